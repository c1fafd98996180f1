//! Health and metrics endpoint for the worker binaries.
//!
//! Returns HTTP 200 on `{hostname}:{port}/health` so external services can
//! confirm the process is live, and serves the prometheus text format on
//! `/metrics`. The ingestion front-end has a richer `/health` of its own
//! that also reports its connection statuses.

use crate::{metrics, settings};
use anyhow::Context;
use axum::{routing::get, Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;

#[derive(Serialize)]
struct Liveness {
	component: &'static str,
	status: &'static str,
}

pub struct HealthServer {
	component: &'static str,
	listener: TcpListener,
}

// Split into new and run so tests can be sure the listener is bound
// before issuing requests.
impl HealthServer {
	pub async fn new(
		health_check_settings: &settings::HealthCheck,
		component: &'static str,
	) -> anyhow::Result<Self> {
		let bind_address =
			format!("{}:{}", health_check_settings.hostname, health_check_settings.port);

		tracing::info!(component, bind_address, "starting health server");

		Ok(Self {
			component,
			listener: TcpListener::bind(&bind_address)
				.await
				.with_context(|| format!("Could not bind health listener to {bind_address}"))?,
		})
	}

	pub async fn run(self) -> anyhow::Result<()> {
		let component = self.component;
		let app = Router::new()
			.route(
				"/health",
				get(move || async move { Json(Liveness { component, status: "ok" }) }),
			)
			.route("/metrics", get(|| async { metrics::metrics_handler() }));

		axum::serve(self.listener, app).await.context("health server stopped")
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::settings::test_utils::new_test_settings;

	#[tokio::test]
	async fn health_endpoint_responds() {
		let mut settings = new_test_settings().health_check;
		// Port 0 lets the OS pick a free port; read it back before running.
		settings.port = 0;
		let server = HealthServer::new(&settings, "test").await.unwrap();
		let addr = server.listener.local_addr().unwrap();
		tokio::spawn(server.run());

		let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
		use tokio::io::{AsyncReadExt, AsyncWriteExt};
		let mut stream = stream;
		stream
			.write_all(b"GET /health HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\r\n")
			.await
			.unwrap();
		let mut response = String::new();
		stream.read_to_string(&mut response).await.unwrap();
		assert!(response.starts_with("HTTP/1.1 200"), "{response}");
		assert!(response.contains("\"component\":\"test\""), "{response}");
	}
}
