//! Distributed vote-processing pipeline.
//!
//! Three independently scaled stages share this library: the stateless
//! ingestion front-end, the validation worker pool and the aggregation
//! service. They coordinate only through the message bus, the credential
//! store and the audit/tally database.

pub mod aggregator;
pub mod credential_store;
pub mod envelope;
pub mod error;
pub mod health;
pub mod ingest;
pub mod logging;
pub mod metrics;
pub mod mq;
pub mod retry;
pub mod settings;
pub mod store;
pub mod validator;

pub mod testing;

/// Resolves on SIGINT or SIGTERM; every binary shuts down through this.
pub async fn shutdown_signal() {
	use tokio::signal::unix::{signal, SignalKind};

	let mut sigterm = signal(SignalKind::terminate()).expect("can install SIGTERM handler");
	tokio::select! {
		_ = tokio::signal::ctrl_c() => {},
		_ = sigterm.recv() => {},
	}
}
