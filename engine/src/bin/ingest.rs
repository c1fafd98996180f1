//! Ingestion front-end binary.

use anyhow::Context;
use ballot_engine::{
	credential_store::{CredentialStore, RedisCredentialStore},
	ingest::{self, AppState, HealthProbes},
	logging, metrics,
	mq::BusClient,
	settings::{CommandLineOptions, PipelineSettings, Settings},
	store::{TallyStore, WindowCache},
};
use clap::Parser;
use std::{sync::Arc, time::Duration};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let opts = CommandLineOptions::parse();
	let settings = Settings::load_settings_from_all_sources(opts.config_file.clone(), opts)
		.context("could not load settings")?;
	logging::init_tracing()?;
	metrics::register_metrics();

	let bus = Arc::new(
		BusClient::connect(&settings.message_bus)
			.await
			.context("could not connect to the message bus")?,
	);
	let store =
		TallyStore::connect(&settings.database).await.context("could not connect to the tally store")?;
	store.migrate().await.context("could not run migrations")?;
	let credentials = RedisCredentialStore::connect(&settings.credential_store)
		.await
		.context("could not connect to the credential store")?;

	let windows = Arc::new(WindowCache::default());
	if let Err(error) = windows.refresh(&store).await {
		tracing::warn!("could not prime the election-window cache: {error}");
	}
	tokio::spawn({
		let windows = windows.clone();
		let store = store.clone();
		let refresh_interval =
			Duration::from_millis(settings.ingest.window_refresh_interval_ms);
		async move {
			let mut interval = tokio::time::interval(refresh_interval);
			loop {
				interval.tick().await;
				if let Err(error) = windows.refresh(&store).await {
					tracing::warn!("election-window refresh failed: {error}");
				}
			}
		}
	});

	let probes = Arc::new(HealthProbes::default());
	tokio::spawn({
		let probes = probes.clone();
		let bus = bus.clone();
		let credentials = credentials.clone();
		let store = store.clone();
		async move {
			// The first tick fires immediately, so /health turns green as
			// soon as the connections answer.
			let mut interval = tokio::time::interval(Duration::from_secs(10));
			loop {
				interval.tick().await;
				probes.set_bus(bus.is_connected());
				probes.set_credential_store(credentials.credential_count().await.is_ok());
				probes.set_database(store.ping().await.is_ok());
			}
		}
	});

	let state = AppState {
		bus,
		results: Arc::new(store),
		windows,
		probes,
		request_deadline: Duration::from_millis(settings.ingest.request_deadline_ms),
	};

	let bind_address = format!("{}:{}", settings.ingest.hostname, settings.ingest.port);
	let listener = tokio::net::TcpListener::bind(&bind_address)
		.await
		.with_context(|| format!("could not bind ingestion listener to {bind_address}"))?;
	tracing::info!("ingestion listening on {bind_address}");

	axum::serve(listener, ingest::router(state))
		.with_graceful_shutdown(ballot_engine::shutdown_signal())
		.await
		.context("ingestion server stopped")
}
