//! Validation worker binary.
//!
//! Stateless; any number of these run in parallel, coordinating only
//! through the credential store's atomic claim and the bus acknowledgment
//! protocol.

use anyhow::Context;
use ballot_engine::{
	credential_store::{CredentialStore, RedisCredentialStore},
	health::HealthServer,
	logging, metrics,
	mq::{BusClient, DeliveryAck, MessageAck, Subject},
	settings::{CommandLineOptions, PipelineSettings, Settings},
	store::{TallyStore, WindowCache},
	validator::{Disposition, ValidationWorker},
};
use clap::Parser;
use futures::StreamExt;
use std::{pin::pin, sync::Arc, time::Duration};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let opts = CommandLineOptions::parse();
	let settings = Settings::load_settings_from_all_sources(opts.config_file.clone(), opts)
		.context("could not load settings")?;
	logging::init_tracing()?;
	metrics::register_metrics();

	let bus = BusClient::connect(&settings.message_bus)
		.await
		.context("could not connect to the message bus")?;
	let store =
		TallyStore::connect(&settings.database).await.context("could not connect to the audit store")?;
	store.migrate().await.context("could not run migrations")?;
	let credentials = RedisCredentialStore::connect(&settings.credential_store)
		.await
		.context("could not connect to the credential store")?;

	match credentials.credential_count().await {
		Ok(count) => tracing::info!("credential set holds {count} fingerprints"),
		Err(error) => tracing::warn!("could not size the credential set: {error}"),
	}

	let health = HealthServer::new(&settings.health_check, "validator").await?;
	tokio::spawn(health.run());

	let mut worker = ValidationWorker::new(credentials, store.clone(), bus.clone());
	if settings.validator.enforce_window {
		let windows = Arc::new(WindowCache::default());
		windows.refresh(&store).await.context("could not load election windows")?;
		tokio::spawn({
			let windows = windows.clone();
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
		worker = worker.with_window_check(windows);
	}

	let mut consumer = bus
		.consume(Subject::Validation, settings.validator.prefetch, "ballot-validator")
		.await
		.context("could not consume the validation queue")?;
	let message_deadline = Duration::from_millis(settings.validator.message_deadline_ms);
	tracing::info!("validation worker consuming with prefetch {}", settings.validator.prefetch);

	let mut shutdown = pin!(ballot_engine::shutdown_signal());
	loop {
		tokio::select! {
			delivery = consumer.next() => {
				let Some(delivery) = delivery else {
					anyhow::bail!("validation consumer closed unexpectedly");
				};
				let delivery = delivery.context("broker connection lost")?;

				let disposition = match tokio::time::timeout(
					message_deadline,
					worker.process_payload(&delivery.data),
				)
				.await
				{
					Ok(disposition) => disposition,
					Err(_) => {
						tracing::warn!("message deadline exceeded, requeueing");
						metrics::MESSAGES_REQUEUED.inc();
						Disposition::Requeue
					},
				};

				match disposition {
					Disposition::Ack => DeliveryAck(delivery).ack().await?,
					Disposition::Requeue => DeliveryAck(delivery).requeue().await?,
					Disposition::Reject => DeliveryAck(delivery).reject().await?,
					// Leave the message unacked for a healthy peer and
					// stop for operator diagnosis.
					Disposition::Fatal =>
						anyhow::bail!("pipeline invariant violated, stopping"),
				}
			},
			_ = &mut shutdown => {
				tracing::info!("validation worker shutting down");
				break;
			},
		}
	}
	Ok(())
}
