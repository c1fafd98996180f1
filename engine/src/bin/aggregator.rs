//! Aggregation service binary.

use anyhow::Context;
use ballot_engine::{
	aggregator::Aggregator,
	envelope::{EnvelopeStatus, ProcessedEnvelope},
	health::HealthServer,
	logging, metrics,
	mq::{BusClient, DeliveryAck, MessageAck, Subject},
	settings::{CommandLineOptions, PipelineSettings, Settings},
	store::TallyStore,
};
use clap::Parser;
use futures::StreamExt;

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
		TallyStore::connect(&settings.database).await.context("could not connect to the tally store")?;
	store.migrate().await.context("could not run migrations")?;

	let health = HealthServer::new(&settings.health_check, "aggregator").await?;
	tokio::spawn(health.run());

	// Prefetch must cover a full batch, or size-based flushes could never
	// trigger and every batch would wait out the interval.
	let prefetch = settings.aggregator.batch_size.min(u16::MAX as usize) as u16;
	let consumer = bus
		.consume(Subject::Aggregation, prefetch, "ballot-aggregator")
		.await
		.context("could not consume the aggregation queue")?;

	let (shutdown_sender, shutdown_receiver) = tokio::sync::watch::channel(false);
	tokio::spawn(async move {
		ballot_engine::shutdown_signal().await;
		let _ = shutdown_sender.send(true);
	});

	let accepted_stream = consumer.filter_map(|delivery| async move {
		let delivery = match delivery {
			Ok(delivery) => delivery,
			Err(error) => {
				tracing::error!("aggregation consume error: {error}");
				return None;
			},
		};
		match ProcessedEnvelope::decode(&delivery.data) {
			Ok(processed) if processed.status == EnvelopeStatus::Accepted =>
				Some((processed, DeliveryAck(delivery))),
			Ok(processed) => {
				// Only accepted envelopes belong here; divert strays to
				// review via the dead-letter route.
				tracing::warn!(
					"non-accepted envelope ({}) on the aggregation queue",
					processed.status
				);
				let _ = DeliveryAck(delivery).reject().await;
				None
			},
			Err(error) => {
				tracing::warn!("malformed envelope on the aggregation queue: {error}");
				let _ = DeliveryAck(delivery).reject().await;
				None
			},
		}
	});

	tracing::info!(
		"aggregator consuming with batch size {} and interval {}ms",
		settings.aggregator.batch_size,
		settings.aggregator.batch_interval_ms
	);
	Aggregator::new(store, &settings.aggregator)
		.run(accepted_stream, shutdown_receiver)
		.await?;
	tracing::info!("aggregator flushed and exited cleanly");
	Ok(())
}
