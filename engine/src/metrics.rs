//! Prometheus metrics for the pipeline, exposed on each binary's health
//! server as `/metrics` in text format.

use lazy_static::lazy_static;
use prometheus::{IntCounter, IntCounterVec, Opts, Registry};

lazy_static! {
	static ref REGISTRY: Registry = Registry::new();
	pub static ref SUBMISSIONS_RECEIVED: IntCounterVec = IntCounterVec::new(
		Opts::new("submissions_received", "Ballot submissions received by ingestion"),
		&["kind", "outcome"]
	)
	.expect("valid metric");
	pub static ref ENVELOPES_PROCESSED: IntCounterVec = IntCounterVec::new(
		Opts::new("envelopes_processed", "Envelopes processed by the validation workers"),
		&["status"]
	)
	.expect("valid metric");
	pub static ref MESSAGES_REQUEUED: IntCounter = IntCounter::new(
		"messages_requeued",
		"Messages negatively acknowledged with requeue after a transient fault"
	)
	.expect("valid metric");
	pub static ref BATCHES_FLUSHED: IntCounter =
		IntCounter::new("batches_flushed", "Aggregation batches committed").expect("valid metric");
	pub static ref BATCH_RETRIES: IntCounter = IntCounter::new(
		"batch_retries",
		"Aggregation batch transactions retried after a database failure"
	)
	.expect("valid metric");
}

pub fn register_metrics() {
	for collector in [
		Box::new(SUBMISSIONS_RECEIVED.clone()) as Box<dyn prometheus::core::Collector>,
		Box::new(ENVELOPES_PROCESSED.clone()),
		Box::new(MESSAGES_REQUEUED.clone()),
		Box::new(BATCHES_FLUSHED.clone()),
		Box::new(BATCH_RETRIES.clone()),
	] {
		// Re-registration only happens in tests that rebuild a binary's
		// state; it is not an error worth failing start-up for.
		let _ = REGISTRY.register(collector);
	}
}

pub fn metrics_handler() -> String {
	use prometheus::Encoder;
	let encoder = prometheus::TextEncoder::new();

	let mut buffer = Vec::new();
	if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
		tracing::error!("could not encode metrics: {e}");
	}
	String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn registered_metrics_render_in_text_format() {
		register_metrics();
		ENVELOPES_PROCESSED.with_label_values(&["accepted"]).inc();
		let rendered = metrics_handler();
		assert!(rendered.contains("envelopes_processed"));
	}
}
