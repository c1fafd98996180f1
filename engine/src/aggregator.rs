//! Aggregation service: folds the stream of accepted envelopes into tally
//! rows, amortizing database cost across batches.
//!
//! Batches flush on size, on elapsed time since the first buffered
//! envelope, or on shutdown. Every message in a batch is acknowledged only
//! after the batch transaction commits; a crash between commit and ack can
//! therefore double-count a batch on redelivery, which is accepted as
//! bounded and left to the reconciliation report. A batch that keeps
//! failing is negatively acknowledged without requeue, which dead-letters
//! it to the review queue.

use crate::{
	envelope::ProcessedEnvelope,
	metrics,
	mq::MessageAck,
	retry::RetryPolicy,
	settings,
	store::{TallyDeltas, TallySink},
};
use futures::{Stream, StreamExt};
use std::{
	sync::atomic::{AtomicU32, Ordering},
	time::Duration,
};
use tokio::sync::watch;

pub struct Aggregator<S> {
	sink: S,
	batch_size: usize,
	batch_interval: Duration,
	retry: RetryPolicy,
}

impl<S: TallySink> Aggregator<S> {
	pub fn new(sink: S, settings: &settings::Aggregator) -> Self {
		Self {
			sink,
			batch_size: settings.batch_size,
			batch_interval: Duration::from_millis(settings.batch_interval_ms),
			retry: RetryPolicy::aggregator_batches(settings),
		}
	}

	/// Consume until the stream ends or shutdown fires, flushing the
	/// residual buffer before returning.
	pub async fn run<St, M>(
		&self,
		stream: St,
		mut shutdown: watch::Receiver<bool>,
	) -> anyhow::Result<()>
	where
		St: Stream<Item = (ProcessedEnvelope, M)>,
		M: MessageAck,
	{
		let mut stream = std::pin::pin!(stream);
		let mut buffer: Vec<(ProcessedEnvelope, M)> = Vec::new();
		let mut deadline: Option<tokio::time::Instant> = None;

		loop {
			// Captures the deadline by value so the select arms below may
			// reassign it.
			let batch_timer = async move {
				match deadline {
					Some(at) => tokio::time::sleep_until(at).await,
					None => std::future::pending().await,
				}
			};

			tokio::select! {
				next = stream.next() => match next {
					Some((envelope, ack)) => {
						if buffer.is_empty() {
							deadline = Some(tokio::time::Instant::now() + self.batch_interval);
						}
						buffer.push((envelope, ack));
						if buffer.len() >= self.batch_size {
							self.flush(&mut buffer).await;
							deadline = None;
						}
					},
					None => {
						self.flush(&mut buffer).await;
						break;
					},
				},
				_ = batch_timer => {
					self.flush(&mut buffer).await;
					deadline = None;
				},
				_ = shutdown.changed() => {
					tracing::info!("aggregator shutting down, flushing {} buffered envelopes", buffer.len());
					self.flush(&mut buffer).await;
					break;
				},
			}
		}
		Ok(())
	}

	async fn flush<M: MessageAck>(&self, buffer: &mut Vec<(ProcessedEnvelope, M)>) {
		if buffer.is_empty() {
			return;
		}
		let batch = std::mem::take(buffer);

		let mut deltas = TallyDeltas::default();
		for (processed, _) in &batch {
			deltas.add(&processed.envelope);
		}

		let attempts = AtomicU32::new(0);
		let result = self
			.retry
			.run("aggregation batch", || {
				attempts.fetch_add(1, Ordering::Relaxed);
				self.sink.apply_deltas(&deltas)
			})
			.await;
		metrics::BATCH_RETRIES.inc_by(attempts.load(Ordering::Relaxed).saturating_sub(1) as u64);

		match result {
			Ok(()) => {
				metrics::BATCHES_FLUSHED.inc();
				for (_, ack) in batch {
					// A lost ack means a redelivery and a rare double
					// count, surfaced by reconciliation.
					if let Err(error) = ack.ack().await {
						tracing::error!("failed to ack aggregated message: {error}");
					}
				}
			},
			Err(error) => {
				tracing::error!(
					"aggregation batch of {} envelopes failed after retries: {error}",
					batch.len()
				);
				for (_, ack) in batch {
					// Rejecting dead-letters the message to review for
					// operator intervention.
					if let Err(error) = ack.reject().await {
						tracing::error!("failed to reject message to review: {error}");
					}
				}
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		envelope::ValidationEnvelope,
		testing::{AckLog, AckOutcome, MemoryAck, MemoryTallySink},
	};
	use ballot_primitives::{Choice, Fingerprint};
	use chrono::Utc;
	use std::sync::Arc;

	fn accepted(n: u8, choice: Choice) -> ProcessedEnvelope {
		ProcessedEnvelope::accepted(ValidationEnvelope::law(
			Fingerprint::compute(&format!("20000000{n}"), "ABC123", "L2025-001"),
			"L2025-001".to_string(),
			choice,
			Utc::now(),
		))
	}

	fn test_settings(batch_size: usize, batch_interval_ms: u64) -> settings::Aggregator {
		settings::Aggregator { batch_size, batch_interval_ms, max_retry: 3, retry_base_ms: 1 }
	}

	// The sender must stay alive for the run: a dropped sender reads as
	// shutdown.
	fn shutdown_pair() -> (watch::Sender<bool>, watch::Receiver<bool>) {
		watch::channel(false)
	}

	#[tokio::test]
	async fn flushes_on_batch_size_and_acks_after_commit() {
		let sink = Arc::new(MemoryTallySink::default());
		let acks = AckLog::default();
		let aggregator = Aggregator::new(sink.clone(), &test_settings(2, 60_000));

		let items: Vec<(ProcessedEnvelope, MemoryAck)> = vec![
			(accepted(1, Choice::Yes), acks.handle()),
			(accepted(2, Choice::Yes), acks.handle()),
			(accepted(3, Choice::No), acks.handle()),
		];
		let (_shutdown, shutdown_rx) = shutdown_pair();
		aggregator.run(futures::stream::iter(items), shutdown_rx).await.unwrap();

		assert_eq!(sink.law_counts("L2025-001"), (2, 1));
		// One full batch plus the residual flush at stream end.
		assert_eq!(sink.commits(), 2);
		assert_eq!(acks.count(AckOutcome::Acked), 3);
	}

	#[tokio::test(start_paused = true)]
	async fn flushes_on_interval_when_batch_is_short() {
		let sink = Arc::new(MemoryTallySink::default());
		let acks = AckLog::default();
		let aggregator = Arc::new(Aggregator::new(sink.clone(), &test_settings(100, 1_000)));

		let (sender, receiver) = tokio::sync::mpsc::channel(8);
		let (_shutdown, shutdown_rx) = shutdown_pair();
		let task = tokio::spawn({
			let aggregator = aggregator.clone();
			async move {
				aggregator
					.run(tokio_stream::wrappers::ReceiverStream::new(receiver), shutdown_rx)
					.await
					.unwrap()
			}
		});

		sender.send((accepted(1, Choice::Yes), acks.handle())).await.unwrap();
		// Paused time auto-advances once every task is idle, so the
		// aggregator's 1s batch timer fires before this 2s sleep returns.
		tokio::time::sleep(Duration::from_secs(2)).await;

		assert_eq!(sink.commits(), 1);
		assert_eq!(sink.law_counts("L2025-001"), (1, 0));
		assert_eq!(acks.count(AckOutcome::Acked), 1);

		drop(sender);
		task.await.unwrap();
	}

	#[tokio::test(start_paused = true)]
	async fn retries_transient_database_failures() {
		let sink = Arc::new(MemoryTallySink::default());
		let acks = AckLog::default();
		let aggregator = Aggregator::new(sink.clone(), &test_settings(1, 1_000));
		sink.fail_next(2);

		let items = vec![(accepted(1, Choice::Yes), acks.handle())];
		let (_shutdown, shutdown_rx) = shutdown_pair();
		aggregator.run(futures::stream::iter(items), shutdown_rx).await.unwrap();

		assert_eq!(sink.commits(), 1);
		assert_eq!(sink.law_counts("L2025-001"), (1, 0));
		assert_eq!(acks.count(AckOutcome::Acked), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn exhausted_batch_is_rejected_to_review() {
		let sink = Arc::new(MemoryTallySink::default());
		let acks = AckLog::default();
		let aggregator = Aggregator::new(sink.clone(), &test_settings(2, 1_000));
		sink.fail_next(3);

		let items = vec![
			(accepted(1, Choice::Yes), acks.handle()),
			(accepted(2, Choice::No), acks.handle()),
		];
		let (_shutdown, shutdown_rx) = shutdown_pair();
		aggregator.run(futures::stream::iter(items), shutdown_rx).await.unwrap();

		assert_eq!(sink.commits(), 0);
		assert_eq!(sink.law_counts("L2025-001"), (0, 0));
		assert_eq!(acks.count(AckOutcome::Rejected), 2);
		assert_eq!(acks.count(AckOutcome::Acked), 0);
	}

	#[tokio::test]
	async fn shutdown_flushes_the_residual_buffer() {
		let sink = Arc::new(MemoryTallySink::default());
		let acks = AckLog::default();
		let aggregator = Arc::new(Aggregator::new(sink.clone(), &test_settings(100, 60_000)));

		let (sender, receiver) = tokio::sync::mpsc::channel(8);
		let (shutdown_sender, shutdown_receiver) = watch::channel(false);
		let task = tokio::spawn({
			let aggregator = aggregator.clone();
			async move {
				aggregator
					.run(tokio_stream::wrappers::ReceiverStream::new(receiver), shutdown_receiver)
					.await
					.unwrap()
			}
		});

		sender.send((accepted(1, Choice::Yes), acks.handle())).await.unwrap();
		sender.send((accepted(2, Choice::Yes), acks.handle())).await.unwrap();
		// Let the aggregator drain the channel into its buffer, then
		// signal shutdown before either flush condition is reached.
		for _ in 0..10 {
			tokio::task::yield_now().await;
		}
		shutdown_sender.send(true).unwrap();
		task.await.unwrap();

		assert_eq!(sink.law_counts("L2025-001"), (2, 0));
		assert_eq!(acks.count(AckOutcome::Acked), 2);
	}
}
