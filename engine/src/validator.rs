//! Validation worker: the only component that mutates the cast set and the
//! duplicate counters.
//!
//! Per message the worker produces exactly one audit row, exactly one
//! forward (to `aggregation` or `review`) and exactly one acknowledgment,
//! strictly in the order authenticate, claim, audit, forward, ack. The
//! ordering is what keeps at-least-once delivery from ever double-counting:
//! a crash at any point either leaves no trace or leaves a state the next
//! delivery resolves to a duplicate.

use crate::{
	credential_store::{Claim, CredentialStore},
	envelope::{EnvelopeStatus, ProcessedEnvelope, ValidationEnvelope},
	error::{PipelineError, Result},
	metrics,
	mq::{BusPublisher, AGGREGATION_KEY, REVIEW_KEY},
	store::{AuditRecord, AuditSink, AuditWrite, WindowCache, WindowStatus},
};
use std::sync::Arc;

/// What the consumer loop should do with the delivery.
#[derive(Debug, PartialEq, Eq)]
pub enum Disposition {
	/// Processing completed; acknowledge.
	Ack,
	/// Transient fault; negative-ack with requeue.
	Requeue,
	/// The payload can never be processed; negative-ack without requeue,
	/// which dead-letters it to the review queue.
	Reject,
	/// An invariant the pipeline depends on does not hold; the worker must
	/// stop and leave the message unacked for a healthy peer.
	Fatal,
}

pub struct ValidationWorker<C, A, B> {
	credentials: C,
	audit: A,
	bus: B,
	window_check: Option<Arc<WindowCache>>,
}

impl<C, A, B> ValidationWorker<C, A, B>
where
	C: CredentialStore,
	A: AuditSink,
	B: BusPublisher,
{
	pub fn new(credentials: C, audit: A, bus: B) -> Self {
		Self { credentials, audit, bus, window_check: None }
	}

	/// Enable the belt-and-suspenders window re-check. Ingestion already
	/// enforces the window; with this on, late envelopes that slipped
	/// through are audited as invalid instead of accepted.
	pub fn with_window_check(mut self, windows: Arc<WindowCache>) -> Self {
		self.window_check = Some(windows);
		self
	}

	pub async fn process_payload(&self, payload: &[u8]) -> Disposition {
		let envelope = match ValidationEnvelope::decode(payload) {
			Ok(envelope) => envelope,
			Err(error) => {
				// Never-parseable: rejecting without requeue dead-letters
				// the raw payload to review for operator inspection.
				tracing::warn!("rejecting malformed envelope to review: {error}");
				metrics::ENVELOPES_PROCESSED.with_label_values(&["malformed"]).inc();
				return Disposition::Reject;
			},
		};

		match self.process_envelope(envelope).await {
			Ok(status) => {
				metrics::ENVELOPES_PROCESSED.with_label_values(&[status]).inc();
				Disposition::Ack
			},
			Err(error) if error.is_transient() => {
				tracing::warn!("transient fault, requeueing: {error}");
				metrics::MESSAGES_REQUEUED.inc();
				Disposition::Requeue
			},
			Err(error) => {
				tracing::error!("stopping worker: {error}");
				Disposition::Fatal
			},
		}
	}

	async fn process_envelope(&self, envelope: ValidationEnvelope) -> Result<&'static str> {
		let fingerprint = envelope.fingerprint.clone();

		if let (Some(windows), Some(election)) = (&self.window_check, &envelope.election) {
			if windows.status(election.election_id, envelope.received_at) == WindowStatus::Closed {
				return self.divert_invalid(envelope, "received outside the election window").await;
			}
		}

		if !self.credentials.is_valid(&fingerprint).await? {
			// Cast but not valid should be impossible under correct
			// generator operation; count it as a duplicate rather than
			// re-announcing a fingerprint the pipeline already accepted.
			if self.credentials.is_cast(&fingerprint).await? {
				tracing::warn!(
					%fingerprint,
					"fingerprint is in the cast set but not in the valid set"
				);
				return self.divert_duplicate(envelope).await;
			}
			return self.divert_invalid(envelope, "unknown credential").await;
		}

		match self.credentials.claim(&fingerprint).await? {
			Claim::Duplicate => self.divert_duplicate(envelope).await,
			Claim::New => {
				let record =
					AuditRecord::from_envelope(&envelope, EnvelopeStatus::Accepted, None, None);
				match self.audit.insert_audit(&record).await? {
					AuditWrite::Inserted => {
						let processed = ProcessedEnvelope::accepted(envelope);
						self.bus.publish(AGGREGATION_KEY, processed.encode()).await?;
						Ok("accepted")
					},
					AuditWrite::AcceptedConflict => {
						// An accepted audit existed although the claim was
						// fresh: C lost state relative to the audit table.
						// Re-read C; if the fingerprint is there the ballot
						// is already counted and this is a duplicate.
						if self.credentials.is_cast(&fingerprint).await? {
							tracing::warn!(
								%fingerprint,
								"accepted audit predates the claim, re-classifying as duplicate"
							);
							self.divert_duplicate(envelope).await
						} else {
							Err(PipelineError::InvariantViolation(format!(
								"accepted audit exists for {fingerprint} but the cast set does not contain it"
							)))
						}
					},
				}
			},
		}
	}

	async fn divert_duplicate(&self, envelope: ValidationEnvelope) -> Result<&'static str> {
		let attempt_count = self.credentials.record_duplicate(&envelope.fingerprint).await?;
		self.audit
			.insert_audit(&AuditRecord::from_envelope(
				&envelope,
				EnvelopeStatus::Duplicate,
				Some(attempt_count as i64),
				None,
			))
			.await?;
		self.bus
			.publish(REVIEW_KEY, ProcessedEnvelope::duplicate(envelope, attempt_count).encode())
			.await?;
		Ok("duplicate")
	}

	async fn divert_invalid(
		&self,
		envelope: ValidationEnvelope,
		reason: &str,
	) -> Result<&'static str> {
		self.audit
			.insert_audit(&AuditRecord::from_envelope(
				&envelope,
				EnvelopeStatus::Invalid,
				None,
				Some(reason.to_string()),
			))
			.await?;
		self.bus
			.publish(
				REVIEW_KEY,
				ProcessedEnvelope::invalid(envelope, Some(reason.to_string())).encode(),
			)
			.await?;
		Ok("invalid")
	}
}
