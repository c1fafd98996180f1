//! Pipeline error taxonomy.
//!
//! Every failure a stage can hit maps to one of three classes, which decide
//! what happens to the in-flight message: transient faults requeue,
//! permanent faults go to review without requeue, fatal faults stop the
//! worker for operator diagnosis.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
	#[error("credential store error: {0}")]
	CredentialStore(#[from] redis::RedisError),

	#[error("database error: {0}")]
	Database(#[from] sqlx::Error),

	#[error("message bus error: {0}")]
	Bus(#[from] lapin::Error),

	#[error("publish was not confirmed by the broker")]
	PublishNotConfirmed,

	#[error("publish confirmation timed out")]
	ConfirmTimeout,

	#[error("deadline exceeded")]
	DeadlineExceeded,

	/// Structurally unparseable or internally inconsistent bus payload.
	#[error("malformed envelope: {0}")]
	MalformedEnvelope(String),

	/// An accepted-audit uniqueness conflict for a fingerprint the
	/// credential store claims was never cast. Signals an inconsistency
	/// between C and the audit table.
	#[error("invariant violation: {0}")]
	InvariantViolation(String),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorClass {
	/// Infrastructure unreachable or slow; the message is redelivered.
	Transient,
	/// The message itself can never succeed; it is diverted to review.
	Permanent,
	/// The process must stop; continuing could corrupt counts.
	Fatal,
}

impl PipelineError {
	pub fn class(&self) -> ErrorClass {
		match self {
			PipelineError::CredentialStore(_) |
			PipelineError::Database(_) |
			PipelineError::Bus(_) |
			PipelineError::PublishNotConfirmed |
			PipelineError::ConfirmTimeout |
			PipelineError::DeadlineExceeded => ErrorClass::Transient,
			PipelineError::MalformedEnvelope(_) => ErrorClass::Permanent,
			PipelineError::InvariantViolation(_) => ErrorClass::Fatal,
		}
	}

	pub fn is_transient(&self) -> bool {
		self.class() == ErrorClass::Transient
	}
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn classes_follow_the_taxonomy() {
		assert_eq!(PipelineError::ConfirmTimeout.class(), ErrorClass::Transient);
		assert_eq!(PipelineError::DeadlineExceeded.class(), ErrorClass::Transient);
		assert_eq!(
			PipelineError::MalformedEnvelope("no payload".to_string()).class(),
			ErrorClass::Permanent
		);
		assert_eq!(
			PipelineError::InvariantViolation("audit/cast-set mismatch".to_string()).class(),
			ErrorClass::Fatal
		);
		assert!(PipelineError::Database(sqlx::Error::PoolTimedOut).is_transient());
	}
}
