//! The canonical in-pipeline representation of a ballot.
//!
//! Envelopes carry the fingerprint and the choice payload between stages;
//! raw credentials never appear here. Exactly one of `law` / `election` is
//! present, matching `kind`; anything else is a malformed envelope and is
//! rejected without requeue.

use crate::error::PipelineError;
use ballot_primitives::{
	election_scope, CandidateId, Choice, ElectionId, Fingerprint, RegionId, VoteMethod,
};
use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BallotKind {
	Law,
	Election,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LawVote {
	pub ballot_id: String,
	pub choice: Choice,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElectionVote {
	pub election_id: ElectionId,
	pub region_id: RegionId,
	pub method: VoteMethod,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub single_choice: Option<CandidateId>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub ranked_choices: Option<Vec<CandidateId>>,
}

impl ElectionVote {
	/// The candidate credited in the tally: the single choice, or the
	/// first preference of a ranking.
	pub fn first_preference(&self) -> Option<CandidateId> {
		match self.method {
			VoteMethod::Single => self.single_choice,
			VoteMethod::Ranked => self.ranked_choices.as_ref().and_then(|r| r.first().copied()),
		}
	}

	fn validate(&self) -> Result<(), String> {
		match self.method {
			VoteMethod::Single => {
				if self.single_choice.is_none() || self.ranked_choices.is_some() {
					return Err("single-choice ballot must carry single_choice only".to_string());
				}
			},
			VoteMethod::Ranked => {
				let Some(ranking) = self.ranked_choices.as_ref().filter(|r| !r.is_empty()) else {
					return Err("ranked ballot must carry a non-empty ranking".to_string());
				};
				if self.single_choice.is_some() {
					return Err("ranked ballot must not carry single_choice".to_string());
				}
				if !ranking.iter().all_unique() {
					return Err("ranked choices must be distinct".to_string());
				}
			},
		}
		Ok(())
	}
}

/// Wire object on the `validation` stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationEnvelope {
	pub kind: BallotKind,
	pub fingerprint: Fingerprint,
	pub received_at: DateTime<Utc>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub law: Option<LawVote>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub election: Option<ElectionVote>,
}

impl ValidationEnvelope {
	pub fn law(
		fingerprint: Fingerprint,
		ballot_id: String,
		choice: Choice,
		received_at: DateTime<Utc>,
	) -> Self {
		Self {
			kind: BallotKind::Law,
			fingerprint,
			received_at,
			law: Some(LawVote { ballot_id, choice }),
			election: None,
		}
	}

	pub fn election(fingerprint: Fingerprint, vote: ElectionVote, received_at: DateTime<Utc>) -> Self {
		Self { kind: BallotKind::Election, fingerprint, received_at, law: None, election: Some(vote) }
	}

	/// Structural invariants the wire format promises. Decoded payloads
	/// that fail here are permanently rejected.
	pub fn validate(&self) -> Result<(), String> {
		match (self.kind, &self.law, &self.election) {
			(BallotKind::Law, Some(law), None) => {
				if law.ballot_id.is_empty() {
					Err("empty ballot_id".to_string())
				} else {
					Ok(())
				}
			},
			(BallotKind::Election, None, Some(election)) => election.validate(),
			_ => Err("kind does not match payload".to_string()),
		}
	}

	pub fn decode(payload: &[u8]) -> Result<Self, PipelineError> {
		let envelope: Self = serde_json::from_slice(payload)
			.map_err(|e| PipelineError::MalformedEnvelope(e.to_string()))?;
		envelope.validate().map_err(PipelineError::MalformedEnvelope)?;
		Ok(envelope)
	}

	pub fn encode(&self) -> Vec<u8> {
		serde_json::to_vec(self).expect("envelopes are plain data and always serialize")
	}

	/// The ballot scope this envelope counts against: the referendum's
	/// `ballot_id`, or `election:{id}`.
	pub fn scope(&self) -> String {
		match (&self.law, &self.election) {
			(Some(law), _) => law.ballot_id.clone(),
			(_, Some(election)) => election_scope(election.election_id),
			_ => String::new(),
		}
	}

	pub fn routing_key(&self) -> &'static str {
		match self.kind {
			BallotKind::Law => crate::mq::VALIDATION_LAW_KEY,
			BallotKind::Election => crate::mq::VALIDATION_ELECTION_KEY,
		}
	}

	/// The choice payload persisted in the audit record. For ranked
	/// ballots this preserves the full ranking for later re-tabulation.
	pub fn choice_payload(&self) -> serde_json::Value {
		match (&self.law, &self.election) {
			(Some(law), _) => serde_json::json!({ "choice": law.choice }),
			(_, Some(election)) => match election.method {
				VoteMethod::Single => serde_json::json!({
					"method": election.method,
					"single_choice": election.single_choice,
				}),
				VoteMethod::Ranked => serde_json::json!({
					"method": election.method,
					"ranked_choices": election.ranked_choices,
				}),
			},
			_ => serde_json::Value::Null,
		}
	}
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeStatus {
	Accepted,
	Duplicate,
	Invalid,
}

impl fmt::Display for EnvelopeStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			EnvelopeStatus::Accepted => write!(f, "accepted"),
			EnvelopeStatus::Duplicate => write!(f, "duplicate"),
			EnvelopeStatus::Invalid => write!(f, "invalid"),
		}
	}
}

/// Wire object on the `aggregation` and `review` streams: the validation
/// envelope extended with its processing outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedEnvelope {
	#[serde(flatten)]
	pub envelope: ValidationEnvelope,
	pub status: EnvelopeStatus,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub attempt_count: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
}

impl ProcessedEnvelope {
	pub fn accepted(envelope: ValidationEnvelope) -> Self {
		Self { envelope, status: EnvelopeStatus::Accepted, attempt_count: None, error: None }
	}

	pub fn duplicate(envelope: ValidationEnvelope, attempt_count: u64) -> Self {
		Self {
			envelope,
			status: EnvelopeStatus::Duplicate,
			attempt_count: Some(attempt_count),
			error: None,
		}
	}

	pub fn invalid(envelope: ValidationEnvelope, error: Option<String>) -> Self {
		Self { envelope, status: EnvelopeStatus::Invalid, attempt_count: None, error }
	}

	pub fn decode(payload: &[u8]) -> Result<Self, PipelineError> {
		let processed: Self = serde_json::from_slice(payload)
			.map_err(|e| PipelineError::MalformedEnvelope(e.to_string()))?;
		processed.envelope.validate().map_err(PipelineError::MalformedEnvelope)?;
		Ok(processed)
	}

	pub fn encode(&self) -> Vec<u8> {
		serde_json::to_vec(self).expect("envelopes are plain data and always serialize")
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::error::ErrorClass;

	fn fingerprint() -> Fingerprint {
		Fingerprint::compute("123456789", "ABC123", "L2025-001")
	}

	#[test]
	fn law_envelope_round_trips_on_the_wire() {
		let envelope =
			ValidationEnvelope::law(fingerprint(), "L2025-001".to_string(), Choice::Yes, Utc::now());
		let decoded = ValidationEnvelope::decode(&envelope.encode()).unwrap();
		assert_eq!(decoded, envelope);
		assert_eq!(decoded.scope(), "L2025-001");
		assert_eq!(decoded.routing_key(), "vote.validation.law");

		let wire: serde_json::Value = serde_json::from_slice(&envelope.encode()).unwrap();
		assert_eq!(wire["kind"], "law");
		assert_eq!(wire["law"]["choice"], "yes");
		assert!(wire.get("election").is_none());
	}

	#[test]
	fn election_envelope_scope_and_first_preference() {
		let vote = ElectionVote {
			election_id: 1,
			region_id: 1,
			method: VoteMethod::Ranked,
			single_choice: None,
			ranked_choices: Some(vec![7, 3, 9]),
		};
		assert_eq!(vote.first_preference(), Some(7));

		let envelope = ValidationEnvelope::election(
			Fingerprint::compute("123456789", "ABC123", "election:1"),
			vote,
			Utc::now(),
		);
		assert_eq!(envelope.scope(), "election:1");
		assert_eq!(envelope.routing_key(), "vote.validation.election");
		assert_eq!(envelope.choice_payload()["ranked_choices"], serde_json::json!([7, 3, 9]));
	}

	#[test]
	fn mismatched_kind_and_payload_is_malformed() {
		let mut envelope =
			ValidationEnvelope::law(fingerprint(), "L2025-001".to_string(), Choice::No, Utc::now());
		envelope.kind = BallotKind::Election;
		let error = ValidationEnvelope::decode(&envelope.encode()).unwrap_err();
		assert_eq!(error.class(), ErrorClass::Permanent);
	}

	#[test]
	fn ranked_ballot_with_repeated_candidate_is_malformed() {
		let envelope = ValidationEnvelope::election(
			fingerprint(),
			ElectionVote {
				election_id: 1,
				region_id: 1,
				method: VoteMethod::Ranked,
				single_choice: None,
				ranked_choices: Some(vec![7, 7]),
			},
			Utc::now(),
		);
		assert!(ValidationEnvelope::decode(&envelope.encode()).is_err());
	}

	#[test]
	fn single_ballot_requires_exactly_one_payload_shape() {
		let envelope = ValidationEnvelope::election(
			fingerprint(),
			ElectionVote {
				election_id: 1,
				region_id: 1,
				method: VoteMethod::Single,
				single_choice: Some(7),
				ranked_choices: Some(vec![3]),
			},
			Utc::now(),
		);
		assert!(envelope.validate().is_err());
	}

	#[test]
	fn unparseable_payload_is_a_permanent_error() {
		let error = ValidationEnvelope::decode(b"{not json").unwrap_err();
		assert_eq!(error.class(), ErrorClass::Permanent);
	}

	#[test]
	fn fingerprint_must_be_64_lowercase_hex_on_the_wire() {
		let wire = serde_json::json!({
			"kind": "law",
			"fingerprint": "abc123",
			"received_at": "2025-10-01T12:00:00Z",
			"law": { "ballot_id": "L2025-001", "choice": "yes" },
		});
		let error = ValidationEnvelope::decode(wire.to_string().as_bytes()).unwrap_err();
		assert_eq!(error.class(), ErrorClass::Permanent);
	}

	#[test]
	fn processed_envelope_carries_status_and_attempts() {
		let envelope =
			ValidationEnvelope::law(fingerprint(), "L2025-001".to_string(), Choice::Yes, Utc::now());
		let processed = ProcessedEnvelope::duplicate(envelope, 2);
		let wire: serde_json::Value = serde_json::from_slice(&processed.encode()).unwrap();
		assert_eq!(wire["status"], "duplicate");
		assert_eq!(wire["attempt_count"], 2);
		// The base envelope is flattened, not nested.
		assert_eq!(wire["kind"], "law");

		assert_eq!(ProcessedEnvelope::decode(&processed.encode()).unwrap(), processed);
	}
}
