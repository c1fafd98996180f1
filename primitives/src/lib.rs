//! Common primitive types used across the ballot pipeline.
//!
//! Everything a component may need to name a ballot without holding voter
//! credentials lives here: scope identifiers, choice enums and the
//! credential [`Fingerprint`]. Raw credentials (`nas`, `code`) are consumed
//! by [`Fingerprint::compute`] and never stored in any type of this crate.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{fmt, str::FromStr};

pub type ElectionId = u32;
pub type RegionId = u32;
pub type CandidateId = u32;

/// Number of decimal digits in a voter identifier.
pub const NAS_DIGITS: usize = 9;
/// Number of alphanumeric characters in a voter code.
pub const CODE_CHARS: usize = 6;
/// Hex length of a fingerprint (SHA-256).
pub const FINGERPRINT_HEX_LEN: usize = 64;
/// Maximum length of a referendum ballot identifier.
pub const MAX_BALLOT_ID_LEN: usize = 50;

/// The scope string binding a credential to a candidate election.
///
/// Referendum ballots use their `ballot_id` directly as scope.
pub fn election_scope(election_id: ElectionId) -> String {
	format!("election:{election_id}")
}

/// A referendum answer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Choice {
	Yes,
	No,
}

impl fmt::Display for Choice {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Choice::Yes => write!(f, "yes"),
			Choice::No => write!(f, "no"),
		}
	}
}

/// How a candidate-election ballot expresses its preference.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteMethod {
	Single,
	Ranked,
}

impl fmt::Display for VoteMethod {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			VoteMethod::Single => write!(f, "single"),
			VoteMethod::Ranked => write!(f, "ranked"),
		}
	}
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FingerprintError {
	#[error("fingerprint must be {FINGERPRINT_HEX_LEN} characters, got {0}")]
	BadLength(usize),
	#[error("fingerprint must be lowercase hex")]
	NotLowercaseHex,
}

/// A 64-lowercase-hex SHA-256 digest binding a credential to a ballot scope.
///
/// This is the only credential-derived identifier that travels through the
/// pipeline. Two fingerprints computed from the same `(nas, code)` against
/// different scopes are distinct and independently spendable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(String);

impl Fingerprint {
	/// Digest a credential pair against a ballot scope.
	///
	/// The code is case-normalized to upper before hashing, so voters may
	/// enter it in either case.
	pub fn compute(nas: &str, code: &str, scope: &str) -> Self {
		let mut hasher = Sha256::new();
		hasher.update(nas.as_bytes());
		hasher.update(b"|");
		hasher.update(code.to_uppercase().as_bytes());
		hasher.update(b"|");
		hasher.update(scope.as_bytes());
		Fingerprint(hex::encode(hasher.finalize()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl FromStr for Fingerprint {
	type Err = FingerprintError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		if s.len() != FINGERPRINT_HEX_LEN {
			return Err(FingerprintError::BadLength(s.len()));
		}
		if !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
			return Err(FingerprintError::NotLowercaseHex);
		}
		Ok(Fingerprint(s.to_string()))
	}
}

impl TryFrom<String> for Fingerprint {
	type Error = FingerprintError;

	fn try_from(s: String) -> Result<Self, Self::Error> {
		s.parse()
	}
}

impl From<Fingerprint> for String {
	fn from(f: Fingerprint) -> Self {
		f.0
	}
}

impl fmt::Display for Fingerprint {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn fingerprint_matches_reference_digest() {
		// sha256("123456789|ABC123|L2025-001")
		let f = Fingerprint::compute("123456789", "ABC123", "L2025-001");
		assert_eq!(
			f.as_str(),
			{
				let mut hasher = Sha256::new();
				hasher.update(b"123456789|ABC123|L2025-001");
				hex::encode(hasher.finalize())
			},
		);
		assert_eq!(f.as_str().len(), FINGERPRINT_HEX_LEN);
	}

	#[test]
	fn code_is_case_normalized() {
		assert_eq!(
			Fingerprint::compute("123456789", "abc123", "L2025-001"),
			Fingerprint::compute("123456789", "ABC123", "L2025-001"),
		);
	}

	#[test]
	fn scope_separates_ballots() {
		assert_ne!(
			Fingerprint::compute("123456789", "ABC123", "L2025-001"),
			Fingerprint::compute("123456789", "ABC123", &election_scope(1)),
		);
	}

	#[test]
	fn parse_rejects_bad_fingerprints() {
		assert_eq!("ab".parse::<Fingerprint>(), Err(FingerprintError::BadLength(2)));
		assert_eq!(
			"G".repeat(64).parse::<Fingerprint>(),
			Err(FingerprintError::NotLowercaseHex)
		);
		// Uppercase hex is not canonical.
		assert_eq!(
			"A".repeat(64).parse::<Fingerprint>(),
			Err(FingerprintError::NotLowercaseHex)
		);
		assert!("a".repeat(64).parse::<Fingerprint>().is_ok());
	}

	#[test]
	fn serde_round_trips_through_the_wire_form() {
		let f = Fingerprint::compute("123456789", "ABC123", "L2025-001");
		let json = serde_json::to_string(&f).unwrap();
		assert_eq!(json, format!("\"{f}\""));
		assert_eq!(serde_json::from_str::<Fingerprint>(&json).unwrap(), f);

		// Deserialization enforces canonical form.
		assert!(serde_json::from_str::<Fingerprint>("\"zz\"").is_err());
	}

	#[test]
	fn choice_and_method_wire_names() {
		assert_eq!(serde_json::to_string(&Choice::Yes).unwrap(), "\"yes\"");
		assert_eq!(serde_json::to_string(&VoteMethod::Ranked).unwrap(), "\"ranked\"");
		assert_eq!(election_scope(7), "election:7");
	}
}
