//! Client for the credential store: the valid set V, the cast set C and
//! the duplicate-attempt counters D.
//!
//! Only the three operations of the voting protocol are exposed.
//! Enumeration and removal are deliberately absent; V is read-only and C is
//! insert-only for the whole voting window.

use crate::{error::Result, settings};
use async_trait::async_trait;
use ballot_primitives::Fingerprint;
use redis::{aio::MultiplexedConnection, AsyncCommands};
use std::time::Duration;

pub const VALID_HASHES_KEY: &str = "valid_hashes";
pub const VOTED_HASHES_KEY: &str = "voted_hashes";

pub fn duplicate_count_key(fingerprint: &Fingerprint) -> String {
	format!("duplicate_count:{fingerprint}")
}

/// Outcome of the atomic insert-if-absent on the cast set. This is the
/// linearization point of the deduplication guarantee: exactly one caller
/// per fingerprint ever observes `New`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Claim {
	New,
	Duplicate,
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
	/// Membership test against V.
	async fn is_valid(&self, fingerprint: &Fingerprint) -> Result<bool>;

	/// Atomic insert-if-absent against C.
	async fn claim(&self, fingerprint: &Fingerprint) -> Result<Claim>;

	/// Atomic increment of D, returning the new attempt count.
	async fn record_duplicate(&self, fingerprint: &Fingerprint) -> Result<u64>;

	/// Read-only membership test against C. Not part of the voting
	/// protocol itself; used to diagnose inconsistencies between C and
	/// the audit table, and to spot cast-but-not-valid anomalies.
	async fn is_cast(&self, fingerprint: &Fingerprint) -> Result<bool>;

	/// Size of V; start-up logging and health checks only.
	async fn credential_count(&self) -> Result<u64>;
}

#[async_trait]
impl<T: CredentialStore + ?Sized> CredentialStore for std::sync::Arc<T> {
	async fn is_valid(&self, fingerprint: &Fingerprint) -> Result<bool> {
		(**self).is_valid(fingerprint).await
	}

	async fn claim(&self, fingerprint: &Fingerprint) -> Result<Claim> {
		(**self).claim(fingerprint).await
	}

	async fn record_duplicate(&self, fingerprint: &Fingerprint) -> Result<u64> {
		(**self).record_duplicate(fingerprint).await
	}

	async fn is_cast(&self, fingerprint: &Fingerprint) -> Result<bool> {
		(**self).is_cast(fingerprint).await
	}

	async fn credential_count(&self) -> Result<u64> {
		(**self).credential_count().await
	}
}

#[derive(Clone)]
pub struct RedisCredentialStore {
	con: MultiplexedConnection,
	duplicate_count_ttl: Option<Duration>,
}

impl RedisCredentialStore {
	pub async fn connect(settings: &settings::CredentialStore) -> Result<Self> {
		let client = redis::Client::open(settings.url.as_str())?;
		let con = client.get_multiplexed_tokio_connection().await?;
		Ok(Self {
			con,
			duplicate_count_ttl: settings.duplicate_count_ttl_secs.map(Duration::from_secs),
		})
	}
}

#[async_trait]
impl CredentialStore for RedisCredentialStore {
	async fn is_valid(&self, fingerprint: &Fingerprint) -> Result<bool> {
		let mut con = self.con.clone();
		Ok(con.sismember::<&str, &str, bool>(VALID_HASHES_KEY, fingerprint.as_str()).await?)
	}

	async fn claim(&self, fingerprint: &Fingerprint) -> Result<Claim> {
		let mut con = self.con.clone();
		// SADD returns the number of members actually inserted, so the
		// winner of a race sees 1 and everyone else sees 0.
		let inserted = con.sadd::<&str, &str, i64>(VOTED_HASHES_KEY, fingerprint.as_str()).await?;
		Ok(if inserted == 1 { Claim::New } else { Claim::Duplicate })
	}

	async fn record_duplicate(&self, fingerprint: &Fingerprint) -> Result<u64> {
		let mut con = self.con.clone();
		let key = duplicate_count_key(fingerprint);
		let count = con.incr::<&str, u64, u64>(key.as_str(), 1).await?;
		if let Some(ttl) = self.duplicate_count_ttl {
			con.expire::<&str, ()>(key.as_str(), ttl.as_secs() as i64).await?;
		}
		Ok(count)
	}

	async fn is_cast(&self, fingerprint: &Fingerprint) -> Result<bool> {
		let mut con = self.con.clone();
		Ok(con.sismember::<&str, &str, bool>(VOTED_HASHES_KEY, fingerprint.as_str()).await?)
	}

	async fn credential_count(&self) -> Result<u64> {
		let mut con = self.con.clone();
		Ok(con.scard::<&str, u64>(VALID_HASHES_KEY).await?)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{settings::test_utils::new_test_settings, testing::MemoryCredentialStore};

	fn fingerprint(n: u8) -> Fingerprint {
		Fingerprint::compute(&format!("00000000{n}"), "ABC123", "L2025-001")
	}

	#[test]
	fn duplicate_count_keys_are_namespaced_per_fingerprint() {
		let f = fingerprint(1);
		assert_eq!(duplicate_count_key(&f), format!("duplicate_count:{f}"));
	}

	#[tokio::test]
	async fn claim_is_first_wins() {
		let store = MemoryCredentialStore::with_valid([fingerprint(1)]);
		assert_eq!(store.claim(&fingerprint(1)).await.unwrap(), Claim::New);
		assert_eq!(store.claim(&fingerprint(1)).await.unwrap(), Claim::Duplicate);
		// Claims on distinct fingerprints are independent.
		assert_eq!(store.claim(&fingerprint(2)).await.unwrap(), Claim::New);
	}

	#[tokio::test]
	async fn record_duplicate_counts_monotonically() {
		let store = MemoryCredentialStore::with_valid([fingerprint(1)]);
		assert_eq!(store.record_duplicate(&fingerprint(1)).await.unwrap(), 1);
		assert_eq!(store.record_duplicate(&fingerprint(1)).await.unwrap(), 2);
		assert_eq!(store.record_duplicate(&fingerprint(2)).await.unwrap(), 1);
	}

	#[tokio::test]
	#[ignore = "requires a running redis"]
	async fn redis_round_trip() {
		let settings = new_test_settings().credential_store;
		let store = RedisCredentialStore::connect(&settings).await.unwrap();
		let _count = store.credential_count().await.unwrap();
	}
}
