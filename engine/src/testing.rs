//! In-memory stand-ins for the pipeline's external collaborators.
//!
//! These back the unit and integration tests: they preserve the semantics
//! the real services promise (first-wins claims, the accepted-audit unique
//! index, confirmed publishes) without any infrastructure, and can inject
//! transient faults on demand.

use crate::{
	credential_store::{Claim, CredentialStore},
	envelope::EnvelopeStatus,
	error::Result,
	mq::BusPublisher,
	store::{AuditRecord, AuditSink, AuditWrite, TallyDeltas, TallySink},
};
use async_trait::async_trait;
use ballot_primitives::{CandidateId, ElectionId, Fingerprint, RegionId};
use std::{
	collections::{BTreeMap, HashMap, HashSet},
	sync::{
		atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
		Mutex,
	},
};

fn simulated_outage() -> crate::error::PipelineError {
	redis::RedisError::from((redis::ErrorKind::IoError, "simulated outage")).into()
}

#[derive(Default)]
struct CredentialState {
	cast: HashSet<Fingerprint>,
	attempts: HashMap<Fingerprint, u64>,
}

/// The credential store's contract over plain collections: membership in V,
/// first-wins insert into C, monotone counters in D.
#[derive(Default)]
pub struct MemoryCredentialStore {
	valid: HashSet<Fingerprint>,
	state: Mutex<CredentialState>,
	failing: AtomicBool,
}

impl MemoryCredentialStore {
	pub fn with_valid(valid: impl IntoIterator<Item = Fingerprint>) -> Self {
		Self { valid: valid.into_iter().collect(), ..Default::default() }
	}

	/// Make every subsequent operation fail transiently, as if the store
	/// were unreachable.
	pub fn set_failing(&self, failing: bool) {
		self.failing.store(failing, Ordering::SeqCst);
	}

	pub fn attempt_count(&self, fingerprint: &Fingerprint) -> u64 {
		self.state.lock().unwrap().attempts.get(fingerprint).copied().unwrap_or(0)
	}

	pub fn is_cast_sync(&self, fingerprint: &Fingerprint) -> bool {
		self.state.lock().unwrap().cast.contains(fingerprint)
	}

	/// Seed C directly, emulating state left behind by another worker.
	pub fn insert_cast(&self, fingerprint: Fingerprint) {
		self.state.lock().unwrap().cast.insert(fingerprint);
	}

	fn check_up(&self) -> Result<()> {
		if self.failing.load(Ordering::SeqCst) {
			Err(simulated_outage())
		} else {
			Ok(())
		}
	}
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
	async fn is_valid(&self, fingerprint: &Fingerprint) -> Result<bool> {
		self.check_up()?;
		Ok(self.valid.contains(fingerprint))
	}

	async fn claim(&self, fingerprint: &Fingerprint) -> Result<Claim> {
		self.check_up()?;
		Ok(if self.state.lock().unwrap().cast.insert(fingerprint.clone()) {
			Claim::New
		} else {
			Claim::Duplicate
		})
	}

	async fn record_duplicate(&self, fingerprint: &Fingerprint) -> Result<u64> {
		self.check_up()?;
		let mut state = self.state.lock().unwrap();
		let count = state.attempts.entry(fingerprint.clone()).or_insert(0);
		*count += 1;
		Ok(*count)
	}

	async fn is_cast(&self, fingerprint: &Fingerprint) -> Result<bool> {
		self.check_up()?;
		Ok(self.state.lock().unwrap().cast.contains(fingerprint))
	}

	async fn credential_count(&self) -> Result<u64> {
		self.check_up()?;
		Ok(self.valid.len() as u64)
	}
}

/// Audit sink with the same uniqueness behavior as the partial unique index
/// on `(fingerprint, scope) WHERE status = 'accepted'`.
#[derive(Default)]
pub struct MemoryAuditSink {
	rows: Mutex<Vec<AuditRecord>>,
	failing: AtomicBool,
}

impl MemoryAuditSink {
	pub fn set_failing(&self, failing: bool) {
		self.failing.store(failing, Ordering::SeqCst);
	}

	pub fn rows(&self) -> Vec<AuditRecord> {
		self.rows.lock().unwrap().clone()
	}

	pub fn count_with_status(&self, fingerprint: &Fingerprint, status: EnvelopeStatus) -> usize {
		self.rows
			.lock()
			.unwrap()
			.iter()
			.filter(|row| row.fingerprint == fingerprint.to_string() && row.status == status)
			.count()
	}
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
	async fn insert_audit(&self, record: &AuditRecord) -> Result<AuditWrite> {
		if self.failing.load(Ordering::SeqCst) {
			return Err(simulated_outage());
		}
		let mut rows = self.rows.lock().unwrap();
		if record.status == EnvelopeStatus::Accepted &&
			rows.iter().any(|row| {
				row.status == EnvelopeStatus::Accepted &&
					row.fingerprint == record.fingerprint &&
					row.scope == record.scope
			}) {
			return Ok(AuditWrite::AcceptedConflict);
		}
		rows.push(record.clone());
		Ok(AuditWrite::Inserted)
	}
}

/// Bus publisher that records everything it confirmed.
#[derive(Default)]
pub struct MemoryBus {
	published: Mutex<Vec<(String, Vec<u8>)>>,
	failing: AtomicBool,
}

impl MemoryBus {
	pub fn set_failing(&self, failing: bool) {
		self.failing.store(failing, Ordering::SeqCst);
	}

	pub fn published(&self) -> Vec<(String, Vec<u8>)> {
		self.published.lock().unwrap().clone()
	}

	pub fn payloads_for(&self, routing_key: &str) -> Vec<Vec<u8>> {
		self.published
			.lock()
			.unwrap()
			.iter()
			.filter(|(key, _)| key == routing_key)
			.map(|(_, payload)| payload.clone())
			.collect()
	}
}

#[async_trait]
impl BusPublisher for MemoryBus {
	async fn publish(&self, routing_key: &str, payload: Vec<u8>) -> Result<()> {
		if self.failing.load(Ordering::SeqCst) {
			return Err(crate::error::PipelineError::ConfirmTimeout);
		}
		self.published.lock().unwrap().push((routing_key.to_string(), payload));
		Ok(())
	}
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AckOutcome {
	Acked,
	Requeued,
	Rejected,
}

/// Issues acknowledgment handles and records what happened to each one.
#[derive(Default)]
pub struct AckLog {
	outcomes: std::sync::Arc<Mutex<Vec<(usize, AckOutcome)>>>,
	next_id: AtomicU64,
}

impl AckLog {
	pub fn handle(&self) -> MemoryAck {
		MemoryAck {
			id: self.next_id.fetch_add(1, Ordering::SeqCst) as usize,
			outcomes: self.outcomes.clone(),
		}
	}

	pub fn outcomes(&self) -> Vec<(usize, AckOutcome)> {
		let mut outcomes = self.outcomes.lock().unwrap().clone();
		outcomes.sort_by_key(|(id, _)| *id);
		outcomes
	}

	pub fn count(&self, outcome: AckOutcome) -> usize {
		self.outcomes.lock().unwrap().iter().filter(|(_, o)| *o == outcome).count()
	}
}

pub struct MemoryAck {
	id: usize,
	outcomes: std::sync::Arc<Mutex<Vec<(usize, AckOutcome)>>>,
}

#[async_trait]
impl crate::mq::MessageAck for MemoryAck {
	async fn ack(self) -> Result<()> {
		self.outcomes.lock().unwrap().push((self.id, AckOutcome::Acked));
		Ok(())
	}

	async fn requeue(self) -> Result<()> {
		self.outcomes.lock().unwrap().push((self.id, AckOutcome::Requeued));
		Ok(())
	}

	async fn reject(self) -> Result<()> {
		self.outcomes.lock().unwrap().push((self.id, AckOutcome::Rejected));
		Ok(())
	}
}

#[derive(Default)]
struct TallyState {
	law: BTreeMap<String, (i64, i64)>,
	election: BTreeMap<(ElectionId, RegionId, CandidateId), i64>,
}

/// Tally sink that folds batches into in-memory counts and can fail the
/// next N transactions to exercise the retry path.
#[derive(Default)]
pub struct MemoryTallySink {
	state: Mutex<TallyState>,
	fail_next: AtomicU32,
	commits: AtomicU64,
}

impl MemoryTallySink {
	pub fn fail_next(&self, failures: u32) {
		self.fail_next.store(failures, Ordering::SeqCst);
	}

	pub fn law_counts(&self, ballot_id: &str) -> (i64, i64) {
		self.state.lock().unwrap().law.get(ballot_id).copied().unwrap_or((0, 0))
	}

	pub fn election_count(&self, key: (ElectionId, RegionId, CandidateId)) -> i64 {
		self.state.lock().unwrap().election.get(&key).copied().unwrap_or(0)
	}

	pub fn commits(&self) -> u64 {
		self.commits.load(Ordering::SeqCst)
	}
}

#[async_trait]
impl TallySink for MemoryTallySink {
	async fn apply_deltas(&self, deltas: &TallyDeltas) -> Result<()> {
		if self
			.fail_next
			.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
			.is_ok()
		{
			return Err(crate::error::PipelineError::Database(sqlx::Error::PoolTimedOut));
		}
		let mut state = self.state.lock().unwrap();
		for (ballot_id, (yes, no)) in &deltas.law {
			let entry = state.law.entry(ballot_id.clone()).or_default();
			entry.0 += yes;
			entry.1 += no;
		}
		for (key, votes) in &deltas.election {
			*state.election.entry(*key).or_default() += votes;
		}
		self.commits.fetch_add(1, Ordering::SeqCst);
		Ok(())
	}
}
