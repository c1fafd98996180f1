//! Audit and tally store client (Postgres).
//!
//! Audit rows are written by the validation workers, one per processed
//! envelope; tally rows are written only by the aggregator, via additive
//! upserts so concurrent batches commute. Dashboard reads project over
//! tally rows only.

use crate::{
	envelope::{EnvelopeStatus, ProcessedEnvelope, ValidationEnvelope},
	error::{PipelineError, Result},
	settings,
};
use async_trait::async_trait;
use ballot_primitives::{CandidateId, ElectionId, RegionId};
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use std::collections::BTreeMap;

/// One audit row, ready to insert.
#[derive(Debug, Clone)]
pub struct AuditRecord {
	pub fingerprint: String,
	pub scope: String,
	pub choice_payload: serde_json::Value,
	pub status: EnvelopeStatus,
	pub attempt_count: Option<i64>,
	pub error: Option<String>,
	pub received_at: DateTime<Utc>,
}

impl AuditRecord {
	pub fn from_envelope(
		envelope: &ValidationEnvelope,
		status: EnvelopeStatus,
		attempt_count: Option<i64>,
		error: Option<String>,
	) -> Self {
		Self {
			fingerprint: envelope.fingerprint.to_string(),
			scope: envelope.scope(),
			choice_payload: envelope.choice_payload(),
			status,
			attempt_count,
			error,
			received_at: envelope.received_at,
		}
	}
}

/// Result of an audit insert. A conflict means another row already holds
/// `status = accepted` for this `(fingerprint, scope)`, and the caller must
/// re-classify.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AuditWrite {
	Inserted,
	AcceptedConflict,
}

#[async_trait]
pub trait AuditSink: Send + Sync {
	async fn insert_audit(&self, record: &AuditRecord) -> Result<AuditWrite>;
}

#[async_trait]
impl<T: AuditSink + ?Sized> AuditSink for std::sync::Arc<T> {
	async fn insert_audit(&self, record: &AuditRecord) -> Result<AuditWrite> {
		(**self).insert_audit(record).await
	}
}

/// Additive changes of one aggregation batch, grouped by tally key.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TallyDeltas {
	/// ballot_id -> (yes, no)
	pub law: BTreeMap<String, (i64, i64)>,
	/// (election, region, candidate) -> votes
	pub election: BTreeMap<(ElectionId, RegionId, CandidateId), i64>,
}

impl TallyDeltas {
	/// Fold one accepted envelope into the batch. Ranked ballots credit
	/// the first preference only.
	pub fn add(&mut self, envelope: &ValidationEnvelope) {
		if let Some(law) = &envelope.law {
			let entry = self.law.entry(law.ballot_id.clone()).or_default();
			match law.choice {
				ballot_primitives::Choice::Yes => entry.0 += 1,
				ballot_primitives::Choice::No => entry.1 += 1,
			}
		} else if let Some(election) = &envelope.election {
			if let Some(candidate) = election.first_preference() {
				*self
					.election
					.entry((election.election_id, election.region_id, candidate))
					.or_default() += 1;
			}
		}
	}

	pub fn is_empty(&self) -> bool {
		self.law.is_empty() && self.election.is_empty()
	}
}

#[async_trait]
pub trait TallySink: Send + Sync {
	/// Apply a whole batch in one transaction.
	async fn apply_deltas(&self, deltas: &TallyDeltas) -> Result<()>;
}

#[async_trait]
impl<T: TallySink + ?Sized> TallySink for std::sync::Arc<T> {
	async fn apply_deltas(&self, deltas: &TallyDeltas) -> Result<()> {
		(**self).apply_deltas(deltas).await
	}
}

#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct LawTallyRow {
	pub ballot_id: String,
	pub yes_count: i64,
	pub no_count: i64,
	pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct ElectionTallyRow {
	pub election_id: i64,
	pub region_id: i64,
	pub candidate_id: i64,
	pub vote_count: i64,
	pub percentage: f64,
}

#[derive(Debug, Clone)]
pub struct ElectionWindow {
	pub election_id: ElectionId,
	pub start_at: DateTime<Utc>,
	pub end_at: DateTime<Utc>,
}

/// Per-scope comparison of accepted audits against tallied votes; a
/// non-zero shortfall points at aggregation messages lost between audit
/// and tally (see the crash-ordering notes on the validator).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ReconciliationRow {
	pub scope: String,
	pub accepted_audits: i64,
	pub tallied: i64,
}

#[derive(Clone)]
pub struct TallyStore {
	pool: PgPool,
	statement_timeout_ms: u64,
}

impl TallyStore {
	pub async fn connect(settings: &settings::Database) -> Result<Self> {
		let pool = PgPoolOptions::new()
			.max_connections(settings.max_connections)
			.connect(&settings.url)
			.await?;
		Ok(Self { pool, statement_timeout_ms: settings.statement_timeout_ms })
	}

	pub async fn migrate(&self) -> Result<()> {
		sqlx::migrate!("./migrations")
			.run(&self.pool)
			.await
			.map_err(|e| PipelineError::Database(sqlx::Error::Migrate(Box::new(e))))?;
		Ok(())
	}

	pub fn pool(&self) -> &PgPool {
		&self.pool
	}

	/// Liveness probe for health reporting.
	pub async fn ping(&self) -> Result<()> {
		sqlx::query("SELECT 1").execute(&self.pool).await?;
		Ok(())
	}

	pub async fn election_windows(&self) -> Result<Vec<ElectionWindow>> {
		let rows = sqlx::query("SELECT id, start_at, end_at FROM elections")
			.fetch_all(&self.pool)
			.await?;
		Ok(rows
			.into_iter()
			.map(|row| ElectionWindow {
				election_id: row.get::<i64, _>("id") as ElectionId,
				start_at: row.get("start_at"),
				end_at: row.get("end_at"),
			})
			.collect())
	}

	/// Accepted-audits versus tallied votes, per scope. Read-only; used by
	/// the operator reconciliation report.
	pub async fn reconciliation_report(&self) -> Result<Vec<ReconciliationRow>> {
		Ok(sqlx::query_as::<_, ReconciliationRow>(
			"SELECT a.scope, a.accepted_audits, COALESCE(t.tallied, 0) AS tallied \
			 FROM (SELECT scope, COUNT(*) AS accepted_audits FROM vote_audit \
			       WHERE status = 'accepted' GROUP BY scope) a \
			 LEFT JOIN (SELECT ballot_id AS scope, SUM(yes_count + no_count)::bigint AS tallied \
			            FROM law_tally GROUP BY ballot_id \
			            UNION ALL \
			            SELECT 'election:' || election_id::text AS scope, SUM(vote_count)::bigint AS tallied \
			            FROM election_tally GROUP BY election_id) t \
			 ON t.scope = a.scope \
			 ORDER BY a.scope",
		)
		.fetch_all(&self.pool)
		.await?)
	}

	pub async fn accepted_audit_count(&self, scope: &str) -> Result<i64> {
		let row = sqlx::query(
			"SELECT COUNT(*) AS n FROM vote_audit WHERE scope = $1 AND status = 'accepted'",
		)
		.bind(scope)
		.fetch_one(&self.pool)
		.await?;
		Ok(row.get("n"))
	}

	pub async fn duplicate_audit_count(&self, fingerprint: &str) -> Result<i64> {
		let row = sqlx::query(
			"SELECT COUNT(*) AS n FROM vote_audit WHERE fingerprint = $1 AND status = 'duplicate'",
		)
		.bind(fingerprint)
		.fetch_one(&self.pool)
		.await?;
		Ok(row.get("n"))
	}
}

/// Read-side projections consumed by the results endpoints and, through
/// them, the external dashboard. They never join against audit rows.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResultsStore: Send + Sync {
	async fn law_results(&self, ballot_id: &str) -> Result<Option<LawTallyRow>>;

	async fn election_results(
		&self,
		election_id: ElectionId,
		region_id: RegionId,
	) -> Result<Vec<ElectionTallyRow>>;
}

#[async_trait]
impl ResultsStore for TallyStore {
	async fn law_results(&self, ballot_id: &str) -> Result<Option<LawTallyRow>> {
		Ok(sqlx::query_as::<_, LawTallyRow>(
			"SELECT ballot_id, yes_count, no_count, updated_at FROM law_tally WHERE ballot_id = $1",
		)
		.bind(ballot_id)
		.fetch_optional(&self.pool)
		.await?)
	}

	async fn election_results(
		&self,
		election_id: ElectionId,
		region_id: RegionId,
	) -> Result<Vec<ElectionTallyRow>> {
		Ok(sqlx::query_as::<_, ElectionTallyRow>(
			"SELECT election_id, region_id, candidate_id, vote_count, percentage \
			 FROM election_tally WHERE election_id = $1 AND region_id = $2 \
			 ORDER BY vote_count DESC, candidate_id",
		)
		.bind(election_id as i64)
		.bind(region_id as i64)
		.fetch_all(&self.pool)
		.await?)
	}
}

#[async_trait]
impl AuditSink for TallyStore {
	async fn insert_audit(&self, record: &AuditRecord) -> Result<AuditWrite> {
		let result = sqlx::query(
			"INSERT INTO vote_audit \
			 (fingerprint, scope, choice_payload, status, attempt_count, error, received_at, processed_at) \
			 VALUES ($1, $2, $3, $4, $5, $6, $7, now())",
		)
		.bind(&record.fingerprint)
		.bind(&record.scope)
		.bind(&record.choice_payload)
		.bind(record.status.to_string())
		.bind(record.attempt_count)
		.bind(&record.error)
		.bind(record.received_at)
		.execute(&self.pool)
		.await;

		match result {
			Ok(_) => Ok(AuditWrite::Inserted),
			Err(sqlx::Error::Database(db_error))
				if matches!(db_error.kind(), sqlx::error::ErrorKind::UniqueViolation) =>
				Ok(AuditWrite::AcceptedConflict),
			Err(e) => Err(e.into()),
		}
	}
}

#[async_trait]
impl TallySink for TallyStore {
	async fn apply_deltas(&self, deltas: &TallyDeltas) -> Result<()> {
		if deltas.is_empty() {
			return Ok(());
		}

		let mut tx = self.pool.begin().await?;

		sqlx::query(&format!("SET LOCAL statement_timeout = {}", self.statement_timeout_ms))
			.execute(&mut *tx)
			.await?;

		for (ballot_id, (yes, no)) in &deltas.law {
			sqlx::query(
				"INSERT INTO law_tally (ballot_id, yes_count, no_count, updated_at) \
				 VALUES ($1, $2, $3, now()) \
				 ON CONFLICT (ballot_id) DO UPDATE SET \
				   yes_count = law_tally.yes_count + excluded.yes_count, \
				   no_count = law_tally.no_count + excluded.no_count, \
				   updated_at = now()",
			)
			.bind(ballot_id)
			.bind(yes)
			.bind(no)
			.execute(&mut *tx)
			.await?;
		}

		for ((election_id, region_id, candidate_id), votes) in &deltas.election {
			sqlx::query(
				"INSERT INTO election_tally (election_id, region_id, candidate_id, vote_count, updated_at) \
				 VALUES ($1, $2, $3, $4, now()) \
				 ON CONFLICT (election_id, region_id, candidate_id) DO UPDATE SET \
				   vote_count = election_tally.vote_count + excluded.vote_count, \
				   updated_at = now()",
			)
			.bind(*election_id as i64)
			.bind(*region_id as i64)
			.bind(*candidate_id as i64)
			.bind(votes)
			.execute(&mut *tx)
			.await?;
		}

		// Percentages are derived; refresh every region the batch touched
		// inside the same transaction so readers never see a stale mix.
		let touched_regions: std::collections::BTreeSet<(ElectionId, RegionId)> =
			deltas.election.keys().map(|(e, r, _)| (*e, *r)).collect();
		for (election_id, region_id) in touched_regions {
			sqlx::query(
				"UPDATE election_tally t SET percentage = \
				   CASE WHEN s.total = 0 THEN 0 \
				        ELSE round(t.vote_count::numeric * 100 / s.total, 2)::double precision END \
				 FROM (SELECT SUM(vote_count) AS total FROM election_tally \
				       WHERE election_id = $1 AND region_id = $2) s \
				 WHERE t.election_id = $1 AND t.region_id = $2",
			)
			.bind(election_id as i64)
			.bind(region_id as i64)
			.execute(&mut *tx)
			.await?;
		}

		tx.commit().await?;
		Ok(())
	}
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WindowStatus {
	Open,
	Closed,
	/// Election not present in the cache. Ingestion treats this as closed
	/// (an unknown election cannot accept votes); the worker-side check
	/// treats it as open to avoid penalizing a stale cache.
	Unknown,
}

/// Cached election-window map, refreshed periodically from the store so
/// the submission hot path never waits on the database.
#[derive(Default)]
pub struct WindowCache {
	windows: std::sync::RwLock<BTreeMap<ElectionId, (DateTime<Utc>, DateTime<Utc>)>>,
}

impl WindowCache {
	pub async fn refresh(&self, store: &TallyStore) -> Result<()> {
		let windows = store.election_windows().await?;
		*self.windows.write().unwrap() = windows
			.into_iter()
			.map(|window| (window.election_id, (window.start_at, window.end_at)))
			.collect();
		Ok(())
	}

	pub fn insert(&self, election_id: ElectionId, start_at: DateTime<Utc>, end_at: DateTime<Utc>) {
		self.windows.write().unwrap().insert(election_id, (start_at, end_at));
	}

	/// Start is inclusive, end exclusive.
	pub fn status(&self, election_id: ElectionId, at: DateTime<Utc>) -> WindowStatus {
		match self.windows.read().unwrap().get(&election_id) {
			Some((start_at, end_at)) =>
				if at >= *start_at && at < *end_at {
					WindowStatus::Open
				} else {
					WindowStatus::Closed
				},
			None => WindowStatus::Unknown,
		}
	}
}

/// Group a slice of accepted envelopes into one batch of deltas.
pub fn deltas_for(batch: &[ProcessedEnvelope]) -> TallyDeltas {
	let mut deltas = TallyDeltas::default();
	for processed in batch {
		deltas.add(&processed.envelope);
	}
	deltas
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::envelope::{ElectionVote, ValidationEnvelope};
	use ballot_primitives::{Choice, Fingerprint, VoteMethod};

	fn law_envelope(n: u8, choice: Choice) -> ValidationEnvelope {
		ValidationEnvelope::law(
			Fingerprint::compute(&format!("10000000{n}"), "ABC123", "L2025-001"),
			"L2025-001".to_string(),
			choice,
			Utc::now(),
		)
	}

	fn ranked_envelope(ranking: Vec<u32>) -> ValidationEnvelope {
		ValidationEnvelope::election(
			Fingerprint::compute("123456789", "ABC123", "election:1"),
			ElectionVote {
				election_id: 1,
				region_id: 1,
				method: VoteMethod::Ranked,
				single_choice: None,
				ranked_choices: Some(ranking),
			},
			Utc::now(),
		)
	}

	#[test]
	fn deltas_group_by_tally_key() {
		let mut deltas = TallyDeltas::default();
		deltas.add(&law_envelope(1, Choice::Yes));
		deltas.add(&law_envelope(2, Choice::Yes));
		deltas.add(&law_envelope(3, Choice::No));
		assert_eq!(deltas.law.get("L2025-001"), Some(&(2, 1)));
	}

	#[test]
	fn ranked_ballot_credits_first_preference_only() {
		let mut deltas = TallyDeltas::default();
		deltas.add(&ranked_envelope(vec![7, 3, 9]));
		assert_eq!(deltas.election.get(&(1, 1, 7)), Some(&1));
		assert_eq!(deltas.election.get(&(1, 1, 3)), None);
		assert_eq!(deltas.election.get(&(1, 1, 9)), None);
	}

	#[test]
	fn batch_outcome_is_independent_of_batch_boundaries() {
		let envelopes = vec![
			ProcessedEnvelope::accepted(law_envelope(1, Choice::Yes)),
			ProcessedEnvelope::accepted(law_envelope(2, Choice::No)),
			ProcessedEnvelope::accepted(ranked_envelope(vec![7, 3])),
		];

		let one_batch = deltas_for(&envelopes);

		let mut many_batches = TallyDeltas::default();
		for envelope in &envelopes {
			let single = deltas_for(std::slice::from_ref(envelope));
			for (k, (y, n)) in single.law {
				let entry = many_batches.law.entry(k).or_default();
				entry.0 += y;
				entry.1 += n;
			}
			for (k, v) in single.election {
				*many_batches.election.entry(k).or_default() += v;
			}
		}

		assert_eq!(one_batch, many_batches);
	}

	async fn connect_test_store() -> TallyStore {
		let settings = crate::settings::test_utils::new_test_settings().database;
		let store = TallyStore::connect(&settings).await.unwrap();
		store.migrate().await.unwrap();
		store
	}

	// Fresh scope per run so reruns against the same database stay
	// independent.
	fn unique_scope() -> String {
		format!("L-recon-{}", hex::encode(rand::random::<[u8; 8]>()))
	}

	#[tokio::test]
	#[ignore = "requires a running postgres"]
	async fn reconciliation_report_surfaces_an_audit_tally_shortfall() {
		let store = connect_test_store().await;
		let scope = unique_scope();

		// Two accepted audits, but only one of them reached the tally:
		// the crash-between-audit-and-forward case the report exists for.
		let mut first = law_envelope(1, Choice::Yes);
		first.law.as_mut().unwrap().ballot_id = scope.clone();
		let mut second = law_envelope(2, Choice::No);
		second.law.as_mut().unwrap().ballot_id = scope.clone();
		for envelope in [&first, &second] {
			assert_eq!(
				store
					.insert_audit(&AuditRecord::from_envelope(
						envelope,
						EnvelopeStatus::Accepted,
						None,
						None,
					))
					.await
					.unwrap(),
				AuditWrite::Inserted
			);
		}
		let mut deltas = TallyDeltas::default();
		deltas.add(&first);
		store.apply_deltas(&deltas).await.unwrap();

		assert_eq!(store.accepted_audit_count(&scope).await.unwrap(), 2);

		let report = store.reconciliation_report().await.unwrap();
		let row = report.iter().find(|row| row.scope == scope).unwrap();
		assert_eq!(row.accepted_audits, 2);
		assert_eq!(row.tallied, 1);
	}

	#[tokio::test]
	#[ignore = "requires a running postgres"]
	async fn duplicate_audit_count_tracks_recorded_duplicates() {
		let store = connect_test_store().await;
		let scope = unique_scope();
		let envelope = ValidationEnvelope::law(
			Fingerprint::compute("123456789", "ABC123", &scope),
			scope.clone(),
			Choice::Yes,
			Utc::now(),
		);

		store
			.insert_audit(&AuditRecord::from_envelope(&envelope, EnvelopeStatus::Accepted, None, None))
			.await
			.unwrap();
		for attempt in 1..=2 {
			store
				.insert_audit(&AuditRecord::from_envelope(
					&envelope,
					EnvelopeStatus::Duplicate,
					Some(attempt),
					None,
				))
				.await
				.unwrap();
		}

		assert_eq!(
			store.duplicate_audit_count(envelope.fingerprint.as_str()).await.unwrap(),
			2
		);
		assert_eq!(store.accepted_audit_count(&scope).await.unwrap(), 1);
	}

	#[test]
	fn window_start_is_inclusive_and_end_exclusive() {
		let cache = WindowCache::default();
		let start = Utc::now();
		let end = start + chrono::Duration::hours(24);
		cache.insert(1, start, end);

		assert_eq!(cache.status(1, start), WindowStatus::Open);
		assert_eq!(cache.status(1, end - chrono::Duration::seconds(1)), WindowStatus::Open);
		assert_eq!(cache.status(1, end), WindowStatus::Closed);
		assert_eq!(cache.status(1, start - chrono::Duration::seconds(1)), WindowStatus::Closed);
		assert_eq!(cache.status(2, start), WindowStatus::Unknown);
	}
}
