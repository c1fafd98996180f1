//! Stateless ingestion front-end.
//!
//! Accepts ballot submissions over HTTP, rejects malformed input
//! synchronously and hands well-formed envelopes to the bus with
//! confirmed-publish semantics. Raw credentials live only inside the
//! request handlers: the fingerprint is computed here and the `nas` /
//! `code` pair never reaches a queue, a log line or a database row.

use crate::{
	envelope::{ElectionVote, ValidationEnvelope},
	mq::BusPublisher,
	store::{ResultsStore, WindowCache, WindowStatus},
};
use axum::{
	extract::{Path, State},
	http::StatusCode,
	response::{IntoResponse, Response},
	routing::{get, post},
	Json, Router,
};
use ballot_primitives::{
	election_scope, CandidateId, Choice, ElectionId, Fingerprint, RegionId, VoteMethod,
	CODE_CHARS, MAX_BALLOT_ID_LEN, NAS_DIGITS,
};
use chrono::Utc;
use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	time::Duration,
};

lazy_static! {
	static ref NAS_RE: Regex = Regex::new(r"^[0-9]{9}$").expect("valid regex");
	static ref CODE_RE: Regex = Regex::new(r"^[A-Za-z0-9]{6}$").expect("valid regex");
}

/// Connection statuses reported by `GET /health`, refreshed by a
/// background probe task.
#[derive(Default)]
pub struct HealthProbes {
	bus: AtomicBool,
	credential_store: AtomicBool,
	database: AtomicBool,
}

impl HealthProbes {
	pub fn set_bus(&self, ok: bool) {
		self.bus.store(ok, Ordering::Relaxed);
	}

	pub fn set_credential_store(&self, ok: bool) {
		self.credential_store.store(ok, Ordering::Relaxed);
	}

	pub fn set_database(&self, ok: bool) {
		self.database.store(ok, Ordering::Relaxed);
	}

	fn report(&self) -> HealthReport {
		fn status(ok: bool) -> &'static str {
			if ok {
				"ok"
			} else {
				"unreachable"
			}
		}
		let bus = self.bus.load(Ordering::Relaxed);
		let credential_store = self.credential_store.load(Ordering::Relaxed);
		let database = self.database.load(Ordering::Relaxed);
		HealthReport {
			status: status(bus && credential_store && database),
			message_bus: status(bus),
			credential_store: status(credential_store),
			database: status(database),
		}
	}
}

#[derive(Serialize)]
struct HealthReport {
	status: &'static str,
	message_bus: &'static str,
	credential_store: &'static str,
	database: &'static str,
}

pub struct AppState<B, R> {
	pub bus: Arc<B>,
	pub results: Arc<R>,
	pub windows: Arc<WindowCache>,
	pub probes: Arc<HealthProbes>,
	pub request_deadline: Duration,
}

// Manual impl: a derived Clone would demand B: Clone and R: Clone even
// though only the Arcs are cloned.
impl<B, R> Clone for AppState<B, R> {
	fn clone(&self) -> Self {
		Self {
			bus: self.bus.clone(),
			results: self.results.clone(),
			windows: self.windows.clone(),
			probes: self.probes.clone(),
			request_deadline: self.request_deadline,
		}
	}
}

pub fn router<B, R>(state: AppState<B, R>) -> Router
where
	B: BusPublisher + 'static,
	R: ResultsStore + 'static,
{
	Router::new()
		.route("/vote", post(submit_law_vote))
		.route("/elections/vote", post(submit_election_vote))
		.route("/results/:ballot_id", get(law_results))
		.route("/elections/:election_id/regions/:region_id/results", get(election_results))
		.route("/health", get(health))
		.with_state(state)
}

#[derive(Debug)]
enum ApiError {
	Shape { error: String, field: &'static str },
	ElectionClosed,
	NotFound(&'static str),
	Unavailable(String),
}

#[derive(Serialize)]
struct ErrorBody {
	error: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	field: Option<&'static str>,
}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		let (status, body) = match self {
			ApiError::Shape { error, field } =>
				(StatusCode::BAD_REQUEST, ErrorBody { error, field: Some(field) }),
			ApiError::ElectionClosed => (
				StatusCode::BAD_REQUEST,
				ErrorBody { error: "election_closed".to_string(), field: Some("election_id") },
			),
			ApiError::NotFound(what) =>
				(StatusCode::NOT_FOUND, ErrorBody { error: what.to_string(), field: None }),
			ApiError::Unavailable(error) =>
				(StatusCode::SERVICE_UNAVAILABLE, ErrorBody { error, field: None }),
		};
		(status, Json(body)).into_response()
	}
}

fn shape(error: impl Into<String>, field: &'static str) -> ApiError {
	ApiError::Shape { error: error.into(), field }
}

#[derive(Serialize)]
struct VoteQueued {
	request_id: String,
	status: &'static str,
}

#[derive(Deserialize)]
pub struct LawVoteRequest {
	nas: String,
	code: String,
	ballot_id: String,
	choice: String,
}

#[derive(Deserialize)]
pub struct ElectionVoteRequest {
	nas: String,
	code: String,
	election_id: i64,
	region_id: i64,
	method: String,
	single_choice: Option<i64>,
	ranked_choices: Option<Vec<i64>>,
}

fn validate_credentials(nas: &str, code: &str) -> Result<(), ApiError> {
	if !NAS_RE.is_match(nas) {
		return Err(shape(format!("nas must be exactly {NAS_DIGITS} digits"), "nas"));
	}
	if !CODE_RE.is_match(code) {
		return Err(shape(
			format!("code must be exactly {CODE_CHARS} alphanumeric characters"),
			"code",
		));
	}
	Ok(())
}

fn validate_law(request: &LawVoteRequest) -> Result<Choice, ApiError> {
	validate_credentials(&request.nas, &request.code)?;
	if request.ballot_id.is_empty() || request.ballot_id.len() > MAX_BALLOT_ID_LEN {
		return Err(shape(
			format!("ballot_id must be between 1 and {MAX_BALLOT_ID_LEN} characters"),
			"ballot_id",
		));
	}
	match request.choice.as_str() {
		"yes" => Ok(Choice::Yes),
		"no" => Ok(Choice::No),
		_ => Err(shape("choice must be yes or no", "choice")),
	}
}

fn positive_id(value: i64, field: &'static str) -> Result<u32, ApiError> {
	u32::try_from(value)
		.ok()
		.filter(|id| *id >= 1)
		.ok_or_else(|| shape("must be a positive integer", field))
}

fn validate_election(request: &ElectionVoteRequest) -> Result<ElectionVote, ApiError> {
	validate_credentials(&request.nas, &request.code)?;
	let election_id: ElectionId = positive_id(request.election_id, "election_id")?;
	let region_id: RegionId = positive_id(request.region_id, "region_id")?;

	match request.method.as_str() {
		"single" => {
			if request.ranked_choices.is_some() {
				return Err(shape("single-choice ballot must not rank candidates", "ranked_choices"));
			}
			let candidate: CandidateId = positive_id(
				request.single_choice.ok_or_else(|| shape("required for method single", "single_choice"))?,
				"single_choice",
			)?;
			Ok(ElectionVote {
				election_id,
				region_id,
				method: VoteMethod::Single,
				single_choice: Some(candidate),
				ranked_choices: None,
			})
		},
		"ranked" => {
			if request.single_choice.is_some() {
				return Err(shape("ranked ballot must not carry single_choice", "single_choice"));
			}
			let ranked = request
				.ranked_choices
				.as_ref()
				.filter(|ranking| !ranking.is_empty())
				.ok_or_else(|| shape("required for method ranked", "ranked_choices"))?;
			let ranking = ranked
				.iter()
				.map(|candidate| positive_id(*candidate, "ranked_choices"))
				.collect::<Result<Vec<CandidateId>, _>>()?;
			if !ranking.iter().all_unique() {
				return Err(shape("ranked choices must be distinct", "ranked_choices"));
			}
			Ok(ElectionVote {
				election_id,
				region_id,
				method: VoteMethod::Ranked,
				single_choice: None,
				ranked_choices: Some(ranking),
			})
		},
		_ => Err(shape("method must be single or ranked", "method")),
	}
}

/// Publish with broker confirmation under the request deadline; only a
/// confirmed publish earns the 202.
async fn confirmed_publish<B: BusPublisher>(
	state: &AppState<B, impl ResultsStore>,
	routing_key: &str,
	payload: Vec<u8>,
	kind: &'static str,
) -> Result<(StatusCode, Json<VoteQueued>), ApiError> {
	match tokio::time::timeout(state.request_deadline, state.bus.publish(routing_key, payload))
		.await
	{
		Ok(Ok(())) => {
			crate::metrics::SUBMISSIONS_RECEIVED.with_label_values(&[kind, "queued"]).inc();
			Ok((
				StatusCode::ACCEPTED,
				Json(VoteQueued {
					request_id: hex::encode(rand::random::<[u8; 16]>()),
					status: "queued",
				}),
			))
		},
		Ok(Err(error)) => {
			crate::metrics::SUBMISSIONS_RECEIVED.with_label_values(&[kind, "unavailable"]).inc();
			tracing::warn!("publish failed, answering 503: {error}");
			Err(ApiError::Unavailable("could not enqueue the ballot, retry later".to_string()))
		},
		Err(_) => {
			crate::metrics::SUBMISSIONS_RECEIVED.with_label_values(&[kind, "deadline"]).inc();
			Err(ApiError::Unavailable("request deadline exceeded, retry later".to_string()))
		},
	}
}

async fn submit_law_vote<B, R>(
	State(state): State<AppState<B, R>>,
	Json(request): Json<LawVoteRequest>,
) -> Result<(StatusCode, Json<VoteQueued>), ApiError>
where
	B: BusPublisher,
	R: ResultsStore,
{
	let choice = validate_law(&request)?;
	// The raw credential pair stops here; only its digest travels on.
	let fingerprint = Fingerprint::compute(&request.nas, &request.code, &request.ballot_id);
	let envelope =
		ValidationEnvelope::law(fingerprint, request.ballot_id.clone(), choice, Utc::now());
	confirmed_publish(&state, envelope.routing_key(), envelope.encode(), "law").await
}

async fn submit_election_vote<B, R>(
	State(state): State<AppState<B, R>>,
	Json(request): Json<ElectionVoteRequest>,
) -> Result<(StatusCode, Json<VoteQueued>), ApiError>
where
	B: BusPublisher,
	R: ResultsStore,
{
	let vote = validate_election(&request)?;
	let now = Utc::now();
	// Submissions at start_at are accepted, at end_at rejected. An
	// election the cache does not know cannot accept votes either.
	if state.windows.status(vote.election_id, now) != WindowStatus::Open {
		return Err(ApiError::ElectionClosed);
	}
	let fingerprint =
		Fingerprint::compute(&request.nas, &request.code, &election_scope(vote.election_id));
	let envelope = ValidationEnvelope::election(fingerprint, vote, now);
	confirmed_publish(&state, envelope.routing_key(), envelope.encode(), "election").await
}

async fn law_results<B, R>(
	State(state): State<AppState<B, R>>,
	Path(ballot_id): Path<String>,
) -> Result<Response, ApiError>
where
	B: BusPublisher,
	R: ResultsStore,
{
	match state.results.law_results(&ballot_id).await {
		Ok(Some(row)) => Ok(Json(row).into_response()),
		Ok(None) => Err(ApiError::NotFound("unknown ballot")),
		Err(error) => {
			tracing::warn!("results query failed: {error}");
			Err(ApiError::Unavailable("results are temporarily unavailable".to_string()))
		},
	}
}

async fn election_results<B, R>(
	State(state): State<AppState<B, R>>,
	Path((election_id, region_id)): Path<(ElectionId, RegionId)>,
) -> Result<Response, ApiError>
where
	B: BusPublisher,
	R: ResultsStore,
{
	match state.results.election_results(election_id, region_id).await {
		Ok(rows) => Ok(Json(rows).into_response()),
		Err(error) => {
			tracing::warn!("results query failed: {error}");
			Err(ApiError::Unavailable("results are temporarily unavailable".to_string()))
		},
	}
}

async fn health<B, R>(State(state): State<AppState<B, R>>) -> Response
where
	B: BusPublisher,
	R: ResultsStore,
{
	let report = state.probes.report();
	let status = if report.status == "ok" {
		StatusCode::OK
	} else {
		StatusCode::SERVICE_UNAVAILABLE
	};
	(status, Json(report)).into_response()
}
