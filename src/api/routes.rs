//! Handlers for the router assembled in `api::router`: a typed query or
//! JSON body in, a typed `Json<T>` response or `StatusCode` out.

use super::{AppState, OverrideRecord, RunStatus};
use crate::contract::CategoryContract;
use crate::evidence_index::SearchFilters;
use crate::identity::ProductTarget;
use crate::types::FieldKey;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct RunRequest {
    pub contract: CategoryContract,
    pub target: ProductTarget,
    #[serde(default)]
    pub run_id: Option<String>,
    /// Known-good product page URLs to fetch on round 0, ahead of any
    /// search query (§276 Product job `seed_urls?`).
    #[serde(default)]
    pub seed_urls: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct RunStartedResponse {
    pub run_id: String,
}

/// Launches a new convergence run (the RC entry point, §4.1), returning
/// immediately with the assigned `run_id`.
pub async fn start_run(State(state): State<AppState>, Json(request): Json<RunRequest>) -> Result<Json<RunStartedResponse>, StatusCode> {
    state
        .launch_run(request)
        .map(|run_id| Json(RunStartedResponse { run_id }))
        .map_err(|e| {
            tracing::error!(error = %e, "failed to launch run");
            StatusCode::INTERNAL_SERVER_ERROR
        })
}

#[derive(Debug, Serialize)]
pub struct RunSummaryResponse {
    pub status: RunStatus,
    pub summary: Option<crate::round::RunSummary>,
    pub overrides: std::collections::HashMap<FieldKey, OverrideRecord>,
}

/// `get_run_summary(run_id)` (§6).
pub async fn get_run_summary(State(state): State<AppState>, Path(run_id): Path<String>) -> Result<Json<RunSummaryResponse>, StatusCode> {
    let entry = state.runs.read().get(&run_id).cloned().ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(RunSummaryResponse {
        status: *entry.status.read(),
        summary: entry.summary.read().clone(),
        overrides: entry.overrides.read().clone(),
    }))
}

/// `get_round_history(run_id)` (§6).
pub async fn get_round_history(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Vec<crate::round::RoundSummary>>, StatusCode> {
    let entry = state.runs.read().get(&run_id).cloned().ok_or(StatusCode::NOT_FOUND)?;
    let summary = entry.summary.read();
    match &*summary {
        Some(s) => Ok(Json(s.rounds.clone())),
        None => Ok(Json(Vec::new())),
    }
}

/// `get_prime_sources(run_id, field_key)` (§6).
pub async fn get_prime_sources(
    State(state): State<AppState>,
    Path((run_id, field_key)): Path<(String, String)>,
) -> Result<Json<crate::retrieval::PrimeSourcePack>, StatusCode> {
    let entry = state.runs.read().get(&run_id).cloned().ok_or(StatusCode::NOT_FOUND)?;
    let summary = entry.summary.read();
    let pack = summary
        .as_ref()
        .and_then(|s| s.prime_sources.get(&field_key))
        .cloned()
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(pack))
}

/// `pause_run` (§6): sets the cooperative pause gate; takes effect at the
/// next round boundary, not mid-round (§5).
pub async fn pause_run(State(state): State<AppState>, Path(run_id): Path<String>) -> StatusCode {
    let Some(entry) = state.runs.read().get(&run_id).cloned() else {
        return StatusCode::NOT_FOUND;
    };
    entry.control.gate.pause();
    *entry.status.write() = RunStatus::Paused;
    StatusCode::NO_CONTENT
}

/// `resume_run` (§6).
pub async fn resume_run(State(state): State<AppState>, Path(run_id): Path<String>) -> StatusCode {
    let Some(entry) = state.runs.read().get(&run_id).cloned() else {
        return StatusCode::NOT_FOUND;
    };
    entry.control.gate.resume();
    if matches!(*entry.status.read(), RunStatus::Paused) {
        *entry.status.write() = RunStatus::Running;
    }
    StatusCode::NO_CONTENT
}

/// `cancel_run` (§6): aborts the driving task. A simplification of the full
/// lane-drain-then-persist cancellation story in §5 — see DESIGN.md.
pub async fn cancel_run(State(state): State<AppState>, Path(run_id): Path<String>) -> StatusCode {
    let Some(entry) = state.runs.read().get(&run_id).cloned() else {
        return StatusCode::NOT_FOUND;
    };
    entry.control.cancel();
    *entry.status.write() = RunStatus::Cancelled;
    StatusCode::NO_CONTENT
}

#[derive(Debug, Deserialize)]
pub struct OverrideRequest {
    pub field: FieldKey,
    pub value: serde_json::Value,
    pub reason: String,
}

/// `apply_override(product_id, field, value, reason)` (§6). Recorded
/// alongside the run rather than mutating `field_states` in place — the run
/// may already have finished, and an override is a human decision layered
/// on top of evidence, not new evidence itself.
pub async fn apply_override(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Json(request): Json<OverrideRequest>,
) -> StatusCode {
    let Some(entry) = state.runs.read().get(&run_id).cloned() else {
        return StatusCode::NOT_FOUND;
    };
    entry.overrides.write().insert(
        request.field,
        OverrideRecord {
            value: request.value,
            reason: request.reason,
            applied_at: chrono::Utc::now(),
        },
    );
    StatusCode::NO_CONTENT
}

#[derive(Debug, Deserialize)]
pub struct EvidenceSearchQuery {
    pub category: String,
    pub query: String,
    #[serde(default)]
    pub kind: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum EvidenceSearchResponse {
    Chunks(Vec<crate::evidence_index::Chunk>),
    Facts(Vec<crate::evidence_index::Fact>),
}

/// `search_evidence(category, query)` (§6), over the category's shared EI
/// partition (facts or chunks, selected by `kind`).
pub async fn search_evidence(
    State(state): State<AppState>,
    Query(params): Query<EvidenceSearchQuery>,
) -> Result<Json<EvidenceSearchResponse>, StatusCode> {
    let index = {
        let indices = state.indices.read();
        indices.get(&params.category).cloned()
    };
    let Some(index) = index else {
        return Ok(Json(EvidenceSearchResponse::Chunks(Vec::new())));
    };
    let filters = SearchFilters::default();
    match params.kind.as_deref() {
        Some("facts") => {
            let facts = index.search_facts_fts(&params.query, &filters).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
            Ok(Json(EvidenceSearchResponse::Facts(facts)))
        }
        _ => {
            let chunks = index.search_chunks_fts(&params.query, &filters).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
            Ok(Json(EvidenceSearchResponse::Chunks(chunks)))
        }
    }
}

/// Websocket bridge for the append-only event stream (§6): a
/// `WebSocketUpgrade` handshake feeding a `broadcast::Receiver` forwarding
/// loop. Every connected client gets every event for every run; GUI clients
/// filter client-side by `run_id`, same as any broadcast-fed event socket.
pub async fn run_events_ws(State(state): State<AppState>, Path(_run_id): Path<String>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_event_socket(socket, state))
}

async fn handle_event_socket(mut socket: WebSocket, state: AppState) {
    let mut rx = state.events.subscribe();
    while let Ok(event) = rx.recv().await {
        let Ok(payload) = serde_json::to_string(&event) else { continue };
        if socket.send(Message::Text(payload)).await.is_err() {
            break;
        }
    }
}
