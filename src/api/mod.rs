//! Read-only query surface plus action hooks (§6): an `AppState` the
//! handlers receive via `axum::extract::State`, `Json<T>` response bodies,
//! and a websocket route fed by a `broadcast::Sender`.

pub mod routes;

use crate::api::routes::RunRequest;
use crate::config::RunSettings;
use crate::contract::CategoryContract;
use crate::engine::{PauseGate, Run, RunHandles};
use crate::events::{BroadcastSink, EventSink, FanoutSink, NdjsonSink};
use crate::evidence_index::EvidenceIndex;
use crate::fetch::{FetchScheduler, ReqwestFetcher};
use crate::frontier::UrlFrontier;
use crate::learning::LearningStores;
use crate::queue::AutomationQueue;
use crate::round::RunSummary;
use crate::types::FieldKey;
use axum::{
    routing::{get, post},
    Router,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Override recorded by `apply_override` (§6). Kept distinct from
/// `FieldState` because an override is a human decision layered on top of
/// the evidence-derived value, not itself evidence.
#[derive(Debug, Clone, serde::Serialize)]
pub struct OverrideRecord {
    pub value: serde_json::Value,
    pub reason: String,
    pub applied_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Paused,
    Completed,
    Cancelled,
    Failed,
}

/// Best-effort run control surfaced to `pause_run`/`resume_run`/`cancel_run`.
/// Pausing is cooperative (checked once per round boundary, §5); cancelling
/// aborts the driving task outright rather than draining lanes gracefully —
/// a simplification from the full §5 cancellation story, noted in DESIGN.md.
pub struct RunControl {
    pub gate: Arc<PauseGate>,
    pub cancelled: AtomicBool,
    handle: RwLock<Option<tokio::task::JoinHandle<()>>>,
}

impl RunControl {
    fn new() -> Self {
        RunControl {
            gate: Arc::new(PauseGate::new()),
            cancelled: AtomicBool::new(false),
            handle: RwLock::new(None),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.write().take() {
            handle.abort();
        }
    }
}

pub struct RunEntry {
    pub status: RwLock<RunStatus>,
    pub summary: RwLock<Option<RunSummary>>,
    pub overrides: RwLock<HashMap<FieldKey, OverrideRecord>>,
    pub control: Arc<RunControl>,
}

#[derive(Clone)]
pub struct AppState {
    pub runs: Arc<RwLock<HashMap<String, Arc<RunEntry>>>>,
    pub indices: Arc<RwLock<HashMap<String, EvidenceIndex>>>,
    pub frontier: Arc<UrlFrontier>,
    pub queue: AutomationQueue,
    pub learning: LearningStores,
    pub events: Arc<BroadcastSink>,
    pub settings: Arc<RunSettings>,
    pub run_counter: Arc<std::sync::atomic::AtomicU64>,
}

impl AppState {
    pub fn new(settings: RunSettings, frontier: Arc<UrlFrontier>, queue: AutomationQueue, learning: LearningStores) -> Self {
        AppState {
            runs: Arc::new(RwLock::new(HashMap::new())),
            indices: Arc::new(RwLock::new(HashMap::new())),
            frontier,
            queue,
            learning,
            events: Arc::new(BroadcastSink::new(1024)),
            settings: Arc::new(settings),
            run_counter: Arc::new(std::sync::atomic::AtomicU64::new(0)),
        }
    }

    /// Open (or reuse) the per-category evidence index. Documents persist
    /// across runs and products of the same category (invariant 3, §3), so
    /// the index is keyed by category, not by run_id.
    fn index_for_category(&self, category: &str) -> anyhow::Result<EvidenceIndex> {
        if let Some(existing) = self.indices.read().get(category) {
            return Ok(existing.clone());
        }
        let path = PathBuf::from(&self.settings.database_dir).join(format!("evidence_{category}.db"));
        std::fs::create_dir_all(&self.settings.database_dir).ok();
        let index = EvidenceIndex::open(path)?;
        self.indices.write().insert(category.to_string(), index.clone());
        Ok(index)
    }

    pub fn next_run_id(&self) -> String {
        let n = self.run_counter.fetch_add(1, Ordering::SeqCst);
        format!("{}-{n}", self.settings.run_id_prefix)
    }

    /// Launch a new run in the background (`RunHandles` are built fresh
    /// per-run; `EvidenceIndex`/frontier/queue/learning are the long-lived
    /// stores shared across runs). Returns the assigned `run_id` immediately;
    /// the task updates `RunEntry` as it progresses.
    pub fn launch_run(&self, request: RunRequest) -> anyhow::Result<String> {
        let run_id = request.run_id.unwrap_or_else(|| self.next_run_id());
        let index = self.index_for_category(&request.target.category)?;

        let mut sinks: Vec<Arc<dyn EventSink>> = vec![self.events.clone()];
        if let Some(dir) = &self.settings.events_ndjson_path {
            let path = PathBuf::from(dir).join(format!("{run_id}.ndjson"));
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).ok();
            }
            if let Ok(sink) = NdjsonSink::create(path) {
                sinks.push(Arc::new(sink));
            }
        }
        let fanout = Arc::new(FanoutSink::new(sinks));

        let scheduler = FetchScheduler::new(
            self.frontier.clone(),
            vec![Arc::new(ReqwestFetcher::new(std::time::Duration::from_secs(
                self.settings.fetch_timeout_secs,
            ))?)],
            self.settings.lane_configs(),
        );

        let mut handles = RunHandles::new(
            run_id.clone(),
            request.contract,
            request.target,
            index,
            self.frontier.clone(),
            self.queue.clone(),
            self.learning.clone(),
            scheduler,
            fanout,
        )
        .with_seed_urls(request.seed_urls);
        handles.convergence_config = self.settings.convergence.clone();

        let control = Arc::new(RunControl::new());
        let entry = Arc::new(RunEntry {
            status: RwLock::new(RunStatus::Running),
            summary: RwLock::new(None),
            overrides: RwLock::new(HashMap::new()),
            control: control.clone(),
        });
        self.runs.write().insert(run_id.clone(), entry.clone());

        handles.pause_gate = Some(control.gate.clone());
        let run = Run::new(handles);

        let task_entry = entry.clone();
        let join = tokio::spawn(async move {
            match run.run_to_convergence().await {
                Ok(summary) => {
                    *task_entry.summary.write() = Some(summary);
                    *task_entry.status.write() = RunStatus::Completed;
                }
                Err(_) => {
                    *task_entry.status.write() = RunStatus::Failed;
                }
            }
        });
        *control.handle.write() = Some(join);

        Ok(run_id)
    }
}

/// Separate from `router` because it carries no `AppState` — the Prometheus
/// handle is process-global.
pub fn metrics_router(handle: Option<metrics_exporter_prometheus::PrometheusHandle>) -> Router {
    let handle = Arc::new(handle);
    Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move {
                match handle.as_ref() {
                    Some(h) => h.render(),
                    None => String::new(),
                }
            }
        }),
    )
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/runs", post(routes::start_run))
        .route("/runs/:run_id/summary", get(routes::get_run_summary))
        .route("/runs/:run_id/rounds", get(routes::get_round_history))
        .route("/runs/:run_id/fields/:field_key/prime_sources", get(routes::get_prime_sources))
        .route("/runs/:run_id/pause", post(routes::pause_run))
        .route("/runs/:run_id/resume", post(routes::resume_run))
        .route("/runs/:run_id/cancel", post(routes::cancel_run))
        .route("/runs/:run_id/override", post(routes::apply_override))
        .route("/runs/:run_id/events", get(routes::run_events_ws))
        .route("/evidence/search", get(routes::search_evidence))
        .with_state(state)
}
