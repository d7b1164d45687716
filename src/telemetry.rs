//! Tracing and metrics bootstrap (ambient observability layer).
//!
//! `init_tracing` builds an env filter with a crate-scoped default plus a
//! `fmt` layer; `init_metrics` installs a live Prometheus recorder over the
//! `metrics`/`metrics-exporter-prometheus` pair, since a long-running
//! harvester needs a real `/metrics` scrape endpoint for the API module to
//! expose.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "convergence_core=info,harvester=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Install a process-wide Prometheus recorder and return its handle, which
/// the API module renders on `/metrics`.
pub fn init_metrics() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    Ok(handle)
}

/// Named counters/gauges emitted across the convergence loop, kept as
/// consts for the same reason `events::names` is (no string-literal typos
/// across call sites).
pub mod names {
    pub const ROUNDS_RUN_TOTAL: &str = "ce_rounds_run_total";
    pub const SOURCES_FETCHED_TOTAL: &str = "ce_sources_fetched_total";
    pub const SOURCES_DEDUPED_TOTAL: &str = "ce_sources_deduped_total";
    pub const FIELDS_ACCEPTED_TOTAL: &str = "ce_fields_accepted_total";
    pub const FIELDS_CONFLICT_TOTAL: &str = "ce_fields_conflict_total";
    pub const REPAIR_JOBS_ENQUEUED_TOTAL: &str = "ce_repair_jobs_enqueued_total";
    pub const RUN_DURATION_SECONDS: &str = "ce_run_duration_seconds";
    pub const ACTIVE_RUNS: &str = "ce_active_runs";
}

pub fn record_round_completed() {
    metrics::counter!(names::ROUNDS_RUN_TOTAL).increment(1);
}

pub fn record_source_fetched(deduped: bool) {
    metrics::counter!(names::SOURCES_FETCHED_TOTAL).increment(1);
    if deduped {
        metrics::counter!(names::SOURCES_DEDUPED_TOTAL).increment(1);
    }
}

pub fn record_field_outcome(accepted: bool, conflicted: bool) {
    if accepted {
        metrics::counter!(names::FIELDS_ACCEPTED_TOTAL).increment(1);
    }
    if conflicted {
        metrics::counter!(names::FIELDS_CONFLICT_TOTAL).increment(1);
    }
}

pub fn record_repair_job_enqueued() {
    metrics::counter!(names::REPAIR_JOBS_ENQUEUED_TOTAL).increment(1);
}

pub fn record_run_duration(seconds: f64) {
    metrics::histogram!(names::RUN_DURATION_SECONDS).record(seconds);
}

pub fn set_active_runs(count: i64) {
    metrics::gauge!(names::ACTIVE_RUNS).set(count as f64);
}
