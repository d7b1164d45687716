//! Append-only event stream (§6). Cross-component signals are messages, not
//! shared mutation — the GUI and batch orchestrator are both just
//! subscribers, fed by an `axum`-compatible `tokio::sync::broadcast`
//! channel behind an `EventSink` trait so an NDJSON file writer and an
//! in-memory test sink share the same seam.

use crate::types::RunId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Search,
    Fetch,
    Parse,
    Index,
    Extract,
    Consensus,
    Needset,
    Round,
    Automation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub run_id: RunId,
    pub ts: DateTime<Utc>,
    pub stage: Stage,
    pub event: String,
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(run_id: impl Into<String>, stage: Stage, event: impl Into<String>, payload: serde_json::Value, ts: DateTime<Utc>) -> Self {
        Event { run_id: run_id.into(), ts, stage, event: event.into(), payload }
    }
}

/// Required event names from §6, kept as consts so callers can't typo the
/// wire format.
pub mod names {
    pub const RUN_STARTED: &str = "run_started";
    pub const RUN_COMPLETED: &str = "run_completed";
    pub const CONVERGENCE_ROUND_STARTED: &str = "convergence_round_started";
    pub const CONVERGENCE_ROUND_COMPLETED: &str = "convergence_round_completed";
    pub const CONVERGENCE_STOP: &str = "convergence_stop";
    pub const NEEDSET_COMPUTED: &str = "needset_computed";
    pub const SOURCE_FETCH_STARTED: &str = "source_fetch_started";
    pub const SOURCE_FETCH_SKIPPED: &str = "source_fetch_skipped";
    pub const SOURCE_FETCH_FAILED: &str = "source_fetch_failed";
    pub const SOURCE_PROCESSED: &str = "source_processed";
    pub const EVIDENCE_INDEX_RESULT: &str = "evidence_index_result";
    pub const PRIME_SOURCES_BUILT: &str = "prime_sources_built";
    pub const EXTRACTION_BATCH_COMPLETED: &str = "extraction_batch_completed";
    pub const IDENTITY_LOCK_STATE: &str = "identity_lock_state";
    pub const REPAIR_QUERY_ENQUEUED: &str = "repair_query_enqueued";
    pub const URL_COOLDOWN_APPLIED: &str = "url_cooldown_applied";
    pub const BLOCKED_DOMAIN_COOLDOWN_APPLIED: &str = "blocked_domain_cooldown_applied";
}

/// Every structural transition is published here; nothing outside a
/// component's owner mutates that component's state directly (§5).
#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: Event);
}

/// In-memory sink for tests and for the axum websocket bridge (paired with
/// a `tokio::sync::broadcast::Sender` upstream of this trait object).
#[derive(Default)]
pub struct MemorySink {
    events: parking_lot::Mutex<Vec<Event>>,
}

#[async_trait::async_trait]
impl EventSink for MemorySink {
    async fn publish(&self, event: Event) {
        self.events.lock().push(event);
    }
}

impl MemorySink {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }
}

/// Per-run NDJSON events file (§6's persisted run artifact).
pub struct NdjsonSink {
    file: parking_lot::Mutex<std::fs::File>,
}

impl NdjsonSink {
    pub fn create(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        let file = std::fs::File::create(path)?;
        Ok(NdjsonSink { file: parking_lot::Mutex::new(file) })
    }
}

#[async_trait::async_trait]
impl EventSink for NdjsonSink {
    async fn publish(&self, event: Event) {
        if let Ok(line) = serde_json::to_string(&event) {
            let mut file = self.file.lock();
            let _ = writeln!(file, "{line}");
        }
    }
}

/// Fan an event out to every registered sink (used when both an NDJSON
/// writer and a live websocket broadcast must see the same stream).
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        FanoutSink { sinks }
    }
}

#[async_trait::async_trait]
impl EventSink for FanoutSink {
    async fn publish(&self, event: Event) {
        for sink in &self.sinks {
            sink.publish(event.clone()).await;
        }
    }
}

/// Feeds the append-only stream into a `tokio::sync::broadcast` channel so
/// the axum websocket route (§6) can fan a single run's events out to any
/// number of connected GUI clients. Lagging subscribers drop old events
/// rather than blocking the publisher — the same trade-off `broadcast`
/// always makes.
#[derive(Clone)]
pub struct BroadcastSink {
    sender: tokio::sync::broadcast::Sender<Event>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = tokio::sync::broadcast::channel(capacity);
        BroadcastSink { sender }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

#[async_trait::async_trait]
impl EventSink for BroadcastSink {
    async fn publish(&self, event: Event) {
        // No subscribers is not an error; the event simply has no GUI to reach yet.
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_sink_records_published_events() {
        let sink = MemorySink::default();
        sink.publish(Event::new("run1", Stage::Round, names::RUN_STARTED, serde_json::json!({}), Utc::now())).await;
        assert_eq!(sink.events().len(), 1);
        assert_eq!(sink.events()[0].event, names::RUN_STARTED);
    }

    #[tokio::test]
    async fn fanout_sink_delivers_to_every_registered_sink() {
        let a = Arc::new(MemorySink::default());
        let b = Arc::new(MemorySink::default());
        let fanout = FanoutSink::new(vec![a.clone(), b.clone()]);
        fanout.publish(Event::new("run1", Stage::Needset, names::NEEDSET_COMPUTED, serde_json::json!({}), Utc::now())).await;
        assert_eq!(a.events().len(), 1);
        assert_eq!(b.events().len(), 1);
    }

    #[tokio::test]
    async fn broadcast_sink_delivers_to_subscribers() {
        let sink = BroadcastSink::new(16);
        let mut rx = sink.subscribe();
        sink.publish(Event::new("run1", Stage::Fetch, names::SOURCE_FETCH_STARTED, serde_json::json!({}), Utc::now())).await;
        let received = rx.recv().await.unwrap();
        assert_eq!(received.event, names::SOURCE_FETCH_STARTED);
    }
}
