//! Automation Queue (AQ), §4.11.
//!
//! A persistent job queue with a strict state machine and an append-only
//! audit log (same `store::Partition` bootstrap as EI), plus a per-domain
//! backoff ledger shared by every job in the queue.

use crate::store::Partition;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

const MIGRATIONS: &[&str] = &[r#"
CREATE TABLE queue_jobs (
    job_id TEXT PRIMARY KEY,
    dedup_key TEXT NOT NULL UNIQUE,
    job_type TEXT NOT NULL,
    scope TEXT NOT NULL,
    identity_fingerprint TEXT NOT NULL,
    payload TEXT NOT NULL,
    state TEXT NOT NULL,
    priority INTEGER NOT NULL,
    due_at TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE queue_actions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL REFERENCES queue_jobs(job_id),
    at TEXT NOT NULL,
    from_state TEXT NOT NULL,
    to_state TEXT NOT NULL,
    actor TEXT NOT NULL,
    reason TEXT NOT NULL
);

CREATE TABLE domain_backoff (
    domain TEXT PRIMARY KEY,
    cooldown_until TEXT,
    consecutive_failures INTEGER NOT NULL DEFAULT 0
);
"#];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    RepairSearch,
    Refresh,
    DeficitRediscovery,
}

impl JobType {
    fn as_str(self) -> &'static str {
        match self {
            JobType::RepairSearch => "repair_search",
            JobType::Refresh => "refresh",
            JobType::DeficitRediscovery => "deficit_rediscovery",
        }
    }

    fn parse(s: &str) -> JobType {
        match s {
            "refresh" => JobType::Refresh,
            "deficit_rediscovery" => JobType::DeficitRediscovery,
            _ => JobType::RepairSearch,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Done,
    Failed,
    Cooldown,
}

impl JobState {
    fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Done => "done",
            JobState::Failed => "failed",
            JobState::Cooldown => "cooldown",
        }
    }

    fn parse(s: &str) -> JobState {
        match s {
            "running" => JobState::Running,
            "done" => JobState::Done,
            "failed" => JobState::Failed,
            "cooldown" => JobState::Cooldown,
            _ => JobState::Queued,
        }
    }

    /// Strict state machine from §4.11: `queued -> running -> {done,
    /// failed} -> cooldown?`.
    fn can_transition_to(self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Queued, JobState::Running)
                | (JobState::Running, JobState::Done)
                | (JobState::Running, JobState::Failed)
                | (JobState::Failed, JobState::Cooldown)
                | (JobState::Failed, JobState::Queued)
                | (JobState::Cooldown, JobState::Queued)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub dedup_key: String,
    pub job_type: JobType,
    pub scope: String,
    pub identity_fingerprint: String,
    pub payload: serde_json::Value,
    pub state: JobState,
    pub priority: i64,
    pub due_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub attempts: u32,
}

/// `dedup_key = identity_fingerprint || job_type || scope` (§4.11).
pub fn dedup_key(identity_fingerprint: &str, job_type: JobType, scope: &str) -> String {
    format!("{identity_fingerprint}\u{1}{}\u{1}{scope}", job_type.as_str())
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error("illegal job state transition {from:?} -> {to:?}")]
    IllegalTransition { from: JobState, to: JobState },
}

#[derive(Clone)]
pub struct AutomationQueue {
    partition: Partition,
}

impl AutomationQueue {
    pub fn open(path: impl AsRef<std::path::Path>) -> rusqlite::Result<Self> {
        Ok(AutomationQueue { partition: Partition::open(path, MIGRATIONS)? })
    }

    pub fn open_in_memory() -> rusqlite::Result<Self> {
        Ok(AutomationQueue { partition: Partition::open_in_memory(MIGRATIONS)? })
    }

    /// Enqueue a job, deduplicating on `dedup_key`. Returns `Ok(None)` when
    /// an equivalent job is already queued or running.
    pub fn enqueue(
        &self,
        job_type: JobType,
        scope: &str,
        identity_fingerprint: &str,
        payload: serde_json::Value,
        priority: i64,
        due_at: DateTime<Utc>,
    ) -> Result<Option<String>, QueueError> {
        let key = dedup_key(identity_fingerprint, job_type, scope);
        let existing: Option<String> = self.partition.with(|conn| {
            conn.query_row(
                "SELECT state FROM queue_jobs WHERE dedup_key = ?1",
                params![key],
                |r| r.get(0),
            )
            .optional()
        })?;
        if let Some(state) = existing {
            if matches!(JobState::parse(&state), JobState::Queued | JobState::Running) {
                return Ok(None);
            }
        }

        let job_id = blake3::hash(format!("{key}{}", Utc::now().timestamp_nanos_opt().unwrap_or(0)).as_bytes())
            .to_hex()
            .to_string();
        let now = Utc::now();
        self.partition.with(|conn| {
            conn.execute(
                "INSERT INTO queue_jobs (job_id, dedup_key, job_type, scope, identity_fingerprint,
                    payload, state, priority, due_at, created_at, updated_at, attempts)
                 VALUES (?1,?2,?3,?4,?5,?6,'queued',?7,?8,?9,?9,0)
                 ON CONFLICT(dedup_key) DO UPDATE SET
                    state='queued', due_at=excluded.due_at, updated_at=excluded.updated_at,
                    payload=excluded.payload",
                params![
                    job_id,
                    key,
                    job_type.as_str(),
                    scope,
                    identity_fingerprint,
                    payload.to_string(),
                    priority,
                    due_at.to_rfc3339(),
                    now.to_rfc3339(),
                ],
            )
        })?;
        self.append_audit(&job_id, None, JobState::Queued, "system", "enqueued")?;
        Ok(Some(job_id))
    }

    /// Dequeue the highest-priority job that is `queued` and due. TTL-stale
    /// jobs (due long past with no pickup) are surfaced via `attempts`
    /// accounting rather than silently dropped.
    pub fn dequeue_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, QueueError> {
        let row: Option<Job> = self.partition.with(|conn| {
            conn.query_row(
                "SELECT job_id, dedup_key, job_type, scope, identity_fingerprint, payload, state,
                        priority, due_at, created_at, updated_at, attempts
                 FROM queue_jobs
                 WHERE state = 'queued' AND due_at <= ?1
                 ORDER BY priority DESC, due_at ASC
                 LIMIT 1",
                params![now.to_rfc3339()],
                row_to_job,
            )
            .optional()
        })?;
        if let Some(job) = &row {
            self.transition(&job.job_id, JobState::Running, "worker", "dequeued")?;
        }
        Ok(row)
    }

    pub fn complete(&self, job_id: &str) -> Result<(), QueueError> {
        self.transition(job_id, JobState::Done, "worker", "completed")
    }

    pub fn fail(&self, job_id: &str, reason: &str) -> Result<(), QueueError> {
        self.partition.with(|conn| {
            conn.execute(
                "UPDATE queue_jobs SET attempts = attempts + 1 WHERE job_id = ?1",
                params![job_id],
            )
        })?;
        self.transition(job_id, JobState::Failed, "worker", reason)
    }

    pub fn cooldown(&self, job_id: &str, reason: &str) -> Result<(), QueueError> {
        self.transition(job_id, JobState::Cooldown, "worker", reason)
    }

    pub fn requeue(&self, job_id: &str, due_at: DateTime<Utc>, reason: &str) -> Result<(), QueueError> {
        let from = self.partition.with(|conn| {
            conn.query_row(
                "SELECT state FROM queue_jobs WHERE job_id = ?1",
                params![job_id],
                |r| r.get::<_, String>(0),
            )
        })?;
        let from_state = JobState::parse(&from);
        if !from_state.can_transition_to(JobState::Queued) {
            return Err(QueueError::IllegalTransition { from: from_state, to: JobState::Queued });
        }
        self.partition.with(|conn| {
            conn.execute(
                "UPDATE queue_jobs SET state='queued', due_at=?2, updated_at=?3 WHERE job_id=?1",
                params![job_id, due_at.to_rfc3339(), Utc::now().to_rfc3339()],
            )
        })?;
        self.append_audit(job_id, Some(from_state), JobState::Queued, "worker", reason)
    }

    fn transition(&self, job_id: &str, to: JobState, actor: &str, reason: &str) -> Result<(), QueueError> {
        let from = self.partition.with(|conn| {
            conn.query_row(
                "SELECT state FROM queue_jobs WHERE job_id = ?1",
                params![job_id],
                |r| r.get::<_, String>(0),
            )
        })?;
        let from_state = JobState::parse(&from);
        if !from_state.can_transition_to(to) {
            return Err(QueueError::IllegalTransition { from: from_state, to });
        }
        self.partition.with(|conn| {
            conn.execute(
                "UPDATE queue_jobs SET state=?2, updated_at=?3 WHERE job_id=?1",
                params![job_id, to.as_str(), Utc::now().to_rfc3339()],
            )
        })?;
        self.append_audit(job_id, Some(from_state), to, actor, reason)
    }

    fn append_audit(
        &self,
        job_id: &str,
        from: Option<JobState>,
        to: JobState,
        actor: &str,
        reason: &str,
    ) -> Result<(), QueueError> {
        self.partition.with(|conn| {
            conn.execute(
                "INSERT INTO queue_actions (job_id, at, from_state, to_state, actor, reason)
                 VALUES (?1,?2,?3,?4,?5,?6)",
                params![
                    job_id,
                    Utc::now().to_rfc3339(),
                    from.map(|s| s.as_str()).unwrap_or("none"),
                    to.as_str(),
                    actor,
                    reason,
                ],
            )
        })?;
        Ok(())
    }

    /// Consult the per-domain backoff ledger before executing a job that
    /// touches `domain`. Returns `true` when the domain is currently cooling
    /// down.
    pub fn is_domain_cooling_down(&self, domain: &str, now: DateTime<Utc>) -> Result<bool, QueueError> {
        let until: Option<String> = self.partition.with(|conn| {
            conn.query_row(
                "SELECT cooldown_until FROM domain_backoff WHERE domain = ?1",
                params![domain],
                |r| r.get(0),
            )
            .optional()
        })?;
        Ok(match until {
            Some(ts) => DateTime::parse_from_rfc3339(&ts).map(|t| t.with_timezone(&Utc) > now).unwrap_or(false),
            None => false,
        })
    }

    pub fn record_domain_failure(&self, domain: &str, cooldown_until: DateTime<Utc>) -> Result<(), QueueError> {
        self.partition.with(|conn| {
            conn.execute(
                "INSERT INTO domain_backoff (domain, cooldown_until, consecutive_failures)
                 VALUES (?1, ?2, 1)
                 ON CONFLICT(domain) DO UPDATE SET
                    cooldown_until = ?2,
                    consecutive_failures = consecutive_failures + 1",
                params![domain, cooldown_until.to_rfc3339()],
            )
        })?;
        Ok(())
    }

    pub fn audit_log(&self, job_id: &str) -> Result<Vec<(DateTime<Utc>, String, String, String, String)>, QueueError> {
        self.partition.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT at, from_state, to_state, actor, reason FROM queue_actions
                 WHERE job_id = ?1 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(params![job_id], |r| {
                let at: String = r.get(0)?;
                Ok((
                    DateTime::parse_from_rfc3339(&at).unwrap().with_timezone(&Utc),
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                ))
            })?;
            rows.collect()
        }).map_err(QueueError::from)
    }
}

fn row_to_job(r: &rusqlite::Row) -> rusqlite::Result<Job> {
    let job_type: String = r.get(2)?;
    let payload_s: String = r.get(5)?;
    let state: String = r.get(6)?;
    Ok(Job {
        job_id: r.get(0)?,
        dedup_key: r.get(1)?,
        job_type: JobType::parse(&job_type),
        scope: r.get(3)?,
        identity_fingerprint: r.get(4)?,
        payload: serde_json::from_str(&payload_s).unwrap_or(serde_json::Value::Null),
        state: JobState::parse(&state),
        priority: r.get(7)?,
        due_at: DateTime::parse_from_rfc3339(&r.get::<_, String>(8)?).unwrap().with_timezone(&Utc),
        created_at: DateTime::parse_from_rfc3339(&r.get::<_, String>(9)?).unwrap().with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&r.get::<_, String>(10)?).unwrap().with_timezone(&Utc),
        attempts: r.get::<_, i64>(11)? as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_enqueue_is_suppressed_while_queued() {
        let aq = AutomationQueue::open_in_memory().unwrap();
        let now = Utc::now();
        let first = aq.enqueue(JobType::RepairSearch, "url:/x", "fp1", serde_json::json!({}), 1, now).unwrap();
        let second = aq.enqueue(JobType::RepairSearch, "url:/x", "fp1", serde_json::json!({}), 1, now).unwrap();
        assert!(first.is_some());
        assert!(second.is_none());
    }

    #[test]
    fn dequeue_moves_job_to_running_and_respects_priority() {
        let aq = AutomationQueue::open_in_memory().unwrap();
        let now = Utc::now();
        aq.enqueue(JobType::Refresh, "doc:a", "fp1", serde_json::json!({}), 1, now).unwrap();
        aq.enqueue(JobType::DeficitRediscovery, "field:polling_rate", "fp1", serde_json::json!({}), 5, now).unwrap();
        let job = aq.dequeue_next(now).unwrap().unwrap();
        assert_eq!(job.job_type, JobType::DeficitRediscovery);
        assert_eq!(job.state, JobState::Running);
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let aq = AutomationQueue::open_in_memory().unwrap();
        let now = Utc::now();
        let job_id = aq.enqueue(JobType::RepairSearch, "url:/y", "fp1", serde_json::json!({}), 1, now).unwrap().unwrap();
        let err = aq.complete(&job_id).unwrap_err();
        assert!(matches!(err, QueueError::IllegalTransition { .. }));
    }

    #[test]
    fn audit_log_records_every_transition() {
        let aq = AutomationQueue::open_in_memory().unwrap();
        let now = Utc::now();
        let job_id = aq.enqueue(JobType::RepairSearch, "url:/z", "fp1", serde_json::json!({}), 1, now).unwrap().unwrap();
        aq.dequeue_next(now).unwrap();
        aq.complete(&job_id).unwrap();
        let log = aq.audit_log(&job_id).unwrap();
        assert_eq!(log.len(), 3); // enqueued, dequeued, completed
    }

    #[test]
    fn domain_cooldown_blocks_until_expiry() {
        let aq = AutomationQueue::open_in_memory().unwrap();
        let now = Utc::now();
        aq.record_domain_failure("example.com", now + chrono::Duration::hours(1)).unwrap();
        assert!(aq.is_domain_cooling_down("example.com", now).unwrap());
        assert!(!aq.is_domain_cooling_down("example.com", now + chrono::Duration::hours(2)).unwrap());
    }
}
