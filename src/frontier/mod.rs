//! URL Frontier & Health (UF), §4.6.
//!
//! Persisted per-URL state plus two learning surfaces (host cooldown and
//! dead-path signatures), grounded on `scrapers::binance_session`'s
//! `EndpointRotator`/cooldown bookkeeping, generalized from one exchange
//! endpoint set to an arbitrary crawl frontier, and sharing `store::Partition`
//! the same way EI and AQ do for the single-writer-per-owner discipline (§5).

use crate::store::Partition;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

const MIGRATIONS: &[&str] = &[r#"
CREATE TABLE url_health (
    url TEXT PRIMARY KEY,
    host TEXT NOT NULL,
    failure_count INTEGER NOT NULL DEFAULT 0,
    blocked_count INTEGER NOT NULL DEFAULT 0,
    success_count INTEGER NOT NULL DEFAULT 0,
    dead_count INTEGER NOT NULL DEFAULT 0,
    cooldown_until TEXT,
    last_outcome TEXT NOT NULL,
    last_fetched_at TEXT NOT NULL
);

CREATE TABLE dead_patterns (
    host TEXT NOT NULL,
    path_template TEXT NOT NULL,
    hit_count INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (host, path_template)
);

CREATE TABLE host_block (
    host TEXT PRIMARY KEY,
    blocked_until TEXT,
    consecutive_blocks INTEGER NOT NULL DEFAULT 0
);
"#];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchOutcome {
    Success,
    Transient,
    Blocked,
    DeadUrl,
}

impl FetchOutcome {
    fn as_str(self) -> &'static str {
        match self {
            FetchOutcome::Success => "success",
            FetchOutcome::Transient => "transient",
            FetchOutcome::Blocked => "blocked",
            FetchOutcome::DeadUrl => "dead_url",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostBudgetState {
    Ok,
    Backoff,
    Blocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    UrlCooldown,
    PathDeadPattern,
    BlockedBudget,
}

/// Normalize a URL path into a template by replacing numeric/opaque-id
/// segments with `{id}` — the basis for dead-path signature detection
/// (§4.6).
pub fn path_template(path: &str) -> String {
    path.split('/')
        .map(|seg| {
            if seg.is_empty() {
                seg.to_string()
            } else if seg.chars().all(|c| c.is_ascii_digit())
                || (seg.len() >= 8 && seg.chars().all(|c| c.is_ascii_alphanumeric()))
            {
                "{id}".to_string()
            } else {
                seg.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

pub fn host_of(url: &str) -> String {
    url.split("//")
        .nth(1)
        .and_then(|rest| rest.split('/').next())
        .unwrap_or(url)
        .to_string()
}

pub fn path_of(url: &str) -> String {
    match url.split("//").nth(1) {
        Some(rest) => match rest.find('/') {
            Some(idx) => rest[idx..].to_string(),
            None => "/".to_string(),
        },
        None => url.to_string(),
    }
}

pub struct UrlFrontier {
    partition: Partition,
    /// Dead-path signatures need at least this many 404/410 hits on the same
    /// template before future matches are skipped.
    pub dead_pattern_threshold: i64,
    /// Consecutive blocked outcomes before a host is fully blocked.
    pub host_block_threshold: i64,
}

impl UrlFrontier {
    pub fn open(path: impl AsRef<std::path::Path>) -> rusqlite::Result<Self> {
        Ok(UrlFrontier {
            partition: Partition::open(path, MIGRATIONS)?,
            dead_pattern_threshold: 3,
            host_block_threshold: 5,
        })
    }

    pub fn open_in_memory() -> rusqlite::Result<Self> {
        Ok(UrlFrontier {
            partition: Partition::open_in_memory(MIGRATIONS)?,
            dead_pattern_threshold: 3,
            host_block_threshold: 5,
        })
    }

    /// `shouldSkipUrl` (§4.5's pre-fetch gate). Checked by FS before every
    /// fetch attempt.
    pub fn should_skip_url(&self, url: &str, now: DateTime<Utc>) -> rusqlite::Result<Option<SkipReason>> {
        let host = host_of(url);

        if let Some(until) = self.host_blocked_until(&host)? {
            if until > now {
                return Ok(Some(SkipReason::BlockedBudget));
            }
        }

        let row: Option<(Option<String>,)> = self.partition.with(|conn| {
            conn.query_row(
                "SELECT cooldown_until FROM url_health WHERE url = ?1",
                params![url],
                |r| Ok((r.get(0)?,)),
            )
            .optional()
        })?;
        if let Some((Some(until),)) = row {
            if DateTime::parse_from_rfc3339(&until).map(|t| t.with_timezone(&Utc) > now).unwrap_or(false) {
                return Ok(Some(SkipReason::UrlCooldown));
            }
        }

        let template = path_template(&path_of(url));
        let hit_count: Option<i64> = self.partition.with(|conn| {
            conn.query_row(
                "SELECT hit_count FROM dead_patterns WHERE host = ?1 AND path_template = ?2",
                params![host, template],
                |r| r.get(0),
            )
            .optional()
        })?;
        if hit_count.unwrap_or(0) >= self.dead_pattern_threshold {
            return Ok(Some(SkipReason::PathDeadPattern));
        }

        Ok(None)
    }

    /// `recordFetch` (§4.5's post-fetch hook). Counters merge additively
    /// under concurrent updates; cooldown is a monotonic max (§5).
    pub fn record_fetch(
        &self,
        url: &str,
        outcome: FetchOutcome,
        cooldown_until: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> rusqlite::Result<()> {
        let host = host_of(url);
        self.partition.with(|conn| {
            let existing_cooldown: Option<String> = conn
                .query_row(
                    "SELECT cooldown_until FROM url_health WHERE url = ?1",
                    params![url],
                    |r| r.get(0),
                )
                .optional()?;
            let merged_cooldown = merge_cooldown_max(existing_cooldown.as_deref(), cooldown_until);

            conn.execute(
                "INSERT INTO url_health (url, host, failure_count, blocked_count, success_count,
                    dead_count, cooldown_until, last_outcome, last_fetched_at)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)
                 ON CONFLICT(url) DO UPDATE SET
                    failure_count = failure_count + excluded.failure_count,
                    blocked_count = blocked_count + excluded.blocked_count,
                    success_count = success_count + excluded.success_count,
                    dead_count = dead_count + excluded.dead_count,
                    cooldown_until = ?7,
                    last_outcome = excluded.last_outcome,
                    last_fetched_at = excluded.last_fetched_at",
                params![
                    url,
                    host,
                    (outcome == FetchOutcome::Transient) as i64,
                    (outcome == FetchOutcome::Blocked) as i64,
                    (outcome == FetchOutcome::Success) as i64,
                    (outcome == FetchOutcome::DeadUrl) as i64,
                    merged_cooldown,
                    outcome.as_str(),
                    now.to_rfc3339(),
                ],
            )?;
            Ok(())
        })?;

        if outcome == FetchOutcome::DeadUrl {
            let template = path_template(&path_of(url));
            self.partition.with(|conn| {
                conn.execute(
                    "INSERT INTO dead_patterns (host, path_template, hit_count) VALUES (?1,?2,1)
                     ON CONFLICT(host, path_template) DO UPDATE SET hit_count = hit_count + 1",
                    params![host, template],
                )
            })?;
        }

        if outcome == FetchOutcome::Blocked {
            self.partition.with(|conn| {
                conn.execute(
                    "INSERT INTO host_block (host, blocked_until, consecutive_blocks) VALUES (?1, NULL, 1)
                     ON CONFLICT(host) DO UPDATE SET consecutive_blocks = consecutive_blocks + 1",
                    params![host],
                )
            })?;
            let consecutive: i64 = self.partition.with(|conn| {
                conn.query_row(
                    "SELECT consecutive_blocks FROM host_block WHERE host = ?1",
                    params![host],
                    |r| r.get(0),
                )
            })?;
            if consecutive >= self.host_block_threshold {
                if let Some(until) = cooldown_until {
                    self.partition.with(|conn| {
                        conn.execute(
                            "UPDATE host_block SET blocked_until = ?2 WHERE host = ?1",
                            params![host, until.to_rfc3339()],
                        )
                    })?;
                }
            }
        } else if outcome == FetchOutcome::Success {
            self.partition.with(|conn| {
                conn.execute(
                    "UPDATE host_block SET consecutive_blocks = 0 WHERE host = ?1",
                    params![host],
                )
            })?;
        }

        Ok(())
    }

    fn host_blocked_until(&self, host: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
        let until: Option<String> = self.partition.with(|conn| {
            conn.query_row(
                "SELECT blocked_until FROM host_block WHERE host = ?1",
                params![host],
                |r| r.get(0),
            )
            .optional()
        })?;
        Ok(until.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|t| t.with_timezone(&Utc)))
    }

    /// `host_budget_score`: 1.0 is healthy, 0.0 is exhausted. Ratio of
    /// successes to total outcomes recorded for the host, weighted toward
    /// recent blocked/dead outcomes.
    pub fn host_budget_score(&self, host: &str) -> rusqlite::Result<f64> {
        let row: Option<(i64, i64, i64, i64)> = self.partition.with(|conn| {
            conn.query_row(
                "SELECT COALESCE(SUM(success_count),0), COALESCE(SUM(failure_count),0),
                        COALESCE(SUM(blocked_count),0), COALESCE(SUM(dead_count),0)
                 FROM url_health WHERE host = ?1",
                params![host],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .optional()
        })?;
        let (success, failure, blocked, dead) = row.unwrap_or((0, 0, 0, 0));
        let total = success + failure + blocked + dead;
        if total == 0 {
            return Ok(1.0);
        }
        let penalized = failure as f64 + 2.0 * blocked as f64 + dead as f64;
        Ok((1.0 - penalized / total as f64).clamp(0.0, 1.0))
    }

    pub fn host_budget_state(&self, host: &str, now: DateTime<Utc>) -> rusqlite::Result<HostBudgetState> {
        if let Some(until) = self.host_blocked_until(host)? {
            if until > now {
                return Ok(HostBudgetState::Blocked);
            }
        }
        let score = self.host_budget_score(host)?;
        Ok(if score < 0.3 {
            HostBudgetState::Blocked
        } else if score < 0.7 {
            HostBudgetState::Backoff
        } else {
            HostBudgetState::Ok
        })
    }
}

fn merge_cooldown_max(existing: Option<&str>, candidate: Option<DateTime<Utc>>) -> Option<String> {
    let existing_dt = existing.and_then(|s| DateTime::parse_from_rfc3339(s).ok()).map(|t| t.with_timezone(&Utc));
    match (existing_dt, candidate) {
        (Some(a), Some(b)) => Some(a.max(b).to_rfc3339()),
        (Some(a), None) => Some(a.to_rfc3339()),
        (None, Some(b)) => Some(b.to_rfc3339()),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn path_template_masks_numeric_and_opaque_segments() {
        assert_eq!(path_template("/products/12345/spec"), "/products/{id}/spec");
        assert_eq!(path_template("/p/razer-viper"), "/p/razer-viper");
    }

    #[test]
    fn cooldown_blocks_until_expiry() {
        let uf = UrlFrontier::open_in_memory().unwrap();
        let now = Utc::now();
        uf.record_fetch("https://example.com/a", FetchOutcome::Blocked, Some(now + Duration::hours(1)), now).unwrap();
        assert_eq!(uf.should_skip_url("https://example.com/a", now).unwrap(), Some(SkipReason::UrlCooldown));
        assert_eq!(
            uf.should_skip_url("https://example.com/a", now + Duration::hours(2)).unwrap(),
            None
        );
    }

    #[test]
    fn repeated_dead_urls_on_same_template_trigger_skip() {
        let uf = UrlFrontier::open_in_memory().unwrap();
        let now = Utc::now();
        for id in ["1", "2", "3"] {
            let url = format!("https://example.com/products/{id}/spec");
            uf.record_fetch(&url, FetchOutcome::DeadUrl, None, now).unwrap();
        }
        let skip = uf.should_skip_url("https://example.com/products/4/spec", now).unwrap();
        assert_eq!(skip, Some(SkipReason::PathDeadPattern));
    }

    #[test]
    fn host_budget_score_drops_with_blocked_outcomes() {
        let uf = UrlFrontier::open_in_memory().unwrap();
        let now = Utc::now();
        uf.record_fetch("https://bad.example/a", FetchOutcome::Success, None, now).unwrap();
        let before = uf.host_budget_score("bad.example").unwrap();
        uf.record_fetch("https://bad.example/b", FetchOutcome::Blocked, None, now).unwrap();
        let after = uf.host_budget_score("bad.example").unwrap();
        assert!(after < before);
    }

    #[test]
    fn counters_merge_additively_across_calls() {
        let uf = UrlFrontier::open_in_memory().unwrap();
        let now = Utc::now();
        uf.record_fetch("https://example.com/a", FetchOutcome::Transient, None, now).unwrap();
        uf.record_fetch("https://example.com/a", FetchOutcome::Transient, None, now).unwrap();
        let score = uf.host_budget_score("example.com").unwrap();
        assert!(score < 1.0);
    }
}
