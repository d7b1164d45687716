//! Learning Stores (LS), §4.12.
//!
//! Four append-and-decay stores, committed only when a field clears the
//! commit gate. Grounded on `route_quality::baseline`'s decay-and-readback
//! shape (active/expired windows feeding future scoring) generalized from
//! one ratio to four independent stores with different half-lives.

use crate::store::Partition;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

const MIGRATIONS: &[&str] = &[r#"
CREATE TABLE learning_component_lexicon (
    identity_fingerprint TEXT NOT NULL,
    term TEXT NOT NULL,
    canonical TEXT NOT NULL,
    committed_at TEXT NOT NULL,
    PRIMARY KEY (identity_fingerprint, term)
);

CREATE TABLE learning_field_anchors (
    category TEXT NOT NULL,
    field_key TEXT NOT NULL,
    anchor TEXT NOT NULL,
    committed_at TEXT NOT NULL,
    PRIMARY KEY (category, field_key, anchor)
);

CREATE TABLE learning_url_memory (
    identity_fingerprint TEXT NOT NULL,
    url TEXT NOT NULL,
    doc_hint TEXT,
    committed_at TEXT NOT NULL,
    PRIMARY KEY (identity_fingerprint, url)
);

CREATE TABLE learning_domain_field_yield (
    domain TEXT NOT NULL,
    field_key TEXT NOT NULL,
    hits INTEGER NOT NULL DEFAULT 0,
    misses INTEGER NOT NULL DEFAULT 0,
    committed_at TEXT NOT NULL,
    PRIMARY KEY (domain, field_key)
);
"#];

/// Commit gate (§4.12): a round's proposed update is only written when all
/// four conditions hold.
#[derive(Debug, Clone, Copy)]
pub struct CommitGateInput {
    pub status_accepted: bool,
    pub confidence: f64,
    pub refs: usize,
    pub tier_preference_met: bool,
}

pub fn passes_commit_gate(input: CommitGateInput, contract: &crate::contract::FieldContract, confidence_threshold: f64) -> bool {
    input.status_accepted
        && input.confidence >= confidence_threshold
        && input.refs >= contract.evidence_policy.min_refs
        && input.tier_preference_met
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Freshness {
    Active,
    Stale,
    Expired,
}

fn freshness(committed_at: DateTime<Utc>, now: DateTime<Utc>, active_days: i64, expired_days: i64) -> Freshness {
    let age = (now - committed_at).num_days();
    if age <= active_days {
        Freshness::Active
    } else if age <= expired_days {
        Freshness::Stale
    } else {
        Freshness::Expired
    }
}

#[derive(Clone)]
pub struct LearningStores {
    partition: Partition,
}

impl LearningStores {
    pub fn open(path: impl AsRef<std::path::Path>) -> rusqlite::Result<Self> {
        Ok(LearningStores { partition: Partition::open(path, MIGRATIONS)? })
    }

    pub fn open_in_memory() -> rusqlite::Result<Self> {
        Ok(LearningStores { partition: Partition::open_in_memory(MIGRATIONS)? })
    }

    pub fn commit_component_lexicon(&self, identity_fingerprint: &str, term: &str, canonical: &str, now: DateTime<Utc>) -> rusqlite::Result<()> {
        self.partition.with(|conn| {
            conn.execute(
                "INSERT INTO learning_component_lexicon (identity_fingerprint, term, canonical, committed_at)
                 VALUES (?1,?2,?3,?4)
                 ON CONFLICT(identity_fingerprint, term) DO UPDATE SET canonical=excluded.canonical, committed_at=excluded.committed_at",
                params![identity_fingerprint, term, canonical, now.to_rfc3339()],
            )
        })?;
        Ok(())
    }

    /// Active entries (90 d) — merged into retrieval hints per the readback
    /// described in §4.12.
    pub fn active_component_lexicon(&self, identity_fingerprint: &str, now: DateTime<Utc>) -> rusqlite::Result<Vec<(String, String)>> {
        let rows: Vec<(String, String, String)> = self.partition.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT term, canonical, committed_at FROM learning_component_lexicon WHERE identity_fingerprint = ?1",
            )?;
            let rows = stmt.query_map(params![identity_fingerprint], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?;
            rows.collect()
        })?;
        Ok(rows
            .into_iter()
            .filter_map(|(term, canonical, committed_at)| {
                let ts = DateTime::parse_from_rfc3339(&committed_at).ok()?.with_timezone(&Utc);
                (freshness(ts, now, 90, 180) != Freshness::Expired).then_some((term, canonical))
            })
            .collect())
    }

    pub fn commit_field_anchor(&self, category: &str, field_key: &str, anchor: &str, now: DateTime<Utc>) -> rusqlite::Result<()> {
        self.partition.with(|conn| {
            conn.execute(
                "INSERT INTO learning_field_anchors (category, field_key, anchor, committed_at) VALUES (?1,?2,?3,?4)
                 ON CONFLICT(category, field_key, anchor) DO UPDATE SET committed_at=excluded.committed_at",
                params![category, field_key, anchor, now.to_rfc3339()],
            )
        })?;
        Ok(())
    }

    /// Active anchors (60 d), merged into retrieval hints for TR/DP.
    pub fn active_field_anchors(&self, category: &str, field_key: &str, now: DateTime<Utc>) -> rusqlite::Result<Vec<String>> {
        let rows: Vec<(String, String)> = self.partition.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT anchor, committed_at FROM learning_field_anchors WHERE category = ?1 AND field_key = ?2",
            )?;
            let rows = stmt.query_map(params![category, field_key], |r| Ok((r.get(0)?, r.get(1)?)))?;
            rows.collect()
        })?;
        Ok(rows
            .into_iter()
            .filter_map(|(anchor, committed_at)| {
                let ts = DateTime::parse_from_rfc3339(&committed_at).ok()?.with_timezone(&Utc);
                (freshness(ts, now, 60, 120) == Freshness::Active).then_some(anchor)
            })
            .collect())
    }

    pub fn commit_url_memory(&self, identity_fingerprint: &str, url: &str, doc_hint: Option<&str>, now: DateTime<Utc>) -> rusqlite::Result<()> {
        self.partition.with(|conn| {
            conn.execute(
                "INSERT INTO learning_url_memory (identity_fingerprint, url, doc_hint, committed_at) VALUES (?1,?2,?3,?4)
                 ON CONFLICT(identity_fingerprint, url) DO UPDATE SET committed_at=excluded.committed_at",
                params![identity_fingerprint, url, doc_hint, now.to_rfc3339()],
            )
        })?;
        Ok(())
    }

    /// Active URL-memory hits (120 d), suggested to seed Round 0 of a
    /// subsequent run on a similar identity.
    pub fn active_url_memory(&self, identity_fingerprint: &str, now: DateTime<Utc>) -> rusqlite::Result<Vec<String>> {
        let rows: Vec<(String, String)> = self.partition.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT url, committed_at FROM learning_url_memory WHERE identity_fingerprint = ?1",
            )?;
            let rows = stmt.query_map(params![identity_fingerprint], |r| Ok((r.get(0)?, r.get(1)?)))?;
            rows.collect()
        })?;
        Ok(rows
            .into_iter()
            .filter_map(|(url, committed_at)| {
                let ts = DateTime::parse_from_rfc3339(&committed_at).ok()?.with_timezone(&Utc);
                (freshness(ts, now, 120, 240) == Freshness::Active).then_some(url)
            })
            .collect())
    }

    pub fn record_domain_field_outcome(&self, domain: &str, field_key: &str, hit: bool, now: DateTime<Utc>) -> rusqlite::Result<()> {
        self.partition.with(|conn| {
            conn.execute(
                "INSERT INTO learning_domain_field_yield (domain, field_key, hits, misses, committed_at)
                 VALUES (?1,?2,?3,?4,?5)
                 ON CONFLICT(domain, field_key) DO UPDATE SET
                    hits = hits + excluded.hits, misses = misses + excluded.misses, committed_at = excluded.committed_at",
                params![domain, field_key, hit as i64, (!hit) as i64, now.to_rfc3339()],
            )
        })?;
        Ok(())
    }

    /// Ratio-based yield with a low-yield flag (§4.12): yield below 0.2 with
    /// at least 5 samples is flagged.
    pub fn domain_field_yield(&self, domain: &str, field_key: &str) -> rusqlite::Result<Option<(f64, bool)>> {
        let row: Option<(i64, i64)> = self.partition.with(|conn| {
            conn.query_row(
                "SELECT hits, misses FROM learning_domain_field_yield WHERE domain = ?1 AND field_key = ?2",
                params![domain, field_key],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
        })?;
        Ok(row.map(|(hits, misses)| {
            let total = hits + misses;
            let ratio = if total == 0 { 0.0 } else { hits as f64 / total as f64 };
            let low_yield = total >= 5 && ratio < 0.2;
            (ratio, low_yield)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{EvidencePolicy, FieldContract, ValueType};
    use crate::types::{DocHint, RequiredLevel, Tier};
    use chrono::Duration;

    fn field() -> FieldContract {
        FieldContract {
            key: "polling_rate".into(),
            required_level: RequiredLevel::Critical,
            value_type: ValueType::Number,
            unit: Some("hz".into()),
            enum_values: None,
            evidence_policy: EvidencePolicy { min_refs: 2, preferred_tier: Some(Tier::MANUFACTURER) },
            tier_preference: vec![],
            search_hints: vec![],
            preferred_content_types: vec![DocHint::SpecPdf],
            half_life_days: None,
            publish_gated: false,
        }
    }

    #[test]
    fn commit_gate_requires_all_four_conditions() {
        let f = field();
        assert!(!passes_commit_gate(
            CommitGateInput { status_accepted: false, confidence: 0.9, refs: 2, tier_preference_met: true },
            &f,
            0.85
        ));
        assert!(passes_commit_gate(
            CommitGateInput { status_accepted: true, confidence: 0.9, refs: 2, tier_preference_met: true },
            &f,
            0.85
        ));
        assert!(!passes_commit_gate(
            CommitGateInput { status_accepted: true, confidence: 0.9, refs: 1, tier_preference_met: true },
            &f,
            0.85
        ));
    }

    #[test]
    fn field_anchors_expire_after_active_window() {
        let ls = LearningStores::open_in_memory().unwrap();
        let committed = Utc::now() - Duration::days(10);
        ls.commit_field_anchor("mouse", "polling_rate", "polling rate hz", committed).unwrap();
        let active_now = ls.active_field_anchors("mouse", "polling_rate", committed + Duration::days(5)).unwrap();
        assert_eq!(active_now, vec!["polling rate hz".to_string()]);
        let active_later = ls.active_field_anchors("mouse", "polling_rate", committed + Duration::days(90)).unwrap();
        assert!(active_later.is_empty());
    }

    #[test]
    fn domain_yield_flags_low_yield_after_enough_samples() {
        let ls = LearningStores::open_in_memory().unwrap();
        let now = Utc::now();
        for _ in 0..6 {
            ls.record_domain_field_outcome("forum.example", "weight_g", false, now).unwrap();
        }
        let (ratio, low_yield) = ls.domain_field_yield("forum.example", "weight_g").unwrap().unwrap();
        assert_eq!(ratio, 0.0);
        assert!(low_yield);
    }
}
