//! Tier-Aware Retriever & Prime Sources (TR), §4.8.
//!
//! Issues per-field queries into EI (facts first, then chunks), ranks with a
//! weighted sum, and persists a Prime Source pack with scored/accepted/
//! rejected trace and miss diagnostics. This is the third module (after DP
//! and CE) to reach for the same weighted-sum scoring shape for a
//! multi-factor ranking problem.

use crate::contract::FieldContract;
use crate::evidence_index::{Chunk, EvidenceIndex, Fact, SearchFilters};
use crate::identity::token_coverage;
use crate::learning::LearningStores;
use crate::types::{DocHint, IdentityMatchLevel, SnippetId, Tier};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissReason {
    PoolEmpty,
    NoAnchor,
    TierDeficit,
    IdentityMismatch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredSnippet {
    pub snippet_id: SnippetId,
    pub score: f64,
    pub accepted: bool,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrimeSourcePack {
    pub field_key: String,
    pub accepted: Vec<ScoredSnippet>,
    pub rejected: Vec<ScoredSnippet>,
    pub miss_reasons: Vec<MissReason>,
}

fn tier_position_weight(contract: &FieldContract, tier: Tier) -> f64 {
    if let Some(pos) = contract.tier_preference.iter().position(|t| *t == tier) {
        // Earlier positions in a field's own preference list score higher
        // than the fixed global order would.
        4.0 - pos as f64
    } else {
        match tier.0 {
            1 => 4.0,
            2 => 3.0,
            3 => 2.0,
            _ => 1.0,
        }
    }
}

struct Weighed {
    snippet_id: SnippetId,
    score: f64,
    source_id: String,
    tier: Tier,
    identity_level: IdentityMatchLevel,
    reasons: Vec<String>,
}

/// Build the Prime Source pack for one deficit field (§4.8). `anchors` come
/// from the contract's anchor pack plus learning's active `field_anchors`
/// (§4.12); `identity_tokens` gates brand/model token proximity scoring;
/// `learning`'s `domain_field_yield` (§4.12) nudges scoring toward hosts
/// that have historically resolved this field.
pub fn build_prime_sources(
    index: &EvidenceIndex,
    contract: &FieldContract,
    anchors: &[String],
    identity_tokens: &[String],
    identity_critical: bool,
    learning: &LearningStores,
) -> rusqlite::Result<PrimeSourcePack> {
    let filters = SearchFilters::default();

    let facts = if anchors.is_empty() {
        Vec::new()
    } else {
        index.search_facts_fts(&anchors.join(" OR "), &filters)?
    };
    let chunks = if anchors.is_empty() {
        Vec::new()
    } else {
        index.get_by_field_anchor(&contract.key, anchors, &filters)?
    };

    if facts.is_empty() && chunks.is_empty() {
        return Ok(PrimeSourcePack {
            field_key: contract.key.clone(),
            accepted: Vec::new(),
            rejected: Vec::new(),
            miss_reasons: vec![if anchors.is_empty() { MissReason::NoAnchor } else { MissReason::PoolEmpty }],
        });
    }

    let mut weighed = Vec::new();
    for fact in &facts {
        if let Some(w) = score_fact(index, contract, fact, identity_tokens, learning)? {
            weighed.push(w);
        }
    }
    for chunk in &chunks {
        if let Some(w) = score_chunk(index, contract, chunk, identity_tokens, learning)? {
            weighed.push(w);
        }
    }

    weighed.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.snippet_id.cmp(&b.snippet_id)));

    let mut accepted = Vec::new();
    let mut rejected = Vec::new();
    let mut distinct_sources: HashSet<String> = HashSet::new();
    let mut miss_reasons = Vec::new();
    let min_refs = contract.evidence_policy.min_refs;

    for w in weighed {
        let identity_ok = matches!(w.identity_level, IdentityMatchLevel::Locked | IdentityMatchLevel::Provisional)
            || !identity_critical;
        if !identity_ok {
            rejected.push(ScoredSnippet { snippet_id: w.snippet_id, score: w.score, accepted: false, reasons: vec!["identity_mismatch".into()] });
            continue;
        }
        if distinct_sources.len() >= min_refs && accepted.len() >= min_refs {
            rejected.push(ScoredSnippet { snippet_id: w.snippet_id, score: w.score, accepted: false, reasons: w.reasons });
            continue;
        }
        distinct_sources.insert(w.source_id.clone());
        accepted.push(ScoredSnippet { snippet_id: w.snippet_id, score: w.score, accepted: true, reasons: w.reasons });
    }

    if distinct_sources.len() < min_refs {
        miss_reasons.push(MissReason::TierDeficit);
    }
    if accepted.is_empty() {
        miss_reasons.push(MissReason::IdentityMismatch);
    }

    Ok(PrimeSourcePack { field_key: contract.key.clone(), accepted, rejected, miss_reasons })
}

fn score_fact(
    index: &EvidenceIndex,
    contract: &FieldContract,
    fact: &Fact,
    identity_tokens: &[String],
    learning: &LearningStores,
) -> rusqlite::Result<Option<Weighed>> {
    let chunk = index.resolve_snippet(&fact.snippet_id)?;
    let Some(chunk) = chunk else { return Ok(None) };
    score_common(index, contract, &fact.snippet_id, &chunk.doc_id, identity_tokens, Some(&fact.unit_hint), learning)
}

fn score_chunk(
    index: &EvidenceIndex,
    contract: &FieldContract,
    chunk: &Chunk,
    identity_tokens: &[String],
    learning: &LearningStores,
) -> rusqlite::Result<Option<Weighed>> {
    score_common(index, contract, &chunk.snippet_id, &chunk.doc_id, identity_tokens, None, learning)
}

fn score_common(
    index: &EvidenceIndex,
    contract: &FieldContract,
    snippet_id: &SnippetId,
    doc_id: &str,
    identity_tokens: &[String],
    unit_hint: Option<&Option<String>>,
    learning: &LearningStores,
) -> rusqlite::Result<Option<Weighed>> {
    let Some(source) = index.source_for_doc(&doc_id.to_string())? else { return Ok(None) };

    let mut score = tier_position_weight(contract, source.tier);
    let mut reasons = vec![format!("tier_weight:{:.1}", tier_position_weight(contract, source.tier))];

    let hint_to_doc_kind = |h: DocHint| match h {
        DocHint::ManualPdf => crate::types::DocKind::Manual,
        DocHint::SpecPdf => crate::types::DocKind::Spec,
        DocHint::Support => crate::types::DocKind::Support,
        DocHint::LabReview => crate::types::DocKind::Review,
        DocHint::TeardownReview => crate::types::DocKind::Teardown,
        DocHint::Retail => crate::types::DocKind::Retail,
        DocHint::General => crate::types::DocKind::Other,
    };
    if contract.preferred_content_types.iter().any(|h| hint_to_doc_kind(*h) == source.doc_kind) {
        score += 1.5;
        reasons.push("doc_kind_aligned".into());
    }

    let url_tokens = crate::identity::tokenize(&source.final_url);
    let proximity = token_coverage(identity_tokens, &url_tokens);
    score += proximity;
    if proximity > 0.0 {
        reasons.push(format!("brand_model_proximity:{proximity:.2}"));
    }

    if unit_hint.map(|h| h.is_some()).unwrap_or(false) {
        score += 0.5;
        reasons.push("unit_hint_present".into());
    }

    score += match source.identity_match_level {
        IdentityMatchLevel::Locked => 1.0,
        IdentityMatchLevel::Provisional => 0.6,
        IdentityMatchLevel::Unlocked => 0.2,
        IdentityMatchLevel::Conflict => 0.0,
    };

    if let Some((ratio, low_yield)) = learning.domain_field_yield(&source.root_domain, &contract.key)? {
        if low_yield {
            score -= 1.0;
            reasons.push("domain_low_yield".into());
        } else if ratio > 0.0 {
            score += ratio;
            reasons.push(format!("domain_yield:{ratio:.2}"));
        }
    }

    Ok(Some(Weighed {
        snippet_id: snippet_id.clone(),
        score,
        source_id: source.source_id,
        tier: source.tier,
        identity_level: source.identity_match_level,
        reasons,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{EvidencePolicy, ValueType};
    use crate::evidence_index::Source;
    use crate::types::{DocKind, FetchMode, RequiredLevel};
    use chrono::Utc;

    fn field() -> FieldContract {
        FieldContract {
            key: "sensor".into(),
            required_level: RequiredLevel::Critical,
            value_type: ValueType::Text,
            unit: None,
            enum_values: None,
            evidence_policy: EvidencePolicy { min_refs: 1, preferred_tier: Some(Tier::MANUFACTURER) },
            tier_preference: vec![Tier::MANUFACTURER],
            search_hints: vec![],
            preferred_content_types: vec![DocHint::SpecPdf],
            half_life_days: None,
            publish_gated: false,
        }
    }

    fn source(id: &str, tier: Tier, identity: IdentityMatchLevel) -> Source {
        Source {
            source_id: id.into(),
            url: "https://razer.com/viper".into(),
            final_url: "https://razer.com/viper".into(),
            host: "razer.com".into(),
            root_domain: "razer.com".into(),
            tier,
            doc_kind: DocKind::Spec,
            content_type: "text/html".into(),
            content_hash: format!("hash-{id}"),
            bytes: 10,
            fetched_at: Utc::now(),
            fetch_mode: FetchMode::Http,
            status_code: Some(200),
            identity_match_level: identity,
            target_match_score: 0.9,
            page_product_cluster_id: None,
        }
    }

    #[test]
    fn empty_anchors_report_no_anchor_miss() {
        let index = EvidenceIndex::open_in_memory().unwrap();
        let learning = LearningStores::open_in_memory().unwrap();
        let pack = build_prime_sources(&index, &field(), &[], &[], true, &learning).unwrap();
        assert_eq!(pack.miss_reasons, vec![MissReason::NoAnchor]);
    }

    #[test]
    fn accepted_pack_prefers_locked_identity_and_tier1() {
        let index = EvidenceIndex::open_in_memory().unwrap();
        let learning = LearningStores::open_in_memory().unwrap();
        let s = source("s1", Tier::MANUFACTURER, IdentityMatchLevel::Locked);
        index.index_source(&s, "p1", "c1", "Sensor: Focus Pro 35K").unwrap();
        let pack = build_prime_sources(&index, &field(), &["sensor".to_string()], &crate::identity::tokenize("razer viper"), true, &learning).unwrap();
        assert!(!pack.accepted.is_empty());
    }

    #[test]
    fn identity_critical_rejects_unlocked_sources() {
        let index = EvidenceIndex::open_in_memory().unwrap();
        let learning = LearningStores::open_in_memory().unwrap();
        let s = source("s1", Tier::MANUFACTURER, IdentityMatchLevel::Unlocked);
        index.index_source(&s, "p1", "c1", "Sensor: Focus Pro 35K").unwrap();
        let pack = build_prime_sources(&index, &field(), &["sensor".to_string()], &[], true, &learning).unwrap();
        assert!(pack.accepted.is_empty());
        assert!(pack.miss_reasons.contains(&MissReason::IdentityMismatch));
    }

    #[test]
    fn high_yield_domain_outscores_an_unseen_domain_at_equal_tier() {
        let index = EvidenceIndex::open_in_memory().unwrap();
        let learning = LearningStores::open_in_memory().unwrap();
        let now = Utc::now();
        for _ in 0..4 {
            learning.record_domain_field_outcome("razer.com", "sensor", true, now).unwrap();
        }
        let mut s = source("s1", Tier::MANUFACTURER, IdentityMatchLevel::Locked);
        s.host = "razer.com".into();
        s.root_domain = "razer.com".into();
        index.index_source(&s, "p1", "c1", "Sensor: Focus Pro 35K").unwrap();

        let mut other = source("s2", Tier::MANUFACTURER, IdentityMatchLevel::Locked);
        other.host = "unseen.example".into();
        other.root_domain = "unseen.example".into();
        other.url = "https://unseen.example/viper".into();
        other.final_url = "https://unseen.example/viper".into();
        index.index_source(&other, "p1", "c1", "Sensor: Focus Pro 35K V2").unwrap();

        let pack = build_prime_sources(&index, &field(), &["sensor".to_string()], &[], true, &learning).unwrap();
        let best = pack.accepted.iter().max_by(|a, b| a.score.partial_cmp(&b.score).unwrap()).unwrap();
        assert!(best.reasons.iter().any(|r| r.starts_with("domain_yield")));
    }
}
