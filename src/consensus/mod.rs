//! Consensus Engine (CE), §4.10.
//!
//! Scores competing candidates for a single field and decides tiered
//! acceptance (`full | provisional | abort`) rather than a single binary
//! threshold, grounded on `signals::detector::SignalDetector`'s weighted,
//! multi-factor scoring style generalized from one signal formula to a
//! configurable `method_weight` table.

use crate::contract::FieldContract;
use crate::identity::IdentityLockState;
use crate::types::{Method, SnippetId, SourceId, Tier};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Per-source identity outcome as seen by a single evidence unit. Distinct
/// from [`crate::types::IdentityMatchLevel`] because `failed` (§7,
/// `identity_failure`) has no corresponding lock state — it only ever
/// attaches to one evidence unit, never to the whole source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceIdentityStatus {
    Locked,
    Provisional,
    Unlocked,
    Conflict,
    Failed,
}

impl EvidenceIdentityStatus {
    /// `identity_weight` from §4.10.
    pub fn weight(self) -> f64 {
        match self {
            EvidenceIdentityStatus::Locked => 1.0,
            EvidenceIdentityStatus::Provisional => 0.74,
            EvidenceIdentityStatus::Unlocked => 0.59,
            EvidenceIdentityStatus::Conflict => 0.39,
            EvidenceIdentityStatus::Failed => 0.0,
        }
    }
}

/// `tier_weight` from §4.10, default table.
pub fn tier_weight(tier: Tier) -> f64 {
    match tier.0 {
        1 => 1.00,
        2 => 0.80,
        3 => 0.45,
        _ => 0.25,
    }
}

#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    /// Per-method base weight. Missing entries default to 1.0.
    pub method_weights: HashMap<Method, f64>,
    pub margin_threshold: f64,
    /// Softening constant for the score -> confidence squash
    /// (`score / (score + k)`).
    pub confidence_softening: f64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        let mut method_weights = HashMap::new();
        method_weights.insert(Method::HtmlSpecTable, 1.2);
        method_weights.insert(Method::EmbeddedJson, 1.15);
        method_weights.insert(Method::StructuredMetadata, 1.0);
        method_weights.insert(Method::DeterministicNormalizer, 1.1);
        method_weights.insert(Method::Adapter, 1.0);
        method_weights.insert(Method::PdfText, 0.95);
        method_weights.insert(Method::ArticleText, 0.8);
        method_weights.insert(Method::PdfOcr, 0.7);
        method_weights.insert(Method::ImageOcr, 0.6);
        method_weights.insert(Method::LlmExtract, 0.75);
        ConsensusConfig {
            method_weights,
            margin_threshold: 0.05,
            confidence_softening: 1.0,
        }
    }
}

impl ConsensusConfig {
    fn method_weight(&self, method: Method, tier: Tier) -> f64 {
        let base = self.method_weights.get(&method).copied().unwrap_or(1.0);
        // `html_spec_table` on tier 1 is stronger than `llm_extract` on tier
        // 3 (§4.10's own example) falls out naturally once multiplied by
        // `tier_weight`; no extra tier-conditioned table is needed.
        let _ = tier;
        base
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceUnit {
    pub snippet_id: SnippetId,
    pub source_id: SourceId,
    pub method: Method,
    pub tier: Tier,
    pub identity_status: EvidenceIdentityStatus,
    pub target_match_passed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub value: serde_json::Value,
    pub evidence: Vec<EvidenceUnit>,
}

impl Candidate {
    pub fn score(&self, config: &ConsensusConfig) -> f64 {
        self.evidence
            .iter()
            .map(|e| config.method_weight(e.method, e.tier) * tier_weight(e.tier) * e.identity_status.weight())
            .sum()
    }

    pub fn distinct_sources(&self) -> usize {
        self.evidence.iter().map(|e| e.source_id.as_str()).collect::<HashSet<_>>().len()
    }

    pub fn best_tier(&self) -> Option<Tier> {
        self.evidence.iter().map(|e| e.tier).min()
    }

    pub fn has_target_match(&self) -> bool {
        self.evidence.iter().any(|e| e.target_match_passed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcceptanceTier {
    Full,
    Provisional,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConsensusOutcome {
    Accepted {
        tier: AcceptanceTier,
        value: serde_json::Value,
        confidence: f64,
        refs: Vec<SnippetId>,
    },
    Candidate {
        best_value: serde_json::Value,
        confidence: f64,
    },
    Conflict {
        candidates: Vec<serde_json::Value>,
    },
    Abort {
        reason: crate::types::UnknownReason,
    },
}

/// Resolve one field's competing candidates per §4.10. Candidates are
/// ordered by score descending with a stable tie-break on the first
/// evidence unit's `snippet_id` ascending (§5's ordering guarantee).
pub fn resolve_field(
    mut candidates: Vec<Candidate>,
    contract: &FieldContract,
    identity: &IdentityLockState,
    config: &ConsensusConfig,
) -> ConsensusOutcome {
    if candidates.is_empty() {
        return ConsensusOutcome::Abort {
            reason: crate::types::UnknownReason::MissingEvidence,
        };
    }

    candidates.sort_by(|a, b| {
        let sa = a.score(config);
        let sb = b.score(config);
        sb.partial_cmp(&sa)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| tie_break_key(a).cmp(&tie_break_key(b)))
    });

    // Two top values that differ in text but are relaxed-compatible
    // ("wireless" vs "wireless / wired", sensor name variants, SKU
    // suffixes) are not a real conflict: fold the runner-up's evidence into
    // the winner and treat the next distinct value, if any, as the real
    // runner-up.
    let mut winner = candidates[0].clone();
    let mut runner_up_idx = 1;
    if let Some(runner) = candidates.get(1) {
        if winner.value != runner.value && relaxed_compatible(contract, &winner.value, &runner.value) {
            winner.evidence.extend(runner.evidence.clone());
            runner_up_idx = 2;
        }
    }
    let winner = &winner;
    let winner_score = winner.score(config);
    let runner_up_score = candidates.get(runner_up_idx).map(|c| c.score(config)).unwrap_or(0.0);
    let runner_up_value = candidates.get(runner_up_idx).map(|c| c.value.clone());

    if identity.blocks_field(contract.is_identity_critical()) {
        return ConsensusOutcome::Candidate {
            best_value: winner.value.clone(),
            confidence: squash(winner_score, config.confidence_softening).min(identity.status.confidence_cap()),
        };
    }

    let margin_ok = (winner_score - runner_up_score) >= config.margin_threshold;
    let evidence_ok = winner.distinct_sources() >= contract.evidence_policy.min_refs;
    let tier_ok = match contract.evidence_policy.preferred_tier {
        None => true,
        Some(preferred) => {
            let feasible = candidates.iter().any(|c| c.best_tier().map(|t| t <= preferred).unwrap_or(false));
            !feasible || winner.best_tier().map(|t| t <= preferred).unwrap_or(false)
        }
    };
    let target_match_ok = winner.has_target_match();

    if !target_match_ok {
        return ConsensusOutcome::Abort {
            reason: crate::types::UnknownReason::IdentityUncertain,
        };
    }

    if !margin_ok && runner_up_score > 0.0 && runner_up_value.as_ref().is_some_and(|v| *v != winner.value) {
        return ConsensusOutcome::Conflict {
            candidates: std::iter::once(winner.value.clone()).chain(runner_up_value).collect(),
        };
    }

    if !margin_ok || !evidence_ok || !tier_ok {
        return ConsensusOutcome::Candidate {
            best_value: winner.value.clone(),
            confidence: squash(winner_score, config.confidence_softening).min(identity.status.confidence_cap()),
        };
    }

    let confidence = squash(winner_score, config.confidence_softening).min(identity.status.confidence_cap());
    let tier = if identity.publish_gate_open {
        AcceptanceTier::Full
    } else {
        AcceptanceTier::Provisional
    };
    ConsensusOutcome::Accepted {
        tier,
        value: winner.value.clone(),
        confidence,
        refs: winner.evidence.iter().map(|e| e.snippet_id.clone()).collect(),
    }
}

/// Dispatches to the relaxed compatibility rule matching this field's value type.
/// Only string-valued `Text`/`Enum` fields go through `connection_compatible`
/// for now; numeric tolerance (`dimensions_compatible`) is applied by callers
/// that already know they're comparing a dimension field, not here.
fn relaxed_compatible(contract: &FieldContract, a: &serde_json::Value, b: &serde_json::Value) -> bool {
    use crate::contract::ValueType;
    match (&contract.value_type, a.as_str(), b.as_str()) {
        (ValueType::Text | ValueType::Enum, Some(sa), Some(sb)) => crate::identity::relaxed::connection_compatible(sa, sb),
        _ => false,
    }
}

fn tie_break_key(c: &Candidate) -> String {
    c.evidence.first().map(|e| e.snippet_id.clone()).unwrap_or_default()
}

fn squash(score: f64, k: f64) -> f64 {
    if score <= 0.0 {
        return 0.0;
    }
    score / (score + k.max(0.0001))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{EvidencePolicy, FieldContract, ValueType};
    use crate::types::{AmbiguityLevel, DocHint, IdentityMatchLevel, RequiredLevel};

    fn field() -> FieldContract {
        FieldContract {
            key: "polling_rate".into(),
            required_level: RequiredLevel::Critical,
            value_type: ValueType::Number,
            unit: Some("hz".into()),
            enum_values: None,
            evidence_policy: EvidencePolicy { min_refs: 2, preferred_tier: Some(Tier::MANUFACTURER) },
            tier_preference: vec![Tier::MANUFACTURER],
            search_hints: vec![],
            preferred_content_types: vec![DocHint::SpecPdf],
            half_life_days: None,
            publish_gated: false,
        }
    }

    fn locked_identity() -> IdentityLockState {
        IdentityLockState::new(IdentityMatchLevel::Locked, 0.97, AmbiguityLevel::Easy, 1)
    }

    fn unit(snippet: &str, source: &str, method: Method, tier: Tier) -> EvidenceUnit {
        EvidenceUnit {
            snippet_id: snippet.into(),
            source_id: source.into(),
            method,
            tier,
            identity_status: EvidenceIdentityStatus::Locked,
            target_match_passed: true,
        }
    }

    #[test]
    fn strong_agreeing_evidence_accepts_full() {
        let candidates = vec![Candidate {
            value: serde_json::json!(8000),
            evidence: vec![
                unit("a", "src1", Method::HtmlSpecTable, Tier::MANUFACTURER),
                unit("b", "src2", Method::EmbeddedJson, Tier::MANUFACTURER),
            ],
        }];
        let outcome = resolve_field(candidates, &field(), &locked_identity(), &ConsensusConfig::default());
        match outcome {
            ConsensusOutcome::Accepted { tier, value, .. } => {
                assert_eq!(tier, AcceptanceTier::Full);
                assert_eq!(value, serde_json::json!(8000));
            }
            other => panic!("expected Accepted, got {other:?}"),
        }
    }

    #[test]
    fn single_source_fails_min_refs_stays_candidate() {
        let candidates = vec![Candidate {
            value: serde_json::json!(8000),
            evidence: vec![unit("a", "src1", Method::HtmlSpecTable, Tier::MANUFACTURER)],
        }];
        let outcome = resolve_field(candidates, &field(), &locked_identity(), &ConsensusConfig::default());
        assert!(matches!(outcome, ConsensusOutcome::Candidate { .. }));
    }

    #[test]
    fn close_competing_values_produce_conflict() {
        let candidates = vec![
            Candidate {
                value: serde_json::json!(8000),
                evidence: vec![
                    unit("a", "src1", Method::ArticleText, Tier::RETAIL),
                    unit("b", "src2", Method::ArticleText, Tier::RETAIL),
                ],
            },
            Candidate {
                value: serde_json::json!(4000),
                evidence: vec![
                    unit("c", "src3", Method::ArticleText, Tier::RETAIL),
                    unit("d", "src4", Method::ArticleText, Tier::RETAIL),
                ],
            },
        ];
        let outcome = resolve_field(candidates, &field(), &locked_identity(), &ConsensusConfig::default());
        assert!(matches!(outcome, ConsensusOutcome::Conflict { .. }));
    }

    #[test]
    fn no_target_match_aborts() {
        let mut ev = unit("a", "src1", Method::HtmlSpecTable, Tier::MANUFACTURER);
        ev.target_match_passed = false;
        let candidates = vec![Candidate { value: serde_json::json!(8000), evidence: vec![ev] }];
        let outcome = resolve_field(candidates, &field(), &locked_identity(), &ConsensusConfig::default());
        assert!(matches!(outcome, ConsensusOutcome::Abort { .. }));
    }

    #[test]
    fn identity_blocking_keeps_field_as_candidate_even_with_strong_evidence() {
        let identity = IdentityLockState::new(IdentityMatchLevel::Unlocked, 0.4, AmbiguityLevel::Medium, 3);
        let candidates = vec![Candidate {
            value: serde_json::json!(8000),
            evidence: vec![
                unit("a", "src1", Method::HtmlSpecTable, Tier::MANUFACTURER),
                unit("b", "src2", Method::EmbeddedJson, Tier::MANUFACTURER),
            ],
        }];
        let outcome = resolve_field(candidates, &field(), &identity, &ConsensusConfig::default());
        assert!(matches!(outcome, ConsensusOutcome::Candidate { .. }));
    }

    #[test]
    fn provisional_when_identity_locked_threshold_not_quite_publishable() {
        let identity = IdentityLockState::new(IdentityMatchLevel::Provisional, 0.8, AmbiguityLevel::Easy, 1);
        let candidates = vec![Candidate {
            value: serde_json::json!(8000),
            evidence: vec![
                unit("a", "src1", Method::HtmlSpecTable, Tier::MANUFACTURER),
                unit("b", "src2", Method::EmbeddedJson, Tier::MANUFACTURER),
            ],
        }];
        let outcome = resolve_field(candidates, &field(), &identity, &ConsensusConfig::default());
        match outcome {
            ConsensusOutcome::Accepted { tier, confidence, .. } => {
                assert_eq!(tier, AcceptanceTier::Provisional);
                assert!(confidence <= 0.74);
            }
            other => panic!("expected Accepted(Provisional), got {other:?}"),
        }
    }
}
