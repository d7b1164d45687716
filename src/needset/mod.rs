//! NeedSet Engine (NS), §4.2.
//!
//! A pure function over field state, contract, and identity state. No I/O,
//! no mutation — grounded on `signals::quality::SignalQualityGate`'s rolling
//! but side-effect-free filtering style, simplified here to a single
//! deterministic scalar formula since NeedSet carries no cross-call state.

use crate::contract::FieldContract;
use crate::types::{FieldKey, FieldStatus, IdentityMatchLevel, NeedReason, Tier};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldState {
    pub status: FieldStatus,
    pub value: Option<serde_json::Value>,
    pub confidence: f64,
    pub refs: Vec<crate::types::SnippetId>,
    pub refs_from_distinct_sources: usize,
    pub best_tier_seen: Option<Tier>,
    pub unknown_reason: Option<crate::types::UnknownReason>,
    /// Days since this field state was last (re)computed; drives
    /// `freshness_mult`.
    pub age_days: f64,
}

impl FieldState {
    pub fn unknown() -> Self {
        FieldState {
            status: FieldStatus::Unknown,
            value: None,
            confidence: 0.0,
            refs: Vec::new(),
            refs_from_distinct_sources: 0,
            best_tier_seen: None,
            unknown_reason: Some(crate::types::UnknownReason::MissingEvidence),
            age_days: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeedRow {
    pub field_key: FieldKey,
    pub need_score: f64,
    pub reasons: Vec<NeedReason>,
    pub blocked_by: Option<String>,
    pub effective_confidence: f64,
    pub confidence_capped: bool,
}

/// Identity-aware confidence cap applied before the need formula (§4.2).
pub fn identity_confidence_cap(status: IdentityMatchLevel) -> f64 {
    status.confidence_cap()
}

fn missing_mult(status: FieldStatus) -> f64 {
    if matches!(status, FieldStatus::Unknown | FieldStatus::Candidate) {
        2.0
    } else {
        1.0
    }
}

fn tier_deficit_mult(contract: &FieldContract, state: &FieldState) -> bool {
    match (&contract.evidence_policy.preferred_tier, state.best_tier_seen) {
        (Some(preferred), Some(seen)) if preferred.0 == 1 => seen.0 > 1,
        _ => false,
    }
}

fn min_refs_mult(contract: &FieldContract, state: &FieldState) -> bool {
    state.refs_from_distinct_sources < contract.evidence_policy.min_refs
}

fn freshness_mult(age_days: f64, half_life_days: f64) -> f64 {
    if half_life_days <= 0.0 {
        return 1.0;
    }
    2f64.powf(-age_days / half_life_days)
}

/// `need(f)` from §4.2. Pure: same inputs always produce the same
/// [`NeedRow`] (invariant/testable-property 3, §8 — determinism of the pure
/// core).
pub fn compute(
    contract: &FieldContract,
    state: &FieldState,
    identity: &crate::identity::IdentityLockState,
    default_half_life_days: f64,
    confidence_floor: f64,
) -> NeedRow {
    let mut reasons = Vec::new();

    let identity_blocks_field = identity.blocks_field(contract.is_identity_critical());

    let cap = identity_confidence_cap(identity.status);
    let confidence_capped = state.confidence > cap;
    let effective_confidence = state.confidence.min(cap).clamp(0.0, 1.0);

    let half_life = contract.half_life_days.unwrap_or(default_half_life_days);
    let freshness = freshness_mult(state.age_days, half_life).max(confidence_floor);
    let decayed_confidence = (effective_confidence * freshness).clamp(0.0, 1.0);

    if matches!(state.status, FieldStatus::Unknown | FieldStatus::Candidate) {
        reasons.push(NeedReason::Missing);
    }
    if min_refs_mult(contract, state) {
        reasons.push(NeedReason::MinRefsFail);
    }
    if tier_deficit_mult(contract, state) {
        reasons.push(NeedReason::TierDeficit);
    }
    if matches!(state.status, FieldStatus::Conflict) {
        reasons.push(NeedReason::Conflict);
    }
    if identity.status == IdentityMatchLevel::Unlocked {
        reasons.push(NeedReason::IdentityUnlocked);
    }
    if identity_blocks_field {
        reasons.push(NeedReason::BlockedByIdentity);
    }
    if contract.publish_gated && !identity.publish_gate_open {
        reasons.push(NeedReason::PublishGateBlock);
    }
    if decayed_confidence < confidence_floor.max(0.01) && !reasons.contains(&NeedReason::Missing) {
        reasons.push(NeedReason::LowConf);
    }

    let need_score = if identity_blocks_field && contract.is_identity_critical() {
        // Identity-critical fields still carry a nonzero need so NS keeps
        // surfacing them until identity resolves, but the dominant reason is
        // `blocked_by_identity`, not ordinary deficit scoring.
        missing_mult(state.status) * (1.0 - decayed_confidence) * contract.required_level.weight()
    } else {
        let min_refs_m = if min_refs_mult(contract, state) { 1.5 } else { 1.0 };
        let tier_m = if tier_deficit_mult(contract, state) { 2.0 } else { 1.0 };
        let conflict_m = if matches!(state.status, FieldStatus::Conflict) { 1.5 } else { 1.0 };
        missing_mult(state.status)
            * (1.0 - decayed_confidence).clamp(0.0, 1.0)
            * contract.required_level.weight()
            * tier_m
            * min_refs_m
            * conflict_m
            * freshness
    };

    let blocked_by = if identity_blocks_field {
        Some("identity".to_string())
    } else if contract.publish_gated && !identity.publish_gate_open {
        Some("publish_gate".to_string())
    } else {
        None
    };

    NeedRow {
        field_key: contract.key.clone(),
        need_score,
        reasons,
        blocked_by,
        effective_confidence: decayed_confidence,
        confidence_capped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{CategoryPolicies, CategoryContract, EvidencePolicy, FieldContract, ValueType};
    use crate::types::{AmbiguityLevel, DocHint, RequiredLevel};
    use std::collections::HashMap;

    fn critical_field() -> FieldContract {
        FieldContract {
            key: "sensor_model".into(),
            required_level: RequiredLevel::Critical,
            value_type: ValueType::Text,
            unit: None,
            enum_values: None,
            evidence_policy: EvidencePolicy { min_refs: 2, preferred_tier: Some(Tier::MANUFACTURER) },
            tier_preference: vec![Tier::MANUFACTURER],
            search_hints: vec![],
            preferred_content_types: vec![DocHint::SpecPdf],
            half_life_days: None,
            publish_gated: false,
        }
    }

    fn locked() -> crate::identity::IdentityLockState {
        crate::identity::IdentityLockState::new(IdentityMatchLevel::Locked, 0.97, AmbiguityLevel::Easy, 1)
    }

    #[test]
    fn missing_field_has_positive_need_with_missing_reason() {
        let row = compute(&critical_field(), &FieldState::unknown(), &locked(), 180.0, 0.05);
        assert!(row.need_score > 0.0);
        assert!(row.reasons.contains(&NeedReason::Missing));
    }

    #[test]
    fn identity_critical_field_blocked_while_unlocked() {
        let identity = crate::identity::IdentityLockState::new(
            IdentityMatchLevel::Unlocked,
            0.4,
            AmbiguityLevel::Medium,
            3,
        );
        let row = compute(&critical_field(), &FieldState::unknown(), &identity, 180.0, 0.05);
        assert!(row.reasons.contains(&NeedReason::BlockedByIdentity));
        assert_eq!(row.blocked_by.as_deref(), Some("identity"));
    }

    #[test]
    fn tier_deficit_flagged_when_only_worse_tier_seen() {
        let mut state = FieldState::unknown();
        state.status = FieldStatus::Candidate;
        state.best_tier_seen = Some(Tier::RETAIL);
        state.confidence = 0.5;
        let row = compute(&critical_field(), &state, &locked(), 180.0, 0.05);
        assert!(row.reasons.contains(&NeedReason::TierDeficit));
    }

    #[test]
    fn min_refs_fail_flagged_below_threshold() {
        let mut state = FieldState::unknown();
        state.status = FieldStatus::Candidate;
        state.refs_from_distinct_sources = 1;
        state.confidence = 0.6;
        let row = compute(&critical_field(), &state, &locked(), 180.0, 0.05);
        assert!(row.reasons.contains(&NeedReason::MinRefsFail));
    }

    #[test]
    fn accepted_field_with_full_evidence_has_low_need() {
        let mut state = FieldState::unknown();
        state.status = FieldStatus::Accepted;
        state.confidence = 0.95;
        state.refs_from_distinct_sources = 2;
        state.best_tier_seen = Some(Tier::MANUFACTURER);
        let row = compute(&critical_field(), &state, &locked(), 180.0, 0.05);
        assert!(row.need_score < 0.2);
        assert!(row.reasons.is_empty());
    }

    #[test]
    fn confidence_is_capped_by_identity_state() {
        let mut state = FieldState::unknown();
        state.status = FieldStatus::Accepted;
        state.confidence = 0.99;
        state.refs_from_distinct_sources = 2;
        let identity = crate::identity::IdentityLockState::new(
            IdentityMatchLevel::Provisional,
            0.8,
            AmbiguityLevel::Easy,
            1,
        );
        let row = compute(&critical_field(), &state, &identity, 180.0, 0.05);
        assert!(row.confidence_capped);
        assert!(row.effective_confidence <= 0.74);
    }

    #[test]
    fn needset_is_deterministic_given_same_inputs() {
        let field = critical_field();
        let state = FieldState::unknown();
        let identity = locked();
        let a = compute(&field, &state, &identity, 180.0, 0.05);
        let b = compute(&field, &state, &identity, 180.0, 0.05);
        assert_eq!(a.need_score, b.need_score);
        assert_eq!(a.reasons, b.reasons);
    }

    #[test]
    fn contract_reference_unused_import_guard() {
        // keeps CategoryContract/CategoryPolicies/HashMap imports meaningful
        // for future multi-field NeedSet-row batches in this test module.
        let _c = CategoryContract {
            category: "mouse".into(),
            fields: vec![critical_field()],
            key_migrations: HashMap::new(),
            policies: CategoryPolicies::default(),
        };
    }
}
