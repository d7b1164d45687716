//! Category contract and field contract (§3).
//!
//! Loaded once per run from the category schema collaborator and treated as
//! immutable for the lifetime of the run, a "load once, read everywhere"
//! shape.

use crate::types::{DocHint, FieldKey, RequiredLevel, Tier};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Text,
    Number,
    Enum,
    Boolean,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidencePolicy {
    /// Minimum distinct-source evidence units required to accept a value
    /// (invariant 1, §3).
    pub min_refs: usize,
    /// Whether the contract prefers a specific tier and should be penalized
    /// (`tier_deficit_mult`, §4.2) when only worse tiers are seen.
    pub preferred_tier: Option<Tier>,
}

impl Default for EvidencePolicy {
    fn default() -> Self {
        EvidencePolicy {
            min_refs: 1,
            preferred_tier: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldContract {
    pub key: FieldKey,
    pub required_level: RequiredLevel,
    pub value_type: ValueType,
    pub unit: Option<String>,
    pub enum_values: Option<Vec<String>>,
    pub evidence_policy: EvidencePolicy,
    /// Per-field tier preference order; remaps retrieval weight positions
    /// (§4.8) overriding the fixed global tier weights.
    pub tier_preference: Vec<Tier>,
    pub search_hints: Vec<String>,
    /// Preferred document kinds for this field, used by the retriever's
    /// doc_kind-alignment term (§4.8).
    pub preferred_content_types: Vec<DocHint>,
    /// Half-life (days) for the freshness decay applied in the NeedSet
    /// engine (§4.2). Falls back to the category-wide default when absent.
    pub half_life_days: Option<f64>,
    /// Whether an accepted value for this field requires human review
    /// before publish (publish gate, §4.3/§4.10).
    pub publish_gated: bool,
}

impl FieldContract {
    pub fn is_identity_critical(&self) -> bool {
        matches!(
            self.required_level,
            RequiredLevel::Identity | RequiredLevel::Critical
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CategoryPolicies {
    pub default_half_life_days: f64,
    pub low_quality_confidence: f64,
    pub margin_threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryContract {
    pub category: String,
    pub fields: Vec<FieldContract>,
    /// Old key -> new key. RC rewrites incoming keys before CE; unknown
    /// keys are rejected with a counted metric (§4.1).
    pub key_migrations: HashMap<String, String>,
    pub policies: CategoryPolicies,
}

impl CategoryContract {
    pub fn field(&self, key: &str) -> Option<&FieldContract> {
        self.fields.iter().find(|f| f.key == key)
    }

    /// Rewrite a raw evidence key through `key_migrations`. Returns `None`
    /// when the key is neither a known field nor a migratable alias — the
    /// caller counts this as a rejected-key metric.
    pub fn resolve_key<'a>(&'a self, raw_key: &'a str) -> Option<&'a str> {
        if self.field(raw_key).is_some() {
            return Some(raw_key);
        }
        self.key_migrations
            .get(raw_key)
            .map(|s| s.as_str())
            .filter(|mapped| self.field(mapped).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contract() -> CategoryContract {
        CategoryContract {
            category: "mouse".into(),
            fields: vec![FieldContract {
                key: "polling_rate".into(),
                required_level: RequiredLevel::Critical,
                value_type: ValueType::Number,
                unit: Some("hz".into()),
                enum_values: None,
                evidence_policy: EvidencePolicy {
                    min_refs: 2,
                    preferred_tier: Some(Tier::MANUFACTURER),
                },
                tier_preference: vec![Tier::MANUFACTURER, Tier::LAB_REVIEW],
                search_hints: vec!["polling rate".into()],
                preferred_content_types: vec![DocHint::SpecPdf],
                half_life_days: None,
                publish_gated: false,
            }],
            key_migrations: HashMap::from([("poll_rate".to_string(), "polling_rate".to_string())]),
            policies: CategoryPolicies {
                default_half_life_days: 180.0,
                low_quality_confidence: 0.3,
                margin_threshold: 0.05,
            },
        }
    }

    #[test]
    fn resolves_known_key() {
        assert_eq!(contract().resolve_key("polling_rate"), Some("polling_rate"));
    }

    #[test]
    fn resolves_migrated_key() {
        assert_eq!(contract().resolve_key("poll_rate"), Some("polling_rate"));
    }

    #[test]
    fn rejects_unknown_key() {
        assert_eq!(contract().resolve_key("nonexistent"), None);
    }
}
