//! Identity Gate (IG), §4.3, plus the product target / identity lock state
//! types from §3.
//!
//! Two jobs: classify a fetched source's identity match level, and decide
//! whether a single evidence unit's snippet actually talks about the target
//! product. Thresholds are tunable with env override but ship with sane
//! defaults.

use crate::types::AmbiguityLevel;
use crate::types::IdentityMatchLevel;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductTarget {
    pub category: String,
    pub brand: String,
    pub model: String,
    pub variant: Option<String>,
    pub sku: Option<String>,
    pub aliases: Vec<String>,
    pub identity_fingerprint: String,
}

impl ProductTarget {
    pub fn new(
        category: impl Into<String>,
        brand: impl Into<String>,
        model: impl Into<String>,
        variant: Option<String>,
        sku: Option<String>,
        aliases: Vec<String>,
    ) -> Self {
        let category = category.into();
        let brand = brand.into();
        let model = model.into();
        let mut target = ProductTarget {
            category,
            brand,
            model,
            variant,
            sku,
            aliases,
            identity_fingerprint: String::new(),
        };
        target.identity_fingerprint = target.compute_fingerprint();
        target
    }

    /// Stable hash over normalized identity tokens (§3, "Product target").
    fn compute_fingerprint(&self) -> String {
        let mut tokens = self.identity_tokens();
        tokens.sort();
        tokens.dedup();
        let joined = tokens.join("\u{1}");
        blake3::hash(joined.as_bytes()).to_hex().to_string()
    }

    /// Normalized identity tokens: brand, model, variant, sku, each
    /// lowercased and split on non-alphanumeric boundaries.
    pub fn identity_tokens(&self) -> Vec<String> {
        let mut tokens = Vec::new();
        tokens.extend(tokenize(&self.brand));
        tokens.extend(tokenize(&self.model));
        if let Some(v) = &self.variant {
            tokens.extend(tokenize(v));
        }
        if let Some(s) = &self.sku {
            tokens.extend(tokenize(s));
        }
        tokens
    }
}

/// Lowercase, split on non-alphanumeric runs, drop empties.
pub fn tokenize(s: &str) -> Vec<String> {
    s.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

/// Coverage of `needle` tokens found in `haystack`: how much of the identity
/// is actually present in the text being scored, not a symmetric similarity.
pub fn token_coverage(needle: &[String], haystack: &[String]) -> f64 {
    if needle.is_empty() {
        return 0.0;
    }
    let hay: HashSet<&str> = haystack.iter().map(|s| s.as_str()).collect();
    let hit = needle.iter().filter(|t| hay.contains(t.as_str())).count();
    hit as f64 / needle.len() as f64
}

/// Raw identity-adjacent text pulled from a fetched source: title, URL, and
/// near-identity DOM context (breadcrumbs, H1, product-card attributes).
#[derive(Debug, Clone, Default)]
pub struct IdentitySignals {
    pub title: String,
    pub url: String,
    pub dom_context: String,
}

impl IdentitySignals {
    fn weighted_coverage(&self, identity_tokens: &[String]) -> f64 {
        let title_tokens = tokenize(&self.title);
        let url_tokens = tokenize(&self.url);
        let dom_tokens = tokenize(&self.dom_context);
        0.5 * token_coverage(identity_tokens, &title_tokens)
            + 0.3 * token_coverage(identity_tokens, &url_tokens)
            + 0.2 * token_coverage(identity_tokens, &dom_tokens)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityLockState {
    pub status: IdentityMatchLevel,
    pub certainty: f64,
    pub ambiguity_level: AmbiguityLevel,
    pub family_model_count: u32,
    pub publish_gate_open: bool,
    pub extraction_gate_open: bool,
}

impl IdentityLockState {
    pub fn new(
        status: IdentityMatchLevel,
        certainty: f64,
        ambiguity_level: AmbiguityLevel,
        family_model_count: u32,
    ) -> Self {
        let extraction_gate_open = match status {
            IdentityMatchLevel::Conflict => false,
            IdentityMatchLevel::Unlocked => !ambiguity_level.is_hard_or_worse(),
            IdentityMatchLevel::Provisional | IdentityMatchLevel::Locked => true,
        };
        // Publish gate is always strict: only a locked identity publishes.
        let publish_gate_open = matches!(status, IdentityMatchLevel::Locked);
        IdentityLockState {
            status,
            certainty,
            ambiguity_level,
            family_model_count,
            publish_gate_open,
            extraction_gate_open,
        }
    }
}

impl IdentityLockState {
    /// Shared by NS (§4.2) and CE (§4.10): an identity-critical field cannot
    /// accumulate need-free or accept evidence while identity is unresolved
    /// or contested.
    pub fn blocks_field(&self, field_is_identity_critical: bool) -> bool {
        field_is_identity_critical
            && matches!(self.status, IdentityMatchLevel::Conflict | IdentityMatchLevel::Unlocked)
    }
}

#[derive(Debug, Clone)]
pub struct IdentityGate {
    pub locked_threshold: f64,
    pub provisional_threshold: f64,
}

impl Default for IdentityGate {
    fn default() -> Self {
        IdentityGate {
            locked_threshold: 0.95,
            provisional_threshold: 0.70,
        }
    }
}

impl IdentityGate {
    /// Classify a fetched source's identity match level (§4.3 "Source
    /// classification"). `competing` is a second identity candidate found on
    /// the same page (e.g. a related-product card); when it also clears
    /// `provisional_threshold` with a materially different model token set,
    /// the result is `conflict`.
    pub fn classify_source(
        &self,
        target: &ProductTarget,
        primary: &IdentitySignals,
        competing: Option<(&ProductTarget, &IdentitySignals)>,
    ) -> (IdentityMatchLevel, f64) {
        let identity_tokens = target.identity_tokens();
        let certainty = primary.weighted_coverage(&identity_tokens);

        if let Some((other_target, other_signals)) = competing {
            let other_tokens = other_target.identity_tokens();
            let other_certainty = other_signals.weighted_coverage(&other_tokens);
            let model_overlap = token_coverage(&tokenize(&target.model), &tokenize(&other_target.model));
            if other_certainty >= self.provisional_threshold
                && certainty >= self.provisional_threshold
                && model_overlap < 1.0
            {
                return (IdentityMatchLevel::Conflict, certainty);
            }
        }

        let level = if certainty >= self.locked_threshold {
            IdentityMatchLevel::Locked
        } else if certainty >= self.provisional_threshold {
            IdentityMatchLevel::Provisional
        } else {
            IdentityMatchLevel::Unlocked
        };
        (level, certainty)
    }

    /// `target_match_passed` for a single evidence unit (§4.3 "Candidate
    /// classification").
    pub fn classify_candidate(
        &self,
        source_level: IdentityMatchLevel,
        identity_tokens: &[String],
        snippet_text: &str,
        field_threshold: f64,
    ) -> bool {
        if !matches!(
            source_level,
            IdentityMatchLevel::Provisional | IdentityMatchLevel::Locked
        ) {
            return false;
        }
        let snippet_tokens = tokenize(snippet_text);
        token_coverage(identity_tokens, &snippet_tokens) >= field_threshold
    }
}

/// Relaxed contradiction rules (§4.3), each returning `true` when the two
/// observations are compatible (i.e. NOT a conflict) despite differing text.
pub mod relaxed {
    use super::{token_coverage, tokenize};

    /// Connection class ("wireless" vs "wireless / wired"): overlap rather
    /// than exact-string match.
    pub fn connection_compatible(a: &str, b: &str) -> bool {
        let ta = tokenize(a);
        let tb = tokenize(b);
        if ta.is_empty() || tb.is_empty() {
            return true;
        }
        token_coverage(&ta, &tb) > 0.0 || token_coverage(&tb, &ta) > 0.0
    }

    /// Sensor/component names: overlap >= 0.6 over the tokenized set.
    pub fn component_compatible(a: &str, b: &str) -> bool {
        let ta = tokenize(a);
        let tb = tokenize(b);
        if ta.is_empty() || tb.is_empty() {
            return true;
        }
        token_coverage(&ta, &tb).max(token_coverage(&tb, &ta)) >= 0.6
    }

    /// Dimensions: tolerate +/- 3mm differences.
    pub fn dimensions_compatible(a_mm: f64, b_mm: f64) -> bool {
        (a_mm - b_mm).abs() <= 3.0
    }

    /// SKU variants: only a conflict when token overlap is zero.
    pub fn sku_compatible(a: &str, b: &str) -> bool {
        let ta = tokenize(a);
        let tb = tokenize(b);
        if ta.is_empty() || tb.is_empty() {
            return true;
        }
        token_coverage(&ta, &tb) > 0.0 || token_coverage(&tb, &ta) > 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> ProductTarget {
        ProductTarget::new("mouse", "Razer", "Viper V3 Pro", None, None, vec![])
    }

    #[test]
    fn fingerprint_is_stable_across_calls() {
        let a = target();
        let b = target();
        assert_eq!(a.identity_fingerprint, b.identity_fingerprint);
    }

    #[test]
    fn locked_when_title_and_url_both_match() {
        let gate = IdentityGate::default();
        let signals = IdentitySignals {
            title: "Razer Viper V3 Pro Wireless Gaming Mouse".into(),
            url: "https://www.razer.com/gaming-mice/razer-viper-v3-pro".into(),
            dom_context: "Razer Viper V3 Pro".into(),
        };
        let (level, certainty) = gate.classify_source(&target(), &signals, None);
        assert_eq!(level, IdentityMatchLevel::Locked);
        assert!(certainty >= gate.locked_threshold);
    }

    #[test]
    fn unlocked_when_unrelated_page() {
        let gate = IdentityGate::default();
        let signals = IdentitySignals {
            title: "Logitech G Pro X Superlight 2".into(),
            url: "https://www.logitech.com/gpx2".into(),
            dom_context: "Logitech".into(),
        };
        let (level, _) = gate.classify_source(&target(), &signals, None);
        assert_eq!(level, IdentityMatchLevel::Unlocked);
    }

    #[test]
    fn conflict_when_two_distinct_products_both_clear_provisional() {
        let gate = IdentityGate::default();
        let other = ProductTarget::new("mouse", "Razer", "DeathAdder V3 Pro", None, None, vec![]);
        let primary_signals = IdentitySignals {
            title: "Razer Viper V3 Pro vs DeathAdder V3 Pro comparison".into(),
            url: "https://example.com/compare".into(),
            dom_context: "Razer Viper V3 Pro DeathAdder V3 Pro".into(),
        };
        let other_signals = primary_signals.clone();
        let (level, _) =
            gate.classify_source(&target(), &primary_signals, Some((&other, &other_signals)));
        assert_eq!(level, IdentityMatchLevel::Conflict);
    }

    #[test]
    fn relaxed_connection_class_not_conflicting() {
        assert!(relaxed::connection_compatible("wireless", "wireless / wired"));
    }

    #[test]
    fn relaxed_dimensions_within_tolerance() {
        assert!(relaxed::dimensions_compatible(125.0, 127.5));
        assert!(!relaxed::dimensions_compatible(125.0, 130.0));
    }

    #[test]
    fn relaxed_sku_conflict_only_when_zero_overlap() {
        assert!(relaxed::sku_compatible("RZ01-0001", "RZ01-0001-R3U1"));
        assert!(!relaxed::sku_compatible("RZ01-0001", "ZZ99-9999"));
    }
}
