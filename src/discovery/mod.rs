//! Discovery Planner (DP), §4.4.
//!
//! Builds a deterministic `SearchProfile` (alias set + structured query
//! rows) and triages SERP candidates with a fixed, weighted multi-factor
//! scoring decomposition (same shape CE reuses), tunable with sane
//! defaults. LLM expansion and SERP reranking are modeled as trait seams
//! with no-op defaults, since neither collaborator is implemented here.

use crate::identity::{tokenize, ProductTarget};
use crate::needset::NeedRow;
use crate::types::{DocHint, FieldKey};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRow {
    pub query: String,
    pub target_fields: Vec<FieldKey>,
    pub doc_hint: DocHint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchProfile {
    pub aliases: Vec<String>,
    pub queries: Vec<QueryRow>,
}

const MAX_ALIASES: usize = 12;

/// Deterministic alias set: spacing, hyphenation, and digit-group-preserving
/// variants of brand + model (§4.4).
pub fn generate_aliases(brand: &str, model: &str) -> Vec<String> {
    let mut out = Vec::new();
    let base = format!("{brand} {model}");
    out.push(base.clone());
    out.push(format!("{brand}-{model}").replace(' ', "-"));
    out.push(format!("{brand}{model}").replace(' ', ""));
    out.push(base.to_lowercase());
    out.push(base.to_uppercase());

    // Digit-group-preserving variants: split trailing digit runs off model
    // tokens ("V3" -> "V 3", "3 Pro" kept intact) without disturbing the
    // digits themselves, since SKUs/firmware revisions hinge on them.
    let spaced_digits: String = model
        .chars()
        .enumerate()
        .flat_map(|(i, c)| {
            if i > 0 && c.is_ascii_digit() && !model.as_bytes()[i - 1].is_ascii_whitespace() && !(model.as_bytes()[i - 1] as char).is_ascii_digit() {
                vec![' ', c]
            } else {
                vec![c]
            }
        })
        .collect();
    if spaced_digits != model {
        out.push(format!("{brand} {spaced_digits}"));
    }

    for hyphen_variant in [
        model.replace(' ', "-"),
        model.replace('-', " "),
    ] {
        if hyphen_variant != model {
            out.push(format!("{brand} {hyphen_variant}"));
        }
    }

    out.sort();
    out.dedup();
    out.truncate(MAX_ALIASES);
    out
}

/// Build the deterministic half of a `SearchProfile`. NeedSet rows with
/// `need_score > 0` drive targeted queries for rounds ≥ 1; an empty
/// `needset` (Round 0) falls back to identity-only bootstrap queries (§4.1).
pub fn build_search_profile(
    target: &ProductTarget,
    needset: &[NeedRow],
    learning_anchor_hints: &[String],
) -> SearchProfile {
    let aliases = generate_aliases(&target.brand, &target.model);
    let mut queries = Vec::new();
    let mut seen = HashSet::new();

    let mut push = |query: String, target_fields: Vec<FieldKey>, doc_hint: DocHint| {
        if seen.insert(query.clone()) {
            queries.push(QueryRow { query, target_fields, doc_hint });
        }
    };

    let identity_name = format!("{} {}", target.brand, target.model);
    push(format!("{identity_name} specifications"), vec![], DocHint::SpecPdf);
    push(format!("{identity_name} manual pdf"), vec![], DocHint::ManualPdf);
    push(format!("{identity_name} review"), vec![], DocHint::LabReview);

    for row in needset.iter().filter(|r| r.need_score > 0.0) {
        let mut query = format!("{identity_name} {}", row.field_key.replace('_', " "));
        for hint in learning_anchor_hints {
            if hint.to_lowercase().contains(&row.field_key) {
                query = format!("{query} {hint}");
                break;
            }
        }
        push(query, vec![row.field_key.clone()], DocHint::SpecPdf);
    }

    SearchProfile { aliases, queries }
}

/// Progressive re-query using facts-so-far as negative context (§4.4's
/// Escalation). `known_values` is rendered as "found X" context so the
/// query is not a bare repeat of earlier rounds.
pub fn escalate(
    target: &ProductTarget,
    still_missing: &[FieldKey],
    known_values: &HashMap<FieldKey, String>,
) -> Vec<QueryRow> {
    let identity_name = format!("{} {}", target.brand, target.model);
    still_missing
        .iter()
        .map(|field| {
            let known_fragment = known_values
                .iter()
                .take(2)
                .map(|(k, v)| format!("{k} {v}"))
                .collect::<Vec<_>>()
                .join(" ");
            let query = if known_fragment.is_empty() {
                format!("{identity_name} {}", field.replace('_', " "))
            } else {
                format!("{identity_name} {known_fragment} {}", field.replace('_', " "))
            };
            QueryRow { query, target_fields: vec![field.clone()], doc_hint: DocHint::General }
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerpCandidate {
    pub url: String,
    pub host: String,
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredCandidate {
    pub candidate: SerpCandidate,
    pub score: f64,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct HostStrategy {
    pub tier: Option<crate::types::Tier>,
    pub doc_kind_bias: Option<crate::types::DocKind>,
    pub fetch_mode_preference: Option<crate::types::FetchMode>,
}

#[derive(Debug, Clone, Default)]
pub struct HostStrategyTable {
    pub known_hosts: HashMap<String, HostStrategy>,
    pub denied_hosts: HashSet<String>,
}

/// Triage SERP candidates with the fixed decomposition from §4.4: tier
/// match, doc_kind match, brand/model token match, PDF bonus, denied-host
/// penalty, duplicate penalty. Returns the top `k` by score, ties broken by
/// URL ascending for determinism.
pub fn triage(
    candidates: Vec<SerpCandidate>,
    strategy: &HostStrategyTable,
    doc_hint: DocHint,
    identity_tokens: &[String],
    already_seen_urls: &HashSet<String>,
    k: usize,
) -> Vec<ScoredCandidate> {
    let mut scored: Vec<ScoredCandidate> = candidates
        .into_iter()
        .map(|c| score_candidate(c, strategy, doc_hint, identity_tokens, already_seen_urls))
        .collect();

    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.candidate.url.cmp(&b.candidate.url)));
    scored.retain(|c| c.score > f64::NEG_INFINITY);
    scored.truncate(k);
    scored
}

fn score_candidate(
    candidate: SerpCandidate,
    strategy: &HostStrategyTable,
    doc_hint: DocHint,
    identity_tokens: &[String],
    already_seen_urls: &HashSet<String>,
) -> ScoredCandidate {
    let mut score = 0.0;
    let mut reasons = Vec::new();

    if strategy.denied_hosts.contains(&candidate.host) {
        return ScoredCandidate { score: f64::NEG_INFINITY, reasons: vec!["denied_host".into()], candidate };
    }

    if let Some(known) = strategy.known_hosts.get(&candidate.host) {
        if let Some(tier) = known.tier {
            score += match tier.0 {
                1 => 3.0,
                2 => 2.0,
                3 => 1.0,
                _ => 0.25,
            };
            reasons.push(format!("tier_match:{tier}"));
        }
        if known.doc_kind_bias.is_some() {
            score += 1.0;
            reasons.push("doc_kind_bias_known_host".into());
        }
    }

    let title_tokens = tokenize(&candidate.title);
    let overlap = crate::identity::token_coverage(identity_tokens, &title_tokens);
    score += overlap * 2.0;
    if overlap > 0.0 {
        reasons.push(format!("brand_model_match:{overlap:.2}"));
    }

    let is_pdf = candidate.url.to_lowercase().ends_with(".pdf");
    if is_pdf && matches!(doc_hint, DocHint::SpecPdf | DocHint::ManualPdf) {
        score += 1.5;
        reasons.push("pdf_bonus".into());
    }

    if already_seen_urls.contains(&candidate.url) {
        score -= 2.0;
        reasons.push("duplicate_penalty".into());
    }

    ScoredCandidate { candidate, score, reasons }
}

/// LLM query expansion seam (§4.4). Output must be validated before merging
/// with the deterministic set — see [`validate_expansion`].
#[async_trait::async_trait]
pub trait LlmExpander: Send + Sync {
    async fn expand(&self, target: &ProductTarget, context: &[NeedRow]) -> Vec<QueryRow>;
}

pub struct NoopLlmExpander;

#[async_trait::async_trait]
impl LlmExpander for NoopLlmExpander {
    async fn expand(&self, _target: &ProductTarget, _context: &[NeedRow]) -> Vec<QueryRow> {
        Vec::new()
    }
}

/// Validate LLM-proposed queries: brand token present, required digit groups
/// (SKU/firmware numbers already known in the identity) preserved, caps
/// enforced.
pub fn validate_expansion(target: &ProductTarget, proposed: Vec<QueryRow>, cap: usize) -> Vec<QueryRow> {
    let brand_token = tokenize(&target.brand).into_iter().next().unwrap_or_default();
    let required_digit_groups: Vec<String> = tokenize(&target.model)
        .into_iter()
        .filter(|t| t.chars().any(|c| c.is_ascii_digit()))
        .collect();

    proposed
        .into_iter()
        .filter(|row| {
            let tokens = tokenize(&row.query);
            let has_brand = brand_token.is_empty() || tokens.contains(&brand_token);
            let has_digits = required_digit_groups.iter().all(|g| tokens.contains(g));
            has_brand && has_digits
        })
        .take(cap)
        .collect()
}

/// SERP reranking seam over the top-N triaged candidates (§4.4).
#[async_trait::async_trait]
pub trait SerpReranker: Send + Sync {
    async fn rerank(&self, candidates: Vec<ScoredCandidate>) -> Vec<ScoredCandidate>;
}

pub struct NoopSerpReranker;

#[async_trait::async_trait]
impl SerpReranker for NoopSerpReranker {
    async fn rerank(&self, candidates: Vec<ScoredCandidate>) -> Vec<ScoredCandidate> {
        candidates
    }
}

/// Search engine seam: DP issues a `QueryRow` and gets raw SERP candidates
/// back. Like `LlmExpander`/`SerpReranker`, this collaborator lives outside
/// the corpus (a real search API or index) and ships as a no-op by default,
/// mirroring FS's `PageFetcher` seam for the same reason.
#[async_trait::async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str) -> Vec<SerpCandidate>;
}

pub struct NoopSearchProvider;

#[async_trait::async_trait]
impl SearchProvider for NoopSearchProvider {
    async fn search(&self, _query: &str) -> Vec<SerpCandidate> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> ProductTarget {
        ProductTarget::new("mouse", "Razer", "Viper V3 Pro", None, None, vec![])
    }

    #[test]
    fn alias_generation_is_capped_and_deterministic() {
        let a = generate_aliases("Razer", "Viper V3 Pro");
        let b = generate_aliases("Razer", "Viper V3 Pro");
        assert_eq!(a, b);
        assert!(a.len() <= MAX_ALIASES);
    }

    #[test]
    fn search_profile_bootstrap_has_no_target_fields_when_needset_empty() {
        let profile = build_search_profile(&target(), &[], &[]);
        assert!(profile.queries.iter().all(|q| q.target_fields.is_empty()));
        assert!(!profile.queries.is_empty());
    }

    #[test]
    fn triage_excludes_denied_hosts() {
        let mut strategy = HostStrategyTable::default();
        strategy.denied_hosts.insert("spam.example".to_string());
        let candidates = vec![
            SerpCandidate { url: "https://razer.com/viper-v3-pro".into(), host: "razer.com".into(), title: "Razer Viper V3 Pro".into() },
            SerpCandidate { url: "https://spam.example/x".into(), host: "spam.example".into(), title: "Razer Viper V3 Pro".into() },
        ];
        let tokens = tokenize("Razer Viper V3 Pro");
        let results = triage(candidates, &strategy, DocHint::SpecPdf, &tokens, &HashSet::new(), 10);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].candidate.host, "razer.com");
    }

    #[test]
    fn triage_prefers_known_tier1_host_and_pdf() {
        let mut strategy = HostStrategyTable::default();
        strategy.known_hosts.insert(
            "razer.com".to_string(),
            HostStrategy { tier: Some(crate::types::Tier::MANUFACTURER), doc_kind_bias: Some(crate::types::DocKind::Spec), fetch_mode_preference: None },
        );
        let candidates = vec![
            SerpCandidate { url: "https://forum.example/thread".into(), host: "forum.example".into(), title: "Razer Viper V3 Pro discussion".into() },
            SerpCandidate { url: "https://razer.com/spec.pdf".into(), host: "razer.com".into(), title: "Razer Viper V3 Pro specs".into() },
        ];
        let tokens = tokenize("Razer Viper V3 Pro");
        let results = triage(candidates, &strategy, DocHint::SpecPdf, &tokens, &HashSet::new(), 10);
        assert_eq!(results[0].candidate.host, "razer.com");
    }

    #[test]
    fn expansion_rejects_queries_missing_required_digit_groups() {
        let t = target(); // model tokens include "3"
        let proposed = vec![
            QueryRow { query: "Razer Viper Pro wireless".into(), target_fields: vec![], doc_hint: DocHint::General },
            QueryRow { query: "Razer Viper V3 Pro wireless".into(), target_fields: vec![], doc_hint: DocHint::General },
        ];
        let valid = validate_expansion(&t, proposed, 12);
        assert_eq!(valid.len(), 1);
        assert!(valid[0].query.contains('3'));
    }
}
