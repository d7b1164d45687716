//! Extraction Context Assembler (EC), §4.9.
//!
//! Builds the bounded per-field prompt context extractors actually see:
//! contract summary, parse-template intent, component refs, and a Prime
//! Source pack trimmed to short quotes. Full pages are never dumped — the
//! context is always assembled from a small typed struct, never a raw
//! blob.

pub mod extractors;

use crate::contract::FieldContract;
use crate::evidence_index::EvidenceIndex;
use crate::retrieval::PrimeSourcePack;
use crate::types::{IdentityMatchLevel, Method, SnippetId, Tier, UnknownReason};
use serde::{Deserialize, Serialize};

const MAX_QUOTE_CHARS: usize = 300;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldContractSummary {
    pub key: String,
    pub value_type: crate::contract::ValueType,
    pub unit: Option<String>,
    pub enum_values: Option<Vec<String>>,
    pub min_refs: usize,
}

impl From<&FieldContract> for FieldContractSummary {
    fn from(c: &FieldContract) -> Self {
        FieldContractSummary {
            key: c.key.clone(),
            value_type: c.value_type.clone(),
            unit: c.unit.clone(),
            enum_values: c.enum_values.clone(),
            min_refs: c.evidence_policy.min_refs,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrimeSourceRef {
    pub snippet_id: SnippetId,
    pub quote: String,
    pub tier: Tier,
    pub source_identity_match: IdentityMatchLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionContext {
    pub field: FieldContractSummary,
    pub parse_template_id: String,
    pub examples: Vec<String>,
    pub component_refs: Vec<String>,
    pub prime_sources: Vec<PrimeSourceRef>,
}

/// Truncate a quote to `MAX_QUOTE_CHARS`, respecting UTF-8 char boundaries.
fn truncate_quote(text: &str) -> String {
    if text.chars().count() <= MAX_QUOTE_CHARS {
        return text.to_string();
    }
    let truncated: String = text.chars().take(MAX_QUOTE_CHARS).collect();
    format!("{truncated}…")
}

/// Assemble the bounded context for one field (§4.9). `parse_template_id`
/// identifies the field's parse-template intent (e.g. `"kv_numeric"`); real
/// example strings come from the contract's search hints, capped at two.
pub fn build_context(
    index: &EvidenceIndex,
    contract: &FieldContract,
    pack: &PrimeSourcePack,
    parse_template_id: &str,
    component_refs: Vec<String>,
) -> rusqlite::Result<ExtractionContext> {
    let mut prime_sources = Vec::new();
    for scored in &pack.accepted {
        if let Some(chunk) = index.resolve_snippet(&scored.snippet_id)? {
            if let Some(source) = index.source_for_doc(&chunk.doc_id)? {
                prime_sources.push(PrimeSourceRef {
                    snippet_id: scored.snippet_id.clone(),
                    quote: truncate_quote(&chunk.text),
                    tier: source.tier,
                    source_identity_match: source.identity_match_level,
                });
            }
        }
    }

    Ok(ExtractionContext {
        field: FieldContractSummary::from(contract),
        parse_template_id: parse_template_id.to_string(),
        examples: contract.search_hints.iter().take(2).cloned().collect(),
        component_refs,
        prime_sources,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExtractedValue {
    Value(serde_json::Value),
    Unknown { reason: UnknownReason },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceUnitOutput {
    pub field_key: String,
    pub value: ExtractedValue,
    pub method: Method,
    pub snippet_ids: Vec<SnippetId>,
    pub target_match_passed: bool,
    pub page_product_cluster_id: Option<String>,
}

/// Strip reasoning wrappers and code fences a provider-normalized output
/// parser must remove before schema validation (§4.9). Handles the two
/// shapes seen across providers: ```` ```json ... ``` ```` fences and
/// `<think>...</think>` reasoning preambles.
pub fn sanitize_provider_output(raw: &str) -> String {
    let after_think = match (raw.find("<think>"), raw.find("</think>")) {
        (Some(_), Some(end)) => raw[end + "</think>".len()..].trim(),
        _ => raw.trim(),
    };
    let mut text = after_think.to_string();
    if text.starts_with("```") {
        if let Some(first_newline) = text.find('\n') {
            text = text[first_newline + 1..].to_string();
        }
        if let Some(idx) = text.rfind("```") {
            text.truncate(idx);
        }
        text = text.trim().to_string();
    }
    text
}

/// Reject any evidence unit referencing a `snippet_id` that doesn't resolve
/// in EI, or whose `value`/`unknown_reason` violates the schema (§4.9).
/// Returns `(accepted, rejected_count)`.
pub fn validate_schema(
    index: &EvidenceIndex,
    outputs: Vec<EvidenceUnitOutput>,
) -> rusqlite::Result<(Vec<EvidenceUnitOutput>, usize)> {
    let mut accepted = Vec::new();
    let mut rejected = 0usize;
    for out in outputs {
        let mut all_resolve = true;
        for snippet_id in &out.snippet_ids {
            if index.resolve_snippet(snippet_id)?.is_none() {
                all_resolve = false;
                break;
            }
        }
        if !all_resolve {
            rejected += 1;
            continue;
        }
        match &out.value {
            ExtractedValue::Value(v) if v.is_null() => {
                rejected += 1;
                continue;
            }
            _ => {}
        }
        accepted.push(out);
    }
    Ok((accepted, rejected))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_truncation_respects_char_boundary_and_cap() {
        let long = "a".repeat(400);
        let q = truncate_quote(&long);
        assert!(q.chars().count() <= MAX_QUOTE_CHARS + 1);
    }

    #[test]
    fn sanitizer_strips_code_fence() {
        let raw = "```json\n{\"value\": 8000}\n```";
        assert_eq!(sanitize_provider_output(raw), "{\"value\": 8000}");
    }

    #[test]
    fn sanitizer_strips_reasoning_preamble() {
        let raw = "<think>let me check the spec sheet</think>{\"value\": 8000}";
        assert_eq!(sanitize_provider_output(raw), "{\"value\": 8000}");
    }

    #[test]
    fn dangling_snippet_reference_is_rejected() {
        let index = EvidenceIndex::open_in_memory().unwrap();
        let out = EvidenceUnitOutput {
            field_key: "polling_rate".into(),
            value: ExtractedValue::Value(serde_json::json!(8000)),
            method: Method::HtmlSpecTable,
            snippet_ids: vec!["not-real".into()],
            target_match_passed: true,
            page_product_cluster_id: None,
        };
        let (accepted, rejected) = validate_schema(&index, vec![out]).unwrap();
        assert_eq!(accepted.len(), 0);
        assert_eq!(rejected, 1);
    }
}
