//! Extractor implementations over the method set (§3, §4.9).
//!
//! `DeterministicNormalizerExtractor` is the one concrete, non-LLM extractor
//! in this crate: it reads straight from EI's already-extracted `facts`
//! table, grounded on `evidence_index::extract_kv_facts`'s normalization.
//! `html_spec_table` / `embedded_json` / `pdf_text` / `*_ocr` extractors all
//! require a real HTML/PDF/OCR pipeline this corpus does not supply (see
//! DESIGN.md's Open Question); `LlmExtractExtractor` is the trait seam for
//! the one method this crate genuinely cannot implement without an external
//! model call, mirroring DP's `LlmExpander` seam.

use super::{EvidenceUnitOutput, ExtractedValue, ExtractionContext};
use crate::evidence_index::EvidenceIndex;
use crate::identity::token_coverage;
use crate::types::{Method, UnknownReason};

#[async_trait::async_trait]
pub trait Extractor: Send + Sync {
    fn method(&self) -> Method;
    async fn extract(&self, ctx: &ExtractionContext, identity_tokens: &[String]) -> Vec<EvidenceUnitOutput>;
}

/// Reads the `normalized_value` already sitting in EI's `facts` table for
/// the field's anchor keys — no free-text parsing, no model call.
pub struct DeterministicNormalizerExtractor<'a> {
    pub index: &'a EvidenceIndex,
}

#[async_trait::async_trait]
impl<'a> Extractor for DeterministicNormalizerExtractor<'a> {
    fn method(&self) -> Method {
        Method::DeterministicNormalizer
    }

    async fn extract(&self, ctx: &ExtractionContext, identity_tokens: &[String]) -> Vec<EvidenceUnitOutput> {
        let mut out = Vec::new();
        for prime in &ctx.prime_sources {
            let Ok(Some(chunk)) = self.index.resolve_snippet(&prime.snippet_id) else { continue };
            let Ok(facts) = self
                .index
                .search_facts_fts(&ctx.field.key.replace('_', " "), &Default::default())
            else {
                continue;
            };
            let relevant: Vec<_> = facts.into_iter().filter(|f| f.snippet_id == prime.snippet_id).collect();
            for fact in relevant {
                let snippet_tokens = crate::identity::tokenize(&chunk.text);
                let target_match_passed = token_coverage(identity_tokens, &snippet_tokens) > 0.0 || identity_tokens.is_empty();
                let value = parse_typed_value(&ctx.field.value_type, &fact.normalized_value)
                    .map(ExtractedValue::Value)
                    .unwrap_or(ExtractedValue::Unknown { reason: UnknownReason::MissingEvidence });
                out.push(EvidenceUnitOutput {
                    field_key: ctx.field.key.clone(),
                    value,
                    method: Method::DeterministicNormalizer,
                    snippet_ids: vec![prime.snippet_id.clone()],
                    target_match_passed,
                    page_product_cluster_id: None,
                });
            }
        }
        out
    }
}

fn parse_typed_value(value_type: &crate::contract::ValueType, raw: &str) -> Option<serde_json::Value> {
    use crate::contract::ValueType;
    match value_type {
        ValueType::Number => {
            let digits: String = raw.chars().filter(|c| c.is_ascii_digit() || *c == '.').collect();
            digits.parse::<f64>().ok().map(|n| serde_json::json!(n))
        }
        ValueType::Boolean => match raw.trim() {
            "true" | "yes" | "1" => Some(serde_json::json!(true)),
            "false" | "no" | "0" => Some(serde_json::json!(false)),
            _ => None,
        },
        ValueType::Text | ValueType::Enum => {
            if raw.trim().is_empty() {
                None
            } else {
                Some(serde_json::json!(raw.trim()))
            }
        }
    }
}

/// Trait seam for `llm_extract` (§3's method set). No-op by default; a real
/// implementation lives outside this crate and is injected by the batch
/// orchestrator.
pub struct NoopLlmExtractExtractor;

#[async_trait::async_trait]
impl Extractor for NoopLlmExtractExtractor {
    fn method(&self) -> Method {
        Method::LlmExtract
    }

    async fn extract(&self, _ctx: &ExtractionContext, _identity_tokens: &[String]) -> Vec<EvidenceUnitOutput> {
        Vec::new()
    }
}
