//! Round Controller (RC), §4.1.
//!
//! Executes one product as a bounded multi-round convergence loop. The stop
//! condition evaluator ([`step`]) is written as a pure function over streak
//! counters and round metrics — alongside NS, this is the other half of the
//! principal testable surface named in §4.2 and §8 invariant 7.
//! [`ConvergenceConfig`] follows the usual "load settings once, thread an
//! immutable struct everywhere" shape, and this module keeps the same
//! single-writer-per-product discipline already established by
//! `store::Partition`.

use crate::types::{ConvergenceStopReason, FieldKey, IdentityMatchLevel};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvergenceConfig {
    pub max_rounds: u32,
    pub no_progress_epsilon: f64,
    pub n_no_progress: u32,
    pub n_low_quality: u32,
    pub low_quality_confidence: f64,
    pub n_identity_fast_fail: u32,
    pub per_run_url_cap: u64,
    pub per_run_token_cap: u64,
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        ConvergenceConfig {
            max_rounds: 4,
            no_progress_epsilon: 0.01,
            n_no_progress: 3,
            n_low_quality: 3,
            low_quality_confidence: 0.3,
            n_identity_fast_fail: 1,
            per_run_url_cap: 200,
            per_run_token_cap: 200_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RoundProgress {
    pub fields_accepted_delta: i64,
    pub confidence_delta: f64,
    pub needset_size: usize,
    pub sources_identity_matched: usize,
    pub all_time_queries_added: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Streaks {
    pub no_progress: u32,
    pub low_quality: u32,
    pub identity_stuck: u32,
}

/// Per-round inputs the stop evaluator needs, gathered by RC after CE runs.
#[derive(Debug, Clone, Copy)]
pub struct RoundMetrics<'a> {
    pub progress: &'a RoundProgress,
    pub mean_confidence: f64,
    pub identity_status: IdentityMatchLevel,
    pub newly_identity_matched: usize,
    pub escalation_yielded_new_queries: bool,
    pub all_required_fields_complete: bool,
    pub cumulative_fetched_urls: u64,
    pub cumulative_llm_tokens: u64,
}

/// Evaluate the seven stop conditions from §4.1 in spec order, updating
/// streak counters. Pure: identical inputs always yield identical
/// `(Streaks, Option<ConvergenceStopReason>)` (§8 invariant 3).
pub fn step(
    streaks: Streaks,
    round_index: u32,
    config: &ConvergenceConfig,
    metrics: RoundMetrics,
) -> (Streaks, Option<ConvergenceStopReason>) {
    let mut next = streaks;

    if metrics.all_required_fields_complete {
        return (next, Some(ConvergenceStopReason::Complete));
    }

    if round_index >= config.max_rounds {
        return (next, Some(ConvergenceStopReason::MaxRoundsReached));
    }

    if metrics.cumulative_fetched_urls > config.per_run_url_cap || metrics.cumulative_llm_tokens > config.per_run_token_cap {
        return (next, Some(ConvergenceStopReason::BudgetExhausted));
    }

    if metrics.progress.confidence_delta.abs() < config.no_progress_epsilon && metrics.progress.fields_accepted_delta == 0 {
        next.no_progress += 1;
    } else {
        next.no_progress = 0;
    }
    if next.no_progress >= config.n_no_progress {
        return (next, Some(ConvergenceStopReason::NoProgress));
    }

    if metrics.progress.sources_identity_matched == 0 || metrics.mean_confidence < config.low_quality_confidence {
        next.low_quality += 1;
    } else {
        next.low_quality = 0;
    }
    if next.low_quality >= config.n_low_quality {
        return (next, Some(ConvergenceStopReason::RepeatedLowQuality));
    }

    let identity_not_locked = matches!(metrics.identity_status, IdentityMatchLevel::Unlocked | IdentityMatchLevel::Conflict);
    if identity_not_locked && metrics.newly_identity_matched == 0 {
        next.identity_stuck += 1;
    } else {
        next.identity_stuck = 0;
    }
    if next.identity_stuck >= config.n_identity_fast_fail {
        return (next, Some(ConvergenceStopReason::IdentityGateStuck));
    }

    if !metrics.escalation_yielded_new_queries && round_index > 0 {
        return (next, Some(ConvergenceStopReason::EscalationExhausted));
    }

    (next, None)
}

/// Cross-round query dedup (§4.1): RC maintains an all-time set of emitted
/// query strings and filters DP's output against it before dispatch.
#[derive(Debug, Clone, Default)]
pub struct QueryLedger {
    seen: HashSet<String>,
}

impl QueryLedger {
    /// Filter `queries` down to those not yet emitted, recording the
    /// survivors as now-seen. Returns the accepted subset in order.
    pub fn admit(&mut self, queries: Vec<crate::discovery::QueryRow>) -> Vec<crate::discovery::QueryRow> {
        queries
            .into_iter()
            .filter(|q| self.seen.insert(q.query.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Rewrite a raw evidence key through the contract's `key_migrations`
/// before CE sees it (§4.1). Unknown keys are dropped and counted by the
/// caller via the returned bool.
pub fn resolve_and_count<'a>(contract: &'a crate::contract::CategoryContract, raw_key: &'a str) -> Option<&'a str> {
    contract.resolve_key(raw_key)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundSummary {
    pub round_index: u32,
    pub progress: RoundProgress,
    pub stop_reason: Option<ConvergenceStopReason>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RunSummary {
    pub rounds: Vec<RoundSummary>,
    pub final_stop_reason: Option<ConvergenceStopReason>,
    pub field_values: HashMap<FieldKey, serde_json::Value>,
    pub unknown_reasons: HashMap<FieldKey, crate::types::UnknownReason>,
    /// Last Prime Source pack built per field (§4.8), kept for the `get_prime_sources`
    /// read endpoint and the `prime_sources.json` run artifact (§6).
    pub prime_sources: HashMap<FieldKey, crate::retrieval::PrimeSourcePack>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(progress: RoundProgress, identity: IdentityMatchLevel) -> RoundMetrics<'static> {
        // leak the progress so tests can own a 'static RoundMetrics cheaply;
        // scoped entirely to the test process.
        RoundMetrics {
            progress: Box::leak(Box::new(progress)),
            mean_confidence: 0.9,
            identity_status: identity,
            newly_identity_matched: 1,
            escalation_yielded_new_queries: true,
            all_required_fields_complete: false,
            cumulative_fetched_urls: 10,
            cumulative_llm_tokens: 100,
        }
    }

    #[test]
    fn complete_short_circuits_all_other_checks() {
        let mut m = metrics(RoundProgress::default(), IdentityMatchLevel::Locked);
        m.all_required_fields_complete = true;
        let (_streaks, reason) = step(Streaks::default(), 0, &ConvergenceConfig::default(), m);
        assert_eq!(reason, Some(ConvergenceStopReason::Complete));
    }

    #[test]
    fn max_rounds_reached_stops_the_run() {
        let m = metrics(RoundProgress::default(), IdentityMatchLevel::Locked);
        let config = ConvergenceConfig { max_rounds: 2, ..Default::default() };
        let (_streaks, reason) = step(Streaks::default(), 2, &config, m);
        assert_eq!(reason, Some(ConvergenceStopReason::MaxRoundsReached));
    }

    #[test]
    fn no_progress_streak_accumulates_then_stops() {
        let config = ConvergenceConfig { max_rounds: 10, ..Default::default() };
        let mut streaks = Streaks::default();
        let flat_progress = RoundProgress { fields_accepted_delta: 0, confidence_delta: 0.0, ..Default::default() };
        for round in 0..2 {
            let m = metrics(flat_progress, IdentityMatchLevel::Locked);
            let (next, reason) = step(streaks, round, &config, m);
            assert_eq!(reason, None);
            streaks = next;
        }
        let m = metrics(flat_progress, IdentityMatchLevel::Locked);
        let (_next, reason) = step(streaks, 2, &config, m);
        assert_eq!(reason, Some(ConvergenceStopReason::NoProgress));
    }

    #[test]
    fn identity_gate_stuck_fires_after_fast_fail_threshold() {
        let config = ConvergenceConfig { max_rounds: 10, n_identity_fast_fail: 1, ..Default::default() };
        let mut m = metrics(
            RoundProgress { sources_identity_matched: 0, ..Default::default() },
            IdentityMatchLevel::Unlocked,
        );
        m.newly_identity_matched = 0;
        let (_streaks, reason) = step(Streaks::default(), 1, &config, m);
        assert_eq!(reason, Some(ConvergenceStopReason::IdentityGateStuck));
    }

    #[test]
    fn budget_exhausted_takes_priority_over_progress_streaks() {
        let config = ConvergenceConfig { max_rounds: 10, per_run_url_cap: 5, ..Default::default() };
        let mut m = metrics(RoundProgress::default(), IdentityMatchLevel::Locked);
        m.cumulative_fetched_urls = 999;
        let (_streaks, reason) = step(Streaks::default(), 1, &config, m);
        assert_eq!(reason, Some(ConvergenceStopReason::BudgetExhausted));
    }

    #[test]
    fn query_ledger_deduplicates_across_rounds() {
        let mut ledger = QueryLedger::default();
        let first = vec![crate::discovery::QueryRow { query: "razer viper v3 pro specs".into(), target_fields: vec![], doc_hint: crate::types::DocHint::SpecPdf }];
        let admitted_first = ledger.admit(first.clone());
        assert_eq!(admitted_first.len(), 1);
        let admitted_second = ledger.admit(first);
        assert_eq!(admitted_second.len(), 0);
    }

    #[test]
    fn stop_evaluation_is_deterministic_given_same_inputs() {
        let config = ConvergenceConfig::default();
        let m1 = metrics(RoundProgress::default(), IdentityMatchLevel::Locked);
        let m2 = metrics(RoundProgress::default(), IdentityMatchLevel::Locked);
        let (s1, r1) = step(Streaks::default(), 1, &config, m1);
        let (s2, r2) = step(Streaks::default(), 1, &config, m2);
        assert_eq!(r1, r2);
        assert_eq!(s1.no_progress, s2.no_progress);
    }
}
