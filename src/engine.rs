//! Round Controller (RC) orchestration glue, §4.1.
//!
//! Wires DP -> FS -> EI -> TR -> EC -> CE -> NS into the bounded multi-round
//! convergence loop the rest of this crate only supplies the pure pieces
//! for. [`RunHandles`] is one shared, mostly-immutable struct threaded
//! through every round the way an `AppState` is threaded through every
//! handler: it is built
//! once per run and handed to [`Run::new`], which owns the only mutable
//! state (field states, identity lock, streaks, query ledger) and drives
//! rounds until [`crate::round::step`] returns a stop reason. Each round's
//! read-only inputs are gathered fresh from `self` rather than carried
//! forward by the executor, so the round body never holds a back-reference
//! into the loop driving it.

use crate::consensus::{self, Candidate, ConsensusConfig, ConsensusOutcome};
use crate::contract::CategoryContract;
use crate::discovery::{
    self, HostStrategyTable, LlmExpander, NoopLlmExpander, NoopSearchProvider, NoopSerpReranker,
    SearchProvider, SerpReranker,
};
use crate::error::{CoreError, CoreResult};
use crate::events::{names, Event, EventSink, Stage};
use crate::evidence_index::EvidenceIndex;
use crate::extraction::{self, extractors::Extractor, ExtractedValue};
use crate::frontier::UrlFrontier;
use crate::identity::{IdentityGate, IdentityLockState, IdentitySignals, ProductTarget};
use crate::learning::{passes_commit_gate, CommitGateInput, LearningStores};
use crate::needset::{self, FieldState, NeedRow};
use crate::queue::{AutomationQueue, JobType};
use crate::retrieval;
use crate::round::{self, ConvergenceConfig, QueryLedger, RoundMetrics, RoundProgress, RoundSummary, RunSummary, Streaks};
use crate::telemetry;
use crate::types::{AmbiguityLevel, FieldKey, FieldStatus, IdentityMatchLevel, Tier, UnknownReason};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Constructs the extractor set for one round, given a borrow of the
/// evidence index that outlives the returned trait objects. A factory
/// rather than a stored `Vec<Box<dyn Extractor>>` because
/// `DeterministicNormalizerExtractor<'a>` borrows EI and `RunHandles` would
/// otherwise be self-referential.
pub type ExtractorFactory =
    Arc<dyn for<'a> Fn(&'a EvidenceIndex) -> Vec<Box<dyn Extractor + 'a>> + Send + Sync>;

pub fn default_extractor_factory() -> ExtractorFactory {
    Arc::new(|index: &EvidenceIndex| -> Vec<Box<dyn Extractor + '_>> {
        vec![
            Box::new(crate::extraction::extractors::DeterministicNormalizerExtractor { index }),
            Box::new(crate::extraction::extractors::NoopLlmExtractExtractor),
        ]
    })
}

/// Everything one run needs, built once by the CLI/API entry point and
/// owned by the [`Run`] it drives. Collaborators this crate cannot supply
/// on its own (search, LLM expansion/extraction, SERP reranking) default to
/// no-ops, same seam discipline as DP's and FS's trait objects elsewhere.
pub struct RunHandles {
    pub run_id: String,
    pub contract: CategoryContract,
    pub target: ProductTarget,
    pub index: EvidenceIndex,
    pub frontier: Arc<UrlFrontier>,
    pub queue: AutomationQueue,
    pub learning: LearningStores,
    pub scheduler: crate::fetch::FetchScheduler,
    pub identity_gate: IdentityGate,
    pub consensus_config: ConsensusConfig,
    pub convergence_config: ConvergenceConfig,
    pub host_strategy: HostStrategyTable,
    pub llm_expander: Arc<dyn LlmExpander>,
    pub serp_reranker: Arc<dyn SerpReranker>,
    pub search_provider: Arc<dyn SearchProvider>,
    pub extractor_factory: ExtractorFactory,
    pub events: Arc<dyn EventSink>,
    pub candidates_per_query: usize,
    pub fetches_per_query: usize,
    pub pause_gate: Option<Arc<PauseGate>>,
    /// Known-good URLs supplied by the caller (a product job's own
    /// `seed_urls`), dispatched directly in round 0 alongside `url_memory`
    /// hits, ahead of any search-derived query.
    pub seed_urls: Vec<String>,
}

impl RunHandles {
    pub fn new(
        run_id: impl Into<String>,
        contract: CategoryContract,
        target: ProductTarget,
        index: EvidenceIndex,
        frontier: Arc<UrlFrontier>,
        queue: AutomationQueue,
        learning: LearningStores,
        scheduler: crate::fetch::FetchScheduler,
        events: Arc<dyn EventSink>,
    ) -> Self {
        RunHandles {
            run_id: run_id.into(),
            contract,
            target,
            index,
            frontier,
            queue,
            learning,
            scheduler,
            identity_gate: IdentityGate::default(),
            consensus_config: ConsensusConfig::default(),
            convergence_config: ConvergenceConfig::default(),
            host_strategy: HostStrategyTable::default(),
            llm_expander: Arc::new(NoopLlmExpander),
            serp_reranker: Arc::new(NoopSerpReranker),
            search_provider: Arc::new(NoopSearchProvider),
            extractor_factory: default_extractor_factory(),
            events,
            candidates_per_query: 8,
            fetches_per_query: 3,
            pause_gate: None,
            seed_urls: Vec::new(),
        }
    }

    pub fn with_pause_gate(mut self, gate: Arc<PauseGate>) -> Self {
        self.pause_gate = Some(gate);
        self
    }

    pub fn with_seed_urls(mut self, seed_urls: Vec<String>) -> Self {
        self.seed_urls = seed_urls;
        self
    }
}

/// The one cooperative suspension point `pause_run`/`resume_run` (§6) can
/// reach: RC only ever blocks at round boundaries (§5), so this is checked
/// once per iteration of [`Run::run_to_convergence`]'s loop, never mid-round.
#[derive(Default)]
pub struct PauseGate {
    paused: std::sync::atomic::AtomicBool,
    notify: tokio::sync::Notify,
}

impl PauseGate {
    pub fn new() -> Self {
        PauseGate::default()
    }

    pub fn pause(&self) {
        self.paused.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, std::sync::atomic::Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(std::sync::atomic::Ordering::SeqCst)
    }

    async fn wait_if_paused(&self) {
        while self.is_paused() {
            self.notify.notified().await;
        }
    }
}

struct RoundOutcome {
    progress: RoundProgress,
    mean_confidence: f64,
    newly_identity_matched: usize,
    escalation_yielded_new_queries: bool,
    all_required_fields_complete: bool,
}

/// Owns the one piece of cross-round mutable state RC is allowed: field
/// states, identity lock, stop-condition streaks, and the all-time query
/// ledger (§4.1). Everything else is recomputed from EI/UF/AQ/LS each round.
pub struct Run {
    handles: RunHandles,
    field_states: HashMap<FieldKey, FieldState>,
    identity: IdentityLockState,
    streaks: Streaks,
    query_ledger: QueryLedger,
    seen_urls: HashSet<String>,
    cumulative_fetched_urls: u64,
    cumulative_llm_tokens: u64,
    round_summaries: Vec<RoundSummary>,
    prime_sources: HashMap<FieldKey, crate::retrieval::PrimeSourcePack>,
}

impl Run {
    pub fn new(handles: RunHandles) -> Self {
        let field_states = handles
            .contract
            .fields
            .iter()
            .map(|f| (f.key.clone(), FieldState::unknown()))
            .collect();
        Run {
            handles,
            field_states,
            identity: IdentityLockState::new(IdentityMatchLevel::Unlocked, 0.0, AmbiguityLevel::Easy, 1),
            streaks: Streaks::default(),
            query_ledger: QueryLedger::default(),
            seen_urls: HashSet::new(),
            cumulative_fetched_urls: 0,
            cumulative_llm_tokens: 0,
            round_summaries: Vec::new(),
            prime_sources: HashMap::new(),
        }
    }

    async fn publish(&self, stage: Stage, event: &'static str, payload: serde_json::Value) {
        self.handles
            .events
            .publish(Event::new(self.handles.run_id.clone(), stage, event, payload, Utc::now()))
            .await;
    }

    /// Drive the run to completion (§4.1). Returns the accumulated
    /// [`RunSummary`] once `round::step` reports a stop reason.
    pub async fn run_to_convergence(mut self) -> CoreResult<RunSummary> {
        self.publish(
            Stage::Round,
            names::RUN_STARTED,
            serde_json::json!({"identity_fingerprint": self.handles.target.identity_fingerprint}),
        )
        .await;

        let final_reason = loop {
            if let Some(gate) = self.handles.pause_gate.clone() {
                gate.wait_if_paused().await;
            }
            let round_index = self.round_summaries.len() as u32;
            self.publish(Stage::Round, names::CONVERGENCE_ROUND_STARTED, serde_json::json!({"round_index": round_index})).await;

            let outcome = self.execute_round(round_index).await?;

            let (next_streaks, stop) = round::step(
                self.streaks,
                round_index,
                &self.handles.convergence_config,
                RoundMetrics {
                    progress: &outcome.progress,
                    mean_confidence: outcome.mean_confidence,
                    identity_status: self.identity.status,
                    newly_identity_matched: outcome.newly_identity_matched,
                    escalation_yielded_new_queries: outcome.escalation_yielded_new_queries,
                    all_required_fields_complete: outcome.all_required_fields_complete,
                    cumulative_fetched_urls: self.cumulative_fetched_urls,
                    cumulative_llm_tokens: self.cumulative_llm_tokens,
                },
            );
            self.streaks = next_streaks;
            self.round_summaries.push(RoundSummary {
                round_index,
                progress: outcome.progress,
                stop_reason: stop,
            });
            telemetry::record_round_completed();
            self.publish(
                Stage::Round,
                names::CONVERGENCE_ROUND_COMPLETED,
                serde_json::json!({"round_index": round_index, "stop_reason": stop}),
            )
            .await;

            if let Some(reason) = stop {
                self.publish(Stage::Round, names::CONVERGENCE_STOP, serde_json::json!({"reason": reason})).await;
                break reason;
            }
        };

        let mut field_values = HashMap::new();
        let mut unknown_reasons = HashMap::new();
        for (key, state) in &self.field_states {
            if let Some(v) = &state.value {
                field_values.insert(key.clone(), v.clone());
            }
            if let Some(r) = state.unknown_reason {
                unknown_reasons.insert(key.clone(), r);
            }
        }

        self.publish(Stage::Round, names::RUN_COMPLETED, serde_json::json!({"stop_reason": final_reason})).await;

        Ok(RunSummary {
            rounds: self.round_summaries,
            final_stop_reason: Some(final_reason),
            field_values,
            unknown_reasons,
            prime_sources: self.prime_sources.clone(),
        })
    }

    async fn execute_round(&mut self, round_index: u32) -> CoreResult<RoundOutcome> {
        let default_half_life = self.handles.contract.policies.default_half_life_days;
        let confidence_floor = self.handles.contract.policies.low_quality_confidence.min(0.05).max(0.01);

        let needset: Vec<NeedRow> = self
            .handles
            .contract
            .fields
            .iter()
            .map(|f| needset::compute(f, &self.field_states[&f.key], &self.identity, default_half_life, confidence_floor))
            .collect();
        self.publish(Stage::Needset, names::NEEDSET_COMPUTED, serde_json::json!({"rows": needset.len()})).await;

        let learning_hints: Vec<String> = self
            .handles
            .learning
            .active_component_lexicon(&self.handles.target.identity_fingerprint, Utc::now())?
            .into_iter()
            .map(|(_term, canonical)| canonical)
            .collect();

        let profile = discovery::build_search_profile(&self.handles.target, &needset, &learning_hints);
        let mut admitted = self.query_ledger.admit(profile.queries);

        let llm_proposed = self.handles.llm_expander.expand(&self.handles.target, &needset).await;
        let llm_validated = discovery::validate_expansion(&self.handles.target, llm_proposed, 6);
        admitted.extend(self.query_ledger.admit(llm_validated));

        let escalation_yielded_new_queries = if round_index > 0 {
            let still_missing: Vec<FieldKey> = needset.iter().filter(|r| r.need_score > 0.0).map(|r| r.field_key.clone()).collect();
            let known_values: HashMap<FieldKey, String> = self
                .field_states
                .iter()
                .filter_map(|(k, v)| v.value.as_ref().map(|val| (k.clone(), val.to_string())))
                .collect();
            let escalated = discovery::escalate(&self.handles.target, &still_missing, &known_values);
            let new_escalated = self.query_ledger.admit(escalated);
            let yielded = !new_escalated.is_empty();
            admitted.extend(new_escalated);
            yielded
        } else {
            true
        };

        let identity_tokens = self.handles.target.identity_tokens();
        let mut newly_identity_matched = 0usize;
        let mut sources_identity_matched = 0usize;

        if round_index == 0 {
            let mut bootstrap_urls = self.handles.seed_urls.clone();
            bootstrap_urls.extend(
                self.handles
                    .learning
                    .active_url_memory(&self.handles.target.identity_fingerprint, Utc::now())?,
            );
            for url in bootstrap_urls {
                self.fetch_and_index_url(round_index, url, &mut newly_identity_matched, &mut sources_identity_matched).await?;
            }
        }

        for query in &admitted {
            let raw_candidates = self.handles.search_provider.search(&query.query).await;
            let scored = discovery::triage(
                raw_candidates,
                &self.handles.host_strategy,
                query.doc_hint,
                &identity_tokens,
                &self.seen_urls,
                self.handles.candidates_per_query,
            );
            let reranked = self.handles.serp_reranker.rerank(scored).await;

            for scored_candidate in reranked.into_iter().take(self.handles.fetches_per_query) {
                let url = scored_candidate.candidate.url;
                self.fetch_and_index_url(round_index, url, &mut newly_identity_matched, &mut sources_identity_matched).await?;
            }
        }

        let (fields_accepted_delta, confidence_delta) = self.resolve_fields(&needset, &identity_tokens).await?;

        let mean_confidence = if self.field_states.is_empty() {
            0.0
        } else {
            self.field_states.values().map(|s| s.confidence).sum::<f64>() / self.field_states.len() as f64
        };
        let all_required_fields_complete = self
            .handles
            .contract
            .fields
            .iter()
            .filter(|f| f.is_identity_critical())
            .all(|f| matches!(self.field_states[&f.key].status, FieldStatus::Accepted));

        let progress = RoundProgress {
            fields_accepted_delta,
            confidence_delta,
            needset_size: needset.iter().filter(|r| r.need_score > 0.0).count(),
            sources_identity_matched,
            all_time_queries_added: self.query_ledger.len(),
        };

        Ok(RoundOutcome {
            progress,
            mean_confidence,
            newly_identity_matched,
            escalation_yielded_new_queries,
            all_required_fields_complete,
        })
    }

    /// Fetch one URL through FS, index it through EI, and fold its identity
    /// reading into the run-wide lock state. Shared by the per-query SERP
    /// loop and the round-0 direct dispatch of `seed_urls`/`url_memory`
    /// hits, so both paths see the same dedupe-by-`seen_urls`, identity
    /// classification, and indexing behavior.
    async fn fetch_and_index_url(
        &mut self,
        round_index: u32,
        url: String,
        newly_identity_matched: &mut usize,
        sources_identity_matched: &mut usize,
    ) -> CoreResult<()> {
        if !self.seen_urls.insert(url.clone()) {
            return Ok(());
        }
        self.publish(Stage::Fetch, names::SOURCE_FETCH_STARTED, serde_json::json!({"url": url})).await;

        let fetch_result = self.handles.scheduler.fetch_with_ladder(crate::fetch::Lane::Fetch, &url).await?;
        let Some(fetch_result) = fetch_result else {
            self.publish(Stage::Fetch, names::SOURCE_FETCH_SKIPPED, serde_json::json!({"url": url})).await;
            return Ok(());
        };
        self.cumulative_fetched_urls += 1;

        if fetch_result.dead_url_cooldown_applied {
            self.emit_dead_url_repair(&url).await?;
        }

        let Some(body) = fetch_result.body else {
            self.publish(
                Stage::Fetch,
                names::SOURCE_FETCH_FAILED,
                serde_json::json!({"url": url, "status": fetch_result.status_code}),
            )
            .await;
            return Ok(());
        };

        let signals = IdentitySignals {
            title: extract_title(&body),
            url: fetch_result.final_url.clone(),
            dom_context: strip_tags(&body),
        };
        let (level, certainty) = self.handles.identity_gate.classify_source(&self.handles.target, &signals, None);
        let previous_status = self.identity.status;
        self.update_identity(level, certainty);
        if previous_status != IdentityMatchLevel::Locked
            && matches!(self.identity.status, IdentityMatchLevel::Locked | IdentityMatchLevel::Provisional)
        {
            *newly_identity_matched += 1;
        }
        if matches!(level, IdentityMatchLevel::Locked | IdentityMatchLevel::Provisional) {
            *sources_identity_matched += 1;
        }

        let host = crate::frontier::host_of(&url);
        let strategy = self.handles.host_strategy.known_hosts.get(&host);
        let tier = strategy.and_then(|s| s.tier).unwrap_or(Tier::RETAIL);
        let doc_kind = strategy.and_then(|s| s.doc_kind_bias).unwrap_or(crate::types::DocKind::Other);

        let source = crate::evidence_index::Source {
            source_id: blake3::hash(format!("{url}\u{1}{round_index}").as_bytes()).to_hex().to_string(),
            url: url.clone(),
            final_url: fetch_result.final_url,
            host: host.clone(),
            root_domain: host,
            tier,
            doc_kind,
            content_type: "text/html".to_string(),
            content_hash: crate::evidence_index::compute_content_hash(body.as_bytes()),
            bytes: body.len() as u64,
            fetched_at: Utc::now(),
            fetch_mode: fetch_result.fetch_mode,
            status_code: fetch_result.status_code,
            identity_match_level: level,
            target_match_score: certainty,
            page_product_cluster_id: None,
        };
        let index_outcome = self.handles.index.index_source(&source, "parser_v1", "chunker_v1", &body)?;
        telemetry::record_source_fetched(matches!(index_outcome, crate::evidence_index::IndexOutcome::DedupeHit { .. }));
        self.publish(
            Stage::Index,
            names::SOURCE_PROCESSED,
            serde_json::json!({"url": url, "identity_level": level}),
        )
        .await;
        self.publish(
            Stage::Index,
            names::EVIDENCE_INDEX_RESULT,
            serde_json::json!({"url": url, "outcome": format!("{index_outcome:?}")}),
        )
        .await;
        Ok(())
    }

    /// A dead seed URL needs a replacement, not a retry: enqueue a
    /// deduped-by-domain repair job and surface the cooldown/repair events
    /// the same way CE's conflict path does (§4.6's boundary with AQ).
    async fn emit_dead_url_repair(&mut self, url: &str) -> CoreResult<()> {
        let host = crate::frontier::host_of(url);
        self.publish(Stage::Fetch, names::URL_COOLDOWN_APPLIED, serde_json::json!({"url": url})).await;
        let reason = self
            .handles
            .queue
            .enqueue(
                JobType::RepairSearch,
                &format!("domain:{host}"),
                &self.handles.target.identity_fingerprint,
                serde_json::json!({"dead_url": url, "host": host}),
                5,
                Utc::now(),
            )
            .map_err(|e| CoreError::Fatal(e.to_string()))?;
        if reason.is_some() {
            telemetry::record_repair_job_enqueued();
            self.publish(Stage::Automation, names::REPAIR_QUERY_ENQUEUED, serde_json::json!({"host": host})).await;
        }
        Ok(())
    }

    /// Merge a newly classified source's identity level into the run-wide
    /// lock state. A `locked` reading always wins; a `conflict` reading
    /// downgrades anything short of an existing `locked`; otherwise the run
    /// only moves up the `unlocked -> provisional` ladder, never back down
    /// on the strength of one weak page (open question, see DESIGN.md).
    fn update_identity(&mut self, level: IdentityMatchLevel, certainty: f64) {
        match level {
            IdentityMatchLevel::Locked => {
                self.identity = IdentityLockState::new(level, certainty, self.identity.ambiguity_level, self.identity.family_model_count);
            }
            IdentityMatchLevel::Conflict if self.identity.status != IdentityMatchLevel::Locked => {
                self.identity = IdentityLockState::new(level, certainty, AmbiguityLevel::Hard, self.identity.family_model_count + 1);
            }
            IdentityMatchLevel::Provisional if self.identity.status == IdentityMatchLevel::Unlocked => {
                self.identity = IdentityLockState::new(level, certainty, self.identity.ambiguity_level, self.identity.family_model_count);
            }
            _ => {}
        }
    }

    /// TR -> EC -> CE for every field with positive need this round.
    /// Returns `(fields_accepted_delta, mean confidence_delta)`.
    async fn resolve_fields(&mut self, needset: &[NeedRow], identity_tokens: &[String]) -> CoreResult<(i64, f64)> {
        let mut fields_accepted_delta = 0i64;
        let mut confidence_sum = 0.0;
        let mut confidence_count = 0usize;

        let deficit_fields: Vec<_> = self
            .handles
            .contract
            .fields
            .iter()
            .filter(|f| needset.iter().any(|r| r.field_key == f.key && r.need_score > 0.0))
            .cloned()
            .collect();

        for field in &deficit_fields {
            let mut anchors = field.search_hints.clone();
            anchors.extend(self.handles.learning.active_field_anchors(&self.handles.contract.category, &field.key, Utc::now())?);

            let pack = retrieval::build_prime_sources(
                &self.handles.index,
                field,
                &anchors,
                identity_tokens,
                field.is_identity_critical(),
                &self.handles.learning,
            )?;
            self.publish(
                Stage::Extract,
                names::PRIME_SOURCES_BUILT,
                serde_json::json!({"field": field.key, "accepted": pack.accepted.len(), "miss_reasons": pack.miss_reasons}),
            )
            .await;
            self.prime_sources.insert(field.key.clone(), pack.clone());

            let ctx = extraction::build_context(&self.handles.index, field, &pack, "kv_generic", Vec::new())?;

            let extractors = (self.handles.extractor_factory)(&self.handles.index);
            let mut outputs = Vec::new();
            for extractor in &extractors {
                outputs.extend(extractor.extract(&ctx, identity_tokens).await);
            }
            let (validated, rejected_count) = extraction::validate_schema(&self.handles.index, outputs)?;
            self.publish(
                Stage::Extract,
                names::EXTRACTION_BATCH_COMPLETED,
                serde_json::json!({"field": field.key, "accepted": validated.len(), "rejected": rejected_count}),
            )
            .await;

            if validated.is_empty() {
                continue;
            }

            let mut grouped: HashMap<String, Candidate> = HashMap::new();
            let mut evidence_hosts: HashMap<String, String> = HashMap::new();
            let mut source_url_by_snippet: HashMap<String, String> = HashMap::new();
            for output in validated {
                let value = match output.value {
                    ExtractedValue::Value(v) => v,
                    ExtractedValue::Unknown { .. } => continue,
                };
                let Some(snippet_id) = output.snippet_ids.first() else { continue };
                let Some(chunk) = self.handles.index.resolve_snippet(snippet_id)? else { continue };
                let Some(source) = self.handles.index.source_for_doc(&chunk.doc_id)? else { continue };
                let identity_status = evidence_identity_status(source.identity_match_level, output.target_match_passed);
                evidence_hosts.insert(source.source_id.clone(), source.root_domain.clone());
                source_url_by_snippet.insert(snippet_id.clone(), source.url.clone());
                grouped
                    .entry(value.to_string())
                    .or_insert_with(|| Candidate { value: value.clone(), evidence: Vec::new() })
                    .evidence
                    .push(consensus::EvidenceUnit {
                        snippet_id: snippet_id.clone(),
                        source_id: source.source_id,
                        method: output.method,
                        tier: source.tier,
                        identity_status,
                        target_match_passed: output.target_match_passed,
                    });
            }
            if grouped.is_empty() {
                continue;
            }

            let tier_lookup: HashMap<String, (usize, Option<Tier>)> = grouped
                .values()
                .map(|c| (c.value.to_string(), (c.distinct_sources(), c.best_tier())))
                .collect();
            let evidence_value_by_source: Vec<(String, String)> = grouped
                .values()
                .flat_map(|c| c.evidence.iter().map(move |e| (e.source_id.clone(), c.value.to_string())))
                .collect();
            let candidates: Vec<Candidate> = grouped.into_values().collect();

            let previous_status = self.field_states[&field.key].status;
            let previous_confidence = self.field_states[&field.key].confidence;

            let outcome = consensus::resolve_field(candidates, field, &self.identity, &self.handles.consensus_config);

            let new_state = match &outcome {
                ConsensusOutcome::Accepted { value, confidence, refs, .. } => {
                    let (distinct, best_tier) = tier_lookup.get(&value.to_string()).copied().unwrap_or((refs.len(), None));
                    telemetry::record_field_outcome(true, false);
                    for (source_id, candidate_value) in &evidence_value_by_source {
                        if let Some(host) = evidence_hosts.get(source_id) {
                            let hit = candidate_value == &value.to_string();
                            self.handles.learning.record_domain_field_outcome(host, &field.key, hit, Utc::now())?;
                        }
                    }
                    FieldState {
                        status: FieldStatus::Accepted,
                        value: Some(value.clone()),
                        confidence: *confidence,
                        refs: refs.clone(),
                        refs_from_distinct_sources: distinct,
                        best_tier_seen: best_tier,
                        unknown_reason: None,
                        age_days: 0.0,
                    }
                }
                ConsensusOutcome::Candidate { best_value, confidence } => {
                    let (distinct, best_tier) = tier_lookup.get(&best_value.to_string()).copied().unwrap_or((0, None));
                    FieldState {
                        status: FieldStatus::Candidate,
                        value: Some(best_value.clone()),
                        confidence: *confidence,
                        refs: Vec::new(),
                        refs_from_distinct_sources: distinct,
                        best_tier_seen: best_tier,
                        unknown_reason: None,
                        age_days: 0.0,
                    }
                }
                ConsensusOutcome::Conflict { candidates } => {
                    telemetry::record_field_outcome(false, true);
                    let reason = self
                        .handles
                        .queue
                        .enqueue(
                            JobType::RepairSearch,
                            &field.key,
                            &self.handles.target.identity_fingerprint,
                            serde_json::json!({"field": field.key, "candidates": candidates}),
                            5,
                            Utc::now(),
                        )
                        .map_err(|e| CoreError::Fatal(e.to_string()))?;
                    if reason.is_some() {
                        telemetry::record_repair_job_enqueued();
                        self.publish(Stage::Automation, names::REPAIR_QUERY_ENQUEUED, serde_json::json!({"field": field.key})).await;
                    }
                    FieldState {
                        status: FieldStatus::Conflict,
                        value: None,
                        confidence: 0.0,
                        refs: Vec::new(),
                        refs_from_distinct_sources: 0,
                        best_tier_seen: None,
                        unknown_reason: Some(UnknownReason::Conflict),
                        age_days: 0.0,
                    }
                }
                ConsensusOutcome::Abort { reason } => FieldState {
                    status: FieldStatus::Unknown,
                    value: None,
                    confidence: 0.0,
                    refs: Vec::new(),
                    refs_from_distinct_sources: 0,
                    best_tier_seen: None,
                    unknown_reason: Some(*reason),
                    age_days: 0.0,
                },
            };

            if matches!(new_state.status, FieldStatus::Accepted) && !matches!(previous_status, FieldStatus::Accepted) {
                fields_accepted_delta += 1;
            }
            confidence_sum += new_state.confidence - previous_confidence;
            confidence_count += 1;

            if matches!(new_state.status, FieldStatus::Accepted) {
                let gate_input = CommitGateInput {
                    status_accepted: true,
                    confidence: new_state.confidence,
                    refs: new_state.refs_from_distinct_sources,
                    tier_preference_met: true,
                };
                if passes_commit_gate(gate_input, field, self.handles.contract.policies.margin_threshold.max(0.5)) {
                    if let Some(anchor) = field.search_hints.first() {
                        self.handles.learning.commit_field_anchor(&self.handles.contract.category, &field.key, anchor, Utc::now())?;
                    }
                    if let Some(value) = &new_state.value {
                        self.handles.learning.commit_component_lexicon(
                            &self.handles.target.identity_fingerprint,
                            &field.key,
                            &format!("{} {value}", field.key),
                            Utc::now(),
                        )?;
                    }
                    for snippet_id in &new_state.refs {
                        if let Some(url) = source_url_by_snippet.get(snippet_id) {
                            self.handles.learning.commit_url_memory(&self.handles.target.identity_fingerprint, url, None, Utc::now())?;
                        }
                    }
                }
            }

            self.field_states.insert(field.key.clone(), new_state);
        }

        let avg_delta = if confidence_count > 0 { confidence_sum / confidence_count as f64 } else { 0.0 };
        Ok((fields_accepted_delta, avg_delta))
    }
}

fn evidence_identity_status(level: IdentityMatchLevel, target_match_passed: bool) -> consensus::EvidenceIdentityStatus {
    if !target_match_passed {
        return consensus::EvidenceIdentityStatus::Failed;
    }
    match level {
        IdentityMatchLevel::Locked => consensus::EvidenceIdentityStatus::Locked,
        IdentityMatchLevel::Provisional => consensus::EvidenceIdentityStatus::Provisional,
        IdentityMatchLevel::Unlocked => consensus::EvidenceIdentityStatus::Unlocked,
        IdentityMatchLevel::Conflict => consensus::EvidenceIdentityStatus::Conflict,
    }
}

fn extract_title(html: &str) -> String {
    regex::Regex::new(r"(?is)<title[^>]*>(.*?)</title>")
        .ok()
        .and_then(|re| re.captures(html))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default()
}

fn strip_tags(html: &str) -> String {
    match regex::Regex::new(r"<[^>]+>") {
        Ok(re) => re.replace_all(html, " ").to_string(),
        Err(_) => html.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_extraction_is_case_insensitive_and_trims() {
        let html = "<html><HEAD><Title>  Razer Viper V3 Pro  </Title></HEAD></html>";
        assert_eq!(extract_title(html), "Razer Viper V3 Pro");
    }

    #[test]
    fn strip_tags_removes_markup_but_keeps_text() {
        let html = "<p>Sensor: <b>Focus Pro 35K</b></p>";
        assert!(strip_tags(html).contains("Focus Pro 35K"));
        assert!(!strip_tags(html).contains('<'));
    }

    #[tokio::test]
    async fn pause_gate_blocks_until_resumed() {
        let gate = Arc::new(PauseGate::new());
        gate.pause();
        assert!(gate.is_paused());
        let waiting_gate = gate.clone();
        let waiter = tokio::spawn(async move { waiting_gate.wait_if_paused().await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        gate.resume();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn run_with_no_search_provider_stops_on_identity_gate_stuck() {
        use crate::contract::{CategoryPolicies, EvidencePolicy, FieldContract, ValueType};
        use crate::types::{DocHint, RequiredLevel};

        let contract = CategoryContract {
            category: "mouse".into(),
            fields: vec![FieldContract {
                key: "polling_rate".into(),
                required_level: RequiredLevel::Critical,
                value_type: ValueType::Number,
                unit: Some("hz".into()),
                enum_values: None,
                evidence_policy: EvidencePolicy { min_refs: 1, preferred_tier: None },
                tier_preference: vec![],
                search_hints: vec!["polling rate".into()],
                preferred_content_types: vec![DocHint::SpecPdf],
                half_life_days: None,
                publish_gated: false,
            }],
            key_migrations: Default::default(),
            policies: CategoryPolicies { default_half_life_days: 180.0, low_quality_confidence: 0.3, margin_threshold: 0.05 },
        };
        let target = ProductTarget::new("mouse", "Razer", "Viper V3 Pro", None, None, vec![]);
        let frontier = Arc::new(UrlFrontier::open_in_memory().unwrap());
        let scheduler = crate::fetch::FetchScheduler::new(
            frontier.clone(),
            vec![],
            HashMap::from([(crate::fetch::Lane::Fetch, crate::fetch::LaneConfig::default())]),
        );
        let handles = RunHandles::new(
            "run1",
            contract,
            target,
            EvidenceIndex::open_in_memory().unwrap(),
            frontier,
            AutomationQueue::open_in_memory().unwrap(),
            LearningStores::open_in_memory().unwrap(),
            scheduler,
            Arc::new(crate::events::MemorySink::default()),
        );
        let run = Run::new(handles);
        let summary = run.run_to_convergence().await.unwrap();
        // n_identity_fast_fail defaults to 1: with no sources ever fetched,
        // identity never leaves `Unlocked`, so the very first round trips
        // the identity-stuck stop before no-progress/low-quality streaks
        // (which need several rounds) get a chance to fire.
        assert_eq!(summary.final_stop_reason, Some(crate::types::ConvergenceStopReason::IdentityGateStuck));
        assert_eq!(summary.rounds.len(), 1);
    }
}
