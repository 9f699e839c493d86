//! Pipeline orchestration
//!
//! Retrieval, rules, reranking and diversity selection run one after the other for each
//! request. Retrieval errors and invalid requests are fatal. Reranking and diversity are
//! optional: they are skipped when disabled, when the deadline leaves no time for them, or
//! when their backend is unavailable, and the run continues with the candidates it has.
use crate::candidate::Candidate;
use crate::config::{ConfigStore, PipelineConfig};
use crate::mmr::{self, MmrConfig};
use crate::rerank::{self, RerankConfig};
use crate::rules::{self, BusinessRule, Removal};
use crate::RankingError;
use search_ranking_backend::{
    BackendError, Metric, ModelFamily, Query, RerankBackend, Retrieval, RetrievalRequest,
    RetrievedItem,
};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::Instant;
use tracing::{instrument, Span};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalParams {
    /// Number of candidates to retrieve, never less than the request `top_k`
    pub candidate_pool: Option<usize>,
    /// Backend specific pre-filter
    pub filter: Option<String>,
    pub metric: Option<Metric>,
    pub push_down_filters: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: Query,
    pub top_k: usize,
    #[serde(default)]
    pub retrieval: RetrievalParams,
    /// Ids of the configured rules to apply, in evaluation order. All rules when `None`.
    #[serde(default)]
    pub rule_ids: Option<Vec<String>>,
    /// Overrides the configured rerank settings
    #[serde(default)]
    pub rerank: Option<RerankConfig>,
    /// Overrides the configured diversity settings
    #[serde(default)]
    pub mmr: Option<MmrConfig>,
}

impl SearchRequest {
    pub fn new(query: Query, top_k: usize) -> Self {
        Self {
            query,
            top_k,
            retrieval: RetrievalParams::default(),
            rule_ids: None,
            rerank: None,
            mmr: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Disabled,
    DeadlineExceeded,
    Unavailable,
    NoCandidates,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Disabled => "disabled",
            SkipReason::DeadlineExceeded => "deadline_exceeded",
            SkipReason::Unavailable => "unavailable",
            SkipReason::NoCandidates => "no_candidates",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Executed,
    /// Ran, but part of its work failed and kept the previous scores
    Degraded,
    Skipped(SkipReason),
}

impl StageStatus {
    pub fn ran(&self) -> bool {
        matches!(self, StageStatus::Executed | StageStatus::Degraded)
    }
}

/// Per stage wall clock time in milliseconds. Stages that did not run report 0.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageTimings {
    pub retrieval_ms: f64,
    pub rules_ms: f64,
    pub rerank_ms: f64,
    pub mmr_ms: f64,
    pub total_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Pending,
    Retrieved,
    RulesApplied,
    Reranked,
    RerankSkipped,
    Diversified,
    DiversitySkipped,
    Done,
}

impl PipelineState {
    fn step(&self) -> u8 {
        match self {
            PipelineState::Pending => 0,
            PipelineState::Retrieved => 1,
            PipelineState::RulesApplied => 2,
            PipelineState::Reranked | PipelineState::RerankSkipped => 3,
            PipelineState::Diversified | PipelineState::DiversitySkipped => 4,
            PipelineState::Done => 5,
        }
    }
}

/// Forward only record of the states a run went through
#[derive(Debug, Clone)]
struct Trace(Vec<PipelineState>);

impl Trace {
    fn new() -> Self {
        Self(vec![PipelineState::Pending])
    }

    fn advance(&mut self, next: PipelineState) {
        debug_assert!(self.0.last().map_or(true, |last| last.step() < next.step()));
        self.0.push(next);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub candidates: Vec<Candidate>,
    pub timings: StageTimings,
    /// Rules that matched at least one candidate
    pub matched_rules: Vec<String>,
    /// Candidates removed by filter or requirement rules
    pub removed: Vec<Removal>,
    pub rules_applied: bool,
    pub rerank: StageStatus,
    pub rerank_failed_batches: usize,
    pub mmr: StageStatus,
    pub config_version: u64,
    pub trace: Vec<PipelineState>,
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    retrieval: Retrieval,
    reranker: Option<RerankBackend>,
    config: Arc<ConfigStore>,
    /// Request limit
    limit_concurrent_requests: Arc<Semaphore>,
}

impl Pipeline {
    pub fn new(
        retrieval: Retrieval,
        reranker: Option<RerankBackend>,
        config: Arc<ConfigStore>,
        max_concurrent_requests: usize,
    ) -> Self {
        Self {
            retrieval,
            reranker,
            config,
            limit_concurrent_requests: Arc::new(Semaphore::new(max_concurrent_requests)),
        }
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    pub fn reranker(&self) -> Option<&RerankBackend> {
        self.reranker.as_ref()
    }

    #[instrument(skip(self))]
    pub async fn health(&self) -> Result<(), BackendError> {
        self.retrieval.health().await?;
        if let Some(reranker) = &self.reranker {
            reranker.health().await?;
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn try_acquire_permit(&self) -> Result<OwnedSemaphorePermit, RankingError> {
        // Limit concurrent requests by acquiring a permit from the semaphore
        self.limit_concurrent_requests
            .clone()
            .try_acquire_owned()
            .map_err(|err| {
                metrics::counter!("sr_request_failure", "err" => "overloaded").increment(1);
                tracing::error!("{err}");
                RankingError::from(err)
            })
    }

    #[instrument(skip(self))]
    pub async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit, RankingError> {
        self.limit_concurrent_requests
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RankingError::Overloaded(TryAcquireError::Closed))
    }

    /// Run `request` against the current configuration snapshot
    #[instrument(skip_all, fields(top_k = request.top_k))]
    pub async fn run(
        &self,
        request: SearchRequest,
        deadline: Instant,
        _permit: OwnedSemaphorePermit,
    ) -> Result<PipelineResult, RankingError> {
        let config = self.config.snapshot();
        self.run_with(request, &config, deadline).await
    }

    /// Run `request` against an explicit configuration snapshot
    #[instrument(
        skip_all,
        fields(top_k = request.top_k, config_version = config.version, retrieved, returned)
    )]
    pub async fn run_with(
        &self,
        request: SearchRequest,
        config: &PipelineConfig,
        deadline: Instant,
    ) -> Result<PipelineResult, RankingError> {
        let start = std::time::Instant::now();
        metrics::counter!("sr_request_count").increment(1);

        let result = self.execute(request, config, deadline).await;
        match &result {
            Ok(result) => {
                metrics::counter!("sr_request_success").increment(1);
                metrics::histogram!("sr_request_duration").record(start.elapsed().as_secs_f64());
                Span::current().record("returned", result.candidates.len());
                tracing::info!("Success");
            }
            Err(err) => {
                metrics::counter!("sr_request_failure", "err" => err.kind()).increment(1);
                tracing::error!("{err}");
            }
        }
        result
    }

    async fn execute(
        &self,
        request: SearchRequest,
        config: &PipelineConfig,
        deadline: Instant,
    ) -> Result<PipelineResult, RankingError> {
        let start = std::time::Instant::now();
        let mut trace = Trace::new();
        let mut timings = StageTimings::default();

        // Everything that can make the run fatal is checked before any I/O
        validate_query(&request.query)?;
        let active_rules = select_rules(config, request.rule_ids.as_deref())?;
        let rerank_config = request.rerank.as_ref().unwrap_or(&config.rerank);
        rerank_config.validate()?;
        let mmr_config = request.mmr.as_ref().or(config.mmr.as_ref());
        if let Some(mmr_config) = mmr_config {
            mmr_config.validate()?;
        }

        // Retrieval
        let metric = request.retrieval.metric.unwrap_or(config.metric);
        let push_down = request
            .retrieval
            .push_down_filters
            .unwrap_or(config.push_down_filters);
        let pushed_down = if push_down {
            rules::filter_expression(&active_rules)
        } else {
            None
        };
        let retrieval_request = RetrievalRequest {
            query: request.query.clone(),
            top_k: request
                .retrieval
                .candidate_pool
                .unwrap_or(config.candidate_pool)
                .max(request.top_k),
            filter: combine_filters(request.retrieval.filter.clone(), pushed_down),
            metric,
        };
        let (items, retrieval_duration) = self
            .retrieval
            .search(retrieval_request, deadline)
            .await?;
        let mut candidates = to_candidates(items, metric)?;

        timings.retrieval_ms = millis(retrieval_duration);
        metrics::histogram!("sr_retrieval_duration").record(retrieval_duration.as_secs_f64());
        metrics::histogram!("sr_candidates_retrieved").record(candidates.len() as f64);
        Span::current().record("retrieved", candidates.len());
        trace.advance(PipelineState::Retrieved);

        // Business rules
        let mut matched_rules = Vec::new();
        let mut removed = Vec::new();
        let rules_applied = !active_rules.is_empty() && !candidates.is_empty();
        if rules_applied {
            let stage_start = std::time::Instant::now();
            let application = rules::apply(candidates, &active_rules);
            let elapsed = stage_start.elapsed();

            for rule in active_rules.iter() {
                if !application.matched_rules.contains(&rule.rule_id) {
                    tracing::info!("Rule `{}` matched no candidate", rule.rule_id);
                }
            }
            metrics::histogram!("sr_rules_duration").record(elapsed.as_secs_f64());
            metrics::counter!("sr_candidates_removed").increment(application.removed.len() as u64);

            timings.rules_ms = millis(elapsed);
            candidates = application.candidates;
            matched_rules = application.matched_rules;
            removed = application.removed;
        }
        trace.advance(PipelineState::RulesApplied);

        // Reranking
        let mut rerank_failed_batches = 0;
        let rerank_status = match (rerank_config.model_family, &self.reranker) {
            (ModelFamily::None, _) => StageStatus::Skipped(SkipReason::Disabled),
            _ if rerank_config.top_k == 0 => StageStatus::Skipped(SkipReason::Disabled),
            _ if candidates.is_empty() => StageStatus::Skipped(SkipReason::NoCandidates),
            (_, None) => StageStatus::Skipped(SkipReason::Unavailable),
            (_, Some(backend)) => match stage_deadline(deadline, config.budgets.rerank_ms) {
                None => StageStatus::Skipped(SkipReason::DeadlineExceeded),
                Some(stage_end) => {
                    let stage_start = std::time::Instant::now();
                    let outcome = rerank::rerank(
                        candidates,
                        &request.query,
                        rerank_config,
                        backend,
                        stage_end,
                    )
                    .await;
                    let elapsed = stage_start.elapsed();
                    metrics::histogram!("sr_rerank_duration").record(elapsed.as_secs_f64());
                    timings.rerank_ms = millis(elapsed);

                    rerank_failed_batches = outcome.failed_batches;
                    let status = if outcome.unavailable.is_some() {
                        StageStatus::Skipped(SkipReason::Unavailable)
                    } else if outcome.all_failed() {
                        if outcome.timed_out_batches == outcome.batches {
                            StageStatus::Skipped(SkipReason::DeadlineExceeded)
                        } else {
                            StageStatus::Skipped(SkipReason::Unavailable)
                        }
                    } else if outcome.failed_batches > 0 {
                        StageStatus::Degraded
                    } else {
                        StageStatus::Executed
                    };
                    candidates = outcome.candidates;
                    status
                }
            },
        };
        record_status("rerank", rerank_status);
        trace.advance(if rerank_status.ran() {
            PipelineState::Reranked
        } else {
            PipelineState::RerankSkipped
        });

        // Diversity
        let mmr_status = match mmr_config {
            None => StageStatus::Skipped(SkipReason::Disabled),
            Some(_) if candidates.is_empty() => StageStatus::Skipped(SkipReason::NoCandidates),
            Some(mmr_config) => match stage_deadline(deadline, config.budgets.mmr_ms) {
                None => StageStatus::Skipped(SkipReason::DeadlineExceeded),
                Some(_) => {
                    let stage_start = std::time::Instant::now();
                    candidates = mmr::select(candidates, mmr_config);
                    let elapsed = stage_start.elapsed();
                    metrics::histogram!("sr_mmr_duration").record(elapsed.as_secs_f64());
                    timings.mmr_ms = millis(elapsed);
                    StageStatus::Executed
                }
            },
        };
        record_status("mmr", mmr_status);
        trace.advance(if mmr_status.ran() {
            PipelineState::Diversified
        } else {
            PipelineState::DiversitySkipped
        });

        let limit = match (mmr_status.ran(), mmr_config) {
            (true, Some(mmr_config)) => mmr_config.max_results,
            _ => request.top_k,
        };
        candidates.truncate(limit);

        timings.total_ms = millis(start.elapsed());
        trace.advance(PipelineState::Done);

        Ok(PipelineResult {
            candidates,
            timings,
            matched_rules,
            removed,
            rules_applied,
            rerank: rerank_status,
            rerank_failed_batches,
            mmr: mmr_status,
            config_version: config.version,
            trace: trace.0,
        })
    }
}

fn validate_query(query: &Query) -> Result<(), RankingError> {
    match (&query.text, &query.embedding) {
        (None, None) => Err(RankingError::Validation(
            "`query` needs a text or an embedding".to_string(),
        )),
        (_, Some(embedding)) if embedding.is_empty() => Err(RankingError::Validation(
            "`query.embedding` cannot be empty".to_string(),
        )),
        (_, Some(embedding)) if embedding.iter().any(|v| !v.is_finite()) => {
            Err(RankingError::Validation(
                "`query.embedding` must only contain finite values".to_string(),
            ))
        }
        _ => Ok(()),
    }
}

fn select_rules<'a>(
    config: &'a PipelineConfig,
    rule_ids: Option<&[String]>,
) -> Result<Cow<'a, [BusinessRule]>, RankingError> {
    let Some(rule_ids) = rule_ids else {
        return Ok(Cow::Borrowed(&config.rules));
    };
    rule_ids
        .iter()
        .map(|id| {
            config
                .rule(id)
                .cloned()
                .ok_or_else(|| RankingError::Validation(format!("unknown rule id `{id}`")))
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Cow::Owned)
}

fn to_candidates(
    items: Vec<RetrievedItem>,
    metric: Metric,
) -> Result<Vec<Candidate>, RankingError> {
    let mut seen = HashSet::with_capacity(items.len());
    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| {
            if !seen.insert(item.id.clone()) {
                return Err(RankingError::MalformedResponse(format!(
                    "duplicate id `{}`",
                    item.id
                )));
            }
            Candidate::from_retrieved(item, i + 1, metric)
        })
        .collect()
}

fn combine_filters(caller: Option<String>, rules: Option<String>) -> Option<String> {
    match (caller, rules) {
        (Some(caller), Some(rules)) => Some(format!("({caller}) and ({rules})")),
        (caller, rules) => caller.or(rules),
    }
}

/// Deadline for an optional stage, `None` when no time is left for it
fn stage_deadline(deadline: Instant, budget_ms: Option<u64>) -> Option<Instant> {
    let now = Instant::now();
    if now >= deadline {
        return None;
    }
    match budget_ms {
        Some(0) => None,
        Some(ms) => Some(deadline.min(now + Duration::from_millis(ms))),
        None => Some(deadline),
    }
}

fn record_status(stage: &'static str, status: StageStatus) {
    match status {
        StageStatus::Skipped(reason) => {
            metrics::counter!("sr_stage_skipped", "stage" => stage, "reason" => reason.as_str())
                .increment(1);
            tracing::debug!("Stage {stage} skipped: {}", reason.as_str());
        }
        StageStatus::Degraded => {
            metrics::counter!("sr_stage_degraded", "stage" => stage).increment(1);
            tracing::warn!("Stage {stage} degraded");
        }
        StageStatus::Executed => {}
    }
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}
