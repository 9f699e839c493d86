use crate::candidate::Candidate;
use crate::math::cosine_similarity;
use crate::RankingError;
use futures::future::join_all;
use search_ranking_backend::{
    BackendError, ComputeTarget, ModelFamily, PairBatch, Query, RerankBackend,
};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::instrument;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RerankConfig {
    pub model_family: ModelFamily,
    /// Number of leading candidates sent to the model
    pub top_k: usize,
    pub batch_size: usize,
    pub compute_target: ComputeTarget,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            model_family: ModelFamily::CrossEncoder,
            top_k: 100,
            batch_size: 32,
            compute_target: ComputeTarget::Cpu,
        }
    }
}

impl RerankConfig {
    pub fn disabled() -> Self {
        Self {
            model_family: ModelFamily::None,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), RankingError> {
        if self.batch_size == 0 {
            return Err(RankingError::Config(
                "rerank `batch_size` must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct RerankOutcome {
    pub candidates: Vec<Candidate>,
    pub batches: usize,
    pub failed_batches: usize,
    pub timed_out_batches: usize,
    /// Set when the stage could not score anything at all
    pub unavailable: Option<String>,
}

impl RerankOutcome {
    fn unavailable(candidates: Vec<Candidate>, reason: String) -> Self {
        Self {
            candidates,
            unavailable: Some(reason),
            ..Default::default()
        }
    }

    pub fn all_failed(&self) -> bool {
        self.batches > 0 && self.failed_batches == self.batches
    }
}

/// Rescore the leading `config.top_k` candidates with the rerank model.
///
/// Candidates past `top_k` keep their scores and follow the reranked prefix.
/// A failed batch keeps its previous scores and is flagged `rerank_failed`.
#[instrument(
    skip_all,
    fields(family = %config.model_family, top_k = config.top_k, candidates = candidates.len())
)]
pub async fn rerank(
    mut candidates: Vec<Candidate>,
    query: &Query,
    config: &RerankConfig,
    backend: &RerankBackend,
    deadline: Instant,
) -> RerankOutcome {
    if config.model_family == ModelFamily::None || config.top_k == 0 || candidates.is_empty() {
        return RerankOutcome {
            candidates,
            ..Default::default()
        };
    }
    if !backend.supports(config.model_family) {
        return RerankOutcome::unavailable(
            candidates,
            format!("rerank model does not support {}", config.model_family),
        );
    }

    let tail = candidates.split_off(config.top_k.min(candidates.len()));
    let mut head = candidates;

    let batch_size = backend
        .max_batch_size
        .map_or(config.batch_size, |max| max.min(config.batch_size))
        .max(1);
    let documents: Vec<String> = head.iter().map(Candidate::document).collect();

    let results = match score_batches(
        &documents,
        batch_size,
        query,
        config.model_family,
        backend,
        deadline,
    )
    .await
    {
        Ok(results) => results,
        Err(reason) => {
            tracing::warn!("Reranking unavailable: {reason}");
            head.extend(tail);
            return RerankOutcome::unavailable(head, reason);
        }
    };

    let batches = results.len();
    let mut failed_batches = 0;
    let mut timed_out_batches = 0;

    for (chunk, (result, candidates)) in results
        .into_iter()
        .zip(head.chunks_mut(batch_size))
        .enumerate()
    {
        metrics::histogram!("sr_rerank_batch_size").record(candidates.len() as f64);
        match result.and_then(check_finite) {
            Ok(scores) => {
                for (candidate, score) in candidates.iter_mut().zip(scores) {
                    candidate.score = score;
                    candidate.annotations.rerank_score = Some(score);
                }
            }
            Err(err) => {
                failed_batches += 1;
                if err == BackendError::Timeout {
                    timed_out_batches += 1;
                }
                metrics::counter!("sr_rerank_batch_failure").increment(1);
                tracing::warn!("Rerank batch {chunk} failed: {err}");
                for candidate in candidates.iter_mut() {
                    candidate.annotations.rerank_failed = true;
                }
            }
        }
    }

    head.sort_by(|a, b| b.score.total_cmp(&a.score));
    head.extend(tail);

    RerankOutcome {
        candidates: head,
        batches,
        failed_batches,
        timed_out_batches,
        unavailable: None,
    }
}

type BatchResult = Result<Vec<f32>, BackendError>;

async fn score_batches(
    documents: &[String],
    batch_size: usize,
    query: &Query,
    family: ModelFamily,
    backend: &RerankBackend,
    deadline: Instant,
) -> Result<Vec<BatchResult>, String> {
    match family {
        ModelFamily::CrossEncoder => {
            let futures = documents.chunks(batch_size).map(|chunk| {
                let batch = PairBatch {
                    query: query.clone(),
                    documents: chunk.to_vec(),
                };
                async move { backend.predict(batch, deadline).await.map(|(s, _)| s) }
            });
            Ok(join_all(futures).await)
        }
        ModelFamily::BiEncoder => {
            let query_embedding = query_embedding(query, backend, deadline).await?;
            let query_embedding = &query_embedding;
            let futures = documents.chunks(batch_size).map(|chunk| {
                let texts = chunk.to_vec();
                async move {
                    let (embeddings, _) = backend.embed(texts, deadline).await?;
                    embeddings
                        .iter()
                        .map(|embedding| {
                            cosine_similarity(query_embedding, embedding).ok_or_else(|| {
                                BackendError::Inference(
                                    "document embedding cannot be compared with the query embedding"
                                        .to_string(),
                                )
                            })
                        })
                        .collect::<BatchResult>()
                }
            });
            Ok(join_all(futures).await)
        }
        ModelFamily::None => Ok(Vec::new()),
    }
}

/// The model's embedding of the query text, or the caller's embedding when there is no text
async fn query_embedding(
    query: &Query,
    backend: &RerankBackend,
    deadline: Instant,
) -> Result<Vec<f32>, String> {
    match (&query.text, &query.embedding) {
        (Some(text), _) => {
            let (mut embeddings, _) = backend
                .embed(vec![text.clone()], deadline)
                .await
                .map_err(|err| format!("could not embed query: {err}"))?;
            embeddings
                .pop()
                .ok_or_else(|| "model returned no query embedding".to_string())
        }
        (None, Some(embedding)) => Ok(embedding.clone()),
        (None, None) => Err("bi-encoder reranking requires query text or embedding".to_string()),
    }
}

fn check_finite(scores: Vec<f32>) -> Result<Vec<f32>, BackendError> {
    if scores.iter().all(|s| s.is_finite()) {
        Ok(scores)
    } else {
        Err(BackendError::Inference(
            "model returned a non finite score".to_string(),
        ))
    }
}
