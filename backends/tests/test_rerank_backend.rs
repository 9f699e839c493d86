use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use search_ranking_backend::{
    BackendError, Metric, ModelFamily, PairBatch, Query, RerankBackend, RerankModel,
    RetrievalRequest, RetrievedItem, Retrieval, Retriever,
};
use tokio::time::Instant;

/// Scores each document by its length, optionally after sleeping
struct LengthModel {
    delay: Duration,
    calls: AtomicUsize,
}

impl LengthModel {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            calls: AtomicUsize::new(0),
        }
    }
}

impl RerankModel for LengthModel {
    fn health(&self) -> Result<(), BackendError> {
        Ok(())
    }

    fn families(&self) -> Vec<ModelFamily> {
        vec![ModelFamily::CrossEncoder]
    }

    fn max_batch_size(&self) -> Option<usize> {
        Some(8)
    }

    fn predict(&self, batch: PairBatch) -> Result<Vec<f32>, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        Ok(batch.documents.iter().map(|d| d.len() as f32).collect())
    }
}

/// Always returns a single score regardless of batch size
struct TruncatingModel;

impl RerankModel for TruncatingModel {
    fn health(&self) -> Result<(), BackendError> {
        Ok(())
    }

    fn families(&self) -> Vec<ModelFamily> {
        vec![ModelFamily::CrossEncoder]
    }

    fn predict(&self, _batch: PairBatch) -> Result<Vec<f32>, BackendError> {
        Ok(vec![1.0])
    }
}

fn deadline_in(ms: u64) -> Instant {
    Instant::now() + Duration::from_millis(ms)
}

fn batch(documents: &[&str]) -> PairBatch {
    PairBatch {
        query: Query::from_text("headphones"),
        documents: documents.iter().map(|d| d.to_string()).collect(),
    }
}

#[tokio::test]
async fn test_predict_keeps_submission_order() {
    let backend = RerankBackend::new(Arc::new(LengthModel::new(Duration::ZERO)), 2).unwrap();
    assert_eq!(backend.max_batch_size, Some(8));
    assert!(backend.supports(ModelFamily::CrossEncoder));
    assert!(!backend.supports(ModelFamily::BiEncoder));

    let (scores, _) = backend
        .predict(batch(&["a", "abc", "ab"]), deadline_in(5_000))
        .await
        .unwrap();
    assert_eq!(scores, vec![1.0, 3.0, 2.0]);
    assert!(*backend.health_watcher().borrow());
}

#[tokio::test]
async fn test_embed_unsupported() {
    let backend = RerankBackend::new(Arc::new(LengthModel::new(Duration::ZERO)), 1).unwrap();
    let err = backend
        .embed(vec!["a".to_string()], deadline_in(5_000))
        .await
        .unwrap_err();
    assert!(matches!(err, BackendError::Unsupported(_)));
}

#[tokio::test]
async fn test_predict_times_out() {
    let model = Arc::new(LengthModel::new(Duration::from_millis(300)));
    let backend = RerankBackend::new(model, 1).unwrap();

    let err = backend
        .predict(batch(&["a"]), deadline_in(20))
        .await
        .unwrap_err();
    assert_eq!(err, BackendError::Timeout);
}

#[tokio::test]
async fn test_output_length_mismatch_is_an_error() {
    let backend = RerankBackend::new(Arc::new(TruncatingModel), 1).unwrap();
    let err = backend
        .predict(batch(&["a", "b"]), deadline_in(5_000))
        .await
        .unwrap_err();
    assert!(matches!(err, BackendError::Inference(_)));
    assert!(!*backend.health_watcher().borrow());
}

#[tokio::test]
async fn test_health_runs_forward_pass() {
    let model = Arc::new(LengthModel::new(Duration::ZERO));
    let backend = RerankBackend::new(model.clone(), 1).unwrap();

    // First check runs a forward pass
    backend.health().await.unwrap();
    assert_eq!(model.calls.load(Ordering::SeqCst), 1);

    // Healthy backends only ask the model for its status
    backend.health().await.unwrap();
    assert_eq!(model.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_zero_workers_rejected() {
    let err = RerankBackend::new(Arc::new(TruncatingModel), 0).unwrap_err();
    assert!(matches!(err, BackendError::Start(_)));
}

struct StaticRetriever {
    delay: Duration,
}

#[async_trait::async_trait]
impl Retriever for StaticRetriever {
    async fn search(&self, request: RetrievalRequest) -> Result<Vec<RetrievedItem>, BackendError> {
        tokio::time::sleep(self.delay).await;
        Ok((0..request.top_k)
            .map(|i| RetrievedItem {
                id: format!("item-{i}"),
                distance: Some(i as f32 * 0.1),
                ..Default::default()
            })
            .collect())
    }
}

fn request(top_k: usize) -> RetrievalRequest {
    RetrievalRequest {
        query: Query::from_embedding(vec![1.0, 0.0]),
        top_k,
        filter: None,
        metric: Metric::Cosine,
    }
}

#[tokio::test]
async fn test_retrieval_search() {
    let retrieval = Retrieval::new(Arc::new(StaticRetriever {
        delay: Duration::ZERO,
    }));
    retrieval.health().await.unwrap();
    let (items, _) = retrieval.search(request(3), deadline_in(5_000)).await.unwrap();
    let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
    assert_eq!(ids, ["item-0", "item-1", "item-2"]);
}

#[tokio::test]
async fn test_retrieval_honours_deadline() {
    let retrieval = Retrieval::new(Arc::new(StaticRetriever {
        delay: Duration::from_secs(10),
    }));
    let err = retrieval.search(request(3), deadline_in(10)).await.unwrap_err();
    assert_eq!(err, BackendError::Timeout);
}
