#![allow(dead_code)]

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use search_ranking_backend::{
    BackendError, ModelFamily, PairBatch, RerankBackend, RerankModel, RetrievalRequest,
    RetrievedItem, Retrieval, Retriever,
};
use search_ranking_core::config::{ConfigStore, PipelineConfig};
use search_ranking_core::pipeline::Pipeline;
use tokio::time::Instant;

#[derive(Serialize, Deserialize, Debug)]
pub struct Score(pub f32);

impl Score {
    fn is_close(&self, other: &Self, abs_tol: f32) -> bool {
        is_close::default()
            .abs_tol(abs_tol)
            .is_close(self.0, other.0)
    }
}

impl PartialEq for Score {
    fn eq(&self, other: &Self) -> bool {
        // Default tolerance for equality
        self.is_close(other, 1e-5)
    }
}

/// Returns a fixed list of items, or a fixed error, and records every request
pub struct MockRetriever {
    items: Vec<RetrievedItem>,
    error: Option<BackendError>,
    requests: Mutex<Vec<RetrievalRequest>>,
}

impl MockRetriever {
    pub fn new(items: Vec<RetrievedItem>) -> Self {
        Self {
            items,
            error: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(error: BackendError) -> Self {
        Self {
            items: Vec::new(),
            error: Some(error),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<RetrievalRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Retriever for MockRetriever {
    async fn health(&self) -> Result<(), BackendError> {
        match &self.error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    async fn search(&self, request: RetrievalRequest) -> Result<Vec<RetrievedItem>, BackendError> {
        let top_k = request.top_k;
        self.requests.lock().unwrap().push(request);
        match &self.error {
            Some(err) => Err(err.clone()),
            None => Ok(self.items.iter().take(top_k).cloned().collect()),
        }
    }
}

/// Rerank model answering from lookup tables keyed by document text
#[derive(Default)]
pub struct MockModel {
    pub families: Vec<ModelFamily>,
    pub scores: HashMap<String, f32>,
    pub embeddings: HashMap<String, Vec<f32>>,
    pub delay: Duration,
    /// Fail any batch containing this document
    pub fail_on: Option<String>,
    /// Reject pair batches whose query has no text
    pub text_only: bool,
}

impl MockModel {
    pub fn cross_encoder(scores: &[(&str, f32)]) -> Self {
        Self {
            families: vec![ModelFamily::CrossEncoder],
            scores: scores.iter().map(|(d, s)| (d.to_string(), *s)).collect(),
            ..Default::default()
        }
    }

    pub fn bi_encoder(embeddings: &[(&str, Vec<f32>)]) -> Self {
        Self {
            families: vec![ModelFamily::BiEncoder],
            embeddings: embeddings
                .iter()
                .map(|(d, e)| (d.to_string(), e.clone()))
                .collect(),
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing_on(mut self, document: &str) -> Self {
        self.fail_on = Some(document.to_string());
        self
    }

    pub fn text_only(mut self) -> Self {
        self.text_only = true;
        self
    }

    fn check(&self, documents: &[String]) -> Result<(), BackendError> {
        std::thread::sleep(self.delay);
        match &self.fail_on {
            Some(fail_on) if documents.contains(fail_on) => {
                Err(BackendError::Inference("model crashed".to_string()))
            }
            _ => Ok(()),
        }
    }
}

impl RerankModel for MockModel {
    fn health(&self) -> Result<(), BackendError> {
        Ok(())
    }

    fn families(&self) -> Vec<ModelFamily> {
        self.families.clone()
    }

    fn predict(&self, batch: PairBatch) -> Result<Vec<f32>, BackendError> {
        if self.text_only && batch.query.text.is_none() {
            return Err(BackendError::Unsupported(
                "scoring without a query text".to_string(),
            ));
        }
        self.check(&batch.documents)?;
        Ok(batch
            .documents
            .iter()
            .map(|d| self.scores.get(d).copied().unwrap_or(0.0))
            .collect())
    }

    fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, BackendError> {
        self.check(&texts)?;
        Ok(texts
            .iter()
            .map(|t| self.embeddings.get(t).cloned().unwrap_or_else(|| vec![0.0, 0.0]))
            .collect())
    }
}

/// Retrieved item whose document text is `doc{i}`
pub fn item(i: usize, score: f32) -> RetrievedItem {
    let mut item = RetrievedItem {
        id: format!("c{i}"),
        score: Some(score),
        ..Default::default()
    };
    item.metadata
        .insert("title".to_string(), format!("doc{i}").into());
    item
}

/// `n` items scored 0.95, 0.94, ...
pub fn ranked_items(n: usize) -> Vec<RetrievedItem> {
    (0..n).map(|i| item(i, 0.95 - 0.01 * i as f32)).collect()
}

pub fn pipeline(
    retriever: Arc<MockRetriever>,
    model: Option<MockModel>,
    config: PipelineConfig,
) -> Pipeline {
    let reranker = model.map(|model| RerankBackend::new(Arc::new(model), 2).unwrap());
    let store = Arc::new(ConfigStore::new(config).unwrap());
    Pipeline::new(Retrieval::new(retriever), reranker, store, 8)
}

pub fn deadline() -> Instant {
    Instant::now() + Duration::from_secs(5)
}

pub fn ids(result: &search_ranking_core::pipeline::PipelineResult) -> Vec<&str> {
    result.candidates.iter().map(|c| c.id.as_str()).collect()
}
