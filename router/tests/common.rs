#![allow(dead_code)]

use search_ranking_backend::{
    BackendError, ModelFamily, PairBatch, RerankModel, RetrievalRequest, RetrievedItem, Retriever,
};
use search_ranking_router::Args;
use clap::Parser;
use std::sync::Arc;

/// Returns `n` items scored 0.9, 0.8, ... whose documents are `doc{i}`
pub struct StaticRetriever {
    pub n: usize,
}

#[async_trait::async_trait]
impl Retriever for StaticRetriever {
    async fn search(&self, request: RetrievalRequest) -> Result<Vec<RetrievedItem>, BackendError> {
        Ok((0..self.n.min(request.top_k))
            .map(|i| {
                let mut item = RetrievedItem {
                    id: format!("c{i}"),
                    score: Some(0.9 - 0.1 * i as f32),
                    ..Default::default()
                };
                item.metadata
                    .insert("title".to_string(), format!("doc{i}").into());
                item
            })
            .collect())
    }
}

/// Cross-encoder scoring documents by their index, reversing the retrieval order
pub struct IndexModel;

impl RerankModel for IndexModel {
    fn health(&self) -> Result<(), BackendError> {
        Ok(())
    }

    fn families(&self) -> Vec<ModelFamily> {
        vec![ModelFamily::CrossEncoder]
    }

    fn predict(&self, batch: PairBatch) -> Result<Vec<f32>, BackendError> {
        batch
            .documents
            .iter()
            .map(|d| match d.strip_prefix("doc") {
                Some(index) => index
                    .parse::<f32>()
                    .map_err(|err| BackendError::Inference(err.to_string())),
                // Warmup and health documents
                None => Ok(0.0),
            })
            .collect()
    }
}

pub fn retriever(n: usize) -> Arc<dyn Retriever> {
    Arc::new(StaticRetriever { n })
}

pub fn model() -> Option<Arc<dyn RerankModel + Send + Sync>> {
    Some(Arc::new(IndexModel))
}

/// Parse args, never installing the Prometheus exporter
pub fn args(extra: &[&str]) -> Args {
    let mut argv = vec!["search-ranking-router", "--disable-prometheus", "--rerank-workers", "2"];
    argv.extend_from_slice(extra);
    Args::try_parse_from(argv).unwrap()
}
