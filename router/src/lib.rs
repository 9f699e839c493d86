//! Search ranking process wiring
//!
//! Turns process settings into a ready [`SearchService`]: configuration loading, reranker
//! mode resolution, rerank worker pool, health checks and metrics exporter.
mod logging;
mod prometheus;

pub mod args;
pub mod strategy;


pub use args::Args;
pub use logging::init_logging;

use anyhow::{Context, Result};
use search_ranking_backend::{ModelFamily, RerankBackend, RerankModel, Retrieval, Retriever};
use search_ranking_core::config::{ConfigStore, PipelineConfig};
use search_ranking_core::pipeline::{Pipeline, PipelineResult, SearchRequest};
use search_ranking_core::RankingError;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::instrument;

/// Entry point for host applications
#[derive(Debug, Clone)]
pub struct SearchService {
    pub pipeline: Pipeline,
    pub default_timeout: Duration,
}

impl SearchService {
    pub async fn search(&self, request: SearchRequest) -> Result<PipelineResult, RankingError> {
        self.search_with_timeout(request, self.default_timeout)
            .await
    }

    #[instrument(skip_all)]
    pub async fn search_with_timeout(
        &self,
        request: SearchRequest,
        timeout: Duration,
    ) -> Result<PipelineResult, RankingError> {
        let permit = self.pipeline.try_acquire_permit()?;
        self.pipeline
            .run(request, Instant::now() + timeout, permit)
            .await
    }
}

/// Assemble a [`SearchService`] around `retriever` and an optional rerank `model`
pub async fn run(
    args: Args,
    retriever: Arc<dyn Retriever>,
    model: Option<Arc<dyn RerankModel + Send + Sync>>,
) -> Result<SearchService> {
    let reranker_mode = args.parse_reranker_mode()?;

    let mut config = match &args.config_path {
        Some(path) => {
            tracing::info!("Loading pipeline configuration from {path}");
            PipelineConfig::from_path(Path::new(path))?
        }
        None => {
            let search_type = args.parse_search_type()?;
            tracing::info!("Using the {search_type} preset");
            PipelineConfig::preset(search_type)
        }
    };
    if let Some(metric) = args.metric {
        config.metric = metric;
    }

    let supported = model.as_ref().map(|m| m.families()).unwrap_or_default();
    let configured = config.rerank.model_family;
    let family = strategy::determine_family(&reranker_mode, &supported, configured)?;
    config.rerank.model_family = family;

    let reranker = match model {
        Some(model) if family != ModelFamily::None => {
            let workers = args.rerank_workers.unwrap_or_else(num_cpus::get);
            let backend = RerankBackend::new(model, workers)
                .context("Could not start the rerank backend")?;
            Some(backend)
        }
        _ => None,
    };
    tracing::info!("Reranking with {family}");

    let retrieval = Retrieval::new(retriever);
    let max_candidate_pool = config.candidate_pool;
    let store = Arc::new(ConfigStore::new(config)?);
    let pipeline = Pipeline::new(retrieval, reranker, store, args.max_concurrent_requests);
    pipeline
        .health()
        .await
        .context("Retriever or rerank model is not healthy")?;

    if !args.disable_prometheus {
        let addr = match args.hostname.parse() {
            Ok(ip) => SocketAddr::new(ip, args.prometheus_port),
            Err(_) => {
                tracing::warn!("Invalid hostname, defaulting to 0.0.0.0");
                SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), args.prometheus_port)
            }
        };
        prometheus::prometheus_builder(addr, args.prometheus_port, max_candidate_pool)
            .context("failed to build prometheus recorder")?
            .install()
            .context("failed to install metrics recorder")?;
    }

    tracing::info!("Ready");
    Ok(SearchService {
        pipeline,
        default_timeout: Duration::from_millis(args.default_timeout_ms),
    })
}
