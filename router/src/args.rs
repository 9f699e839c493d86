use crate::strategy::RerankMode;
use anyhow::Result;
use clap::Parser;
use search_ranking_backend::Metric;
use search_ranking_core::config::SearchType;

/// Process configuration
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// Path to a JSON pipeline configuration.
    ///
    /// If not set, the `search_type` preset is used.
    #[clap(long, env)]
    pub config_path: Option<String>,

    /// Preset used when no configuration file is given.
    /// One of `image`, `text`, `multimodal` or `hybrid`.
    #[clap(default_value = "hybrid", long, env)]
    pub search_type: String,

    /// Overrides the similarity metric of the configuration
    #[clap(long, env, value_enum)]
    pub metric: Option<Metric>,

    /// Reranker mode selection
    #[clap(long, env, default_value = "auto")]
    pub reranker_mode: String,

    /// Optionally control the number of rerank worker threads.
    /// Default to the number of CPU cores on the machine.
    #[clap(long, env)]
    pub rerank_workers: Option<usize>,

    /// The maximum amount of concurrent pipeline runs.
    /// Having a low limit will refuse requests instead of having them
    /// wait for too long.
    #[clap(default_value = "512", long, env)]
    pub max_concurrent_requests: usize,

    /// Deadline given to a request that does not set its own, in milliseconds
    #[clap(default_value = "2000", long, env)]
    pub default_timeout_ms: u64,

    /// Outputs the logs in JSON format (useful for telemetry)
    #[clap(long, env)]
    pub json_output: bool,

    // Whether or not to include the log trace through spans
    #[clap(long, env)]
    pub disable_spans: bool,

    /// The IP address the Prometheus exporter listens on
    #[clap(default_value = "0.0.0.0", long, env)]
    pub hostname: String,

    /// The Prometheus port to listen on.
    #[clap(default_value = "9000", long, env)]
    pub prometheus_port: u16,

    /// Do not install the Prometheus exporter
    #[clap(long, env)]
    pub disable_prometheus: bool,
}

impl Args {
    pub fn parse_reranker_mode(&self) -> Result<RerankMode> {
        self.reranker_mode.parse()
    }

    pub fn parse_search_type(&self) -> Result<SearchType> {
        Ok(self.search_type.parse()?)
    }
}
