pub mod candidate;
pub mod config;
pub mod math;
pub mod mmr;
pub mod pipeline;
pub mod rerank;
pub mod rules;

use search_ranking_backend::BackendError;
use thiserror::Error;
use tokio::sync::TryAcquireError;

#[derive(Error, Debug)]
pub enum RankingError {
    #[error("Retrieval failed: {0}")]
    Retrieval(#[from] BackendError),
    #[error("Malformed retrieval response: {0}")]
    MalformedResponse(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Input validation error: {0}")]
    Validation(String),
    #[error("Pipeline is overloaded")]
    Overloaded(#[from] TryAcquireError),
}

impl RankingError {
    /// Label used for the `err` dimension of failure metrics
    pub fn kind(&self) -> &'static str {
        match self {
            RankingError::Retrieval(BackendError::Timeout) => "retrieval_timeout",
            RankingError::Retrieval(_) => "retrieval",
            RankingError::MalformedResponse(_) => "malformed",
            RankingError::Config(_) => "config",
            RankingError::Validation(_) => "validation",
            RankingError::Overloaded(_) => "overloaded",
        }
    }
}
