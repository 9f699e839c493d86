#[cfg(feature = "clap")]
use clap::ValueEnum;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Metadata value attached to a retrieved item or used as a rule operand
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<Value>),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::String(s) => write!(f, "{s}"),
            Value::List(l) => {
                for (i, v) in l.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                Ok(())
            }
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(value: Vec<T>) -> Self {
        Value::List(value.into_iter().map(Into::into).collect())
    }
}

/// Insertion ordered item metadata
pub type Metadata = IndexMap<String, Value>;

/// Query representation sent to the retriever and the rerank model
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub text: Option<String>,
    pub embedding: Option<Vec<f32>>,
}

impl Query {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            embedding: None,
        }
    }

    pub fn from_embedding(embedding: Vec<f32>) -> Self {
        Self {
            text: None,
            embedding: Some(embedding),
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "clap", derive(ValueEnum))]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Cosine distance, `1 - cos(q, x)`
    #[default]
    Cosine,
    /// Inner product, already a similarity
    InnerProduct,
    /// Euclidean distance
    L2,
}

impl Metric {
    /// Convert a raw index distance to a higher-is-better score
    pub fn similarity(&self, distance: f32) -> f32 {
        match self {
            Metric::Cosine => 1.0 - distance,
            Metric::InnerProduct => distance,
            Metric::L2 => 1.0 / (1.0 + distance.max(0.0)),
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Metric::Cosine => write!(f, "cosine"),
            Metric::InnerProduct => write!(f, "inner_product"),
            Metric::L2 => write!(f, "l2"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalRequest {
    pub query: Query,
    pub top_k: usize,
    /// Backend specific boolean predicate over metadata fields
    pub filter: Option<String>,
    pub metric: Metric,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievedItem {
    pub id: String,
    #[serde(default)]
    pub score: Option<f32>,
    #[serde(default)]
    pub distance: Option<f32>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "clap", derive(ValueEnum))]
#[serde(rename_all = "snake_case")]
pub enum ModelFamily {
    /// Score (query, document) pairs jointly
    CrossEncoder,
    /// Embed query and documents separately and compare them with cosine similarity
    BiEncoder,
    /// Reranking disabled
    #[default]
    None,
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ModelFamily::CrossEncoder => write!(f, "cross_encoder"),
            ModelFamily::BiEncoder => write!(f, "bi_encoder"),
            ModelFamily::None => write!(f, "none"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "clap", derive(ValueEnum))]
#[serde(rename_all = "snake_case")]
pub enum ComputeTarget {
    #[default]
    Cpu,
    Accelerated,
}

/// Documents scored jointly with the query.
/// Models that need a query text reject batches whose query has none.
#[derive(Debug, Clone, PartialEq)]
pub struct PairBatch {
    pub query: Query,
    pub documents: Vec<String>,
}

impl PairBatch {
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

/// Compute bound rerank model. Called from dedicated worker threads.
pub trait RerankModel {
    fn health(&self) -> Result<(), BackendError>;

    fn families(&self) -> Vec<ModelFamily>;

    fn max_batch_size(&self) -> Option<usize> {
        None
    }

    /// One score per document, in submission order
    fn predict(&self, _batch: PairBatch) -> Result<Vec<f32>, BackendError> {
        Err(BackendError::Unsupported("predict".to_string()))
    }

    /// One embedding per text, in submission order
    fn embed(&self, _texts: Vec<String>) -> Result<Vec<Vec<f32>>, BackendError> {
        Err(BackendError::Unsupported("embed".to_string()))
    }
}

/// Vector index backend
#[async_trait::async_trait]
pub trait Retriever: Send + Sync {
    async fn health(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn search(&self, request: RetrievalRequest) -> Result<Vec<RetrievedItem>, BackendError>;
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BackendError {
    #[error("No backend found")]
    NoBackend,
    #[error("Could not start backend: {0}")]
    Start(String),
    #[error("{0}")]
    Inference(String),
    #[error("Backend is unhealthy")]
    Unhealthy,
    #[error("Operation not supported by this backend: {0}")]
    Unsupported(String),
    #[error("Deadline exceeded")]
    Timeout,
}
