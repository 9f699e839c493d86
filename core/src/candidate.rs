use crate::RankingError;
use indexmap::IndexMap;
use search_ranking_backend::{Metadata, Metric, RetrievedItem, Value};
use serde::{Deserialize, Serialize};

/// Metadata fields concatenated into the text sent to rerank models
const DOCUMENT_FIELDS: [&str; 4] = ["description", "category", "tags", "brand"];

/// A scored item flowing through the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    /// Current relevance score, higher is better
    pub score: f32,
    /// Raw retrieval distance
    pub distance: Option<f32>,
    /// 1-based retrieval position
    pub rank: usize,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub annotations: StageAnnotations,
}

/// What each stage did to a candidate. Never read back by scoring.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageAnnotations {
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub business_rule_boosts: IndexMap<String, f32>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub business_rule_penalties: IndexMap<String, f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f32>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub rerank_failed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mmr_score: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diversity_score: Option<f32>,
}

impl Candidate {
    pub fn new(id: impl Into<String>, score: f32) -> Self {
        Self {
            id: id.into(),
            score,
            distance: None,
            rank: 0,
            metadata: Metadata::new(),
            embedding: None,
            annotations: StageAnnotations::default(),
        }
    }

    pub fn with_metadata(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(field.into(), value.into());
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Build a candidate from a retriever response, deriving the score from the distance
    /// when the backend did not return one
    pub fn from_retrieved(
        item: RetrievedItem,
        rank: usize,
        metric: Metric,
    ) -> Result<Self, RankingError> {
        if item.id.is_empty() {
            return Err(RankingError::MalformedResponse(format!(
                "item at rank {rank} has an empty id"
            )));
        }
        if let Some(distance) = item.distance {
            if !distance.is_finite() {
                return Err(RankingError::MalformedResponse(format!(
                    "item `{}` has a non finite distance",
                    item.id
                )));
            }
        }

        let score = match (item.score, item.distance) {
            (Some(score), _) => score,
            (None, Some(distance)) => metric.similarity(distance),
            (None, None) => {
                return Err(RankingError::MalformedResponse(format!(
                    "item `{}` has neither a score nor a distance",
                    item.id
                )))
            }
        };
        if !score.is_finite() {
            return Err(RankingError::MalformedResponse(format!(
                "item `{}` has a non finite score",
                item.id
            )));
        }

        Ok(Self {
            id: item.id,
            score,
            distance: item.distance,
            rank,
            metadata: item.metadata,
            embedding: item.embedding,
            annotations: StageAnnotations::default(),
        })
    }

    /// Text representation of the candidate used by rerank models:
    /// title (or name), description, category, tags and brand, space separated
    pub fn document(&self) -> String {
        let mut parts: Vec<String> = Vec::new();

        let heading = self
            .metadata
            .get("title")
            .or_else(|| self.metadata.get("name"));
        let fields = heading
            .into_iter()
            .chain(DOCUMENT_FIELDS.iter().filter_map(|f| self.metadata.get(*f)));

        for value in fields {
            match value {
                Value::List(values) => parts.extend(values.iter().map(|v| v.to_string())),
                value => parts.push(value.to_string()),
            }
        }

        parts.retain(|p| !p.is_empty());
        parts.join(" ")
    }
}
