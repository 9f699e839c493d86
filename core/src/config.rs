//! Pipeline configuration snapshots
//!
//! Rules and stage settings are read through immutable snapshots. Updates build a new
//! snapshot, validate it, and swap it in atomically. Runs that already loaded a snapshot
//! keep using it.
use crate::mmr::{MmrConfig, MmrStrategy};
use crate::rerank::RerankConfig;
use crate::rules::{self, BusinessRule};
use crate::RankingError;
use arc_swap::{ArcSwap, Guard};
use search_ranking_backend::{ComputeTarget, Metric, ModelFamily};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

/// Search flavours with their own retrieval, rerank and diversity defaults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchType {
    Image,
    Text,
    Multimodal,
    Hybrid,
}

impl fmt::Display for SearchType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SearchType::Image => write!(f, "image"),
            SearchType::Text => write!(f, "text"),
            SearchType::Multimodal => write!(f, "multimodal"),
            SearchType::Hybrid => write!(f, "hybrid"),
        }
    }
}

impl FromStr for SearchType {
    type Err = RankingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "image" => Ok(SearchType::Image),
            "text" => Ok(SearchType::Text),
            "multimodal" => Ok(SearchType::Multimodal),
            "hybrid" => Ok(SearchType::Hybrid),
            _ => Err(RankingError::Config(format!(
                "Invalid search type: {s}. Valid values: image, text, multimodal, hybrid"
            ))),
        }
    }
}

/// Upper bounds on the time given to optional stages, on top of the request deadline
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageBudgets {
    pub rerank_ms: Option<u64>,
    pub mmr_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Bumped by every [`ConfigStore`] update
    pub version: u64,
    /// Number of candidates requested from the retriever
    pub candidate_pool: usize,
    pub metric: Metric,
    /// Send admission rules to the retriever as a pre-filter
    pub push_down_filters: bool,
    pub rules: Vec<BusinessRule>,
    pub rerank: RerankConfig,
    pub mmr: Option<MmrConfig>,
    pub budgets: StageBudgets,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            version: 0,
            candidate_pool: 100,
            metric: Metric::Cosine,
            push_down_filters: false,
            rules: Vec::new(),
            rerank: RerankConfig::default(),
            mmr: None,
            budgets: StageBudgets::default(),
        }
    }
}

impl PipelineConfig {
    pub fn preset(search_type: SearchType) -> Self {
        let (candidate_pool, model_family, rerank_top_k, lambda_param) = match search_type {
            SearchType::Image => (100, ModelFamily::CrossEncoder, 50, None),
            SearchType::Text => (100, ModelFamily::BiEncoder, 50, Some(0.3)),
            SearchType::Multimodal => (150, ModelFamily::CrossEncoder, 75, Some(0.4)),
            SearchType::Hybrid => (200, ModelFamily::CrossEncoder, 100, Some(0.5)),
        };

        Self {
            candidate_pool,
            rerank: RerankConfig {
                model_family,
                top_k: rerank_top_k,
                batch_size: 32,
                compute_target: ComputeTarget::Cpu,
            },
            mmr: lambda_param.map(|lambda_param| MmrConfig {
                strategy: MmrStrategy::Balanced,
                lambda_param,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), RankingError> {
        if self.candidate_pool == 0 {
            return Err(RankingError::Config(
                "`candidate_pool` must be at least 1".to_string(),
            ));
        }
        rules::validate(&self.rules)?;
        self.rerank.validate()?;
        if let Some(mmr) = &self.mmr {
            mmr.validate()?;
        }
        Ok(())
    }

    pub fn from_json(json: &str) -> Result<Self, RankingError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|err| RankingError::Config(format!("could not parse configuration: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, RankingError> {
        let json = std::fs::read_to_string(path).map_err(|err| {
            RankingError::Config(format!("could not read `{}`: {err}", path.display()))
        })?;
        Self::from_json(&json)
    }

    pub fn rule(&self, rule_id: &str) -> Option<&BusinessRule> {
        self.rules.iter().find(|r| r.rule_id == rule_id)
    }
}

/// Process wide holder of the current [`PipelineConfig`] snapshot
#[derive(Debug)]
pub struct ConfigStore {
    current: ArcSwap<PipelineConfig>,
}

impl ConfigStore {
    pub fn new(config: PipelineConfig) -> Result<Self, RankingError> {
        config.validate()?;
        metrics::gauge!("sr_config_version").set(config.version as f64);
        Ok(Self {
            current: ArcSwap::from_pointee(config),
        })
    }

    pub fn snapshot(&self) -> Arc<PipelineConfig> {
        self.current.load_full()
    }

    /// Apply `f` to the current snapshot and swap the validated result in.
    ///
    /// `f` is re-run if another update won the race.
    pub fn update<F>(&self, f: F) -> Result<Arc<PipelineConfig>, RankingError>
    where
        F: Fn(&PipelineConfig) -> Result<PipelineConfig, RankingError>,
    {
        let mut current = self.current.load_full();
        loop {
            let mut next = f(&current)?;
            next.version = current.version + 1;
            next.validate()?;
            let next = Arc::new(next);

            let previous = self.current.compare_and_swap(&current, next.clone());
            if Arc::ptr_eq(&previous, &current) {
                metrics::gauge!("sr_config_version").set(next.version as f64);
                tracing::info!("Configuration updated to version {}", next.version);
                return Ok(next);
            }
            current = Guard::into_inner(previous);
        }
    }

    pub fn replace(&self, config: PipelineConfig) -> Result<Arc<PipelineConfig>, RankingError> {
        self.update(|_| Ok(config.clone()))
    }

    /// Insert `rule`, replacing any rule with the same id
    pub fn add_rule(&self, rule: BusinessRule) -> Result<Arc<PipelineConfig>, RankingError> {
        self.update(|current| {
            let mut next = current.clone();
            match next.rules.iter_mut().find(|r| r.rule_id == rule.rule_id) {
                Some(existing) => *existing = rule.clone(),
                None => next.rules.push(rule.clone()),
            }
            Ok(next)
        })
    }

    pub fn remove_rule(&self, rule_id: &str) -> Result<Arc<PipelineConfig>, RankingError> {
        self.update(|current| {
            let mut next = current.clone();
            let before = next.rules.len();
            next.rules.retain(|r| r.rule_id != rule_id);
            if next.rules.len() == before {
                return Err(RankingError::Validation(format!(
                    "unknown rule id `{rule_id}`"
                )));
            }
            Ok(next)
        })
    }

    pub fn rule(&self, rule_id: &str) -> Option<BusinessRule> {
        self.current.load().rule(rule_id).cloned()
    }

    pub fn rules(&self) -> Vec<BusinessRule> {
        self.current.load().rules.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{Operator, RuleType};

    fn boost(id: &str) -> BusinessRule {
        BusinessRule::new(id, RuleType::Boost, "brand", Operator::Eq, "AudioTech").with_weight(0.2)
    }

    #[test]
    fn test_presets_are_valid() {
        for search_type in [
            SearchType::Image,
            SearchType::Text,
            SearchType::Multimodal,
            SearchType::Hybrid,
        ] {
            assert!(PipelineConfig::preset(search_type).validate().is_ok());
        }

        let image = PipelineConfig::preset(SearchType::Image);
        assert_eq!(image.rerank.model_family, ModelFamily::CrossEncoder);
        assert_eq!(image.mmr, None);

        let text = PipelineConfig::preset(SearchType::Text);
        assert_eq!(text.rerank.model_family, ModelFamily::BiEncoder);
        assert_eq!(text.mmr.unwrap().lambda_param, 0.3);

        let hybrid = PipelineConfig::preset(SearchType::Hybrid);
        assert_eq!(hybrid.candidate_pool, 200);
        assert_eq!(hybrid.rerank.top_k, 100);
    }

    #[test]
    fn test_search_type_from_str() {
        assert_eq!("IMAGE".parse::<SearchType>().unwrap(), SearchType::Image);
        assert_eq!("hybrid".parse::<SearchType>().unwrap(), SearchType::Hybrid);
        assert!("audio".parse::<SearchType>().is_err());
    }

    #[test]
    fn test_from_json() {
        let config = PipelineConfig::from_json(
            r#"{
                "candidate_pool": 50,
                "rules": [{"rule_id": "a", "rule_type": "boost", "field": "brand", "value": "X", "weight": 0.5}],
                "rerank": {"model_family": "bi_encoder", "top_k": 10},
                "mmr": {"lambda_param": 0.7, "max_results": 5},
                "budgets": {"rerank_ms": 200}
            }"#,
        )
        .unwrap();

        assert_eq!(config.candidate_pool, 50);
        assert_eq!(config.rules[0].weight, 0.5);
        assert_eq!(config.rerank.model_family, ModelFamily::BiEncoder);
        assert_eq!(config.rerank.batch_size, 32);
        let mmr = config.mmr.unwrap();
        assert_eq!(mmr.strategy, MmrStrategy::Balanced);
        assert_eq!(mmr.max_results, 5);
        assert_eq!(config.budgets.rerank_ms, Some(200));
        assert_eq!(config.budgets.mmr_ms, None);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = PipelineConfig::from_json(r#"{"mmr": {"lambda_param": 1.5}}"#).unwrap_err();
        assert!(matches!(err, RankingError::Config(_)));

        let err = PipelineConfig::from_json(r#"{"rerank": {"batch_size": 0}}"#).unwrap_err();
        assert!(matches!(err, RankingError::Config(_)));

        let config = PipelineConfig {
            rules: vec![boost("a"), boost("a")],
            ..Default::default()
        };
        assert!(ConfigStore::new(config).is_err());
    }

    #[test]
    fn test_store_updates_bump_version() {
        let store = ConfigStore::new(PipelineConfig::default()).unwrap();
        let initial = store.snapshot();
        assert_eq!(initial.version, 0);

        let updated = store.add_rule(boost("a")).unwrap();
        assert_eq!(updated.version, 1);
        assert_eq!(store.rules(), vec![boost("a")]);
        // Earlier snapshots are never modified
        assert!(initial.rules.is_empty());

        let replaced = store.add_rule(boost("a").with_weight(0.7)).unwrap();
        assert_eq!(replaced.version, 2);
        assert_eq!(replaced.rules.len(), 1);
        assert_eq!(store.rule("a").unwrap().weight, 0.7);

        store.remove_rule("a").unwrap();
        assert!(store.rule("a").is_none());
        assert_eq!(store.snapshot().version, 3);
    }

    #[test]
    fn test_store_rejects_invalid_updates() {
        let store = ConfigStore::new(PipelineConfig::default()).unwrap();

        assert!(matches!(
            store.remove_rule("missing"),
            Err(RankingError::Validation(_))
        ));
        assert!(store.add_rule(boost("a").with_weight(-1.0)).is_err());

        let invalid = PipelineConfig {
            mmr: Some(MmrConfig::balanced(2.0, 3)),
            ..Default::default()
        };
        assert!(store.replace(invalid).is_err());
        assert_eq!(store.snapshot().version, 0);
    }
}
