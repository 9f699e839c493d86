//! Maximal Marginal Relevance selection
//!
//! Greedily picks candidates that trade relevance against dissimilarity to what was already
//! selected. Diversity is the mean cosine distance to the selected set when embeddings are
//! available, and a metadata overlap heuristic otherwise.
use crate::candidate::Candidate;
use crate::math::cosine_distance;
use crate::RankingError;
use search_ranking_backend::Metadata;
use serde::{Deserialize, Serialize};

/// Diversity assigned when a candidate shares no metadata field with the selected items
const DEFAULT_METADATA_DIVERSITY: f32 = 0.5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MmrStrategy {
    /// Rank by diversity only, stop once nothing is diverse enough
    Diversity,
    /// Rank by relevance only
    Relevance,
    /// `λ·relevance + (1-λ)·diversity`
    #[default]
    Balanced,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MmrConfig {
    pub strategy: MmrStrategy,
    pub lambda_param: f32,
    pub diversity_threshold: f32,
    pub max_results: usize,
}

impl Default for MmrConfig {
    fn default() -> Self {
        Self {
            strategy: MmrStrategy::Balanced,
            lambda_param: 0.5,
            diversity_threshold: 0.3,
            max_results: 20,
        }
    }
}

impl MmrConfig {
    pub fn balanced(lambda_param: f32, max_results: usize) -> Self {
        Self {
            lambda_param,
            max_results,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), RankingError> {
        if !(0.0..=1.0).contains(&self.lambda_param) {
            return Err(RankingError::Config(format!(
                "`lambda_param` must be in [0, 1], got {}",
                self.lambda_param
            )));
        }
        if !(0.0..=1.0).contains(&self.diversity_threshold) {
            return Err(RankingError::Config(format!(
                "`diversity_threshold` must be in [0, 1], got {}",
                self.diversity_threshold
            )));
        }
        Ok(())
    }

    fn score(&self, relevance: f32, diversity: f32) -> f32 {
        match self.strategy {
            MmrStrategy::Diversity => diversity,
            MmrStrategy::Relevance => relevance,
            MmrStrategy::Balanced => {
                self.lambda_param * relevance + (1.0 - self.lambda_param) * diversity
            }
        }
    }
}

/// A remaining candidate and its running diversity against the selected set
struct Slot {
    candidate: Candidate,
    /// Sum of cosine distances to the selected items
    distance_sum: f32,
    /// Every selected item so far had a comparable embedding
    embedded: bool,
    /// Lowest differing/shared field ratio against the selected items
    metadata_diversity: Option<f32>,
}

impl Slot {
    fn new(candidate: Candidate) -> Self {
        let embedded = candidate.embedding.is_some();
        Self {
            candidate,
            distance_sum: 0.0,
            embedded,
            metadata_diversity: None,
        }
    }

    fn observe(&mut self, picked: &Candidate) {
        if self.embedded {
            let distance = match (&self.candidate.embedding, &picked.embedding) {
                (Some(a), Some(b)) => cosine_distance(a, b),
                _ => None,
            };
            match distance {
                Some(distance) => self.distance_sum += distance,
                None => self.embedded = false,
            }
        }

        if let Some(ratio) = metadata_difference(&self.candidate.metadata, &picked.metadata) {
            self.metadata_diversity = Some(
                self.metadata_diversity
                    .map_or(ratio, |current| current.min(ratio)),
            );
        }
    }

    fn diversity(&self, selected: usize) -> f32 {
        if self.embedded && selected > 0 {
            self.distance_sum / selected as f32
        } else {
            self.metadata_diversity
                .unwrap_or(DEFAULT_METADATA_DIVERSITY)
        }
    }
}

/// Fraction of the fields present in both maps whose values differ
fn metadata_difference(a: &Metadata, b: &Metadata) -> Option<f32> {
    let mut shared = 0;
    let mut differing = 0;
    for (field, value) in a {
        if let Some(other) = b.get(field) {
            shared += 1;
            if value != other {
                differing += 1;
            }
        }
    }
    (shared > 0).then(|| differing as f32 / shared as f32)
}

/// Select up to `config.max_results` candidates with greedy MMR.
///
/// The highest scoring candidate seeds the selection. Ties always go to the earliest
/// candidate in the incoming order.
pub fn select(candidates: Vec<Candidate>, config: &MmrConfig) -> Vec<Candidate> {
    if candidates.is_empty() || config.max_results == 0 {
        return Vec::new();
    }
    if candidates.len() == 1 {
        return candidates;
    }

    let mut seed_index = 0;
    for (i, candidate) in candidates.iter().enumerate() {
        if candidate.score > candidates[seed_index].score {
            seed_index = i;
        }
    }

    let mut pool: Vec<Slot> = candidates.into_iter().map(Slot::new).collect();
    let seed = pool.remove(seed_index).candidate;
    for slot in pool.iter_mut() {
        slot.observe(&seed);
    }

    let mut selected = Vec::with_capacity(config.max_results.min(pool.len() + 1));
    selected.push(seed);

    while selected.len() < config.max_results && !pool.is_empty() {
        let mut best: Option<(usize, f32, f32)> = None;
        for (i, slot) in pool.iter().enumerate() {
            let diversity = slot.diversity(selected.len());
            let mmr = config.score(slot.candidate.score, diversity);
            if best.map_or(true, |(_, best_mmr, _)| mmr > best_mmr) {
                best = Some((i, mmr, diversity));
            }
        }

        let Some((index, mmr, diversity)) = best else {
            break;
        };
        if config.strategy == MmrStrategy::Diversity && mmr < config.diversity_threshold {
            break;
        }

        let mut picked = pool.remove(index).candidate;
        picked.annotations.mmr_score = Some(mmr);
        picked.annotations.diversity_score = Some(diversity);
        for slot in pool.iter_mut() {
            slot.observe(&picked);
        }
        selected.push(picked);
    }

    selected
}
