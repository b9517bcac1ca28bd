//! Rankers used when no embedding model can answer.

use std::cmp::Ordering;

use rand::Rng;

use super::query::FindSimilarParams;
use super::strategy::{DegradationTier, RankRequest, Ranked, Ranking, RankingStrategy, StrategyError};
use crate::catalog::CatalogSnapshot;

/// Score for items that share no term with the query
pub const NO_MATCH_SCORE: f32 = 0.3;

const MATCH_FLOOR: f32 = 0.1;
const MATCH_CEILING: f32 = 0.9;

const SYNTHETIC_START: f32 = 0.95;
const SYNTHETIC_STEP: f32 = 0.05;
const SYNTHETIC_FLOOR: f32 = 0.1;
const SYNTHETIC_CEILING: f32 = 0.99;

/// Scores items by how many query terms appear in their text fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordOverlapRanker;

impl KeywordOverlapRanker {
    /// Overlap score of one item's text against the query terms.
    ///
    /// `matched / total` is scaled into `[0.1, 0.9]`; no matches (or no
    /// terms) gives [`NO_MATCH_SCORE`].
    pub fn score(terms: &[String], text: &str) -> f32 {
        if terms.is_empty() {
            return NO_MATCH_SCORE;
        }

        let text = text.to_lowercase();
        let matched = terms
            .iter()
            .filter(|term| text.contains(&term.to_lowercase()))
            .count();

        if matched == 0 {
            return NO_MATCH_SCORE;
        }

        let fraction = matched as f32 / terms.len() as f32;
        (fraction * (MATCH_CEILING - MATCH_FLOOR) + MATCH_FLOOR).min(MATCH_CEILING)
    }

    pub fn rank(
        &self,
        terms: &[String],
        snapshot: &CatalogSnapshot,
        params: &FindSimilarParams,
    ) -> Ranking {
        let mut scored: Vec<Ranked> = snapshot
            .items()
            .iter()
            .enumerate()
            .map(|(position, item)| Ranked {
                position,
                score: Self::score(terms, &item.text_fields()),
            })
            .collect();

        // stable: equal scores keep catalog order
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));

        let ranked = scored
            .into_iter()
            .filter(|r| params.accepts_score(r.score))
            .filter(|r| {
                snapshot
                    .at(r.position)
                    .is_some_and(|item| params.matches_category(&item.category))
            })
            .take(params.max_results)
            .collect();

        Ranking {
            ranked,
            stale_dropped: 0,
        }
    }
}

impl RankingStrategy for KeywordOverlapRanker {
    fn tier(&self) -> DegradationTier {
        DegradationTier::KeywordOverlap
    }

    fn attempt(&self, request: &RankRequest<'_>) -> Result<Ranking, StrategyError> {
        Ok(self.rank(request.terms, request.snapshot, request.params))
    }
}

/// Catalog order with decreasing synthetic scores.
///
/// The scores carry no similarity signal; responses built from this ranker
/// are flagged `synthetic`.
#[derive(Debug, Clone, Copy)]
pub struct DeterministicRanker {
    jitter: f32,
}

impl DeterministicRanker {
    /// `jitter` bounds the random perturbation added to each score. Zero
    /// makes the output fully reproducible.
    pub fn new(jitter: f32) -> Self {
        Self {
            jitter: jitter.abs(),
        }
    }

    pub fn base_score(rank: usize) -> f32 {
        (SYNTHETIC_START - SYNTHETIC_STEP * rank as f32).max(SYNTHETIC_FLOOR)
    }

    pub fn rank(&self, snapshot: &CatalogSnapshot, params: &FindSimilarParams) -> Ranking {
        let mut rng = rand::rng();

        let ranked = snapshot
            .items()
            .iter()
            .enumerate()
            .filter(|(_, item)| params.matches_category(&item.category))
            .take(params.max_results)
            .enumerate()
            .map(|(rank, (position, _))| {
                let noise = if self.jitter > 0.0 {
                    rng.random_range(-self.jitter..=self.jitter)
                } else {
                    0.0
                };
                Ranked {
                    position,
                    score: (Self::base_score(rank) + noise).clamp(SYNTHETIC_FLOOR, SYNTHETIC_CEILING),
                }
            })
            .filter(|r| params.accepts_score(r.score))
            .collect();

        Ranking {
            ranked,
            stale_dropped: 0,
        }
    }
}

impl Default for DeterministicRanker {
    fn default() -> Self {
        Self::new(0.1)
    }
}

impl RankingStrategy for DeterministicRanker {
    fn tier(&self) -> DegradationTier {
        DegradationTier::Deterministic
    }

    fn attempt(&self, request: &RankRequest<'_>) -> Result<Ranking, StrategyError> {
        Ok(self.rank(request.snapshot, request.params))
    }
}
