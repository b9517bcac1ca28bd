//! Ranking strategies and the degradation ladder.
//!
//! Each tier is a [`RankingStrategy`] with one uniform `attempt` call. The
//! engine keeps an ordered list of them and walks it until one answers, so
//! fallback is a plain loop rather than nested error handling.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::embeddings::{model_id_hash, EmbeddingError, ImageEmbedder, TextEmbedder};
use super::index::{normalize, IndexError, VectorIndex};
use super::query::{preprocess_item_text, FindSimilarParams, QuerySource};
use crate::catalog::{CatalogItem, CatalogSnapshot};
use crate::images::ImageFetcher;

/// Capability level of the engine, lowest first.
///
/// `Ord` follows quality: `FullEmbedding` is the greatest value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationTier {
    Deterministic,
    KeywordOverlap,
    TextEmbedding,
    FullEmbedding,
}

impl DegradationTier {
    /// All tiers, best first.
    pub const LADDER: [DegradationTier; 4] = [
        DegradationTier::FullEmbedding,
        DegradationTier::TextEmbedding,
        DegradationTier::KeywordOverlap,
        DegradationTier::Deterministic,
    ];

    pub fn label(self) -> &'static str {
        match self {
            DegradationTier::FullEmbedding => "full",
            DegradationTier::TextEmbedding => "text",
            DegradationTier::KeywordOverlap => "keyword",
            DegradationTier::Deterministic => "deterministic",
        }
    }

    pub fn quality(self) -> ResultQuality {
        match self {
            DegradationTier::FullEmbedding | DegradationTier::TextEmbedding => {
                ResultQuality::Similarity
            }
            DegradationTier::KeywordOverlap => ResultQuality::Heuristic,
            DegradationTier::Deterministic => ResultQuality::Synthetic,
        }
    }
}

impl fmt::Display for DegradationTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// How much a result list can be trusted as a similarity ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultQuality {
    /// Cosine similarity from an embedding model
    Similarity,
    /// Keyword overlap between query file name and item text
    Heuristic,
    /// Catalog order with synthetic scores; not a similarity signal
    Synthetic,
}

/// Everything a strategy needs to answer one query.
pub struct RankRequest<'a> {
    pub source: &'a QuerySource,
    /// Terms derived from the query file name
    pub terms: &'a [String],
    pub params: &'a FindSimilarParams,
    pub snapshot: &'a CatalogSnapshot,
    pub index: &'a VectorIndex,
    /// Candidates fetched per requested result before filtering
    pub overfetch: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ranked {
    /// Position of the item in the request's snapshot
    pub position: usize,
    pub score: f32,
}

/// Ranked snapshot positions, already filtered and truncated.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ranking {
    pub ranked: Vec<Ranked>,
    /// Index candidates whose item is no longer in the snapshot
    pub stale_dropped: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum StrategyError {
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Index(#[from] IndexError),
}

pub trait RankingStrategy: Send + Sync {
    fn tier(&self) -> DegradationTier;

    fn attempt(&self, request: &RankRequest<'_>) -> Result<Ranking, StrategyError>;
}

/// Turns query sources and catalog items into vectors for one vector tier.
pub enum QueryEncoder {
    Image {
        embedder: Arc<dyn ImageEmbedder>,
        fetcher: Arc<dyn ImageFetcher>,
    },
    Text(Arc<dyn TextEmbedder>),
}

/// Vector-index tier (FullEmbedding or TextEmbedding).
pub struct VectorStrategy {
    encoder: QueryEncoder,
}

impl VectorStrategy {
    pub fn image(embedder: Arc<dyn ImageEmbedder>, fetcher: Arc<dyn ImageFetcher>) -> Self {
        Self {
            encoder: QueryEncoder::Image { embedder, fetcher },
        }
    }

    pub fn text(embedder: Arc<dyn TextEmbedder>) -> Self {
        Self {
            encoder: QueryEncoder::Text(embedder),
        }
    }

    pub fn dimensions(&self) -> usize {
        match &self.encoder {
            QueryEncoder::Image { embedder, .. } => embedder.dimensions(),
            QueryEncoder::Text(embedder) => embedder.dimensions(),
        }
    }

    pub fn model_name(&self) -> &str {
        match &self.encoder {
            QueryEncoder::Image { embedder, .. } => embedder.name(),
            QueryEncoder::Text(embedder) => embedder.name(),
        }
    }

    /// Identity of the provider, stamped into the persisted index.
    pub fn model_id(&self) -> [u8; 32] {
        model_id_hash(self.tier().label(), self.model_name())
    }

    /// Image embeddings are written back to the catalog; text embeddings
    /// are only kept in the index.
    pub fn uses_catalog_embeddings(&self) -> bool {
        matches!(self.encoder, QueryEncoder::Image { .. })
    }

    /// Compute the raw (not yet normalized) query vector.
    pub fn encode_query(&self, source: &QuerySource) -> Result<Vec<f32>, EmbeddingError> {
        let vector = match (source, &self.encoder) {
            (QuerySource::Embedding(vector), _) => vector.clone(),
            (QuerySource::Bytes { data, .. }, QueryEncoder::Image { embedder, .. }) => {
                embedder.embed_image(data)?
            }
            (QuerySource::Path(path), QueryEncoder::Image { embedder, .. }) => {
                let data = std::fs::read(path)
                    .map_err(|e| EmbeddingError::Source(format!("{}: {}", path.display(), e)))?;
                embedder.embed_image(&data)?
            }
            (QuerySource::Url(url), QueryEncoder::Image { embedder, fetcher }) => {
                let data = fetcher
                    .fetch(url)
                    .map_err(|e| EmbeddingError::Source(format!("{e:#}")))?;
                embedder.embed_image(&data)?
            }
            (_, QueryEncoder::Text(embedder)) => {
                let terms = source.terms();
                if terms.is_empty() {
                    return Err(EmbeddingError::NoQueryText);
                }
                embedder.embed_text(&terms.join(" "))?
            }
        };

        self.check_dimensions(vector)
    }

    /// Compute the vector stored for a catalog item.
    pub fn encode_item(&self, item: &CatalogItem) -> Result<Vec<f32>, EmbeddingError> {
        let vector = match &self.encoder {
            QueryEncoder::Image { embedder, fetcher } => {
                let data = if item.image_url.starts_with("http://")
                    || item.image_url.starts_with("https://")
                {
                    fetcher
                        .fetch(&item.image_url)
                        .map_err(|e| EmbeddingError::Source(format!("{e:#}")))?
                } else {
                    std::fs::read(&item.image_url)
                        .map_err(|e| EmbeddingError::Source(format!("{}: {}", item.image_url, e)))?
                };
                embedder.embed_image(&data)?
            }
            QueryEncoder::Text(embedder) => {
                let text = preprocess_item_text(&item.text_fields()).ok_or_else(|| {
                    EmbeddingError::EmbeddingFailed(format!("item {} has no text", item.id))
                })?;
                embedder.embed_text(&text)?
            }
        };

        self.check_dimensions(vector)
    }

    /// Compute item vectors in bulk, one result per item in order.
    ///
    /// The text tier embeds every item text in a single batch; if the batch
    /// fails, items are retried one at a time so one bad text cannot sink
    /// the rest. Image items are always fetched and embedded one by one.
    pub fn encode_items(&self, items: &[&CatalogItem]) -> Vec<Result<Vec<f32>, EmbeddingError>> {
        let QueryEncoder::Text(embedder) = &self.encoder else {
            return items.iter().map(|item| self.encode_item(item)).collect();
        };

        let texts: Vec<Option<String>> = items
            .iter()
            .map(|item| preprocess_item_text(&item.text_fields()))
            .collect();
        let batch: Vec<String> = texts.iter().flatten().cloned().collect();

        let mut vectors = match embedder.embed_batch(&batch) {
            Ok(vectors) if vectors.len() == batch.len() => vectors.into_iter(),
            Ok(vectors) => {
                log::warn!(
                    "Batch returned {} embeddings for {} texts, embedding one at a time",
                    vectors.len(),
                    batch.len()
                );
                return items.iter().map(|item| self.encode_item(item)).collect();
            }
            Err(e) => {
                log::warn!("Batch embedding failed, embedding one at a time: {}", e);
                return items.iter().map(|item| self.encode_item(item)).collect();
            }
        };

        items
            .iter()
            .zip(texts)
            .map(|(item, text)| match text {
                Some(_) => vectors
                    .next()
                    .ok_or_else(|| EmbeddingError::EmbeddingFailed("batch exhausted".into()))
                    .and_then(|vector| self.check_dimensions(vector)),
                None => Err(EmbeddingError::EmbeddingFailed(format!(
                    "item {} has no text",
                    item.id
                ))),
            })
            .collect()
    }

    fn check_dimensions(&self, vector: Vec<f32>) -> Result<Vec<f32>, EmbeddingError> {
        let expected = self.dimensions();
        if vector.len() != expected {
            return Err(EmbeddingError::DimensionMismatch {
                expected,
                got: vector.len(),
            });
        }
        Ok(vector)
    }
}

impl RankingStrategy for VectorStrategy {
    fn tier(&self) -> DegradationTier {
        match self.encoder {
            QueryEncoder::Image { .. } => DegradationTier::FullEmbedding,
            QueryEncoder::Text(_) => DegradationTier::TextEmbedding,
        }
    }

    fn attempt(&self, request: &RankRequest<'_>) -> Result<Ranking, StrategyError> {
        let query = normalize(&self.encode_query(request.source)?);
        let params = request.params;

        let mut ranking = Ranking::default();
        if request.index.is_empty() {
            return Ok(ranking);
        }

        let k = request
            .overfetch
            .max(1)
            .saturating_mul(params.max_results)
            .min(request.index.len());

        for hit in request.index.search(&query, k)? {
            if ranking.ranked.len() >= params.max_results {
                break;
            }
            if !params.accepts_score(hit.score) {
                continue;
            }
            let Some(position) = request.snapshot.position_of(&hit.item_id) else {
                log::debug!("Dropping stale index row {} ({})", hit.row, hit.item_id);
                ranking.stale_dropped += 1;
                continue;
            };
            if let Some(item) = request.snapshot.at(position) {
                if params.matches_category(&item.category) {
                    ranking.ranked.push(Ranked {
                        position,
                        score: hit.score,
                    });
                }
            }
        }

        Ok(ranking)
    }
}
