//! Similarity engine.
//!
//! Owns the vector index and the ordered list of ranking strategies:
//! - Picks the best tier whose provider initializes, once, at construction
//! - Loads the persisted index or builds it from the catalog
//! - Answers queries, falling back down the ladder for a single query when
//!   its tier fails
//! - Serializes index mutations and persists after each one

use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;

use super::embeddings::{EmbeddingError, ImageEmbedder, TextEmbedder};
use super::fallback::{DeterministicRanker, KeywordOverlapRanker};
use super::index::{IndexError, VectorIndex};
use super::persistence::{IndexStorage, IndexStorageError};
use super::query::{FindSimilarParams, QuerySource};
use super::strategy::{
    DegradationTier, RankRequest, Ranking, RankingStrategy, ResultQuality, VectorStrategy,
};
use crate::catalog::{CatalogError, CatalogItem, CatalogSnapshot, CatalogStore};
use crate::images::{HttpImageFetcher, ImageFetcher};
use crate::storage::BlobStore;

pub const DEFAULT_OVERFETCH_FACTOR: usize = 2;
pub const DEFAULT_DETERMINISTIC_JITTER: f32 = 0.1;

type ImageProviderInit =
    Box<dyn FnOnce() -> Result<Arc<dyn ImageEmbedder>, EmbeddingError> + Send>;
type TextProviderInit = Box<dyn FnOnce() -> Result<Arc<dyn TextEmbedder>, EmbeddingError> + Send>;

/// Errors raised by the similarity engine.
#[derive(Debug, thiserror::Error)]
pub enum SimilarityError {
    /// Fatal: the engine must not start
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("{tier} provider unavailable: {reason}")]
    ProviderUnavailable {
        tier: DegradationTier,
        reason: String,
    },

    #[error("Embedding computation failed: {0}")]
    EmbeddingCompute(#[from] EmbeddingError),

    #[error("Index persistence failed: {0}")]
    Persistence(#[from] IndexStorageError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Tier plan handed to [`SimilarityEngine::initialize`].
///
/// Providers are constructors, not instances: a tier above the one that
/// ends up chosen is only initialized if every tier above it failed.
pub struct EngineSetup {
    max_tier: DegradationTier,
    strict: bool,
    image_provider: Option<ImageProviderInit>,
    text_provider: Option<TextProviderInit>,
    fetcher: Arc<dyn ImageFetcher>,
    expected_dimensions: Option<usize>,
    overfetch_factor: usize,
    deterministic_jitter: f32,
}

impl EngineSetup {
    /// Plan whose best tier is `max_tier`. Tiers that need a provider stay
    /// unavailable until one is supplied.
    pub fn new(max_tier: DegradationTier) -> Self {
        Self {
            max_tier,
            strict: false,
            image_provider: None,
            text_provider: None,
            fetcher: Arc::new(HttpImageFetcher::default()),
            expected_dimensions: None,
            overfetch_factor: DEFAULT_OVERFETCH_FACTOR,
            deterministic_jitter: DEFAULT_DETERMINISTIC_JITTER,
        }
    }

    /// Fail initialization instead of degrading below `max_tier`.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn with_image_provider<F>(mut self, init: F) -> Self
    where
        F: FnOnce() -> Result<Arc<dyn ImageEmbedder>, EmbeddingError> + Send + 'static,
    {
        self.image_provider = Some(Box::new(init));
        self
    }

    pub fn with_image_embedder(self, embedder: Arc<dyn ImageEmbedder>) -> Self {
        self.with_image_provider(move || Ok(embedder))
    }

    pub fn with_text_provider<F>(mut self, init: F) -> Self
    where
        F: FnOnce() -> Result<Arc<dyn TextEmbedder>, EmbeddingError> + Send + 'static,
    {
        self.text_provider = Some(Box::new(init));
        self
    }

    pub fn with_text_embedder(self, embedder: Arc<dyn TextEmbedder>) -> Self {
        self.with_text_provider(move || Ok(embedder))
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn ImageFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    /// Dimension the deployment expects; a provider producing anything
    /// else is a configuration error.
    pub fn expected_dimensions(mut self, dimensions: Option<usize>) -> Self {
        self.expected_dimensions = dimensions;
        self
    }

    pub fn overfetch_factor(mut self, factor: usize) -> Self {
        self.overfetch_factor = factor;
        self
    }

    pub fn deterministic_jitter(mut self, jitter: f32) -> Self {
        self.deterministic_jitter = jitter;
        self
    }
}

/// A tier that was skipped during initialization and why.
#[derive(Debug, Clone, Serialize)]
pub struct SkippedTier {
    pub tier: DegradationTier,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub tier: DegradationTier,
    pub max_tier: DegradationTier,
    pub quality: ResultQuality,
    pub model: Option<String>,
    pub dimensions: Option<usize>,
    pub index_size: usize,
    pub skipped: Vec<SkippedTier>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimilarityMatch {
    pub product: CatalogItem,
    pub similarity_score: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimilarityResponse {
    pub matches: Vec<SimilarityMatch>,
    /// Tier that produced this list
    pub tier: DegradationTier,
    pub quality: ResultQuality,
    /// Set when this query fell back below the engine's tier
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
    #[serde(skip_serializing_if = "is_zero")]
    pub stale_dropped: usize,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

pub struct SimilarityEngine {
    tier: DegradationTier,
    max_tier: DegradationTier,
    skipped: Vec<SkippedTier>,
    vector: Option<Arc<VectorStrategy>>,
    /// Chosen tier first, then every lower tier
    ladder: Vec<Arc<dyn RankingStrategy>>,
    /// Swapped whole on rebuild; appends copy-on-write
    index: RwLock<Arc<VectorIndex>>,
    /// Single-writer discipline for index mutations and saves
    writer: Mutex<()>,
    catalog: Arc<dyn CatalogStore>,
    storage: IndexStorage,
    overfetch: usize,
    /// Last snapshot successfully read from the catalog
    last_snapshot: RwLock<Arc<CatalogSnapshot>>,
}

impl SimilarityEngine {
    /// Select a tier, then load or build the index for it.
    ///
    /// Provider failures degrade the tier. Configuration errors (strict mode
    /// below the configured tier, mismatched dimensions) are returned.
    pub fn initialize(
        setup: EngineSetup,
        catalog: Arc<dyn CatalogStore>,
        store: Arc<dyn BlobStore>,
    ) -> Result<Self, SimilarityError> {
        let EngineSetup {
            max_tier,
            strict,
            mut image_provider,
            mut text_provider,
            fetcher,
            expected_dimensions,
            overfetch_factor,
            deterministic_jitter,
        } = setup;

        if overfetch_factor == 0 {
            return Err(SimilarityError::Configuration(
                "overfetch factor must be at least 1".into(),
            ));
        }
        if expected_dimensions == Some(0) {
            return Err(SimilarityError::Configuration(
                "embedding dimension must be at least 1".into(),
            ));
        }

        let mut skipped = Vec::new();
        let mut chosen = DegradationTier::Deterministic;
        let mut vector: Option<Arc<VectorStrategy>> = None;

        for tier in DegradationTier::LADDER.into_iter().filter(|t| *t <= max_tier) {
            let attempt = match tier {
                DegradationTier::FullEmbedding => match image_provider.take() {
                    Some(init) => init()
                        .map(|embedder| Some(VectorStrategy::image(embedder, fetcher.clone()))),
                    None => Err(EmbeddingError::InitFailed("no image model configured".into())),
                },
                DegradationTier::TextEmbedding => match text_provider.take() {
                    Some(init) => init().map(|embedder| Some(VectorStrategy::text(embedder))),
                    None => Err(EmbeddingError::InitFailed("no text model configured".into())),
                },
                DegradationTier::KeywordOverlap | DegradationTier::Deterministic => Ok(None),
            };

            match attempt {
                Ok(strategy) => {
                    chosen = tier;
                    vector = strategy.map(Arc::new);
                    break;
                }
                Err(e) => {
                    let unavailable = SimilarityError::ProviderUnavailable {
                        tier,
                        reason: e.to_string(),
                    };
                    log::warn!("{}, trying next tier", unavailable);
                    skipped.push(SkippedTier {
                        tier,
                        reason: e.to_string(),
                    });
                }
            }
        }

        if strict && chosen != max_tier {
            let reasons: Vec<String> = skipped
                .iter()
                .map(|s| format!("{}: {}", s.tier, s.reason))
                .collect();
            return Err(SimilarityError::Configuration(format!(
                "tier {} is required but unavailable ({})",
                max_tier,
                reasons.join("; ")
            )));
        }

        if let (Some(vector), Some(expected)) = (&vector, expected_dimensions) {
            if vector.dimensions() != expected {
                return Err(SimilarityError::Configuration(format!(
                    "model {} produces {}-dimension embeddings, configured embedding_dim is {}",
                    vector.model_name(),
                    vector.dimensions(),
                    expected
                )));
            }
        }

        log::info!("Similarity engine using tier '{}'", chosen);

        let items = catalog.list_items()?;
        let storage = IndexStorage::new(store);

        let index = match &vector {
            Some(vector) => load_or_build(vector, &storage, catalog.as_ref(), &items)?,
            None => VectorIndex::new(0),
        };

        let mut ladder: Vec<Arc<dyn RankingStrategy>> = Vec::new();
        if let Some(vector) = &vector {
            ladder.push(vector.clone());
        }
        if chosen >= DegradationTier::KeywordOverlap {
            ladder.push(Arc::new(KeywordOverlapRanker));
        }
        ladder.push(Arc::new(DeterministicRanker::new(deterministic_jitter)));

        Ok(Self {
            tier: chosen,
            max_tier,
            skipped,
            vector,
            ladder,
            index: RwLock::new(Arc::new(index)),
            writer: Mutex::new(()),
            catalog,
            storage,
            overfetch: overfetch_factor,
            last_snapshot: RwLock::new(Arc::new(CatalogSnapshot::new(items))),
        })
    }

    pub fn tier(&self) -> DegradationTier {
        self.tier
    }

    pub fn index_len(&self) -> usize {
        self.current_index().len()
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            tier: self.tier,
            max_tier: self.max_tier,
            quality: self.tier.quality(),
            model: self.vector.as_ref().map(|v| v.model_name().to_string()),
            dimensions: self.vector.as_ref().map(|v| v.dimensions()),
            index_size: self.index_len(),
            skipped: self.skipped.clone(),
        }
    }

    /// Rank catalog items against a query.
    ///
    /// Always answers with a list unless the query itself is invalid. A tier
    /// that fails for this query hands over to the next lower one, and the
    /// response records why.
    pub fn find_similar(
        &self,
        source: &QuerySource,
        params: &FindSimilarParams,
    ) -> Result<SimilarityResponse, SimilarityError> {
        params.validate().map_err(SimilarityError::InvalidQuery)?;

        let mut fallback_reason = None;
        let (snapshot, catalog_ok) = match self.catalog.list_items() {
            Ok(items) => {
                let snapshot = Arc::new(CatalogSnapshot::new(items));
                if let Ok(mut last) = self.last_snapshot.write() {
                    *last = snapshot.clone();
                }
                (snapshot, true)
            }
            Err(e) => {
                log::warn!("Catalog unavailable, answering from last snapshot: {}", e);
                fallback_reason = Some(format!("catalog: {}", e));
                (self.cached_snapshot(), false)
            }
        };

        let index = self.current_index();
        let terms = source.terms();
        let request = RankRequest {
            source,
            terms: &terms,
            params,
            snapshot: &snapshot,
            index: &index,
            overfetch: self.overfetch,
        };

        for strategy in &self.ladder {
            let tier = strategy.tier();
            if !catalog_ok && tier != DegradationTier::Deterministic {
                continue;
            }

            match strategy.attempt(&request) {
                Ok(ranking) => return Ok(respond(tier, ranking, &snapshot, fallback_reason)),
                Err(e) => {
                    log::warn!("Tier '{}' failed for this query, falling back: {}", tier, e);
                    fallback_reason.get_or_insert_with(|| format!("{}: {}", tier, e));
                }
            }
        }

        // the deterministic ranker never fails, so the ladder always answers
        Ok(respond(
            DegradationTier::Deterministic,
            Ranking::default(),
            &snapshot,
            fallback_reason,
        ))
    }

    /// Append one catalog item to the index.
    ///
    /// Returns the row it was stored in, or `None` when the engine has no
    /// vector tier. The stored embedding (on the item or in the catalog) is
    /// reused when present; otherwise it is computed and written back.
    pub fn add_product_to_index(&self, item: &CatalogItem) -> Result<Option<usize>, SimilarityError> {
        let Some(vector) = &self.vector else {
            return Ok(None);
        };

        let _writer = self
            .writer
            .lock()
            .map_err(|e| SimilarityError::Internal(format!("Lock poisoned: {}", e)))?;

        if let Some(row) = self.current_index().row_of(&item.id) {
            log::debug!("Item {} already indexed at row {}", item.id, row);
            return Ok(Some(row));
        }

        let embedding = self.item_embedding(vector, item)?;

        let (row, updated) = {
            let mut slot = self
                .index
                .write()
                .map_err(|e| SimilarityError::Internal(format!("Lock poisoned: {}", e)))?;
            let row = Arc::make_mut(&mut *slot)
                .add(item.id.clone(), &embedding)
                .map_err(index_add_error)?;
            (row, Arc::clone(&slot))
        };

        self.persist(&updated, &vector.model_id());
        log::info!("Indexed item {} at row {}", item.id, row);
        Ok(Some(row))
    }

    /// Recompute every embedding and atomically replace the index.
    ///
    /// Queries running during the rebuild keep using the old index.
    pub fn rebuild_index(&self) -> Result<usize, SimilarityError> {
        let Some(vector) = &self.vector else {
            return Ok(0);
        };

        let _writer = self
            .writer
            .lock()
            .map_err(|e| SimilarityError::Internal(format!("Lock poisoned: {}", e)))?;

        let items = self.catalog.list_items()?;
        let fresh = Arc::new(build_index(vector, self.catalog.as_ref(), &items, false)?);

        {
            let mut slot = self
                .index
                .write()
                .map_err(|e| SimilarityError::Internal(format!("Lock poisoned: {}", e)))?;
            *slot = fresh.clone();
        }
        if let Ok(mut last) = self.last_snapshot.write() {
            *last = Arc::new(CatalogSnapshot::new(items));
        }

        self.persist(&fresh, &vector.model_id());
        log::info!("Rebuilt index with {} vectors", fresh.len());
        Ok(fresh.len())
    }

    fn item_embedding(
        &self,
        vector: &VectorStrategy,
        item: &CatalogItem,
    ) -> Result<Vec<f32>, SimilarityError> {
        if !vector.uses_catalog_embeddings() {
            return Ok(vector.encode_item(item)?);
        }

        let stored = match &item.embedding {
            Some(embedding) => Some(embedding.clone()),
            None => match self.catalog.get_item_embedding(&item.id) {
                Ok(embedding) => embedding,
                Err(CatalogError::NotFound(_)) => None,
                Err(e) => return Err(e.into()),
            },
        };
        if let Some(embedding) = stored {
            if embedding.len() == vector.dimensions() {
                return Ok(embedding);
            }
            log_stale(item, embedding.len(), vector.dimensions());
        }

        let embedding = vector.encode_item(item)?;
        if let Err(e) = self.catalog.set_item_embedding(&item.id, embedding.clone()) {
            log::warn!("Could not store embedding for item {}: {}", item.id, e);
        }
        Ok(embedding)
    }

    fn persist(&self, index: &VectorIndex, model_id: &[u8; 32]) {
        save_with_retry(&self.storage, index, model_id);
    }

    fn current_index(&self) -> Arc<VectorIndex> {
        match self.index.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn cached_snapshot(&self) -> Arc<CatalogSnapshot> {
        match self.last_snapshot.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

fn respond(
    tier: DegradationTier,
    ranking: Ranking,
    snapshot: &CatalogSnapshot,
    fallback_reason: Option<String>,
) -> SimilarityResponse {
    let matches = ranking
        .ranked
        .iter()
        .filter_map(|r| {
            snapshot.at(r.position).map(|item| SimilarityMatch {
                product: item.without_embedding(),
                similarity_score: r.score,
            })
        })
        .collect();

    SimilarityResponse {
        matches,
        tier,
        quality: tier.quality(),
        fallback_reason,
        stale_dropped: ranking.stale_dropped,
    }
}

fn index_add_error(e: IndexError) -> SimilarityError {
    match e {
        IndexError::DimensionMismatch { expected, got } => {
            SimilarityError::EmbeddingCompute(EmbeddingError::DimensionMismatch { expected, got })
        }
        other => SimilarityError::Internal(other.to_string()),
    }
}

fn log_stale(item: &CatalogItem, got: usize, expected: usize) {
    log::warn!(
        "Stored embedding of item {} has {} dimensions, expected {}; recomputing",
        item.id,
        got,
        expected
    );
}

fn load_or_build(
    vector: &VectorStrategy,
    storage: &IndexStorage,
    catalog: &dyn CatalogStore,
    items: &[CatalogItem],
) -> Result<VectorIndex, SimilarityError> {
    let model_id = vector.model_id();
    let dimensions = vector.dimensions();

    match storage.load(&model_id, dimensions) {
        Ok(Some(index)) => {
            log::info!("Loaded {} vectors from storage", index.len());
            return Ok(index);
        }
        Ok(None) => log::info!("No existing index, building from catalog"),
        Err(IndexStorageError::DimensionMismatch { expected, got }) => {
            return Err(SimilarityError::Configuration(format!(
                "persisted index has {}-dimension vectors, model {} produces {}",
                got,
                vector.model_name(),
                expected
            )));
        }
        Err(IndexStorageError::ModelMismatch) => {
            log::warn!("Model changed, rebuilding index");
        }
        Err(e) => {
            log::warn!("Failed to load index, rebuilding: {}", e);
        }
    }

    let index = build_index(vector, catalog, items, true)?;
    save_with_retry(storage, &index, &model_id);
    Ok(index)
}

/// Save the index, retrying once. Failure is logged, never returned: the
/// in-memory index stays authoritative.
fn save_with_retry(storage: &IndexStorage, index: &VectorIndex, model_id: &[u8; 32]) {
    let Err(first) = storage.save(index, model_id) else {
        return;
    };
    log::warn!("Failed to persist index, retrying: {}", first);

    if let Err(second) = storage.save(index, model_id) {
        log::error!("Failed to persist index after retry: {}", second);
    }
}

/// Embed every item into a fresh index. Items whose embedding cannot be
/// computed are skipped. With `reuse_stored`, image embeddings already in
/// the catalog are reused when they match the model dimension; any other
/// stored embedding is stale and recomputed.
fn build_index(
    vector: &VectorStrategy,
    catalog: &dyn CatalogStore,
    items: &[CatalogItem],
    reuse_stored: bool,
) -> Result<VectorIndex, SimilarityError> {
    let dimensions = vector.dimensions();
    let write_back = vector.uses_catalog_embeddings();

    let mut embeddings: Vec<Option<Vec<f32>>> = Vec::with_capacity(items.len());
    let mut pending = Vec::new();
    for item in items {
        let stored = match &item.embedding {
            Some(embedding) if reuse_stored && write_back => {
                if embedding.len() == dimensions {
                    Some(embedding.clone())
                } else {
                    log_stale(item, embedding.len(), dimensions);
                    None
                }
            }
            _ => None,
        };
        if stored.is_none() {
            pending.push(embeddings.len());
        }
        embeddings.push(stored);
    }

    let to_encode: Vec<&CatalogItem> = pending.iter().map(|&i| &items[i]).collect();
    for (i, computed) in pending.iter().zip(vector.encode_items(&to_encode)) {
        let item = &items[*i];
        match computed {
            Ok(embedding) => {
                if write_back {
                    if let Err(e) = catalog.set_item_embedding(&item.id, embedding.clone()) {
                        log::warn!("Could not store embedding for item {}: {}", item.id, e);
                    }
                }
                embeddings[*i] = Some(embedding);
            }
            Err(e) => log::warn!("Skipping item {}: {}", item.id, e),
        }
    }

    let mut index = VectorIndex::with_capacity(dimensions, items.len());
    let mut skipped = 0;
    for (item, embedding) in items.iter().zip(embeddings) {
        let Some(embedding) = embedding else {
            skipped += 1;
            continue;
        };
        if let Err(e) = index.add(item.id.clone(), &embedding) {
            log::warn!("Skipping item {}: {}", item.id, e);
            skipped += 1;
        }
    }

    log::info!(
        "Indexed {} of {} catalog items ({} skipped)",
        index.len(),
        items.len(),
        skipped
    );
    Ok(index)
}
