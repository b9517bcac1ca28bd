//! Visual similarity search over the product catalog.
//!
//! # Architecture
//!
//! - `index`: exact inner-product index over unit vectors, one item id per row
//! - `persistence`: binary `index.bin` codec with model id and checksums
//! - `embeddings`: image/text embedding provider traits and fastembed models
//! - `query`: query sources, search parameters, filename terms
//! - `strategy`: tiers, the `RankingStrategy` contract, vector search tier
//! - `fallback`: keyword-overlap and deterministic rankers
//! - `engine`: tier selection, index lifecycle, `find_similar`

pub mod embeddings;
pub mod engine;
pub mod fallback;
pub mod index;
pub mod persistence;
pub mod query;
pub mod strategy;

pub use embeddings::{
    EmbeddingError, FastEmbedImageModel, FastEmbedTextModel, ImageEmbedder, TextEmbedder,
};
pub use engine::{
    EngineSetup, EngineStatus, SimilarityEngine, SimilarityError, SimilarityMatch,
    SimilarityResponse,
};
pub use index::{normalize, VectorIndex};
pub use query::{FindSimilarParams, QuerySource};
pub use strategy::{DegradationTier, ResultQuality};
