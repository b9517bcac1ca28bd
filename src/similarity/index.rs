//! Exact inner-product vector index.
//!
//! Vectors are unit-normalized on insert, so the inner product of a
//! normalized query and a row is their cosine similarity. Every row records
//! the id of the catalog item it was computed from; callers resolve hits by
//! that id, never by row position.

use std::cmp::Ordering;

use rayon::prelude::*;

/// A single hit returned by [`VectorIndex::search`].
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    /// Row the hit was read from
    pub row: usize,
    /// Catalog item the row belongs to
    pub item_id: String,
    /// Cosine similarity in [-1.0, 1.0]
    pub score: f32,
}

/// Brute-force index over unit vectors of one fixed dimension.
///
/// Vectors live in one row-major buffer; `ids[i]` owns the slice
/// `vectors[i * dimensions..(i + 1) * dimensions]`.
#[derive(Debug, Clone)]
pub struct VectorIndex {
    dimensions: usize,
    ids: Vec<String>,
    vectors: Vec<f32>,
}

impl VectorIndex {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            ids: Vec::new(),
            vectors: Vec::new(),
        }
    }

    pub fn with_capacity(dimensions: usize, capacity: usize) -> Self {
        Self {
            dimensions,
            ids: Vec::with_capacity(capacity),
            vectors: Vec::with_capacity(capacity * dimensions),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Normalize `vector` and append it as the new last row.
    ///
    /// Returns the row index assigned to it. Zero vectors are stored as-is
    /// and score 0.0 against every query.
    pub fn add(&mut self, item_id: impl Into<String>, vector: &[f32]) -> Result<usize, IndexError> {
        self.check_dimensions(vector.len())?;
        Ok(self.push_row(item_id.into(), &normalize(vector)))
    }

    /// Append a row that is already normalized. Used when loading persisted
    /// rows so the stored bits are reproduced exactly.
    pub(crate) fn push_normalized(
        &mut self,
        item_id: String,
        vector: &[f32],
    ) -> Result<usize, IndexError> {
        self.check_dimensions(vector.len())?;
        Ok(self.push_row(item_id, vector))
    }

    fn push_row(&mut self, item_id: String, vector: &[f32]) -> usize {
        self.ids.push(item_id);
        self.vectors.extend_from_slice(vector);
        self.ids.len() - 1
    }

    /// Item id stored for `row`.
    pub fn item_id(&self, row: usize) -> Option<&str> {
        self.ids.get(row).map(String::as_str)
    }

    /// Row holding `item_id`, if any. Linear scan.
    pub fn row_of(&self, item_id: &str) -> Option<usize> {
        self.ids.iter().position(|id| id == item_id)
    }

    /// Stored (normalized) vector for `row`.
    pub fn vector(&self, row: usize) -> Option<&[f32]> {
        if row >= self.len() {
            return None;
        }
        let start = row * self.dimensions;
        Some(&self.vectors[start..start + self.dimensions])
    }

    /// Iterate over `(item_id, vector)` in row order.
    pub fn rows(&self) -> impl Iterator<Item = (&str, &[f32])> {
        self.ids
            .iter()
            .map(String::as_str)
            .zip(self.vectors.chunks_exact(self.dimensions.max(1)))
    }

    /// Exact top-k search by inner product.
    ///
    /// `query` must already be unit-normalized. Returns at most
    /// `min(k, len)` hits ordered by descending score; equal scores keep
    /// ascending row order.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>, IndexError> {
        if k == 0 {
            return Err(IndexError::InvalidLimit);
        }
        self.check_dimensions(query.len())?;

        if self.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(usize, f32)> = self
            .vectors
            .par_chunks_exact(self.dimensions)
            .enumerate()
            .map(|(row, vector)| (row, dot(query, vector)))
            .collect();

        scored.sort_by(|a, b| match b.1.total_cmp(&a.1) {
            Ordering::Equal => a.0.cmp(&b.0),
            other => other,
        });
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(row, score)| SearchHit {
                row,
                item_id: self.ids[row].clone(),
                score,
            })
            .collect())
    }

    fn check_dimensions(&self, got: usize) -> Result<(), IndexError> {
        if got != self.dimensions || got == 0 {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got,
            });
        }
        Ok(())
    }
}

/// L2 norm of a vector.
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Scale `v` to unit L2 norm. All-zero (or non-finite norm) vectors are
/// returned unchanged.
pub fn normalize(v: &[f32]) -> Vec<f32> {
    let norm = l2_norm(v);
    if norm > 0.0 && norm.is_finite() {
        v.iter().map(|x| x / norm).collect()
    } else {
        v.to_vec()
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Errors that can occur during index operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Search limit must be at least 1")]
    InvalidLimit,
}
