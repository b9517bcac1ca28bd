//! Deterministic providers and fixtures for engine and HTTP tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::catalog::CatalogItem;
use crate::images::ImageFetcher;
use crate::similarity::embeddings::{EmbeddingError, ImageEmbedder, TextEmbedder};

pub fn item(id: &str, category: &str) -> CatalogItem {
    CatalogItem::new(id, format!("Item {id}"), category, id)
}

/// Image embedder that maps the image bytes (read as UTF-8) to a fixed vector.
///
/// Catalog items use their id as `image_url`, so with [`EchoFetcher`] or a
/// byte query of the same text both sides resolve to the same vector.
pub struct StubImageEmbedder {
    dimensions: usize,
    vectors: HashMap<String, Vec<f32>>,
    calls: AtomicUsize,
}

impl StubImageEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            vectors: HashMap::new(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with(mut self, key: &str, vector: Vec<f32>) -> Self {
        self.vectors.insert(key.to_string(), vector);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ImageEmbedder for StubImageEmbedder {
    fn name(&self) -> &str {
        "stub-image"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed_image(&self, bytes: &[u8]) -> Result<Vec<f32>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let key = String::from_utf8_lossy(bytes).to_string();
        self.vectors
            .get(&key)
            .cloned()
            .ok_or_else(|| EmbeddingError::EmbeddingFailed(format!("cannot decode image '{key}'")))
    }
}

/// Bag-of-words text embedder: every word increments one hashed bucket.
pub struct StubTextEmbedder {
    dimensions: usize,
    single_calls: AtomicUsize,
    batch_calls: AtomicUsize,
    fail_batches: AtomicBool,
}

impl StubTextEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            single_calls: AtomicUsize::new(0),
            batch_calls: AtomicUsize::new(0),
            fail_batches: AtomicBool::new(false),
        }
    }

    /// Make every `embed_batch` call fail; single texts still embed.
    pub fn failing_batches(self) -> Self {
        self.fail_batches.store(true, Ordering::SeqCst);
        self
    }

    pub fn single_calls(&self) -> usize {
        self.single_calls.load(Ordering::SeqCst)
    }

    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    fn bag_of_words(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0; self.dimensions];
        for word in text.to_lowercase().split_whitespace() {
            vector[self.bucket(word)] += 1.0;
        }
        vector
    }

    fn bucket(&self, word: &str) -> usize {
        word.bytes()
            .fold(7usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize))
            % self.dimensions
    }
}

impl TextEmbedder for StubTextEmbedder {
    fn name(&self) -> &str {
        "stub-text"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed_text(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.single_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.bag_of_words(text))
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_batches.load(Ordering::SeqCst) {
            return Err(EmbeddingError::EmbeddingFailed("batch rejected".into()));
        }
        Ok(texts.iter().map(|text| self.bag_of_words(text)).collect())
    }
}

/// Returns the URL itself as the image bytes. `bad://` URLs fail.
pub struct EchoFetcher;

impl ImageFetcher for EchoFetcher {
    fn fetch(&self, url: &str) -> anyhow::Result<Vec<u8>> {
        if url.starts_with("bad://") {
            anyhow::bail!("unreachable host in {url}");
        }
        Ok(url.as_bytes().to_vec())
    }
}

/// Serves a small PNG for every URL. `bad://` URLs fail.
pub struct PngFetcher;

impl ImageFetcher for PngFetcher {
    fn fetch(&self, url: &str) -> anyhow::Result<Vec<u8>> {
        if url.starts_with("bad://") {
            anyhow::bail!("unreachable host in {url}");
        }
        crate::images::probe_png()
    }
}
