//! Embedding providers.
//!
//! The engine consumes embeddings through two narrow traits so tests can
//! plug in deterministic providers and deployments can run without any
//! model at all:
//! - [`ImageEmbedder`] turns encoded image bytes into a vector
//! - [`TextEmbedder`] turns text into a vector
//!
//! The fastembed-backed implementations download their model on first use
//! and keep it behind a `Mutex`, since fastembed's embed calls need `&mut self`.

use std::path::PathBuf;
use std::sync::{mpsc, Mutex};
use std::time::Duration;

use fastembed::{ImageEmbedding, ImageInitOptions, InitOptions, TextEmbedding};

/// Default download timeout for model files (5 minutes)
pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

pub trait ImageEmbedder: Send + Sync {
    fn name(&self) -> &str;
    fn dimensions(&self) -> usize;
    /// Embed one encoded image (JPEG, PNG, WebP, BMP or GIF).
    fn embed_image(&self, bytes: &[u8]) -> Result<Vec<f32>, EmbeddingError>;
}

pub trait TextEmbedder: Send + Sync {
    fn name(&self) -> &str;
    fn dimensions(&self) -> usize;
    fn embed_text(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        texts.iter().map(|text| self.embed_text(text)).collect()
    }
}

/// Error type for embedding operations
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Model initialization failed: {0}")]
    InitFailed(String),

    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Model download timed out after {0} seconds")]
    DownloadTimeout(u64),

    #[error("Invalid model name: {0}")]
    InvalidModel(String),

    #[error("Embedding has {got} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Could not read image source: {0}")]
    Source(String),

    #[error("Unsupported image format")]
    UnsupportedImage,

    #[error("No text could be derived from the query")]
    NoQueryText,
}

/// SHA-256 identifying the provider a persisted index was built with.
///
/// The tier label is part of the hash so an image index and a text index
/// never load into each other even if they share a model name.
pub fn model_id_hash(tier_label: &str, model_name: &str) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(tier_label.as_bytes());
    hasher.update(b"/");
    hasher.update(model_name.as_bytes());
    hasher.finalize().into()
}

/// Run a model constructor on a helper thread and give up after `timeout`.
///
/// The constructor downloads model files on first use; a stalled download
/// must not hang engine initialization forever.
fn init_with_timeout<T, F>(timeout: Duration, init: F) -> Result<T, EmbeddingError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, EmbeddingError> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    std::thread::Builder::new()
        .name("model-init".into())
        .spawn(move || {
            let _ = tx.send(init());
        })
        .map_err(|e| EmbeddingError::InitFailed(format!("Failed to spawn init thread: {}", e)))?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => {
            Err(EmbeddingError::DownloadTimeout(timeout.as_secs()))
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(EmbeddingError::InitFailed(
            "Model initialization thread exited".to_string(),
        )),
    }
}

fn models_dir(cache_dir: PathBuf) -> Result<PathBuf, EmbeddingError> {
    let models_dir = cache_dir.join("models");
    std::fs::create_dir_all(&models_dir).map_err(|e| {
        EmbeddingError::InitFailed(format!("Failed to create models directory: {}", e))
    })?;
    Ok(models_dir)
}

/// CLIP-style image model served by fastembed.
pub struct FastEmbedImageModel {
    model: Mutex<ImageEmbedding>,
    model_name: String,
    dimensions: usize,
}

impl FastEmbedImageModel {
    /// Create a new image model with the given name.
    ///
    /// The model is downloaded into `cache_dir/models` on first use.
    pub fn new(
        model_name: &str,
        cache_dir: PathBuf,
        download_timeout: Option<Duration>,
    ) -> Result<Self, EmbeddingError> {
        let model_enum = Self::parse_model_name(model_name)?;
        let models_dir = models_dir(cache_dir)?;
        let timeout = download_timeout.unwrap_or(DEFAULT_DOWNLOAD_TIMEOUT);

        let (model, dimensions) = init_with_timeout(timeout, move || {
            let options = ImageInitOptions::new(model_enum)
                .with_cache_dir(models_dir)
                .with_show_download_progress(true);

            let mut model = ImageEmbedding::try_new(options)
                .map_err(|e| EmbeddingError::InitFailed(e.to_string()))?;
            let dimensions = Self::probe_dimensions(&mut model)?;
            Ok((model, dimensions))
        })?;

        Ok(Self {
            model: Mutex::new(model),
            model_name: model_name.to_string(),
            dimensions,
        })
    }

    fn parse_model_name(name: &str) -> Result<fastembed::ImageEmbeddingModel, EmbeddingError> {
        match name.to_lowercase().as_str() {
            "clip-vit-b-32" | "clipvitb32" => Ok(fastembed::ImageEmbeddingModel::ClipVitB32),
            "resnet50" => Ok(fastembed::ImageEmbeddingModel::Resnet50),
            "unicom-vit-b-16" | "unicomvitb16" => Ok(fastembed::ImageEmbeddingModel::UnicomVitB16),
            "unicom-vit-b-32" | "unicomvitb32" => Ok(fastembed::ImageEmbeddingModel::UnicomVitB32),
            "nomic-embed-vision-v1.5" | "nomicembedvisionv15" => {
                Ok(fastembed::ImageEmbeddingModel::NomicEmbedVisionV15)
            }
            _ => Err(EmbeddingError::InvalidModel(format!(
                "Unknown image model: {}. Supported models: clip-vit-b-32, resnet50, unicom-vit-b-16, unicom-vit-b-32, nomic-embed-vision-v1.5",
                name
            ))),
        }
    }

    fn probe_dimensions(model: &mut ImageEmbedding) -> Result<usize, EmbeddingError> {
        let probe = crate::images::probe_png()
            .map_err(|e| EmbeddingError::InitFailed(format!("Failed to build probe image: {}", e)))?;

        let embeddings = model
            .embed_bytes(&[probe.as_slice()], None)
            .map_err(|e| EmbeddingError::InitFailed(format!("Failed to probe dimensions: {}", e)))?;

        embeddings
            .first()
            .map(|v| v.len())
            .ok_or_else(|| EmbeddingError::InitFailed("Model returned no embedding".to_string()))
    }
}

impl ImageEmbedder for FastEmbedImageModel {
    fn name(&self) -> &str {
        &self.model_name
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed_image(&self, bytes: &[u8]) -> Result<Vec<f32>, EmbeddingError> {
        crate::images::sniff_format(bytes).ok_or(EmbeddingError::UnsupportedImage)?;

        let mut model = self.model.lock().map_err(|e| {
            EmbeddingError::EmbeddingFailed(format!("Failed to acquire model lock: {}", e))
        })?;

        let embeddings = model
            .embed_bytes(&[bytes], None)
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?;

        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::EmbeddingFailed("No embedding returned".to_string()))
    }
}

/// Sentence embedding model served by fastembed.
pub struct FastEmbedTextModel {
    model: Mutex<TextEmbedding>,
    model_name: String,
    dimensions: usize,
}

impl FastEmbedTextModel {
    pub fn new(
        model_name: &str,
        cache_dir: PathBuf,
        download_timeout: Option<Duration>,
    ) -> Result<Self, EmbeddingError> {
        let model_enum = Self::parse_model_name(model_name)?;
        let models_dir = models_dir(cache_dir)?;
        let timeout = download_timeout.unwrap_or(DEFAULT_DOWNLOAD_TIMEOUT);

        let (model, dimensions) = init_with_timeout(timeout, move || {
            let options = InitOptions::new(model_enum)
                .with_cache_dir(models_dir)
                .with_show_download_progress(true);

            let mut model = TextEmbedding::try_new(options)
                .map_err(|e| EmbeddingError::InitFailed(e.to_string()))?;
            let dimensions = Self::probe_dimensions(&mut model)?;
            Ok((model, dimensions))
        })?;

        Ok(Self {
            model: Mutex::new(model),
            model_name: model_name.to_string(),
            dimensions,
        })
    }

    fn parse_model_name(name: &str) -> Result<fastembed::EmbeddingModel, EmbeddingError> {
        match name.to_lowercase().as_str() {
            "all-minilm-l6-v2" | "allminiml6v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
            "all-minilm-l6-v2-q" | "allminiml6v2q" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2Q),
            "bge-small-en-v1.5" | "bgesmallenv15" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
            "bge-small-en-v1.5-q" | "bgesmallenv15q" => {
                Ok(fastembed::EmbeddingModel::BGESmallENV15Q)
            }
            "bge-base-en-v1.5" | "bgebaseenv15" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
            "bge-base-en-v1.5-q" | "bgebaseenv15q" => Ok(fastembed::EmbeddingModel::BGEBaseENV15Q),
            _ => Err(EmbeddingError::InvalidModel(format!(
                "Unknown text model: {}. Supported models: all-MiniLM-L6-v2, bge-small-en-v1.5, bge-base-en-v1.5 (add -q suffix for quantized)",
                name
            ))),
        }
    }

    fn probe_dimensions(model: &mut TextEmbedding) -> Result<usize, EmbeddingError> {
        let test_embeddings = model
            .embed(vec!["test"], None)
            .map_err(|e| EmbeddingError::InitFailed(format!("Failed to probe dimensions: {}", e)))?;

        test_embeddings
            .first()
            .map(|v| v.len())
            .ok_or_else(|| EmbeddingError::InitFailed("Model returned no embedding".to_string()))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, TextEmbedding>, EmbeddingError> {
        self.model.lock().map_err(|e| {
            EmbeddingError::EmbeddingFailed(format!("Failed to acquire model lock: {}", e))
        })
    }
}

impl TextEmbedder for FastEmbedTextModel {
    fn name(&self) -> &str {
        &self.model_name
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed_text(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let embeddings = self
            .lock()?
            .embed(vec![text], None)
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?;

        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::EmbeddingFailed("No embedding returned".to_string()))
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        self.lock()?
            .embed(texts.to_vec(), None)
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))
    }
}
