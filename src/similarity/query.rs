//! Query inputs for similarity search.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Maximum item text length fed to a text embedder (characters, not tokens)
const MAX_CONTENT_LENGTH: usize = 512;

/// Ellipsis suffix when content is truncated
const TRUNCATION_SUFFIX: &str = "...";

pub const DEFAULT_MAX_RESULTS: usize = 20;

/// Where the query embedding comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum QuerySource {
    /// Encoded image bytes, with the client-supplied file name if any
    Bytes {
        data: Vec<u8>,
        filename: Option<String>,
    },
    /// Image file on local disk
    Path(PathBuf),
    /// Remote image
    Url(String),
    /// Precomputed embedding, searched as-is (after normalization)
    Embedding(Vec<f32>),
}

impl QuerySource {
    /// File name the query terms are derived from, if the source has one.
    pub fn filename(&self) -> Option<String> {
        match self {
            QuerySource::Bytes { filename, .. } => filename.clone(),
            QuerySource::Path(path) => path
                .file_name()
                .map(|name| name.to_string_lossy().to_string()),
            QuerySource::Url(raw) => url::Url::parse(raw)
                .ok()
                .and_then(|u| {
                    u.path_segments()
                        .and_then(|segments| segments.last().map(str::to_string))
                })
                .filter(|segment| !segment.is_empty()),
            QuerySource::Embedding(_) => None,
        }
    }

    /// Terms for the text and keyword tiers.
    pub fn terms(&self) -> Vec<String> {
        self.filename()
            .map(|name| terms_from_filename(&name))
            .unwrap_or_default()
    }
}

/// Filtering and truncation applied to every tier's ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindSimilarParams {
    /// Inclusive lower bound on score
    #[serde(default)]
    pub min_similarity: f32,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    /// Case-insensitive exact category match
    #[serde(default)]
    pub category_filter: Option<String>,
}

fn default_max_results() -> usize {
    DEFAULT_MAX_RESULTS
}

impl Default for FindSimilarParams {
    fn default() -> Self {
        Self {
            min_similarity: 0.0,
            max_results: DEFAULT_MAX_RESULTS,
            category_filter: None,
        }
    }
}

impl FindSimilarParams {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_results == 0 {
            return Err("max_results must be at least 1".to_string());
        }
        if !self.min_similarity.is_finite() {
            return Err("min_similarity must be a finite number".to_string());
        }
        Ok(())
    }

    pub fn matches_category(&self, category: &str) -> bool {
        match &self.category_filter {
            Some(filter) => filter.to_lowercase() == category.to_lowercase(),
            None => true,
        }
    }

    pub fn accepts_score(&self, score: f32) -> bool {
        score >= self.min_similarity
    }
}

/// Split an image file name into lowercase search terms.
///
/// `"Red_Sneaker-v2.jpg"` becomes `["red", "sneaker", "v2"]`. Directory
/// components and the extension are dropped; duplicates keep their first
/// position.
pub fn terms_from_filename(filename: &str) -> Vec<String> {
    let base = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(filename);

    let stem = match base.rfind('.') {
        Some(pos) if pos > 0 => &base[..pos],
        _ => base,
    };

    let mut terms: Vec<String> = Vec::new();
    for term in stem
        .replace(['_', '-'], " ")
        .to_lowercase()
        .split_whitespace()
    {
        if !terms.iter().any(|t| t == term) {
            terms.push(term.to_string());
        }
    }
    terms
}

/// Prepare an item's text fields for the text embedder.
///
/// Returns `None` for blank text. Longer text is cut to the model input
/// budget with an ellipsis.
pub fn preprocess_item_text(text: &str) -> Option<String> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    if text.chars().count() <= MAX_CONTENT_LENGTH {
        return Some(text.to_string());
    }

    let max_chars = MAX_CONTENT_LENGTH - TRUNCATION_SUFFIX.len();
    let truncated: String = text.chars().take(max_chars).collect();
    Some(format!("{}{}", truncated, TRUNCATION_SUFFIX))
}
