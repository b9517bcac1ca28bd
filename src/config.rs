use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::images::DEFAULT_MAX_UPLOAD_BYTES;
use crate::similarity::engine::{DEFAULT_DETERMINISTIC_JITTER, DEFAULT_OVERFETCH_FACTOR};
use crate::similarity::query::DEFAULT_MAX_RESULTS;
use crate::similarity::DegradationTier;
use crate::storage::{BlobStore, LocalBlobStore};

pub const CONFIG_KEY: &str = "config.yaml";

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8000;
const DEFAULT_FRONTEND_ORIGIN: &str = "http://localhost:3000";
const DEFAULT_IMAGE_MODEL: &str = "clip-vit-b-32";
const DEFAULT_TEXT_MODEL: &str = "all-minilm-l6-v2";
/// Default model download timeout in seconds
const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 300;
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;
const MAX_DETERMINISTIC_JITTER: f32 = 0.5;

/// Highest tier the engine may use. `auto` means "best available".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierSetting {
    #[default]
    Auto,
    Full,
    Text,
    Keyword,
    Deterministic,
}

impl TierSetting {
    pub fn max_tier(self) -> DegradationTier {
        match self {
            TierSetting::Auto | TierSetting::Full => DegradationTier::FullEmbedding,
            TierSetting::Text => DegradationTier::TextEmbedding,
            TierSetting::Keyword => DegradationTier::KeywordOverlap,
            TierSetting::Deterministic => DegradationTier::Deterministic,
        }
    }
}

impl std::str::FromStr for TierSetting {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(TierSetting::Auto),
            "full" => Ok(TierSetting::Full),
            "text" => Ok(TierSetting::Text),
            "keyword" => Ok(TierSetting::Keyword),
            "deterministic" => Ok(TierSetting::Deterministic),
            other => bail!(
                "unknown tier '{other}', expected auto, full, text, keyword or deterministic"
            ),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
    /// Origin of the web frontend, reported by /api/status
    #[serde(default = "default_frontend_origin")]
    pub frontend_origin: String,
    /// Uploads older than this are removed when the server starts
    #[serde(default)]
    pub upload_retention_hours: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_upload_bytes: default_max_upload_bytes(),
            frontend_origin: default_frontend_origin(),
            upload_retention_hours: None,
        }
    }
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_max_upload_bytes() -> usize {
    DEFAULT_MAX_UPLOAD_BYTES
}

fn default_frontend_origin() -> String {
    DEFAULT_FRONTEND_ORIGIN.to_string()
}

/// Configuration for the similarity engine
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimilarityConfig {
    #[serde(default)]
    pub tier: TierSetting,

    /// Fail startup instead of degrading below `tier`. Ignored for `auto`.
    #[serde(default)]
    pub strict: bool,

    #[serde(default = "default_image_model")]
    pub image_model: String,

    #[serde(default = "default_text_model")]
    pub text_model: String,

    /// Expected embedding dimension; checked against the model when set
    #[serde(default)]
    pub embedding_dim: Option<usize>,

    #[serde(default = "default_max_results")]
    pub default_max_results: usize,

    #[serde(default)]
    pub default_min_similarity: f32,

    #[serde(default = "default_overfetch_factor")]
    pub overfetch_factor: usize,

    /// Bound of the random perturbation on deterministic scores
    #[serde(default = "default_deterministic_jitter")]
    pub deterministic_jitter: f32,

    /// Timeout for model download in seconds
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,

    /// Timeout for fetching remote images in seconds
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            tier: TierSetting::Auto,
            strict: false,
            image_model: default_image_model(),
            text_model: default_text_model(),
            embedding_dim: None,
            default_max_results: default_max_results(),
            default_min_similarity: 0.0,
            overfetch_factor: default_overfetch_factor(),
            deterministic_jitter: default_deterministic_jitter(),
            download_timeout_secs: default_download_timeout_secs(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
        }
    }
}

impl SimilarityConfig {
    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    /// Whether startup must fail below the configured tier. `auto` asks for
    /// the best available tier, so it never pins one.
    pub fn enforces_tier(&self) -> bool {
        self.strict && self.tier != TierSetting::Auto
    }
}

fn default_image_model() -> String {
    DEFAULT_IMAGE_MODEL.to_string()
}

fn default_text_model() -> String {
    DEFAULT_TEXT_MODEL.to_string()
}

fn default_max_results() -> usize {
    DEFAULT_MAX_RESULTS
}

fn default_overfetch_factor() -> usize {
    DEFAULT_OVERFETCH_FACTOR
}

fn default_deterministic_jitter() -> f32 {
    DEFAULT_DETERMINISTIC_JITTER
}

fn default_download_timeout_secs() -> u64 {
    DEFAULT_DOWNLOAD_TIMEOUT_SECS
}

fn default_fetch_timeout_secs() -> u64 {
    DEFAULT_FETCH_TIMEOUT_SECS
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub similarity: SimilarityConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        let sim = &self.similarity;

        if !(-1.0..=1.0).contains(&sim.default_min_similarity) {
            bail!(
                "similarity.default_min_similarity must be between -1.0 and 1.0, got {}",
                sim.default_min_similarity
            );
        }
        if sim.default_max_results == 0 {
            bail!("similarity.default_max_results must be greater than 0");
        }
        if sim.overfetch_factor == 0 {
            bail!("similarity.overfetch_factor must be greater than 0");
        }
        if !(0.0..=MAX_DETERMINISTIC_JITTER).contains(&sim.deterministic_jitter) {
            bail!(
                "similarity.deterministic_jitter must be between 0.0 and {}, got {}",
                MAX_DETERMINISTIC_JITTER,
                sim.deterministic_jitter
            );
        }
        if sim.download_timeout_secs == 0 {
            bail!("similarity.download_timeout_secs must be greater than 0");
        }
        if sim.fetch_timeout_secs == 0 {
            bail!("similarity.fetch_timeout_secs must be greater than 0");
        }
        if sim.embedding_dim == Some(0) {
            bail!("similarity.embedding_dim must be greater than 0 when set");
        }
        if self.server.max_upload_bytes == 0 {
            bail!("server.max_upload_bytes must be greater than 0");
        }
        if self.server.upload_retention_hours == Some(0) {
            bail!("server.upload_retention_hours must be greater than 0 when set");
        }

        Ok(())
    }

    /// Load `config.yaml` from `base_path`, creating it from defaults when
    /// missing.
    pub fn load_with(base_path: &Path) -> Result<Self> {
        let store = LocalBlobStore::new(base_path)?;

        // create new if does not exist
        if !store.exists(CONFIG_KEY) {
            store.write(CONFIG_KEY, serde_yml::to_string(&Self::default())?.as_bytes())?;
        }

        let raw = store
            .read(CONFIG_KEY)?
            .context("config file disappeared while loading")?;
        let config_str = String::from_utf8(raw).context("config file is not valid utf8")?;
        let mut config: Self = serde_yml::from_str(&config_str).context("config is malformed")?;

        config.base_path = base_path.to_path_buf();
        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let store = LocalBlobStore::new(&self.base_path)?;

        let config_str = serde_yml::to_string(&self)?;
        store.write(CONFIG_KEY, config_str.as_bytes())?;
        Ok(())
    }
}
