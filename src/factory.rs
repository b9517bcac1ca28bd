use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use homedir::my_home;

use crate::catalog::JsonCatalog;
use crate::config::{Config, TierSetting};
use crate::images::HttpImageFetcher;
use crate::similarity::{
    EngineSetup, FastEmbedImageModel, FastEmbedTextModel, ImageEmbedder, SimilarityEngine,
    TextEmbedder,
};
use crate::storage::{BlobStore, LocalBlobStore};

/// Everything a command or the daemon needs, wired from config.
pub struct App {
    pub config: Config,
    pub paths: AppPaths,
    pub catalog: Arc<JsonCatalog>,
    pub engine: Arc<SimilarityEngine>,
    pub uploads: Arc<LocalBlobStore>,
}

/// Application factory for creating and configuring application components
pub struct AppFactory;

impl AppFactory {
    /// Load config, open the catalog and initialize the similarity engine.
    ///
    /// `tier` overrides the configured tier for this process only.
    pub fn create_app(paths: &AppPaths, tier: Option<TierSetting>) -> Result<App> {
        let mut config = Self::create_config(paths)?;
        if let Some(tier) = tier {
            config.similarity.tier = tier;
        }

        let data_store = Self::data_store(paths)?;
        let catalog = Arc::new(JsonCatalog::open(data_store.clone())?);

        let setup = Self::engine_setup(&config, paths);
        let engine = SimilarityEngine::initialize(setup, catalog.clone(), data_store)
            .context("Failed to initialize similarity engine")?;

        let uploads = Self::uploads_store(paths)?;

        Ok(App {
            config,
            paths: paths.clone(),
            catalog,
            engine: Arc::new(engine),
            uploads,
        })
    }

    /// Open only the catalog, for commands that never touch the engine.
    pub fn open_catalog(paths: &AppPaths) -> Result<JsonCatalog> {
        Ok(JsonCatalog::open(Self::data_store(paths)?)?)
    }

    pub fn uploads_store(paths: &AppPaths) -> Result<Arc<LocalBlobStore>> {
        let store =
            LocalBlobStore::new(&paths.uploads_path).context("Failed to open uploads directory")?;
        Ok(Arc::new(store))
    }

    fn data_store(paths: &AppPaths) -> Result<Arc<LocalBlobStore>> {
        let store =
            LocalBlobStore::new(&paths.base_path).context("Failed to open data directory")?;
        Ok(Arc::new(store))
    }

    /// Tier plan from config. Model constructors run lazily inside the
    /// engine, so a capped tier never downloads a model it will not use.
    pub fn engine_setup(config: &Config, paths: &AppPaths) -> EngineSetup {
        let sim = &config.similarity;
        let fetcher = Arc::new(HttpImageFetcher::new(
            sim.fetch_timeout(),
            config.server.max_upload_bytes,
        ));

        let image_model = sim.image_model.clone();
        let image_cache = paths.base_path.clone();
        let text_model = sim.text_model.clone();
        let text_cache = paths.base_path.clone();
        let timeout = sim.download_timeout();

        EngineSetup::new(sim.tier.max_tier())
            .strict(sim.enforces_tier())
            .with_fetcher(fetcher)
            .expected_dimensions(sim.embedding_dim)
            .overfetch_factor(sim.overfetch_factor)
            .deterministic_jitter(sim.deterministic_jitter)
            .with_image_provider(move || {
                log::info!("Loading image model '{}'", image_model);
                let model = FastEmbedImageModel::new(&image_model, image_cache, Some(timeout))?;
                Ok(Arc::new(model) as Arc<dyn ImageEmbedder>)
            })
            .with_text_provider(move || {
                log::info!("Loading text model '{}'", text_model);
                let model = FastEmbedTextModel::new(&text_model, text_cache, Some(timeout))?;
                Ok(Arc::new(model) as Arc<dyn TextEmbedder>)
            })
    }

    /// Get application paths with validation
    pub fn get_paths() -> Result<AppPaths> {
        let base_path = Self::get_base_path()?;
        Self::paths_in(base_path)
    }

    pub fn paths_in(base_path: PathBuf) -> Result<AppPaths> {
        let uploads_path = base_path.join("uploads");

        // Ensure base directory exists
        std::fs::create_dir_all(&base_path)
            .context("Failed to create application base directory")?;

        Ok(AppPaths {
            base_path,
            uploads_path,
        })
    }

    /// Create configuration with validation
    pub fn create_config(paths: &AppPaths) -> Result<Config> {
        Config::load_with(&paths.base_path)
            .with_context(|| format!("Failed to load config from {}", paths.base_path.display()))
    }

    /// Get the base path for the application
    fn get_base_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var("VISMATCH_BASE_PATH") {
            return Ok(PathBuf::from(path));
        }

        let home = my_home()
            .context("Could not determine home directory")?
            .context("Home directory path is empty")?;
        Ok(home.join(".local/share/vismatch"))
    }
}

/// Application paths structure
#[derive(Debug, Clone)]
pub struct AppPaths {
    pub base_path: PathBuf,
    pub uploads_path: PathBuf,
}

impl App {
    pub fn uploads_store(&self) -> Arc<dyn BlobStore> {
        self.uploads.clone()
    }
}
