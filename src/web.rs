use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::signal;

use crate::{
    catalog::{CatalogError, CatalogItem, CatalogItemCreate, JsonCatalog, DEFAULT_PAGE_SIZE},
    config::Config,
    factory::App,
    images::{self, HttpImageFetcher, ImageFetcher, UploadedImage},
    similarity::{
        EngineStatus, FindSimilarParams, QuerySource, SimilarityEngine, SimilarityError,
        SimilarityResponse,
    },
    storage::{self, BlobStore},
};

#[derive(Clone)]
pub struct SharedState {
    pub engine: Arc<SimilarityEngine>,
    pub catalog: Arc<JsonCatalog>,
    pub uploads: Arc<dyn BlobStore>,
    pub fetcher: Arc<dyn ImageFetcher>,
    pub config: Arc<Config>,
}

impl SharedState {
    pub fn from_app(app: &App) -> Self {
        Self {
            engine: app.engine.clone(),
            catalog: app.catalog.clone(),
            uploads: app.uploads_store(),
            fetcher: Arc::new(HttpImageFetcher::new(
                app.config.similarity.fetch_timeout(),
                app.config.server.max_upload_bytes,
            )),
            config: Arc::new(app.config.clone()),
        }
    }
}

/// HTTP routes. Uploaded files are served from `uploads_dir` when given.
pub fn router(state: SharedState, uploads_dir: Option<&FsPath>) -> Router {
    // base64 inflates uploads by a third
    let body_limit = state.config.server.max_upload_bytes.saturating_mul(2);

    let mut router = Router::new()
        .route("/health", get(health))
        .route("/api/status", get(status))
        .route("/api/find-similar", post(find_similar))
        .route("/api/upload-image", post(upload_image))
        .route("/api/upload-url", post(upload_url))
        .route("/api/products", get(list_products).post(create_product))
        .route("/api/products/:id", get(get_product).delete(delete_product))
        .route("/api/categories", get(categories))
        .route("/api/index/rebuild", post(rebuild_index));

    if let Some(dir) = uploads_dir {
        router = router.nest_service("/uploads", tower_http::services::ServeDir::new(dir));
    }

    router
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(
                    tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO),
                )
                .on_response(
                    tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO),
                ),
        )
        .with_state(Arc::new(state))
}

async fn start_app(state: SharedState, uploads_dir: PathBuf) -> anyhow::Result<()> {
    let addr = format!(
        "{}:{}",
        state.config.server.host, state.config.server.port
    );
    let app = router(state, Some(&uploads_dir));

    async fn shutdown_signal() {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                log::error!("failed to install Ctrl+C handler: {e}");
            }
        };

        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(e) => {
                    log::error!("failed to install signal handler: {e}");
                    std::future::pending::<()>().await;
                }
            }
        };

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
        log::warn!("shutting down");
    }

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("listening on {addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

pub fn start_daemon(app: App) -> anyhow::Result<()> {
    if let Some(hours) = app.config.server.upload_retention_hours {
        let max_age = std::time::Duration::from_secs(hours.saturating_mul(3600));
        match app.uploads.prune_older_than(max_age) {
            Ok(removed) => log::info!("Removed {removed} uploads older than {hours}h"),
            Err(e) => log::warn!("Failed to clean up uploads: {e}"),
        }
    }

    let state = SharedState::from_app(&app);
    let uploads_dir = app.paths.uploads_path.clone();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async { start_app(state, uploads_dir).await })
}

#[derive(Debug)]
pub struct HttpError {
    status: StatusCode,
    message: String,
}

impl HttpError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        if self.status.is_server_error() {
            log::error!("{self:?}");
        }
        (self.status, Json(json!({"error": self.message}))).into_response()
    }
}

impl From<SimilarityError> for HttpError {
    fn from(err: SimilarityError) -> Self {
        match err {
            SimilarityError::InvalidQuery(_) => Self::bad_request(err.to_string()),
            SimilarityError::Catalog(e) => e.into(),
            _ => Self::internal(err.to_string()),
        }
    }
}

impl From<CatalogError> for HttpError {
    fn from(err: CatalogError) -> Self {
        let status = match err {
            CatalogError::NotFound(_) => StatusCode::NOT_FOUND,
            CatalogError::AlreadyExists(_) => StatusCode::CONFLICT,
            CatalogError::Invalid(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<tokio::task::JoinError> for HttpError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::internal(format!("background task failed: {err}"))
    }
}

async fn health(State(state): State<Arc<SharedState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "tier": state.engine.tier(),
    }))
}

#[derive(Serialize)]
struct StatusResponse {
    #[serde(flatten)]
    engine: EngineStatus,
    catalog_size: usize,
    frontend_origin: String,
}

async fn status(State(state): State<Arc<SharedState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        engine: state.engine.status(),
        catalog_size: state.catalog.len(),
        frontend_origin: state.config.server.frontend_origin.clone(),
    })
}

#[derive(Deserialize, Default)]
pub struct FindSimilarRequest {
    /// Base64 image, optionally as a `data:` URL
    pub image_base64: Option<String>,
    pub filename: Option<String>,
    pub image_url: Option<String>,
    /// Key of an image stored by /api/upload-image
    pub image_path: Option<String>,
    pub embedding: Option<Vec<f32>>,

    pub min_similarity: Option<f32>,
    pub max_results: Option<usize>,
    pub category_filter: Option<String>,
}

impl std::fmt::Debug for FindSimilarRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FindSimilarRequest {{ image_base64: [REDACTED], filename: {:?}, image_url: {:?}, image_path: {:?}, embedding: {:?}, min_similarity: {:?}, max_results: {:?}, category_filter: {:?} }}",
            self.filename,
            self.image_url,
            self.image_path,
            self.embedding.as_ref().map(|e| e.len()),
            self.min_similarity,
            self.max_results,
            self.category_filter)
    }
}

fn decode_base64_image(raw: &str) -> Result<Vec<u8>, HttpError> {
    let payload = match raw.split_once(";base64,") {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => raw,
    };
    STANDARD
        .decode(payload.trim())
        .map_err(|e| HttpError::bad_request(format!("invalid base64 image: {e}")))
}

fn query_source(
    payload: &mut FindSimilarRequest,
    uploads: &dyn BlobStore,
) -> Result<QuerySource, HttpError> {
    let provided = [
        payload.image_base64.is_some(),
        payload.image_url.is_some(),
        payload.image_path.is_some(),
        payload.embedding.is_some(),
    ]
    .iter()
    .filter(|p| **p)
    .count();

    if provided != 1 {
        return Err(HttpError::bad_request(
            "exactly one of image_base64, image_url, image_path or embedding is required",
        ));
    }

    if let Some(raw) = payload.image_base64.take() {
        return Ok(QuerySource::Bytes {
            data: decode_base64_image(&raw)?,
            filename: payload.filename.take(),
        });
    }
    if let Some(url) = payload.image_url.take() {
        return Ok(QuerySource::Url(url));
    }
    if let Some(key) = payload.image_path.take() {
        storage::validate_key(&key)
            .map_err(|_| HttpError::bad_request(format!("invalid image_path {key}")))?;
        let data = uploads
            .read(&key)
            .map_err(|e| HttpError::internal(e.to_string()))?
            .ok_or_else(|| HttpError {
                status: StatusCode::NOT_FOUND,
                message: format!("uploaded image {key} not found"),
            })?;
        return Ok(QuerySource::Bytes {
            data,
            filename: payload.filename.take().or(Some(key)),
        });
    }

    Ok(QuerySource::Embedding(payload.embedding.take().unwrap_or_default()))
}

async fn find_similar(
    State(state): State<Arc<SharedState>>,
    Json(mut payload): Json<FindSimilarRequest>,
) -> Result<Json<SimilarityResponse>, HttpError> {
    log::debug!("payload: {payload:?}");

    let source = query_source(&mut payload, state.uploads.as_ref())?;
    let defaults = &state.config.similarity;
    let params = FindSimilarParams {
        min_similarity: payload
            .min_similarity
            .unwrap_or(defaults.default_min_similarity),
        max_results: payload.max_results.unwrap_or(defaults.default_max_results),
        category_filter: payload.category_filter.filter(|c| !c.trim().is_empty()),
    };

    let engine = state.engine.clone();
    let response =
        tokio::task::spawn_blocking(move || engine.find_similar(&source, &params)).await??;

    Ok(Json(response))
}

#[derive(Deserialize)]
pub struct UploadRequest {
    pub image_base64: String,
    pub filename: Option<String>,
}

async fn upload_image(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<UploadRequest>,
) -> Result<Json<UploadedImage>, HttpError> {
    let data = decode_base64_image(&payload.image_base64)?;
    let uploads = state.uploads.clone();
    let max_bytes = state.config.server.max_upload_bytes;

    let uploaded = tokio::task::spawn_blocking(move || {
        images::store_upload(
            uploads.as_ref(),
            &data,
            payload.filename.as_deref(),
            max_bytes,
        )
    })
    .await?
    .map_err(|e| HttpError::bad_request(format!("{e:#}")))?;

    Ok(Json(uploaded))
}

#[derive(Debug, Deserialize)]
pub struct UploadUrlRequest {
    pub image_url: String,
}

async fn upload_url(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<UploadUrlRequest>,
) -> Result<Json<UploadedImage>, HttpError> {
    let uploads = state.uploads.clone();
    let fetcher = state.fetcher.clone();
    let max_bytes = state.config.server.max_upload_bytes;

    let uploaded = tokio::task::spawn_blocking(move || {
        images::store_remote(
            uploads.as_ref(),
            fetcher.as_ref(),
            &payload.image_url,
            max_bytes,
        )
    })
    .await?
    .map_err(|e| HttpError::bad_request(format!("{e:#}")))?;

    Ok(Json(uploaded))
}

#[derive(Debug, Deserialize)]
pub struct ProductsQuery {
    pub category: Option<String>,
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

async fn list_products(
    State(state): State<Arc<SharedState>>,
    Query(query): Query<ProductsQuery>,
) -> Result<Json<Vec<CatalogItem>>, HttpError> {
    let products = state.catalog.products(
        query.category.as_deref(),
        query.limit.unwrap_or(DEFAULT_PAGE_SIZE),
        query.offset,
    )?;
    Ok(Json(
        products.iter().map(CatalogItem::without_embedding).collect(),
    ))
}

async fn get_product(
    State(state): State<Arc<SharedState>>,
    Path(id): Path<String>,
) -> Result<Json<CatalogItem>, HttpError> {
    state
        .catalog
        .get_item(&id)?
        .map(|item| Json(item.without_embedding()))
        .ok_or_else(|| CatalogError::NotFound(id).into())
}

/// Remove a product from the catalog. Its index row stays until the next
/// rebuild and is skipped by queries.
async fn delete_product(
    State(state): State<Arc<SharedState>>,
    Path(id): Path<String>,
) -> Result<Json<CatalogItem>, HttpError> {
    let removed = state.catalog.delete_item(&id)?;
    log::info!("Deleted product {}", removed.id);
    Ok(Json(removed.without_embedding()))
}

#[derive(Serialize)]
struct CreateProductResponse {
    product: CatalogItem,
    /// Index row, absent when the engine has no vector tier or indexing failed
    index_row: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    index_error: Option<String>,
}

async fn create_product(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<CatalogItemCreate>,
) -> Result<(StatusCode, Json<CreateProductResponse>), HttpError> {
    let item = payload.into_item()?;
    if let (Some(embedding), Some(dimensions)) = (&item.embedding, state.engine.status().dimensions)
    {
        if embedding.len() != dimensions {
            return Err(HttpError::bad_request(format!(
                "embedding has {} dimensions, the index expects {}",
                embedding.len(),
                dimensions
            )));
        }
    }
    let product = state.catalog.add_item(item)?;

    let engine = state.engine.clone();
    let to_index = product.clone();
    let indexed = tokio::task::spawn_blocking(move || engine.add_product_to_index(&to_index)).await?;

    let (index_row, index_error) = match indexed {
        Ok(row) => (row, None),
        Err(e) => {
            log::warn!("Product {} added but not indexed: {}", product.id, e);
            (None, Some(e.to_string()))
        }
    };

    Ok((
        StatusCode::CREATED,
        Json(CreateProductResponse {
            product: product.without_embedding(),
            index_row,
            index_error,
        }),
    ))
}

async fn categories(
    State(state): State<Arc<SharedState>>,
) -> Result<Json<Vec<String>>, HttpError> {
    Ok(Json(state.catalog.categories()?))
}

async fn rebuild_index(
    State(state): State<Arc<SharedState>>,
) -> Result<Json<serde_json::Value>, HttpError> {
    let engine = state.engine.clone();
    let indexed = tokio::task::spawn_blocking(move || engine.rebuild_index()).await??;

    Ok(Json(json!({
        "indexed": indexed,
        "tier": state.engine.tier(),
    })))
}
