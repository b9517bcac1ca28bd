//! HTTP API tests driving the router in-process.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use crate::catalog::{CatalogItem, JsonCatalog};
use crate::config::Config;
use crate::images;
use crate::similarity::{DegradationTier, EngineSetup, SimilarityEngine};
use crate::storage::MemoryBlobStore;
use crate::tests::support::{EchoFetcher, PngFetcher, StubImageEmbedder};
use crate::web::{router, SharedState};

fn app() -> Router {
    let catalog = Arc::new(JsonCatalog::with_items(
        Arc::new(MemoryBlobStore::new()),
        vec![
            CatalogItem::new("lamp", "Blue Lamp", "Home & Garden", "lamp.jpg"),
            CatalogItem::new("shoe", "Red Sneaker", "Fashion", "shoe.jpg")
                .with_tags(["running", "shoes"]),
            CatalogItem::new("tee", "White Tee", "Fashion", "tee.jpg"),
        ],
    ));
    let engine = SimilarityEngine::initialize(
        EngineSetup::new(DegradationTier::KeywordOverlap),
        catalog.clone(),
        Arc::new(MemoryBlobStore::new()),
    )
    .unwrap();

    router(
        SharedState {
            engine: Arc::new(engine),
            catalog,
            uploads: Arc::new(MemoryBlobStore::new()),
            fetcher: Arc::new(PngFetcher),
            config: Arc::new(Config::default()),
        },
        None,
    )
}

/// Router over a two-dimensional image embedding index.
fn vector_app() -> Router {
    let catalog = Arc::new(JsonCatalog::with_items(
        Arc::new(MemoryBlobStore::new()),
        vec![CatalogItem::new("lamp", "Blue Lamp", "Home", "http://img/lamp")],
    ));
    let embedder = StubImageEmbedder::new(2)
        .with("http://img/lamp", vec![1.0, 0.0])
        .with("http://img/mug", vec![0.0, 1.0]);
    let engine = SimilarityEngine::initialize(
        EngineSetup::new(DegradationTier::FullEmbedding)
            .with_image_embedder(Arc::new(embedder))
            .with_fetcher(Arc::new(EchoFetcher)),
        catalog.clone(),
        Arc::new(MemoryBlobStore::new()),
    )
    .unwrap();

    router(
        SharedState {
            engine: Arc::new(engine),
            catalog,
            uploads: Arc::new(MemoryBlobStore::new()),
            fetcher: Arc::new(PngFetcher),
            config: Arc::new(Config::default()),
        },
        None,
    )
}

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn test_health_reports_tier() {
    let app = app();
    let (status, body) = call(&app, Method::GET, "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["tier"], "keyword_overlap");
}

#[tokio::test]
async fn test_status() {
    let app = app();
    let (status, body) = call(&app, Method::GET, "/api/status", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["catalog_size"], 3);
    assert_eq!(body["quality"], "heuristic");
    assert_eq!(body["index_size"], 0);
}

#[tokio::test]
async fn test_find_similar_by_filename_terms() {
    let app = app();
    let request = json!({
        "image_base64": STANDARD.encode(b"not decoded by the keyword tier"),
        "filename": "red_sneaker.jpg",
        "max_results": 2,
    });
    let (status, body) = call(&app, Method::POST, "/api/find-similar", Some(request)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tier"], "keyword_overlap");
    let matches = body["matches"].as_array().unwrap();
    assert_eq!(matches.len(), 2);
    assert_eq!(matches[0]["product"]["id"], "shoe");
    assert!((matches[0]["similarity_score"].as_f64().unwrap() - 0.9).abs() < 1e-5);
}

#[tokio::test]
async fn test_find_similar_category_filter() {
    let app = app();
    let request = json!({
        "image_url": "https://cdn.example.com/lamp.png",
        "category_filter": "fashion",
    });
    let (status, body) = call(&app, Method::POST, "/api/find-similar", Some(request)).await;

    assert_eq!(status, StatusCode::OK);
    let matches = body["matches"].as_array().unwrap();
    assert_eq!(matches.len(), 2);
    assert!(matches.iter().all(|m| m["product"]["category"] == "Fashion"));
}

#[tokio::test]
async fn test_find_similar_rejects_bad_requests() {
    let app = app();

    let (status, _) = call(&app, Method::POST, "/api/find-similar", Some(json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let request = json!({"embedding": [1.0], "max_results": 0});
    let (status, body) = call(&app, Method::POST, "/api/find-similar", Some(request)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("max_results"));

    let request = json!({"image_path": "missing.png"});
    let (status, _) = call(&app, Method::POST, "/api/find-similar", Some(request)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_upload_then_search_by_path() {
    let app = app();
    let png = images::probe_png().unwrap();
    let request = json!({
        "image_base64": format!("data:image/png;base64,{}", STANDARD.encode(&png)),
        "filename": "white_tee.png",
    });
    let (status, body) = call(&app, Method::POST, "/api/upload-image", Some(request)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["format"], "png");
    assert_eq!(body["width"], 32);
    let image_path = body["image_path"].as_str().unwrap().to_string();
    assert!(body["thumbnail_path"]
        .as_str()
        .unwrap()
        .starts_with("thumbnails/"));

    let request = json!({"image_path": image_path, "filename": "white_tee.png"});
    let (status, body) = call(&app, Method::POST, "/api/find-similar", Some(request)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["matches"][0]["product"]["id"], "tee");
}

#[tokio::test]
async fn test_upload_rejects_non_images() {
    let app = app();
    let request = json!({"image_base64": STANDARD.encode(b"plain text")});
    let (status, _) = call(&app, Method::POST, "/api/upload-image", Some(request)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_upload_from_url() {
    let app = app();
    let request = json!({"image_url": "https://cdn.example.com/img/white_tee.png?w=64"});
    let (status, body) = call(&app, Method::POST, "/api/upload-url", Some(request)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["filename"], "white_tee.png");
    assert_eq!(body["format"], "png");
    assert_eq!(body["width"], 32);
    assert!(body["thumbnail_path"]
        .as_str()
        .unwrap()
        .starts_with("thumbnails/"));

    let image_path = body["image_path"].as_str().unwrap().to_string();
    let request = json!({"image_path": image_path, "filename": "white_tee.png"});
    let (status, body) = call(&app, Method::POST, "/api/find-similar", Some(request)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["matches"][0]["product"]["id"], "tee");

    let request = json!({"image_url": "bad://nowhere/x.png"});
    let (status, body) = call(&app, Method::POST, "/api/upload-url", Some(request)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("unreachable"));
}

#[tokio::test]
async fn test_find_similar_rejects_absolute_image_path() {
    let app = app();
    let request = json!({"image_path": "/etc/passwd"});
    let (status, _) = call(&app, Method::POST, "/api/find-similar", Some(request)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_products_crud() {
    let app = app();

    let (status, body) = call(&app, Method::GET, "/api/products?category=FASHION", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 2);

    let (status, body) = call(&app, Method::GET, "/api/products?limit=1&offset=1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["id"], "shoe");

    let (status, body) = call(&app, Method::GET, "/api/products/lamp", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "Blue Lamp");

    let (status, _) = call(&app, Method::GET, "/api/products/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let create = json!({
        "id": "mug",
        "name": "Coffee Mug",
        "category": "Home & Garden",
        "image_url": "https://cdn.example.com/mug.jpg",
        "tags": ["Kitchen"],
    });
    let (status, body) = call(&app, Method::POST, "/api/products", Some(create.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["product"]["id"], "mug");
    assert_eq!(body["product"]["tags"][0], "kitchen");
    assert!(body["index_row"].is_null());

    let (status, _) = call(&app, Method::POST, "/api/products", Some(create)).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let invalid = json!({"name": " ", "category": "X", "image_url": "x.jpg"});
    let (status, _) = call(&app, Method::POST, "/api/products", Some(invalid)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = call(&app, Method::DELETE, "/api/products/mug", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], "mug");

    let (status, _) = call(&app, Method::DELETE, "/api/products/mug", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_categories_sorted() {
    let app = app();
    let (status, body) = call(&app, Method::GET, "/api/categories", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!(["Fashion", "Home & Garden"]));
}

#[tokio::test]
async fn test_rebuild_without_vector_tier() {
    let app = app();
    let (status, body) = call(&app, Method::POST, "/api/index/rebuild", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["indexed"], 0);
    assert_eq!(body["tier"], "keyword_overlap");
}

#[tokio::test]
async fn test_create_product_checks_embedding_size() {
    let app = vector_app();

    let wrong = json!({
        "id": "mug",
        "name": "Mug",
        "category": "Home",
        "image_url": "http://img/mug",
        "embedding": [1.0, 0.0, 0.0],
    });
    let (status, body) = call(&app, Method::POST, "/api/products", Some(wrong)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("expects 2"));

    let (status, _) = call(&app, Method::GET, "/api/products/mug", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let right = json!({
        "id": "mug",
        "name": "Mug",
        "category": "Home",
        "image_url": "http://img/mug",
        "embedding": [0.0, 1.0],
    });
    let (status, body) = call(&app, Method::POST, "/api/products", Some(right)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["index_row"], 1);

    let (status, body) = call(&app, Method::POST, "/api/index/rebuild", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["indexed"], 2);
}
