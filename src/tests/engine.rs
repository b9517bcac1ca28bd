//! End-to-end tests for the similarity engine over in-memory stores.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crate::catalog::{CatalogError, CatalogItem, CatalogStore, JsonCatalog};
use crate::similarity::persistence::INDEX_KEY;
use crate::similarity::{
    DegradationTier, EngineSetup, FindSimilarParams, QuerySource, ResultQuality, SimilarityEngine,
    SimilarityError, SimilarityResponse,
};
use crate::storage::MemoryBlobStore;
use crate::tests::support::{EchoFetcher, StubImageEmbedder, StubTextEmbedder};

fn product(id: &str, category: &str) -> CatalogItem {
    CatalogItem::new(id, format!("Item {id}"), category, format!("http://img/{id}"))
}

fn stored(id: &str, category: &str, embedding: Vec<f32>) -> CatalogItem {
    let mut item = product(id, category);
    item.embedding = Some(embedding);
    item
}

fn catalog(items: Vec<CatalogItem>) -> Arc<JsonCatalog> {
    Arc::new(JsonCatalog::with_items(Arc::new(MemoryBlobStore::new()), items))
}

fn embedder() -> StubImageEmbedder {
    StubImageEmbedder::new(2)
        .with("http://img/a", vec![1.0, 0.0])
        .with("http://img/b", vec![0.0, 1.0])
        .with("http://img/c", vec![0.8, 0.6])
        .with("http://img/f", vec![-1.0, 0.0])
}

fn full_setup(embedder: StubImageEmbedder) -> EngineSetup {
    EngineSetup::new(DegradationTier::FullEmbedding)
        .with_image_embedder(Arc::new(embedder))
        .with_fetcher(Arc::new(EchoFetcher))
}

fn ids(response: &SimilarityResponse) -> Vec<&str> {
    response
        .matches
        .iter()
        .map(|m| m.product.id.as_str())
        .collect()
}

/// Catalog whose reads can be switched off.
struct FlakyCatalog {
    inner: Arc<JsonCatalog>,
    down: AtomicBool,
}

impl CatalogStore for FlakyCatalog {
    fn list_items(&self) -> Result<Vec<CatalogItem>, CatalogError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(CatalogError::Io(std::io::Error::other("catalog offline")));
        }
        self.inner.list_items()
    }

    fn get_item_embedding(&self, id: &str) -> Result<Option<Vec<f32>>, CatalogError> {
        self.inner.get_item_embedding(id)
    }

    fn set_item_embedding(&self, id: &str, embedding: Vec<f32>) -> Result<(), CatalogError> {
        self.inner.set_item_embedding(id, embedding)
    }
}

#[test]
fn test_full_tier_orders_by_cosine() {
    let catalog = catalog(vec![product("a", "X"), product("b", "X"), product("c", "X")]);
    let engine = SimilarityEngine::initialize(
        full_setup(embedder()),
        catalog.clone(),
        Arc::new(MemoryBlobStore::new()),
    )
    .unwrap();

    assert_eq!(engine.tier(), DegradationTier::FullEmbedding);
    assert_eq!(engine.index_len(), 3);

    let response = engine
        .find_similar(
            &QuerySource::Embedding(vec![2.0, 0.0]),
            &FindSimilarParams::default(),
        )
        .unwrap();

    assert_eq!(ids(&response), vec!["a", "c", "b"]);
    assert_eq!(response.quality, ResultQuality::Similarity);
    assert!(response.fallback_reason.is_none());
    assert!((response.matches[0].similarity_score - 1.0).abs() < 1e-5);
    assert!((response.matches[1].similarity_score - 0.8).abs() < 1e-5);
}

#[test]
fn test_computed_embeddings_written_back_to_catalog() {
    let catalog = catalog(vec![product("a", "X")]);
    SimilarityEngine::initialize(
        full_setup(embedder()),
        catalog.clone(),
        Arc::new(MemoryBlobStore::new()),
    )
    .unwrap();

    assert_eq!(
        catalog.get_item_embedding("a").unwrap(),
        Some(vec![1.0, 0.0])
    );
}

#[test]
fn test_items_failing_to_embed_are_skipped() {
    let catalog = catalog(vec![product("a", "X"), product("unknown", "X")]);
    let engine = SimilarityEngine::initialize(
        full_setup(embedder()),
        catalog,
        Arc::new(MemoryBlobStore::new()),
    )
    .unwrap();

    assert_eq!(engine.index_len(), 1);
}

#[test]
fn test_category_and_threshold_filter() {
    let catalog = catalog(vec![
        stored("tv", "Electronics", vec![0.6, 0.8]),
        stored("radio", "electronics", vec![0.4, 0.9165]),
        stored("shirt", "Fashion", vec![1.0, 0.0]),
    ]);
    let engine = SimilarityEngine::initialize(
        full_setup(StubImageEmbedder::new(2)),
        catalog,
        Arc::new(MemoryBlobStore::new()),
    )
    .unwrap();

    let params = FindSimilarParams {
        min_similarity: 0.5,
        category_filter: Some("Electronics".into()),
        ..Default::default()
    };
    let response = engine
        .find_similar(&QuerySource::Embedding(vec![1.0, 0.0]), &params)
        .unwrap();

    assert_eq!(ids(&response), vec!["tv"]);
    assert!((response.matches[0].similarity_score - 0.6).abs() < 1e-4);
}

#[test]
fn test_max_results_truncates() {
    let catalog = catalog(vec![product("a", "X"), product("b", "X"), product("c", "X")]);
    let engine = SimilarityEngine::initialize(
        full_setup(embedder()),
        catalog,
        Arc::new(MemoryBlobStore::new()),
    )
    .unwrap();

    let params = FindSimilarParams {
        max_results: 2,
        ..Default::default()
    };
    let response = engine
        .find_similar(&QuerySource::Embedding(vec![1.0, 0.0]), &params)
        .unwrap();
    assert_eq!(ids(&response), vec!["a", "c"]);
}

#[test]
fn test_query_failure_falls_back_to_keyword() {
    let catalog = catalog(vec![
        CatalogItem::new("lamp", "Blue Lamp", "Home", "http://img/a"),
        CatalogItem::new("shoe", "Red Sneaker", "Fashion", "http://img/b"),
    ]);
    let engine = SimilarityEngine::initialize(
        full_setup(embedder()),
        catalog,
        Arc::new(MemoryBlobStore::new()),
    )
    .unwrap();

    let response = engine
        .find_similar(
            &QuerySource::Url("bad://nowhere/red_sneaker.jpg".into()),
            &FindSimilarParams::default(),
        )
        .unwrap();

    // the engine keeps its tier; only this query degraded
    assert_eq!(engine.tier(), DegradationTier::FullEmbedding);
    assert_eq!(response.tier, DegradationTier::KeywordOverlap);
    assert_eq!(response.quality, ResultQuality::Heuristic);
    assert!(response.fallback_reason.as_deref().unwrap().starts_with("full"));
    assert_eq!(ids(&response), vec!["shoe", "lamp"]);
}

#[test]
fn test_keyword_tier_scores() {
    let catalog = catalog(vec![
        CatalogItem::new("lamp", "Blue Lamp", "Home", "lamp.jpg"),
        CatalogItem::new("shoe", "Red Sneaker", "Fashion", "shoe.jpg"),
    ]);
    let engine = SimilarityEngine::initialize(
        EngineSetup::new(DegradationTier::KeywordOverlap),
        catalog,
        Arc::new(MemoryBlobStore::new()),
    )
    .unwrap();

    let query = QuerySource::Bytes {
        data: vec![0xFF, 0xD8],
        filename: Some("red_sneaker.jpg".into()),
    };
    let response = engine
        .find_similar(&query, &FindSimilarParams::default())
        .unwrap();

    assert_eq!(response.tier, DegradationTier::KeywordOverlap);
    assert_eq!(ids(&response), vec!["shoe", "lamp"]);
    assert!((response.matches[0].similarity_score - 0.9).abs() < 1e-5);
    assert!((response.matches[1].similarity_score - 0.3).abs() < 1e-5);
}

#[test]
fn test_deterministic_tier_without_jitter() {
    let catalog = catalog(vec![product("a", "X"), product("b", "Y"), product("c", "X")]);
    let engine = SimilarityEngine::initialize(
        EngineSetup::new(DegradationTier::Deterministic).deterministic_jitter(0.0),
        catalog,
        Arc::new(MemoryBlobStore::new()),
    )
    .unwrap();

    let params = FindSimilarParams {
        category_filter: Some("x".into()),
        ..Default::default()
    };
    let response = engine
        .find_similar(&QuerySource::Embedding(vec![1.0]), &params)
        .unwrap();

    assert_eq!(response.quality, ResultQuality::Synthetic);
    assert_eq!(ids(&response), vec!["a", "c"]);
    assert!((response.matches[0].similarity_score - 0.95).abs() < 1e-5);
    assert!((response.matches[1].similarity_score - 0.90).abs() < 1e-5);
}

#[test]
fn test_text_tier_ranks_by_item_text() {
    let catalog = catalog(vec![
        CatalogItem::new("lamp", "Blue Lamp", "Home", "lamp.jpg"),
        CatalogItem::new("shoe", "Red Sneaker", "Fashion", "shoe.jpg"),
    ]);
    let engine = SimilarityEngine::initialize(
        EngineSetup::new(DegradationTier::FullEmbedding)
            .with_text_embedder(Arc::new(StubTextEmbedder::new(64))),
        catalog.clone(),
        Arc::new(MemoryBlobStore::new()),
    )
    .unwrap();

    assert_eq!(engine.tier(), DegradationTier::TextEmbedding);
    assert_eq!(engine.status().skipped.len(), 1);
    // text embeddings stay in the index
    assert_eq!(catalog.get_item_embedding("shoe").unwrap(), None);

    let query = QuerySource::Path("/uploads/red_sneaker.png".into());
    let response = engine
        .find_similar(&query, &FindSimilarParams::default())
        .unwrap();

    assert_eq!(response.tier, DegradationTier::TextEmbedding);
    assert_eq!(response.matches[0].product.id, "shoe");
}

#[test]
fn test_add_then_catalog_visibility() {
    let items: Vec<_> = (0..5)
        .map(|i| stored(&format!("p{i}"), "X", vec![0.0, 1.0]))
        .collect();
    let catalog = catalog(items);
    let engine = SimilarityEngine::initialize(
        full_setup(embedder()),
        catalog.clone(),
        Arc::new(MemoryBlobStore::new()),
    )
    .unwrap();
    assert_eq!(engine.index_len(), 5);

    let new_item = product("f", "X");
    assert_eq!(engine.add_product_to_index(&new_item).unwrap(), Some(5));
    assert_eq!(engine.index_len(), 6);

    let query = QuerySource::Embedding(vec![-1.0, 0.0]);
    let params = FindSimilarParams {
        min_similarity: 0.5,
        ..Default::default()
    };

    // indexed but not yet in the catalog
    let response = engine.find_similar(&query, &params).unwrap();
    assert!(response.matches.is_empty());
    assert_eq!(response.stale_dropped, 1);

    catalog.add_item(new_item.clone()).unwrap();
    let response = engine.find_similar(&query, &params).unwrap();
    assert_eq!(ids(&response), vec!["f"]);
    assert_eq!(response.stale_dropped, 0);

    // adding again is a no-op
    assert_eq!(engine.add_product_to_index(&new_item).unwrap(), Some(5));
    assert_eq!(engine.index_len(), 6);
}

#[test]
fn test_add_without_vector_tier() {
    let engine = SimilarityEngine::initialize(
        EngineSetup::new(DegradationTier::KeywordOverlap),
        catalog(vec![]),
        Arc::new(MemoryBlobStore::new()),
    )
    .unwrap();

    assert_eq!(engine.add_product_to_index(&product("a", "X")).unwrap(), None);
    assert_eq!(engine.rebuild_index().unwrap(), 0);
}

#[test]
fn test_add_recomputes_wrong_size_embedding() {
    let catalog = catalog(vec![]);
    let engine = SimilarityEngine::initialize(
        full_setup(embedder()),
        catalog.clone(),
        Arc::new(MemoryBlobStore::new()),
    )
    .unwrap();

    let item = stored("a", "X", vec![1.0, 0.0, 0.0]);
    catalog.add_item(item.clone()).unwrap();
    assert_eq!(engine.add_product_to_index(&item).unwrap(), Some(0));
    assert_eq!(catalog.get_item_embedding("a").unwrap(), Some(vec![1.0, 0.0]));

    // nothing to recompute from: an embedding failure, not a configuration error
    let unknown = stored("z", "X", vec![1.0, 0.0, 0.0]);
    let err = engine.add_product_to_index(&unknown).unwrap_err();
    assert!(matches!(err, SimilarityError::EmbeddingCompute(_)));
    assert_eq!(engine.index_len(), 1);
}

#[test]
fn test_concurrent_adds_and_searches() {
    let items: Vec<_> = (0..8)
        .map(|i| stored(&format!("p{i}"), "X", vec![0.0, 1.0]))
        .collect();
    let catalog = catalog(items);
    let engine = SimilarityEngine::initialize(
        full_setup(embedder()),
        catalog.clone(),
        Arc::new(MemoryBlobStore::new()),
    )
    .unwrap();
    let params = FindSimilarParams {
        max_results: 5,
        ..Default::default()
    };

    thread::scope(|scope| {
        for writer in 0..4 {
            let (engine, catalog) = (&engine, &catalog);
            scope.spawn(move || {
                for i in 0..25 {
                    let item = stored(&format!("w{writer}-{i}"), "X", vec![1.0, i as f32]);
                    catalog.add_item(item.clone()).unwrap();
                    engine.add_product_to_index(&item).unwrap();
                }
            });
        }
        for _ in 0..4 {
            let (engine, params) = (&engine, &params);
            scope.spawn(move || {
                for _ in 0..50 {
                    let response = engine
                        .find_similar(&QuerySource::Embedding(vec![1.0, 0.0]), params)
                        .unwrap();
                    assert!(response.matches.len() <= 5);
                    let unique: HashSet<_> = ids(&response).into_iter().collect();
                    assert_eq!(unique.len(), response.matches.len());
                }
            });
        }
    });

    assert_eq!(engine.index_len(), 108);
    let everything = FindSimilarParams {
        max_results: 500,
        ..Default::default()
    };
    let response = engine
        .find_similar(&QuerySource::Embedding(vec![1.0, 0.0]), &everything)
        .unwrap();
    assert_eq!(response.matches.len(), 108);
    assert_eq!(response.stale_dropped, 0);
}

#[test]
fn test_rebuild_while_searching() {
    let items: Vec<_> = (0..20)
        .map(|i| stored(&format!("p{i}"), "X", vec![1.0, i as f32]))
        .collect();
    let engine = SimilarityEngine::initialize(
        full_setup(embedder()),
        catalog(items),
        Arc::new(MemoryBlobStore::new()),
    )
    .unwrap();
    let query = QuerySource::Embedding(vec![1.0, 0.0]);
    let params = FindSimilarParams::default();

    thread::scope(|scope| {
        scope.spawn(|| {
            for _ in 0..5 {
                // items fail to embed on rebuild, so each rebuild empties the index
                engine.rebuild_index().unwrap();
            }
        });
        for _ in 0..3 {
            scope.spawn(|| {
                for _ in 0..50 {
                    let response = engine.find_similar(&query, &params).unwrap();
                    let count = response.matches.len();
                    // whole index swaps: either the full list or nothing
                    assert!(count == 20 || count == 0, "saw {count} matches");
                }
            });
        }
    });

    assert_eq!(engine.index_len(), 0);
}

#[test]
fn test_save_retried_once() {
    let store = Arc::new(MemoryBlobStore::new());
    let engine = SimilarityEngine::initialize(
        full_setup(embedder()),
        catalog(vec![product("a", "X")]),
        store.clone(),
    )
    .unwrap();
    let before = store.write_attempts();

    store.fail_next_writes(1);
    engine.add_product_to_index(&product("b", "X")).unwrap();
    assert_eq!(store.write_attempts(), before + 2);

    let reloaded = SimilarityEngine::initialize(
        full_setup(StubImageEmbedder::new(2)),
        catalog(vec![]),
        store,
    )
    .unwrap();
    assert_eq!(reloaded.index_len(), 2);
}

#[test]
fn test_save_failure_keeps_memory_index() {
    let store = Arc::new(MemoryBlobStore::new());
    let engine = SimilarityEngine::initialize(
        full_setup(embedder()),
        catalog(vec![product("a", "X")]),
        store.clone(),
    )
    .unwrap();
    let before = store.write_attempts();

    store.fail_next_writes(2);
    assert_eq!(
        engine.add_product_to_index(&product("b", "X")).unwrap(),
        Some(1)
    );
    assert_eq!(store.write_attempts(), before + 2);
    assert_eq!(engine.index_len(), 2);
}

#[test]
fn test_reload_skips_embedding() {
    let store = Arc::new(MemoryBlobStore::new());
    let items = vec![product("a", "X"), product("b", "X"), product("c", "X")];
    SimilarityEngine::initialize(full_setup(embedder()), catalog(items.clone()), store.clone())
        .unwrap();

    let fresh = Arc::new(embedder());
    let engine = SimilarityEngine::initialize(
        EngineSetup::new(DegradationTier::FullEmbedding)
            .with_image_embedder(fresh.clone())
            .with_fetcher(Arc::new(EchoFetcher)),
        catalog(items),
        store,
    )
    .unwrap();

    assert_eq!(engine.index_len(), 3);
    assert_eq!(fresh.calls(), 0);
}

#[test]
fn test_corrupt_index_rebuilt() {
    let store = Arc::new(MemoryBlobStore::new());
    let items = vec![product("a", "X"), product("b", "X"), product("c", "X")];
    SimilarityEngine::initialize(full_setup(embedder()), catalog(items.clone()), store.clone())
        .unwrap();

    store.corrupt(INDEX_KEY, 58);

    let fresh = Arc::new(embedder());
    let engine = SimilarityEngine::initialize(
        EngineSetup::new(DegradationTier::FullEmbedding)
            .with_image_embedder(fresh.clone())
            .with_fetcher(Arc::new(EchoFetcher)),
        catalog(items),
        store,
    )
    .unwrap();

    assert_eq!(engine.index_len(), 3);
    assert_eq!(fresh.calls(), 3);
}

#[test]
fn test_model_change_rebuilds() {
    let store = Arc::new(MemoryBlobStore::new());
    let catalog = catalog(vec![
        CatalogItem::new("lamp", "Blue Lamp", "Home", "http://img/a"),
        CatalogItem::new("shoe", "Red Sneaker", "Fashion", "http://img/b"),
    ]);
    SimilarityEngine::initialize(full_setup(embedder()), catalog.clone(), store.clone()).unwrap();

    let engine = SimilarityEngine::initialize(
        EngineSetup::new(DegradationTier::TextEmbedding)
            .with_text_embedder(Arc::new(StubTextEmbedder::new(2))),
        catalog,
        store,
    )
    .unwrap();

    assert_eq!(engine.tier(), DegradationTier::TextEmbedding);
    assert_eq!(engine.index_len(), 2);
}

#[test]
fn test_persisted_dimension_mismatch_is_fatal() {
    let store = Arc::new(MemoryBlobStore::new());
    SimilarityEngine::initialize(
        full_setup(embedder()),
        catalog(vec![product("a", "X")]),
        store.clone(),
    )
    .unwrap();

    let result = SimilarityEngine::initialize(
        full_setup(StubImageEmbedder::new(3)),
        catalog(vec![product("a", "X")]),
        store,
    );
    assert!(matches!(result, Err(SimilarityError::Configuration(_))));
}

#[test]
fn test_stale_stored_embedding_recomputed_on_restart() {
    let catalog = catalog(vec![product("b", "X")]);
    let engine = SimilarityEngine::initialize(
        full_setup(embedder()),
        catalog.clone(),
        Arc::new(MemoryBlobStore::new()),
    )
    .unwrap();
    catalog
        .add_item(stored("a", "X", vec![1.0, 0.0, 0.0]))
        .unwrap();
    drop(engine);

    // no persisted index, so the restart builds from the catalog
    let restarted = SimilarityEngine::initialize(
        full_setup(embedder()),
        catalog.clone(),
        Arc::new(MemoryBlobStore::new()),
    )
    .unwrap();

    assert_eq!(restarted.index_len(), 2);
    assert_eq!(catalog.get_item_embedding("a").unwrap(), Some(vec![1.0, 0.0]));
    let response = restarted
        .find_similar(
            &QuerySource::Embedding(vec![1.0, 0.0]),
            &FindSimilarParams::default(),
        )
        .unwrap();
    assert_eq!(ids(&response)[0], "a");
}

#[test]
fn test_expected_dimensions_checked() {
    let result = SimilarityEngine::initialize(
        full_setup(embedder()).expected_dimensions(Some(512)),
        catalog(vec![]),
        Arc::new(MemoryBlobStore::new()),
    );
    assert!(matches!(result, Err(SimilarityError::Configuration(_))));
}

#[test]
fn test_strict_mode_refuses_degrading() {
    let result = SimilarityEngine::initialize(
        EngineSetup::new(DegradationTier::TextEmbedding).strict(true),
        catalog(vec![]),
        Arc::new(MemoryBlobStore::new()),
    );
    assert!(matches!(result, Err(SimilarityError::Configuration(_))));

    let engine = SimilarityEngine::initialize(
        EngineSetup::new(DegradationTier::KeywordOverlap).strict(true),
        catalog(vec![]),
        Arc::new(MemoryBlobStore::new()),
    )
    .unwrap();
    assert_eq!(engine.tier(), DegradationTier::KeywordOverlap);
}

#[test]
fn test_failing_provider_degrades() {
    let engine = SimilarityEngine::initialize(
        EngineSetup::new(DegradationTier::FullEmbedding)
            .with_image_provider(|| {
                Err(crate::similarity::EmbeddingError::DownloadTimeout(30))
            })
            .with_text_embedder(Arc::new(StubTextEmbedder::new(8))),
        catalog(vec![]),
        Arc::new(MemoryBlobStore::new()),
    )
    .unwrap();

    let status = engine.status();
    assert_eq!(status.tier, DegradationTier::TextEmbedding);
    assert_eq!(status.skipped[0].tier, DegradationTier::FullEmbedding);
    assert_eq!(status.model.as_deref(), Some("stub-text"));
    assert_eq!(status.dimensions, Some(8));
}

#[test]
fn test_rebuild_drops_deleted_items() {
    let catalog = catalog(vec![product("a", "X"), product("b", "X"), product("c", "X")]);
    let engine = SimilarityEngine::initialize(
        full_setup(embedder()),
        catalog.clone(),
        Arc::new(MemoryBlobStore::new()),
    )
    .unwrap();

    catalog.delete_item("b").unwrap();
    let query = QuerySource::Embedding(vec![0.0, 1.0]);
    let params = FindSimilarParams::default();

    let response = engine.find_similar(&query, &params).unwrap();
    assert_eq!(response.stale_dropped, 1);
    assert_eq!(ids(&response), vec!["c", "a"]);

    assert_eq!(engine.rebuild_index().unwrap(), 2);
    let response = engine.find_similar(&query, &params).unwrap();
    assert_eq!(response.stale_dropped, 0);
    assert_eq!(engine.index_len(), 2);
}

#[test]
fn test_catalog_outage_answers_from_last_snapshot() {
    let flaky = Arc::new(FlakyCatalog {
        inner: catalog(vec![product("a", "X"), product("b", "X")]),
        down: AtomicBool::new(false),
    });
    let engine = SimilarityEngine::initialize(
        EngineSetup::new(DegradationTier::KeywordOverlap).deterministic_jitter(0.0),
        flaky.clone(),
        Arc::new(MemoryBlobStore::new()),
    )
    .unwrap();

    flaky.down.store(true, Ordering::SeqCst);
    let response = engine
        .find_similar(
            &QuerySource::Url("http://img/a.jpg".into()),
            &FindSimilarParams::default(),
        )
        .unwrap();

    assert_eq!(response.tier, DegradationTier::Deterministic);
    assert_eq!(response.quality, ResultQuality::Synthetic);
    assert!(response.fallback_reason.as_deref().unwrap().starts_with("catalog"));
    assert_eq!(ids(&response), vec!["a", "b"]);
}

#[test]
fn test_response_serialization() {
    let engine = SimilarityEngine::initialize(
        EngineSetup::new(DegradationTier::Deterministic).deterministic_jitter(0.0),
        catalog(vec![product("a", "X")]),
        Arc::new(MemoryBlobStore::new()),
    )
    .unwrap();

    let response = engine
        .find_similar(&QuerySource::Embedding(vec![1.0]), &FindSimilarParams::default())
        .unwrap();
    let json = serde_json::to_value(&response).unwrap();

    assert_eq!(json["tier"], "deterministic");
    assert_eq!(json["quality"], "synthetic");
    assert!(json.get("fallback_reason").is_none());
    assert!(json.get("stale_dropped").is_none());
    assert_eq!(json["matches"][0]["product"]["id"], "a");
}
