//! Product catalog.
//!
//! The catalog owns item metadata. The similarity engine only reads ordered
//! snapshots of it and writes back embeddings it computed.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use rusty_ulid::Ulid;
use serde::{Deserialize, Serialize};

use crate::storage::BlobStore;

/// Blob key the catalog is stored under
pub const CATALOG_KEY: &str = "products.json";

/// Default page size for [`JsonCatalog::products`]
pub const DEFAULT_PAGE_SIZE: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub id: String,
    pub name: String,
    pub category: String,
    #[serde(default)]
    pub description: Option<String>,
    pub image_url: String,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Image embedding computed by the full-embedding tier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl CatalogItem {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        category: impl Into<String>,
        image_url: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            category: category.into(),
            description: None,
            image_url: image_url.into(),
            price: None,
            brand: None,
            tags: Vec::new(),
            embedding: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Name, description, tags and category joined by spaces.
    pub fn text_fields(&self) -> String {
        let mut parts: Vec<&str> = vec![self.name.as_str()];
        if let Some(description) = &self.description {
            parts.push(description);
        }
        parts.extend(self.tags.iter().map(String::as_str));
        parts.push(&self.category);

        parts
            .into_iter()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn in_category(&self, category: &str) -> bool {
        self.category.to_lowercase() == category.to_lowercase()
    }

    /// Copy without the embedding, for responses.
    pub fn without_embedding(&self) -> Self {
        Self {
            embedding: None,
            ..self.clone()
        }
    }
}

/// Input for creating a catalog item. A ULID is assigned when `id` is absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogItemCreate {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub category: String,
    #[serde(default)]
    pub description: Option<String>,
    pub image_url: String,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
}

impl CatalogItemCreate {
    pub fn into_item(self) -> Result<CatalogItem, CatalogError> {
        if self.name.trim().is_empty() {
            return Err(CatalogError::Invalid("name must not be empty".into()));
        }
        if self.category.trim().is_empty() {
            return Err(CatalogError::Invalid("category must not be empty".into()));
        }
        if self.image_url.trim().is_empty() {
            return Err(CatalogError::Invalid("image_url must not be empty".into()));
        }

        Ok(CatalogItem {
            id: self
                .id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| Ulid::generate().to_string()),
            name: self.name.trim().to_string(),
            category: self.category.trim().to_string(),
            description: self.description,
            image_url: self.image_url.trim().to_string(),
            price: self.price,
            brand: self.brand,
            tags: self.tags.into_iter().map(|t| t.to_lowercase()).collect(),
            embedding: self.embedding,
            created_at: Utc::now(),
        })
    }
}

/// Read-only, ordered view of the catalog at one point in time.
#[derive(Debug, Clone, Default)]
pub struct CatalogSnapshot {
    items: Vec<CatalogItem>,
    positions: HashMap<String, usize>,
}

impl CatalogSnapshot {
    pub fn new(items: Vec<CatalogItem>) -> Self {
        let positions = items
            .iter()
            .enumerate()
            .map(|(pos, item)| (item.id.clone(), pos))
            .collect();
        Self { items, positions }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[CatalogItem] {
        &self.items
    }

    pub fn at(&self, position: usize) -> Option<&CatalogItem> {
        self.items.get(position)
    }

    pub fn position_of(&self, id: &str) -> Option<usize> {
        self.positions.get(id).copied()
    }

    pub fn get(&self, id: &str) -> Option<&CatalogItem> {
        self.position_of(id).map(|pos| &self.items[pos])
    }
}

/// What the similarity engine needs from the catalog.
pub trait CatalogStore: Send + Sync {
    /// All items, in catalog order.
    fn list_items(&self) -> Result<Vec<CatalogItem>, CatalogError>;

    fn get_item_embedding(&self, id: &str) -> Result<Option<Vec<f32>>, CatalogError>;

    fn set_item_embedding(&self, id: &str, embedding: Vec<f32>) -> Result<(), CatalogError>;
}

/// Errors raised by catalog operations.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("product not found: {0}")]
    NotFound(String),

    #[error("product with id {0} already exists")]
    AlreadyExists(String),

    #[error("invalid product: {0}")]
    Invalid(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed catalog: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("catalog lock poisoned")]
    Poisoned,
}

/// Catalog persisted as a JSON array in a blob store.
pub struct JsonCatalog {
    store: Arc<dyn BlobStore>,
    items: RwLock<Vec<CatalogItem>>,
}

impl JsonCatalog {
    /// Open the catalog, seeding it with sample products when the blob is
    /// missing or unreadable.
    pub fn open(store: Arc<dyn BlobStore>) -> Result<Self, CatalogError> {
        let items = match store.read(CATALOG_KEY)? {
            Some(bytes) => match serde_json::from_slice::<Vec<CatalogItem>>(&bytes) {
                Ok(items) => {
                    log::info!("Loaded {} products", items.len());
                    Some(items)
                }
                Err(e) => {
                    log::warn!("Error loading products, reseeding sample catalog: {e}");
                    None
                }
            },
            None => None,
        };

        let catalog = match items {
            Some(items) => Self::with_items(store, items),
            None => {
                let catalog = Self::with_items(store, sample_items());
                catalog.persist(&catalog.read()?)?;
                log::info!("Created {} sample products", catalog.len());
                catalog
            }
        };

        Ok(catalog)
    }

    /// Catalog over the given items without touching storage.
    pub fn with_items(store: Arc<dyn BlobStore>, items: Vec<CatalogItem>) -> Self {
        Self {
            store,
            items: RwLock::new(items),
        }
    }

    pub fn len(&self) -> usize {
        self.items.read().map(|items| items.len()).unwrap_or(0)
    }

    pub fn get_item(&self, id: &str) -> Result<Option<CatalogItem>, CatalogError> {
        Ok(self.read()?.iter().find(|item| item.id == id).cloned())
    }

    /// Page through products, optionally restricted to one category
    /// (case-insensitive).
    pub fn products(
        &self,
        category: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CatalogItem>, CatalogError> {
        Ok(self
            .read()?
            .iter()
            .filter(|item| category.map_or(true, |c| item.in_category(c)))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    /// Sorted, de-duplicated category names.
    pub fn categories(&self) -> Result<Vec<String>, CatalogError> {
        let mut categories: Vec<String> = self
            .read()?
            .iter()
            .map(|item| item.category.clone())
            .collect();
        categories.sort();
        categories.dedup();
        Ok(categories)
    }

    /// Append an item. Ids must be unique.
    /// Mutations are applied to a copy that is persisted first, so a failed
    /// write leaves the in-memory catalog untouched.
    pub fn add_item(&self, item: CatalogItem) -> Result<CatalogItem, CatalogError> {
        let mut items = self.items.write().map_err(|_| CatalogError::Poisoned)?;
        if items.iter().any(|existing| existing.id == item.id) {
            return Err(CatalogError::AlreadyExists(item.id));
        }
        let mut updated = items.clone();
        updated.push(item.clone());
        self.persist(&updated)?;
        *items = updated;
        Ok(item)
    }

    pub fn delete_item(&self, id: &str) -> Result<CatalogItem, CatalogError> {
        let mut items = self.items.write().map_err(|_| CatalogError::Poisoned)?;
        let pos = items
            .iter()
            .position(|item| item.id == id)
            .ok_or_else(|| CatalogError::NotFound(id.to_string()))?;
        let mut updated = items.clone();
        let removed = updated.remove(pos);
        self.persist(&updated)?;
        *items = updated;
        Ok(removed)
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Vec<CatalogItem>>, CatalogError> {
        self.items.read().map_err(|_| CatalogError::Poisoned)
    }

    fn persist(&self, items: &[CatalogItem]) -> Result<(), CatalogError> {
        let json = serde_json::to_vec_pretty(items)?;
        self.store.write(CATALOG_KEY, &json)?;
        Ok(())
    }
}

impl CatalogStore for JsonCatalog {
    fn list_items(&self) -> Result<Vec<CatalogItem>, CatalogError> {
        Ok(self.read()?.clone())
    }

    fn get_item_embedding(&self, id: &str) -> Result<Option<Vec<f32>>, CatalogError> {
        self.read()?
            .iter()
            .find(|item| item.id == id)
            .map(|item| item.embedding.clone())
            .ok_or_else(|| CatalogError::NotFound(id.to_string()))
    }

    fn set_item_embedding(&self, id: &str, embedding: Vec<f32>) -> Result<(), CatalogError> {
        let mut items = self.items.write().map_err(|_| CatalogError::Poisoned)?;
        let mut updated = items.clone();
        let item = updated
            .iter_mut()
            .find(|item| item.id == id)
            .ok_or_else(|| CatalogError::NotFound(id.to_string()))?;
        item.embedding = Some(embedding);
        self.persist(&updated)?;
        *items = updated;
        Ok(())
    }
}

/// Built-in catalog used when no products file exists yet.
pub fn sample_items() -> Vec<CatalogItem> {
    let raw: &[(&str, &str, &str, &str, f64, &str, &[&str])] = &[
        ("iPhone 15 Pro", "Electronics", "Latest iPhone with titanium design and advanced camera system", "photo-1592750475338-74b7b21085ab", 999.99, "Apple", &["smartphone", "mobile", "apple", "premium"]),
        ("MacBook Pro 16\"", "Electronics", "Professional laptop with M3 chip", "photo-1517336714731-489689fd1ca8", 2499.99, "Apple", &["laptop", "computer", "apple", "professional"]),
        ("Samsung Galaxy S24", "Electronics", "Android flagship with AI features", "photo-1511707171634-5f897ff02aa9", 899.99, "Samsung", &["smartphone", "android", "samsung"]),
        ("Sony WH-1000XM5", "Electronics", "Premium noise-canceling headphones", "photo-1583394838336-acd977736f90", 399.99, "Sony", &["headphones", "audio", "wireless", "noise-canceling"]),
        ("Nike Air Jordan 1", "Fashion", "Classic basketball sneakers", "photo-1542291026-7eec264c27ff", 170.0, "Nike", &["sneakers", "shoes", "basketball", "classic"]),
        ("Levi's 501 Jeans", "Fashion", "Original straight fit jeans", "photo-1541099649105-f69ad21f3246", 89.99, "Levi's", &["jeans", "denim", "casual", "classic"]),
        ("Adidas Ultraboost 22", "Fashion", "Premium running shoes", "photo-1549298916-b41d501d3772", 180.0, "Adidas", &["sneakers", "running", "sport", "comfort"]),
        ("Ray-Ban Aviator", "Fashion", "Classic aviator sunglasses", "photo-1572635196237-14b3f281503f", 154.0, "Ray-Ban", &["sunglasses", "aviator", "classic", "eyewear"]),
        ("Dyson V15 Detect", "Home & Garden", "Cordless vacuum with laser detection", "photo-1558618666-fcd25c85cd64", 749.99, "Dyson", &["vacuum", "cordless", "cleaning", "technology"]),
        ("KitchenAid Stand Mixer", "Home & Garden", "Professional 5-quart stand mixer", "photo-1556909114-f6e7ad7d3136", 379.99, "KitchenAid", &["mixer", "kitchen", "baking", "appliance"]),
        ("Instant Pot Duo", "Home & Garden", "7-in-1 electric pressure cooker", "photo-1585515656973-a0b1b2c8b7b0", 99.99, "Instant Pot", &["pressure cooker", "kitchen", "cooking", "appliance"]),
        ("Monstera Deliciosa Plant", "Home & Garden", "Large tropical houseplant", "photo-1506905925346-21bda4d32df4", 45.0, "Plant Co", &["plant", "houseplant", "tropical", "decor"]),
        ("Wilson Evolution Basketball", "Sports", "Indoor game basketball with moisture-wicking cover", "photo-1519861531473-9200262188bf", 64.99, "Wilson", &["basketball", "ball", "indoor", "sport"]),
        ("Yoga Mat Pro", "Sports", "Non-slip extra thick exercise mat", "photo-1544367567-0f2fcb009e0b", 79.0, "Manduka", &["yoga", "mat", "fitness", "exercise"]),
        ("The Pragmatic Programmer", "Books", "Your journey to mastery, 20th anniversary edition", "photo-1544716278-ca5e3f4abd8c", 49.99, "Addison-Wesley", &["programming", "software", "career"]),
        ("Atomic Habits", "Books", "An easy and proven way to build good habits", "photo-1512820790803-83ca734da794", 16.99, "Avery", &["self-help", "habits", "productivity"]),
    ];

    raw.iter()
        .map(|(name, category, description, photo, price, brand, tags)| CatalogItem {
            id: Ulid::generate().to_string(),
            name: name.to_string(),
            category: category.to_string(),
            description: Some(description.to_string()),
            image_url: format!("https://images.unsplash.com/{photo}?w=500"),
            price: Some(*price),
            brand: Some(brand.to_string()),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            embedding: None,
            created_at: Utc::now(),
        })
        .collect()
}
