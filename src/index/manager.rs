use crate::config::CatalogConfig;
use crate::engine::SearchEngine;
use crate::error::{Result, StacError};
use crate::index::mapping::IndexMapping;
use crate::index::naming::IndexNaming;
use crate::query::queryables::Queryables;
use crate::retry::RetryPolicy;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;

/// Maps collections to physical indices and keeps their mappings valid.
///
/// Create one with [`IndexManager::new`], which returns `Arc<IndexManager>`
/// (it is `Send + Sync` and meant to be shared). Mappings are cached per
/// index name once seen; the cache only ever grows, and entries are dropped
/// with [`IndexManager::invalidate`].
pub struct IndexManager {
    engine: Arc<dyn SearchEngine>,
    naming: IndexNaming,
    retry: RetryPolicy,
    mappings: DashMap<String, Arc<IndexMapping>>,
}

impl IndexManager {
    pub fn new(engine: Arc<dyn SearchEngine>, config: &CatalogConfig) -> Arc<Self> {
        Arc::new(IndexManager {
            engine,
            naming: IndexNaming::new(
                config.items_index_prefix.clone(),
                config.collections_index.clone(),
            ),
            retry: config.retry,
            mappings: DashMap::new(),
        })
    }

    pub fn naming(&self) -> &IndexNaming {
        &self.naming
    }

    /// Create the items index for `collection_id` if absent and validate it
    /// if present. Idempotent; returns the index name.
    pub async fn ensure_index(&self, collection_id: &str) -> Result<String> {
        let name = self.naming.items_index(collection_id)?;
        if self.mappings.contains_key(&name) {
            return Ok(name);
        }
        let mapping = self.create_or_fetch(&name, IndexMapping::item_default()).await?;
        mapping.validate_item_mapping(&name)?;
        self.mappings.insert(name.clone(), Arc::new(mapping));
        Ok(name)
    }

    pub async fn ensure_collections_index(&self) -> Result<()> {
        let name = self.naming.collections_index().to_string();
        if self.mappings.contains_key(&name) {
            return Ok(());
        }
        let mapping = self
            .create_or_fetch(&name, IndexMapping::collection_default())
            .await?;
        self.mappings.insert(name, Arc::new(mapping));
        Ok(())
    }

    async fn create_or_fetch(&self, name: &str, mapping: IndexMapping) -> Result<IndexMapping> {
        if let Some(existing) = self.fetch_mapping(name).await? {
            tracing::debug!("[INDEX {}] already exists", name);
            return Ok(existing);
        }
        let created = self
            .retry
            .run("create_index", || self.engine.create_index(name, &mapping))
            .await;
        match created {
            Ok(()) => {
                tracing::info!("[INDEX {}] created with {} mapped fields", name, mapping.fields().count());
                Ok(mapping)
            }
            Err(StacError::AlreadyExists(_)) => {
                // Lost a creation race; the winner's mapping is authoritative.
                tracing::debug!("[INDEX {}] created concurrently", name);
                self.fetch_mapping(name)
                    .await?
                    .ok_or_else(|| StacError::Engine(format!("index {} vanished after creation", name)))
            }
            Err(e) => Err(e),
        }
    }

    async fn fetch_mapping(&self, name: &str) -> Result<Option<IndexMapping>> {
        self.retry
            .run("get_mapping", || self.engine.get_mapping(name))
            .await
    }

    /// Mapping of a collection's items index, `None` when it does not exist.
    pub async fn mapping(&self, collection_id: &str) -> Result<Option<Arc<IndexMapping>>> {
        let name = self.naming.items_index(collection_id)?;
        if let Some(cached) = self.mappings.get(&name) {
            return Ok(Some(Arc::clone(&cached)));
        }
        match self.fetch_mapping(&name).await? {
            Some(m) => {
                let m = Arc::new(m);
                self.mappings.insert(name, Arc::clone(&m));
                Ok(Some(m))
            }
            None => Ok(None),
        }
    }

    /// Index name for a collection that must already exist.
    pub async fn require_index(&self, collection_id: &str) -> Result<String> {
        match self.mapping(collection_id).await? {
            Some(_) => self.naming.items_index(collection_id),
            None => Err(StacError::NotFound(format!("collection {}", collection_id))),
        }
    }

    /// Fields known across the given collections (all collections when
    /// empty). The default item mapping is always included, so root fields
    /// and core properties resolve even before any index exists.
    pub async fn queryables(&self, collections: &[String]) -> Result<Queryables> {
        let mut merged = IndexMapping::item_default();
        if collections.is_empty() {
            let pattern = self.naming.items_wildcard();
            if let Some(m) = self.fetch_mapping(&pattern).await? {
                merged.merge(&m);
            }
        } else {
            for c in collections {
                if let Some(m) = self.mapping(c).await? {
                    merged.merge(&m);
                }
            }
        }
        Ok(Queryables::new(merged))
    }

    /// Fields of the collections index over the default collection mapping.
    pub async fn collection_queryables(&self) -> Result<Queryables> {
        let name = self.naming.collections_index().to_string();
        let mut merged = IndexMapping::collection_default();
        let cached = self.mappings.get(&name).map(|m| Arc::clone(&m));
        let stored = match cached {
            Some(m) => Some(m),
            None => match self.fetch_mapping(&name).await? {
                Some(m) => {
                    let m = Arc::new(m);
                    self.mappings.insert(name, Arc::clone(&m));
                    Some(m)
                }
                None => None,
            },
        };
        if let Some(m) = stored {
            merged.merge(&m);
        }
        Ok(Queryables::for_collections(merged))
    }

    /// Drop a collection's cached mapping when a written document carries
    /// fields it does not know, so the next lookup sees what the engine
    /// mapped dynamically.
    pub fn observe_write(&self, collection_id: &str, document: &Value) {
        let Ok(name) = self.naming.items_index(collection_id) else {
            return;
        };
        let stale = match self.mappings.get(&name) {
            Some(cached) => {
                let mut learned = IndexMapping::clone(&cached);
                learned.learn_dynamic(document);
                learned != **cached
            }
            None => false,
        };
        if stale {
            self.mappings.remove(&name);
            tracing::debug!("[INDEX {}] new fields written; cached mapping dropped", name);
        }
    }

    pub fn invalidate(&self, collection_id: &str) {
        if let Ok(name) = self.naming.items_index(collection_id) {
            self.mappings.remove(&name);
        }
    }
}
