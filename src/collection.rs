//! Collection documents and their lazily recomputed extents.

use crate::config::CatalogConfig;
use crate::engine::{
    BulkItemResponse, BulkOp, BulkRequest, EngineSearch, Refresh, SearchEngine, TotalHits,
};
use crate::error::{Result, StacError};
use crate::geo::Bbox;
use crate::index::manager::IndexManager;
use crate::index::mapping::{COLLECTION_END_FIELD, COLLECTION_SHAPE_FIELD, COLLECTION_START_FIELD};
use crate::mutation::item_error;
use crate::pagination::Paginator;
use crate::query::builder::{FieldsSpec, SearchRequest};
use crate::query::dsl::{EngineQuery, EngineQueryNode, SortDirection, SortField};
use crate::retry::RetryPolicy;
use crate::types::{
    parse_rfc3339, Collection, Extent, Item, SpatialExtent, TemporalExtent, VersionToken,
};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};
use std::sync::Arc;

const LIST_PAGE_SIZE: usize = 500;
const EXTENT_PAGE_SIZE: usize = 1000;

/// One page of a collection search.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionPage {
    pub collections: Vec<Collection>,
    /// Token for the following page; `None` on the last page.
    pub next: Option<String>,
    pub matched: TotalHits,
}

pub struct CollectionCatalog {
    engine: Arc<dyn SearchEngine>,
    indices: Arc<IndexManager>,
    paginator: Paginator,
    retry: RetryPolicy,
    refresh: Refresh,
}

impl CollectionCatalog {
    pub fn new(
        engine: Arc<dyn SearchEngine>,
        indices: Arc<IndexManager>,
        config: &CatalogConfig,
    ) -> Self {
        CollectionCatalog {
            paginator: Paginator::new(engine.clone(), indices.clone(), config),
            engine,
            indices,
            retry: config.retry,
            refresh: config.refresh.single,
        }
    }

    /// Store a new collection and create its items index.
    pub async fn create(&self, collection: Collection) -> Result<VersionToken> {
        if collection.id.trim().is_empty() {
            return Err(StacError::InvalidRequest("collection id must not be empty".to_string()));
        }
        // Rejects ids that cannot name an index before anything is written.
        self.indices.naming().items_index(&collection.id)?;
        self.indices.ensure_collections_index().await?;

        let op = BulkOp::create(
            self.indices.naming().collections_index(),
            collection.id.clone(),
            stored_document(&collection)?,
        );
        let response = self.write_one(op).await?;
        let version = match response.status {
            200..=299 => response.version.ok_or_else(|| {
                StacError::Engine(format!("write of collection {} returned no version", collection.id))
            })?,
            409 => return Err(StacError::AlreadyExists(format!("collection {}", collection.id))),
            _ => return Err(item_error("collections", &collection.id, &response)),
        };
        self.indices.ensure_index(&collection.id).await?;
        tracing::info!("[COLLECTION {}] created", collection.id);
        Ok(version)
    }

    pub async fn get(&self, collection_id: &str) -> Result<(Collection, VersionToken)> {
        let search = self.collections_search(
            EngineQueryNode::Term {
                field: "id".to_string(),
                value: json!(collection_id),
            },
            1,
            None,
        );
        let response = self
            .retry
            .run("get_collection", || self.engine.search(&search))
            .await?;
        let hit = response
            .hits
            .into_iter()
            .next()
            .ok_or_else(|| StacError::NotFound(format!("collection {}", collection_id)))?;
        let version = hit.version.ok_or_else(|| {
            StacError::Engine(format!("collection {} returned without a version", collection_id))
        })?;
        Ok((serde_json::from_value(hit.source)?, version))
    }

    /// Every stored collection, ordered by id.
    pub async fn list(&self) -> Result<Vec<Collection>> {
        let mut all = Vec::new();
        let mut after = None;
        loop {
            let search = self.collections_search(EngineQueryNode::MatchAll, LIST_PAGE_SIZE, after);
            let response = self
                .retry
                .run("list_collections", || self.engine.search(&search))
                .await?;
            let done = response.hits.len() < LIST_PAGE_SIZE;
            after = response.hits.last().map(|h| h.sort.clone());
            for hit in response.hits {
                all.push(serde_json::from_value(hit.source)?);
            }
            if done || after.is_none() {
                return Ok(all);
            }
        }
    }

    /// Collections matching a search: `bbox`/`intersects` against the
    /// spatial extent, `datetime` overlapping the temporal extent, `q` over
    /// title, description and keywords, `filter` over collection fields, and
    /// `collections`/`ids` restricting collection ids. Ordered by `sortby`,
    /// then id.
    pub async fn search(&self, request: &SearchRequest) -> Result<CollectionPage> {
        let page = self.paginator.page_collections(request).await?;
        let collections = page
            .hits
            .into_iter()
            .map(|hit| serde_json::from_value(hit.document))
            .collect::<std::result::Result<Vec<Collection>, _>>()?;
        Ok(CollectionPage {
            collections,
            next: page.next,
            matched: page.matched,
        })
    }

    /// Overwrite a collection document, optionally only at `expected`.
    pub async fn update(
        &self,
        collection: Collection,
        expected: Option<VersionToken>,
    ) -> Result<VersionToken> {
        let op = BulkOp::index(
            self.indices.naming().collections_index(),
            collection.id.clone(),
            stored_document(&collection)?,
        )
        .if_version(expected);
        // Without a version the write would silently create the collection.
        if expected.is_none() {
            self.get(&collection.id).await?;
        }
        let response = self.write_one(op).await?;
        match response.status {
            200..=299 => response.version.ok_or_else(|| {
                StacError::Engine(format!("write of collection {} returned no version", collection.id))
            }),
            409 => match self.get(&collection.id).await {
                Err(e @ StacError::NotFound(_)) => Err(e),
                _ => Err(StacError::VersionConflict {
                    collection: collection.id.clone(),
                    id: collection.id,
                    message: "collection changed since it was read".to_string(),
                }),
            },
            _ => Err(item_error("collections", &collection.id, &response)),
        }
    }

    /// Remove the collection document. Its items index is left in place.
    pub async fn delete(&self, collection_id: &str) -> Result<()> {
        let op = BulkOp::delete(self.indices.naming().collections_index(), collection_id);
        let response = self.write_one(op).await?;
        self.indices.invalidate(collection_id);
        match response.status {
            200..=299 => Ok(()),
            404 => Err(StacError::NotFound(format!("collection {}", collection_id))),
            _ => Err(item_error("collections", collection_id, &response)),
        }
    }

    /// Recompute a collection's extent from its items and store it.
    ///
    /// An empty collection gets an empty spatial extent and a fully open
    /// temporal interval.
    pub async fn refresh_extent(&self, collection_id: &str) -> Result<Extent> {
        let (mut collection, version) = self.get(collection_id).await?;

        let request = SearchRequest {
            collections: vec![collection_id.to_string()],
            fields: Some(FieldsSpec {
                include: vec![
                    "geometry".to_string(),
                    "bbox".to_string(),
                    "properties.datetime".to_string(),
                    "properties.start_datetime".to_string(),
                    "properties.end_datetime".to_string(),
                ],
                exclude: Vec::new(),
            }),
            limit: Some(EXTENT_PAGE_SIZE),
            ..Default::default()
        };
        let hits = self.paginator.collect_all(&request).await?;

        let mut bbox: Option<Bbox> = None;
        let mut start: Option<DateTime<Utc>> = None;
        let mut end: Option<DateTime<Utc>> = None;
        for hit in &hits {
            let item = Item::from_json(hit.document.clone())?;
            let item_bbox = match &item.bbox {
                Some(b) => Some(Bbox::from_slice(b)?),
                None => item.geometry.bbox(),
            };
            if let Some(b) = item_bbox {
                bbox = Some(bbox.map_or(b, |acc| acc.union(&b)));
            }
            if let Ok(t) = item.temporal() {
                start = Some(start.map_or(t.start(), |s| s.min(t.start())));
                end = Some(end.map_or(t.end(), |e| e.max(t.end())));
            } else {
                tracing::warn!(
                    "[COLLECTION {}] item {} has no usable datetime; left out of the extent",
                    collection_id,
                    item.id
                );
            }
        }

        let format = |t: DateTime<Utc>| t.to_rfc3339_opts(SecondsFormat::Secs, true);
        let extent = Extent {
            spatial: SpatialExtent {
                bbox: bbox.map(|b| vec![b.to_vec()]).unwrap_or_default(),
            },
            temporal: TemporalExtent {
                interval: vec![[start.map(format), end.map(format)]],
            },
        };
        tracing::debug!(
            "[COLLECTION {}] extent recomputed from {} items",
            collection_id,
            hits.len()
        );
        collection.extent = extent.clone();
        self.update(collection, Some(version)).await?;
        Ok(extent)
    }

    fn collections_search(
        &self,
        query: EngineQueryNode,
        size: usize,
        search_after: Option<Vec<serde_json::Value>>,
    ) -> EngineSearch {
        EngineSearch {
            indices: vec![self.indices.naming().collections_index().to_string()],
            query: EngineQuery {
                query,
                sort: vec![SortField {
                    field: "id".to_string(),
                    direction: SortDirection::Asc,
                    unmapped_type: Some("keyword".to_string()),
                }],
                size,
                search_after,
                source: None,
                aggregations: Default::default(),
            },
        }
    }

    async fn write_one(&self, op: BulkOp) -> Result<BulkItemResponse> {
        let request = BulkRequest {
            ops: vec![op],
            refresh: self.refresh,
        };
        self.engine
            .bulk(&request)
            .await?
            .pop()
            .ok_or_else(|| StacError::Engine("bulk response had no items".to_string()))
    }
}

/// The collection as stored: its JSON plus the derived fields collection
/// search matches on.
fn stored_document(collection: &Collection) -> Result<Value> {
    let mut doc = serde_json::to_value(collection)?;
    let Some(fields) = doc.as_object_mut() else {
        return Ok(doc);
    };
    if let Some(first) = collection.extent.spatial.bbox.first() {
        match Bbox::from_slice(first) {
            Ok(b) => {
                fields.insert(COLLECTION_SHAPE_FIELD.to_string(), b.to_shape().to_json());
            }
            Err(e) => tracing::warn!(
                "[COLLECTION {}] spatial extent is not searchable: {}",
                collection.id,
                e
            ),
        }
    }
    if let Some([start, end]) = collection.extent.temporal.interval.first() {
        for (field, bound) in [(COLLECTION_START_FIELD, start), (COLLECTION_END_FIELD, end)] {
            if let Some(s) = bound {
                let t = parse_rfc3339("temporal extent", s)?;
                fields.insert(
                    field.to_string(),
                    json!(t.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
                );
            }
        }
    }
    Ok(doc)
}
