//! Item writes with optimistic concurrency.
//!
//! Every single-record write is a one-op bulk request carrying the expected
//! `(seq_no, primary_term)`, so the engine applies it atomically or not at
//! all. Single-record writes are not retried on transport failure: a lost
//! response cannot be told apart from a lost request.

pub mod bulk;

pub use bulk::BulkOutcome;

use crate::config::CatalogConfig;
use crate::engine::{BulkItemResponse, BulkOp, BulkRequest, EngineSearch, Refresh, SearchEngine};
use crate::error::{Result, StacError};
use crate::index::manager::IndexManager;
use crate::index::refresh::RefreshPolicy;
use crate::query::dsl::{EngineQuery, EngineQueryNode};
use crate::retry::RetryPolicy;
use crate::types::{Item, VersionToken, VersionedItem};
use serde_json::{json, Map, Value};
use std::sync::Arc;

pub struct MutationCoordinator {
    engine: Arc<dyn SearchEngine>,
    indices: Arc<IndexManager>,
    retry: RetryPolicy,
    refresh: RefreshPolicy,
    chunk_docs: usize,
    chunk_bytes: usize,
}

impl MutationCoordinator {
    pub fn new(
        engine: Arc<dyn SearchEngine>,
        indices: Arc<IndexManager>,
        config: &CatalogConfig,
    ) -> Self {
        MutationCoordinator {
            engine,
            indices,
            retry: config.retry,
            refresh: config.refresh,
            chunk_docs: config.bulk_chunk_docs.max(1),
            chunk_bytes: config.bulk_chunk_bytes.max(1),
        }
    }

    /// Current stored item and its version token.
    pub async fn get(&self, collection_id: &str, item_id: &str) -> Result<VersionedItem> {
        let index = self.indices.naming().items_index(collection_id)?;
        let search = EngineSearch {
            indices: vec![index],
            query: EngineQuery {
                query: EngineQueryNode::Term {
                    field: "id".to_string(),
                    value: json!(item_id),
                },
                sort: Vec::new(),
                size: 1,
                search_after: None,
                source: None,
                aggregations: Default::default(),
            },
        };
        let response = self
            .retry
            .run("get", || self.engine.search(&search))
            .await?;
        let hit = response
            .hits
            .into_iter()
            .next()
            .ok_or_else(|| not_found(collection_id, item_id))?;
        let version = hit.version.ok_or_else(|| {
            StacError::Engine(format!("engine returned {} without a version", hit.id))
        })?;
        Ok(VersionedItem {
            item: Item::from_json(hit.source)?,
            version,
        })
    }

    /// Insert a new item; `AlreadyExists` if the id is taken.
    pub async fn create(&self, item: Item, refresh: Option<Refresh>) -> Result<VersionToken> {
        let item = item.prepare_for_write()?;
        let index = self.indices.require_index(&item.collection).await?;
        let document = item.to_json();
        let op = BulkOp::create(index, item.id.clone(), document.clone());
        let response = self.write_one(op, refresh).await?;
        match response.status {
            200..=299 => {
                self.indices.observe_write(&item.collection, &document);
                success_version(&response)
            }
            409 => Err(StacError::AlreadyExists(format!(
                "item {}/{}",
                item.collection, item.id
            ))),
            _ => Err(item_error(&item.collection, &item.id, &response)),
        }
    }

    /// Overwrite an item if its stored version is still `expected`.
    pub async fn replace(
        &self,
        item: Item,
        expected: VersionToken,
        refresh: Option<Refresh>,
    ) -> Result<VersionToken> {
        let item = item.prepare_for_write()?;
        let index = self.indices.require_index(&item.collection).await?;
        let document = item.to_json();
        let op = BulkOp::index(index, item.id.clone(), document.clone()).if_version(Some(expected));
        let response = self.write_one(op, refresh).await?;
        match response.status {
            200..=299 => {
                self.indices.observe_write(&item.collection, &document);
                success_version(&response)
            }
            409 => Err(self
                .explain_conflict(&item.collection, &item.id, expected, &response)
                .await),
            _ => Err(item_error(&item.collection, &item.id, &response)),
        }
    }

    /// Overwrite top-level properties (no deep merge) under the same version
    /// check as [`Self::replace`].
    pub async fn patch(
        &self,
        collection_id: &str,
        item_id: &str,
        delta: Map<String, Value>,
        expected: VersionToken,
        refresh: Option<Refresh>,
    ) -> Result<VersionToken> {
        let current = self.get(collection_id, item_id).await?;
        if current.version != expected {
            return Err(version_conflict(
                collection_id,
                item_id,
                expected,
                Some(current.version),
            ));
        }
        let mut item = current.item;
        item.properties.extend(delta);
        self.replace(item, expected, refresh).await
    }

    /// Remove an item. Without `expected`, deleting a missing item succeeds.
    pub async fn delete(
        &self,
        collection_id: &str,
        item_id: &str,
        expected: Option<VersionToken>,
        refresh: Option<Refresh>,
    ) -> Result<()> {
        let index = self.indices.naming().items_index(collection_id)?;
        let op = BulkOp::delete(index, item_id).if_version(expected);
        let response = self.write_one(op, refresh).await?;
        match (response.status, expected) {
            (200..=299, _) => Ok(()),
            (404, None) => {
                tracing::debug!("[DELETE] {}/{} already absent", collection_id, item_id);
                Ok(())
            }
            (404, Some(_)) => Err(not_found(collection_id, item_id)),
            (409, Some(expected)) => Err(self
                .explain_conflict(collection_id, item_id, expected, &response)
                .await),
            _ => Err(item_error(collection_id, item_id, &response)),
        }
    }

    async fn write_one(&self, op: BulkOp, refresh: Option<Refresh>) -> Result<BulkItemResponse> {
        let request = BulkRequest {
            ops: vec![op],
            refresh: self.refresh.for_single(refresh),
        };
        self.engine
            .bulk(&request)
            .await?
            .pop()
            .ok_or_else(|| StacError::Engine("bulk response had no items".to_string()))
    }

    /// A conditional write was rejected: missing item or stale version.
    ///
    /// The engine's reason decides when it names the case. Re-reading is the
    /// fallback only, since search does not see writes until the next refresh.
    async fn explain_conflict(
        &self,
        collection_id: &str,
        item_id: &str,
        expected: VersionToken,
        response: &BulkItemResponse,
    ) -> StacError {
        match classify_conflict(response.error.as_deref()) {
            Some(Conflict::Missing) => return not_found(collection_id, item_id),
            Some(Conflict::Stale(current)) => {
                return version_conflict(collection_id, item_id, expected, current)
            }
            None => {}
        }
        match self.get(collection_id, item_id).await {
            Ok(current) => version_conflict(collection_id, item_id, expected, Some(current.version)),
            Err(StacError::NotFound(_)) => not_found(collection_id, item_id),
            Err(_) => version_conflict(collection_id, item_id, expected, None),
        }
    }
}

fn not_found(collection_id: &str, item_id: &str) -> StacError {
    StacError::NotFound(format!("item {}/{}", collection_id, item_id))
}

fn version_conflict(
    collection_id: &str,
    item_id: &str,
    expected: VersionToken,
    current: Option<VersionToken>,
) -> StacError {
    StacError::VersionConflict {
        collection: collection_id.to_string(),
        id: item_id.to_string(),
        message: match current {
            Some(c) => format!("expected version {}, current is {}", expected, c),
            None => format!("expected version {} is stale", expected),
        },
    }
}

/// What a rejected conditional write says about the stored document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Conflict {
    Missing,
    Stale(Option<VersionToken>),
}

/// Elasticsearch and OpenSearch end a conditional-write conflict with either
/// "current document has seqNo [s] and primary term [t]" or "but no document
/// was found".
fn classify_conflict(reason: Option<&str>) -> Option<Conflict> {
    let reason = reason?;
    if reason.contains("no document was found") {
        return Some(Conflict::Missing);
    }
    let (_, rest) = reason.split_once("current document has seqNo [")?;
    let seq_no = leading_number(rest);
    let term = rest
        .split_once("primary term [")
        .and_then(|(_, t)| leading_number(t));
    Some(Conflict::Stale(
        seq_no.zip(term).map(|(s, t)| VersionToken::new(s, t)),
    ))
}

fn leading_number(s: &str) -> Option<u64> {
    s.split(']').next()?.trim().parse().ok()
}

fn success_version(response: &BulkItemResponse) -> Result<VersionToken> {
    response.version.ok_or_else(|| {
        StacError::Engine(format!("write of {} returned no version", response.id))
    })
}

/// Map a failed per-item engine response onto the error taxonomy.
pub(crate) fn item_error(
    collection_id: &str,
    item_id: &str,
    response: &BulkItemResponse,
) -> StacError {
    let reason = response
        .error
        .clone()
        .unwrap_or_else(|| format!("status {}", response.status));
    match response.status {
        409 => StacError::VersionConflict {
            collection: collection_id.to_string(),
            id: item_id.to_string(),
            message: reason,
        },
        404 => StacError::NotFound(format!("item {}/{}: {}", collection_id, item_id, reason)),
        400 => StacError::InvalidRequest(format!("item {}/{}: {}", collection_id, item_id, reason)),
        429 | 500..=599 => StacError::Transport(reason),
        _ => StacError::Engine(reason),
    }
}
