//! The search-engine capability.
//!
//! Everything the catalog needs from its backing engine goes through
//! [`SearchEngine`]: search, bulk write, index creation and mapping lookup.
//! Components receive it as `Arc<dyn SearchEngine>`.

pub mod memory;

use crate::error::Result;
use crate::index::mapping::IndexMapping;
use crate::query::dsl::{EngineDialect, EngineQuery};
use crate::types::VersionToken;
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use memory::MemoryEngine;

/// A query against one or more indices (names or `prefix*` patterns).
///
/// Indices that do not exist are skipped rather than failing the search.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSearch {
    pub indices: Vec<String>,
    pub query: EngineQuery,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    pub index: String,
    pub id: String,
    pub source: Value,
    pub version: Option<VersionToken>,
    /// Sort values of this hit, in sortby order; feed back as `search_after`.
    pub sort: Vec<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TotalRelation {
    /// Exact count.
    Eq,
    /// Lower bound.
    Gte,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TotalHits {
    pub value: u64,
    pub relation: TotalRelation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    /// Term, geohash cell, or RFC 3339 start of a date bucket.
    pub key: Value,
    pub count: u64,
}

/// Outcome of one named aggregation.
#[derive(Debug, Clone, PartialEq)]
pub enum AggregationResult {
    Buckets(Vec<Bucket>),
    /// Single-value metric; `None` when no hit had the field.
    Value(Option<Value>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchResponse {
    pub hits: Vec<Hit>,
    pub total: TotalHits,
    pub aggregations: IndexMap<String, AggregationResult>,
}

/// When a write becomes visible to search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Refresh {
    /// Force a refresh before returning.
    Immediate,
    /// Return once a scheduled refresh has made the write visible.
    WaitFor,
    /// Visible after the engine's normal refresh interval.
    Eventual,
}

impl Refresh {
    pub fn as_param(&self) -> &'static str {
        match self {
            Refresh::Immediate => "true",
            Refresh::WaitFor => "wait_for",
            Refresh::Eventual => "false",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "true" | "immediate" => Some(Refresh::Immediate),
            "wait_for" | "waitfor" => Some(Refresh::WaitFor),
            "false" | "eventual" => Some(Refresh::Eventual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BulkAction {
    /// Insert; fails if the id exists.
    Create,
    /// Insert or overwrite.
    Index,
    Delete,
}

impl BulkAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            BulkAction::Create => "create",
            BulkAction::Index => "index",
            BulkAction::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BulkOp {
    pub action: BulkAction,
    pub index: String,
    pub id: String,
    pub document: Option<Value>,
    /// Apply only if the stored document carries exactly this version.
    pub if_version: Option<VersionToken>,
}

impl BulkOp {
    pub fn create(index: impl Into<String>, id: impl Into<String>, document: Value) -> Self {
        BulkOp {
            action: BulkAction::Create,
            index: index.into(),
            id: id.into(),
            document: Some(document),
            if_version: None,
        }
    }

    pub fn index(index: impl Into<String>, id: impl Into<String>, document: Value) -> Self {
        BulkOp {
            action: BulkAction::Index,
            index: index.into(),
            id: id.into(),
            document: Some(document),
            if_version: None,
        }
    }

    pub fn delete(index: impl Into<String>, id: impl Into<String>) -> Self {
        BulkOp {
            action: BulkAction::Delete,
            index: index.into(),
            id: id.into(),
            document: None,
            if_version: None,
        }
    }

    pub fn if_version(mut self, version: Option<VersionToken>) -> Self {
        self.if_version = version;
        self
    }

    /// Approximate size on the wire (action line plus source line).
    pub fn estimated_bytes(&self) -> usize {
        let doc = self
            .document
            .as_ref()
            .map(|d| d.to_string().len() + 1)
            .unwrap_or(0);
        doc + self.index.len() + self.id.len() + 64
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BulkRequest {
    pub ops: Vec<BulkOp>,
    pub refresh: Refresh,
}

/// Per-op result of a bulk call, in request order.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkItemResponse {
    pub index: String,
    pub id: String,
    /// HTTP-style status: 200/201 success, 404 missing, 409 conflict, ...
    pub status: u16,
    pub version: Option<VersionToken>,
    pub error: Option<String>,
}

impl BulkItemResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait SearchEngine: Send + Sync {
    fn dialect(&self) -> EngineDialect {
        EngineDialect::default()
    }

    async fn search(&self, request: &EngineSearch) -> Result<SearchResponse>;

    /// Item-level failures are reported in the responses; `Err` means the
    /// request as a whole did not get through.
    async fn bulk(&self, request: &BulkRequest) -> Result<Vec<BulkItemResponse>>;

    /// Fails with `AlreadyExists` if the index is present.
    async fn create_index(&self, name: &str, mapping: &IndexMapping) -> Result<()>;

    /// Mapping of an index, or the merged mapping of every index matching a
    /// `prefix*` pattern. `None` when nothing matches.
    async fn get_mapping(&self, name: &str) -> Result<Option<IndexMapping>>;
}
