//! # stacdb
//!
//! The query translation and transactional indexing core of a STAC catalog
//! backed by an Elasticsearch/OpenSearch-style document engine.
//!
//! Search requests (bbox, intersects, datetime, ids, collections, CQL2
//! filters, free text) are compiled into the engine's JSON DSL and paged
//! with tamper-evident search-after tokens. The same constraints drive
//! collection search and named aggregations. Item writes use optimistic
//! concurrency on the engine's `(seq_no, primary_term)`; bulk loads report
//! one outcome per record.
//!
//! The engine is a capability: anything implementing [`SearchEngine`]. The
//! in-process [`MemoryEngine`] honors the same contract; the companion
//! `stacdb-elastic` crate talks to a real cluster.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use stacdb::{CatalogConfig, IndexManager, MemoryEngine, MutationCoordinator, Paginator};
//! use stacdb::query::{parse_filter, FilterLang, SearchRequest};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn run() -> stacdb::Result<()> {
//! let engine = Arc::new(MemoryEngine::new());
//! let config = CatalogConfig::from_env();
//! let indices = IndexManager::new(engine.clone(), &config); // Returns Arc<IndexManager>
//! indices.ensure_index("landsat").await?;
//!
//! let writes = MutationCoordinator::new(engine.clone(), indices.clone(), &config);
//! let item = stacdb::Item::from_json(json!({
//!     "id": "scene-1",
//!     "collection": "landsat",
//!     "geometry": {"type": "Point", "coordinates": [1.0, 2.0]},
//!     "properties": {"datetime": "2020-06-01T00:00:00Z", "eo:cloud_cover": 12}
//! }))?;
//! writes.create(item, None).await?;
//!
//! let paginator = Paginator::new(engine, indices, &config);
//! let request = SearchRequest {
//!     collections: vec!["landsat".into()],
//!     filter: Some(parse_filter(&json!("eo:cloud_cover < 20"), FilterLang::Cql2Text)?),
//!     limit: Some(10),
//!     ..Default::default()
//! };
//! let page = paginator.page(&request).await?;
//! println!("{} hits, next = {:?}", page.hits.len(), page.next);
//! # Ok(())
//! # }
//! ```

pub mod aggregation;
pub mod collection;
pub mod config;
pub mod engine;
pub mod error;
pub mod geo;
pub mod index;
pub mod mutation;
pub mod pagination;
pub mod query;
pub mod retry;
pub mod types;

pub use aggregation::{AggregationRequest, Aggregator};
pub use collection::{CollectionCatalog, CollectionPage};
pub use config::CatalogConfig;
pub use engine::{MemoryEngine, Refresh, SearchEngine};
pub use error::{ErrorKind, Result, StacError};
pub use index::IndexManager;
pub use mutation::{BulkOutcome, MutationCoordinator};
pub use pagination::{Page, Paginator};
pub use types::*;

/// Install a fmt subscriber filtered by `RUST_LOG` (default `info`).
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
