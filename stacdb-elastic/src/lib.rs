//! [`stacdb::SearchEngine`] over the Elasticsearch/OpenSearch REST API.
//!
//! ```rust,no_run
//! use stacdb::{CatalogConfig, IndexManager};
//! use stacdb_elastic::{ElasticClient, ElasticConfig};
//! use std::sync::Arc;
//!
//! # async fn run() -> stacdb::Result<()> {
//! let catalog = CatalogConfig::from_env();
//! let engine = Arc::new(ElasticClient::new(&ElasticConfig::from_env(), catalog.dialect)?);
//! let indices = IndexManager::new(engine, &catalog);
//! indices.ensure_collections_index().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;

pub use client::ElasticClient;
pub use config::ElasticConfig;
