//! Named aggregations over item searches.
//!
//! A client asks for aggregations by name (`collection_frequency`,
//! `datetime_max`, ...) alongside ordinary search constraints. Each name maps
//! to one engine aggregation, computed over every matching item rather than
//! one page. Collections may restrict the names they offer by listing them
//! in their `aggregations` field.

use crate::collection::CollectionCatalog;
use crate::config::CatalogConfig;
use crate::engine::{AggregationResult, SearchEngine};
use crate::error::{Result, StacError};
use crate::index::manager::IndexManager;
use crate::query::builder::{SearchRequest, SearchRequestBuilder};
use crate::query::dsl::{Aggregation, CalendarInterval};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

pub const MAX_GEOHASH_PRECISION: u8 = 12;
const DEFAULT_GEOHASH_PRECISION: u8 = 1;
const FREQUENCY_BUCKETS: usize = 10_000;

const INTEGER: &str = "integer";
const DATETIME: &str = "datetime";
const FREQUENCY: &str = "frequency_distribution";

/// Offered when a collection does not list its own.
const DEFAULT_AGGREGATIONS: [(&str, &str); 8] = [
    ("total_count", INTEGER),
    ("datetime_max", DATETIME),
    ("datetime_min", DATETIME),
    ("datetime_frequency", FREQUENCY),
    ("collection_frequency", FREQUENCY),
    ("platform_frequency", FREQUENCY),
    ("grid_code_frequency", FREQUENCY),
    ("geometry_geohash_grid_frequency", FREQUENCY),
];

/// A named aggregation a collection offers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AggregationInfo {
    pub name: String,
    pub data_type: String,
}

impl AggregationInfo {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        AggregationInfo {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

pub fn default_aggregations() -> Vec<AggregationInfo> {
    DEFAULT_AGGREGATIONS
        .iter()
        .map(|(name, data_type)| AggregationInfo::new(*name, *data_type))
        .collect()
}

/// The engine aggregation behind a name. `total_count` is `None`: it is the
/// search's own hit count.
fn engine_aggregation(name: &str, geohash_precision: u8) -> Result<Option<Aggregation>> {
    let terms = |field: &str| Aggregation::Terms {
        field: field.to_string(),
        size: FREQUENCY_BUCKETS,
    };
    Ok(Some(match name {
        "total_count" => return Ok(None),
        "datetime_max" => Aggregation::Max {
            field: "properties.datetime".to_string(),
        },
        "datetime_min" => Aggregation::Min {
            field: "properties.datetime".to_string(),
        },
        "datetime_frequency" => Aggregation::DateHistogram {
            field: "properties.datetime".to_string(),
            interval: CalendarInterval::Month,
        },
        "collection_frequency" => terms("collection"),
        "platform_frequency" => terms("properties.platform"),
        "grid_code_frequency" => terms("properties.grid:code"),
        "geometry_geohash_grid_frequency" => Aggregation::GeohashGrid {
            field: "geometry".to_string(),
            precision: geohash_precision,
            size: FREQUENCY_BUCKETS,
        },
        other => {
            return Err(StacError::InvalidRequest(format!(
                "aggregation {} is not supported",
                other
            )))
        }
    }))
}

/// Search constraints plus the aggregations to compute over the matches.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregationRequest {
    pub search: SearchRequest,
    /// Names to compute; empty means every name on offer.
    pub aggregations: Vec<String>,
    pub geohash_precision: Option<u8>,
}

impl AggregationRequest {
    /// Parse a search body carrying `aggregations` (array or comma-separated
    /// string) and `geometry_geohash_grid_frequency_precision`.
    pub fn from_json(value: &Value) -> Result<Self> {
        let search = SearchRequest::from_json(value)?;
        let aggregations = match value.get("aggregations") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::String(s)) => s
                .split(',')
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string)
                .collect(),
            Some(Value::Array(names)) => names
                .iter()
                .map(|n| {
                    n.as_str().map(str::to_string).ok_or_else(|| {
                        StacError::InvalidRequest("aggregation names must be strings".to_string())
                    })
                })
                .collect::<Result<_>>()?,
            Some(other) => {
                return Err(StacError::InvalidRequest(format!(
                    "invalid aggregations: {}",
                    other
                )))
            }
        };
        let geohash_precision = match value.get("geometry_geohash_grid_frequency_precision") {
            None | Some(Value::Null) => None,
            Some(v) => Some(
                v.as_u64()
                    .and_then(|p| u8::try_from(p).ok())
                    .ok_or_else(|| {
                        StacError::InvalidRequest(format!("invalid geohash precision: {}", v))
                    })?,
            ),
        };
        Ok(AggregationRequest {
            search,
            aggregations,
            geohash_precision,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrequencyBucket {
    pub key: Value,
    pub data_type: String,
    pub frequency: u64,
}

/// One computed aggregation: a single value or a frequency distribution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregationOutput {
    pub name: String,
    pub data_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buckets: Option<Vec<FrequencyBucket>>,
}

pub struct Aggregator {
    engine: Arc<dyn SearchEngine>,
    indices: Arc<IndexManager>,
    collections: CollectionCatalog,
    builder: SearchRequestBuilder,
    retry: RetryPolicy,
}

impl Aggregator {
    pub fn new(
        engine: Arc<dyn SearchEngine>,
        indices: Arc<IndexManager>,
        config: &CatalogConfig,
    ) -> Self {
        Aggregator {
            collections: CollectionCatalog::new(engine.clone(), indices.clone(), config),
            engine,
            indices,
            builder: SearchRequestBuilder::new(config),
            retry: config.retry,
        }
    }

    /// Names on offer: the collection's own list when it has one, the
    /// defaults otherwise.
    pub async fn available(&self, collection_id: Option<&str>) -> Result<Vec<AggregationInfo>> {
        let Some(id) = collection_id else {
            return Ok(default_aggregations());
        };
        let (collection, _) = self.collections.get(id).await?;
        Ok(if collection.aggregations.is_empty() {
            default_aggregations()
        } else {
            collection.aggregations
        })
    }

    /// Names every requested collection offers, in the first one's order.
    async fn offered(&self, collections: &[String]) -> Result<Vec<AggregationInfo>> {
        let Some((first, rest)) = collections.split_first() else {
            return self.available(None).await;
        };
        let mut offered = self.available(Some(first)).await?;
        for id in rest {
            let other = self.available(Some(id)).await?;
            offered.retain(|info| other.iter().any(|o| o.name == info.name));
        }
        Ok(offered)
    }

    pub async fn aggregate(&self, request: &AggregationRequest) -> Result<Vec<AggregationOutput>> {
        let precision = request.geohash_precision.unwrap_or(DEFAULT_GEOHASH_PRECISION);
        if !(1..=MAX_GEOHASH_PRECISION).contains(&precision) {
            return Err(StacError::InvalidRequest(format!(
                "geohash precision must be between 1 and {}, got {}",
                MAX_GEOHASH_PRECISION, precision
            )));
        }

        let offered = self.offered(&request.search.collections).await?;
        let wanted: Vec<AggregationInfo> = if request.aggregations.is_empty() {
            offered
        } else {
            request
                .aggregations
                .iter()
                .map(|name| {
                    offered
                        .iter()
                        .find(|info| &info.name == name)
                        .cloned()
                        .ok_or_else(|| {
                            StacError::InvalidRequest(format!(
                                "aggregation {} is not offered by the requested collections",
                                name
                            ))
                        })
                })
                .collect::<Result<_>>()?
        };

        let normalized = self.builder.normalize(&request.search)?;
        let queryables = self.indices.queryables(&normalized.collections).await?;
        let mut search = self.builder.build_normalized(&normalized, &queryables)?;
        search.query.size = 0;
        search.query.sort.clear();
        search.query.source = None;
        for info in &wanted {
            if let Some(agg) = engine_aggregation(&info.name, precision)? {
                search.query.aggregations.insert(info.name.clone(), agg);
            }
        }

        let mut response = self
            .retry
            .run("aggregate", || self.engine.search(&search))
            .await?;
        tracing::debug!(
            "[AGGREGATE {}] {} aggregations over {} matches",
            search.indices.join(","),
            wanted.len(),
            response.total.value
        );

        wanted
            .into_iter()
            .map(|info| {
                if info.name == "total_count" {
                    return Ok(AggregationOutput {
                        name: info.name,
                        data_type: info.data_type,
                        value: Some(json!(response.total.value)),
                        buckets: None,
                    });
                }
                let result = response.aggregations.shift_remove(&info.name).ok_or_else(|| {
                    StacError::Engine(format!("engine returned no {} aggregation", info.name))
                })?;
                Ok(match result {
                    AggregationResult::Value(value) => AggregationOutput {
                        name: info.name,
                        data_type: info.data_type,
                        value: Some(value.unwrap_or(Value::Null)),
                        buckets: None,
                    },
                    AggregationResult::Buckets(buckets) => AggregationOutput {
                        name: info.name,
                        data_type: info.data_type,
                        value: None,
                        buckets: Some(
                            buckets
                                .into_iter()
                                .map(|b| FrequencyBucket {
                                    key: b.key,
                                    data_type: "frequency".to_string(),
                                    frequency: b.count,
                                })
                                .collect(),
                        ),
                    },
                })
            })
            .collect()
    }
}
