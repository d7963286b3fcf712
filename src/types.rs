use crate::aggregation::AggregationInfo;
use crate::error::{Result, StacError};
use crate::geo::{Bbox, Geometry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Collection identifier, e.g. `"landsat-c2-l2"`.
pub type CollectionId = String;
/// Item identifier, unique within its collection.
pub type ItemId = String;

pub const STAC_VERSION: &str = "1.0.0";

/// Link relations that are derived from the request at read time and never stored.
pub const INFERRED_LINK_RELS: [&str; 5] = ["self", "item", "parent", "collection", "root"];

fn default_feature_type() -> String {
    "Feature".to_string()
}

fn default_stac_version() -> String {
    STAC_VERSION.to_string()
}

/// A STAC Item: one catalog record with a geometry, a temporal extent and
/// arbitrary properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    #[serde(rename = "type", default = "default_feature_type")]
    pub feature_type: String,
    #[serde(default = "default_stac_version")]
    pub stac_version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stac_extensions: Vec<String>,
    pub id: ItemId,
    #[serde(default)]
    pub collection: CollectionId,
    pub geometry: Geometry,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<Vec<f64>>,
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub assets: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub links: Vec<serde_json::Value>,
}

/// The temporal extent of an item: an instant, or a closed interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Temporal {
    Instant(DateTime<Utc>),
    Interval {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

impl Temporal {
    pub fn start(&self) -> DateTime<Utc> {
        match self {
            Temporal::Instant(t) => *t,
            Temporal::Interval { start, .. } => *start,
        }
    }

    pub fn end(&self) -> DateTime<Utc> {
        match self {
            Temporal::Instant(t) => *t,
            Temporal::Interval { end, .. } => *end,
        }
    }
}

pub fn parse_rfc3339(field: &str, s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            StacError::InvalidRequest(format!("{} is not an RFC 3339 datetime ({}): {}", field, s, e))
        })
}

impl Item {
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| StacError::InvalidRequest(format!("not a STAC item: {}", e)))
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    fn datetime_property(&self, name: &str) -> Result<Option<DateTime<Utc>>> {
        match self.properties.get(name) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(serde_json::Value::String(s)) => parse_rfc3339(name, s).map(Some),
            Some(other) => Err(StacError::InvalidRequest(format!(
                "{} must be a string, got {}",
                name, other
            ))),
        }
    }

    /// `datetime` wins when present; otherwise both `start_datetime` and
    /// `end_datetime` are required.
    pub fn temporal(&self) -> Result<Temporal> {
        if let Some(t) = self.datetime_property("datetime")? {
            return Ok(Temporal::Instant(t));
        }
        match (
            self.datetime_property("start_datetime")?,
            self.datetime_property("end_datetime")?,
        ) {
            (Some(start), Some(end)) if start <= end => Ok(Temporal::Interval { start, end }),
            (Some(start), Some(end)) => Err(StacError::InvalidRequest(format!(
                "start_datetime {} is after end_datetime {}",
                start, end
            ))),
            _ => Err(StacError::InvalidRequest(format!(
                "item {} needs datetime, or start_datetime and end_datetime",
                self.id
            ))),
        }
    }

    /// Validate and normalize an item before it is written: non-empty ids,
    /// a valid geometry, a usable temporal extent and numeric properties that
    /// are finite. Fills `bbox` from the geometry and drops inferred links.
    pub fn prepare_for_write(mut self) -> Result<Self> {
        if self.id.trim().is_empty() {
            return Err(StacError::InvalidRequest("item id must not be empty".to_string()));
        }
        if self.collection.trim().is_empty() {
            return Err(StacError::InvalidRequest(format!(
                "item {} has no collection",
                self.id
            )));
        }
        self.geometry = self.geometry.normalized()?;
        self.temporal()?;
        for (key, value) in &self.properties {
            if let serde_json::Value::Number(n) = value {
                if n.as_f64().map_or(true, |f| !f.is_finite()) {
                    return Err(StacError::InvalidRequest(format!(
                        "property {} is not a finite number",
                        key
                    )));
                }
            }
        }
        match &self.bbox {
            Some(b) => {
                Bbox::from_slice(b)?;
            }
            None => self.bbox = self.geometry.bbox().map(|b| b.to_vec()),
        }
        self.links.retain(|link| {
            link.get("rel")
                .and_then(|r| r.as_str())
                .map_or(true, |rel| !INFERRED_LINK_RELS.contains(&rel))
        });
        Ok(self)
    }
}

/// Optimistic concurrency token: the engine's sequence number and primary term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionToken {
    pub seq_no: u64,
    pub primary_term: u64,
}

impl VersionToken {
    pub fn new(seq_no: u64, primary_term: u64) -> Self {
        VersionToken {
            seq_no,
            primary_term,
        }
    }
}

impl PartialOrd for VersionToken {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VersionToken {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.primary_term, self.seq_no).cmp(&(other.primary_term, other.seq_no))
    }
}

impl std::fmt::Display for VersionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.primary_term, self.seq_no)
    }
}

/// An item as read back from the engine, with its current version token.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedItem {
    pub item: Item,
    pub version: VersionToken,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpatialExtent {
    pub bbox: Vec<Vec<f64>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemporalExtent {
    /// Each interval is `[start, end]`; `None` means open.
    pub interval: Vec<[Option<String>; 2]>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Extent {
    pub spatial: SpatialExtent,
    pub temporal: TemporalExtent,
}

fn default_collection_type() -> String {
    "Collection".to_string()
}

/// A STAC Collection: a named grouping of items with shared metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    #[serde(rename = "type", default = "default_collection_type")]
    pub collection_type: String,
    #[serde(default = "default_stac_version")]
    pub stac_version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stac_extensions: Vec<String>,
    pub id: CollectionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    #[serde(default = "default_license")]
    pub license: String,
    #[serde(default)]
    pub extent: Extent,
    #[serde(default)]
    pub summaries: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub links: Vec<serde_json::Value>,
    /// Aggregations this collection offers; empty means the defaults.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aggregations: Vec<AggregationInfo>,
}

fn default_license() -> String {
    "proprietary".to_string()
}

impl Collection {
    pub fn new(id: impl Into<String>) -> Self {
        Collection {
            collection_type: default_collection_type(),
            stac_version: default_stac_version(),
            stac_extensions: Vec::new(),
            id: id.into(),
            title: None,
            description: String::new(),
            keywords: Vec::new(),
            license: default_license(),
            extent: Extent::default(),
            summaries: serde_json::Map::new(),
            links: Vec::new(),
            aggregations: Vec::new(),
        }
    }
}
