//! Engine query DSL as a tagged tree, with one serializer per engine dialect.
//!
//! Nothing outside this module builds engine JSON by hand; dialect drift is
//! confined to [`EngineQueryNode::to_json`] and [`EngineQuery::to_body`].

use crate::error::{Result, StacError};
use crate::geo::{Geometry, SpatialRelation};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineDialect {
    /// Elasticsearch 7.x (compatibility headers, no `case_insensitive` flag).
    Elasticsearch7,
    #[default]
    Elasticsearch8,
    OpenSearch,
}

impl EngineDialect {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "es7" | "elasticsearch7" => Some(EngineDialect::Elasticsearch7),
            "es8" | "elasticsearch8" | "elasticsearch" => Some(EngineDialect::Elasticsearch8),
            "opensearch" | "os" => Some(EngineDialect::OpenSearch),
            _ => None,
        }
    }

    pub fn supports_case_insensitive(&self) -> bool {
        !matches!(self, EngineDialect::Elasticsearch7)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoolQuery {
    /// Scored conjunction.
    pub must: Vec<EngineQueryNode>,
    /// Unscored conjunction.
    pub filter: Vec<EngineQueryNode>,
    pub should: Vec<EngineQueryNode>,
    pub must_not: Vec<EngineQueryNode>,
    pub minimum_should_match: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EngineQueryNode {
    MatchAll,
    Term {
        field: String,
        value: Value,
    },
    Terms {
        field: String,
        values: Vec<Value>,
    },
    Range {
        field: String,
        gt: Option<Value>,
        gte: Option<Value>,
        lt: Option<Value>,
        lte: Option<Value>,
    },
    Bool(BoolQuery),
    GeoShape {
        field: String,
        relation: SpatialRelation,
        shape: Geometry,
    },
    /// Engine wildcard syntax: `*` any run, `?` one character, `\` escapes.
    Wildcard {
        field: String,
        pattern: String,
        case_insensitive: bool,
    },
    Exists {
        field: String,
    },
    MultiMatch {
        query: String,
        fields: Vec<String>,
    },
}

impl EngineQueryNode {
    pub fn must(clauses: Vec<EngineQueryNode>) -> Self {
        EngineQueryNode::Bool(BoolQuery {
            must: clauses,
            ..Default::default()
        })
    }

    pub fn filter(clauses: Vec<EngineQueryNode>) -> Self {
        EngineQueryNode::Bool(BoolQuery {
            filter: clauses,
            ..Default::default()
        })
    }

    pub fn any_of(clauses: Vec<EngineQueryNode>) -> Self {
        EngineQueryNode::Bool(BoolQuery {
            should: clauses,
            minimum_should_match: Some(1),
            ..Default::default()
        })
    }

    pub fn none_of(clauses: Vec<EngineQueryNode>) -> Self {
        EngineQueryNode::Bool(BoolQuery {
            must_not: clauses,
            ..Default::default()
        })
    }

    pub fn to_json(&self, dialect: EngineDialect) -> Result<Value> {
        Ok(match self {
            EngineQueryNode::MatchAll => json!({"match_all": {}}),
            EngineQueryNode::Term { field, value } => {
                json!({"term": {field.as_str(): {"value": value}}})
            }
            EngineQueryNode::Terms { field, values } => {
                json!({"terms": {field.as_str(): values}})
            }
            EngineQueryNode::Range {
                field,
                gt,
                gte,
                lt,
                lte,
            } => {
                let mut bounds = serde_json::Map::new();
                for (name, bound) in [("gt", gt), ("gte", gte), ("lt", lt), ("lte", lte)] {
                    if let Some(v) = bound {
                        bounds.insert(name.to_string(), v.clone());
                    }
                }
                json!({"range": {field.as_str(): bounds}})
            }
            EngineQueryNode::Bool(b) => {
                let mut body = serde_json::Map::new();
                for (name, clauses) in [
                    ("must", &b.must),
                    ("filter", &b.filter),
                    ("should", &b.should),
                    ("must_not", &b.must_not),
                ] {
                    if !clauses.is_empty() {
                        let compiled: Result<Vec<Value>> =
                            clauses.iter().map(|c| c.to_json(dialect)).collect();
                        body.insert(name.to_string(), Value::Array(compiled?));
                    }
                }
                if let Some(m) = b.minimum_should_match {
                    body.insert("minimum_should_match".to_string(), json!(m));
                }
                json!({"bool": body})
            }
            EngineQueryNode::GeoShape {
                field,
                relation,
                shape,
            } => json!({
                "geo_shape": {
                    field.as_str(): {
                        "shape": shape.to_json(),
                        "relation": relation.as_str(),
                    }
                }
            }),
            EngineQueryNode::Wildcard {
                field,
                pattern,
                case_insensitive,
            } => {
                let mut body = json!({"value": pattern});
                if *case_insensitive {
                    if !dialect.supports_case_insensitive() {
                        return Err(StacError::InvalidQuery(format!(
                            "case-insensitive matching on {} is not supported by {:?}",
                            field, dialect
                        )));
                    }
                    body["case_insensitive"] = json!(true);
                }
                json!({"wildcard": {field.as_str(): body}})
            }
            EngineQueryNode::Exists { field } => json!({"exists": {"field": field}}),
            EngineQueryNode::MultiMatch { query, fields } => json!({
                "multi_match": {"query": query, "fields": fields}
            }),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortDirection::Asc => "asc",
            SortDirection::Desc => "desc",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortField {
    /// Engine field path, e.g. `properties.datetime`.
    pub field: String,
    pub direction: SortDirection,
    /// Mapping type to assume in indices where the field is unmapped.
    pub unmapped_type: Option<String>,
}

impl SortField {
    fn to_json(&self) -> Value {
        let mut opts = json!({"order": self.direction.as_str()});
        if let Some(t) = &self.unmapped_type {
            opts["unmapped_type"] = json!(t);
        }
        json!({self.field.as_str(): opts})
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceFilter {
    pub includes: Vec<String>,
    pub excludes: Vec<String>,
}

/// Bucket width of a date histogram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CalendarInterval {
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl CalendarInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            CalendarInterval::Hour => "hour",
            CalendarInterval::Day => "day",
            CalendarInterval::Week => "week",
            CalendarInterval::Month => "month",
            CalendarInterval::Year => "year",
        }
    }
}

/// An aggregation computed over every hit of the query, not just the page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Aggregation {
    /// Most frequent values first.
    Terms { field: String, size: usize },
    /// Non-empty buckets in key order.
    DateHistogram {
        field: String,
        interval: CalendarInterval,
    },
    /// Geohash cells of `precision` characters, most populated first.
    GeohashGrid {
        field: String,
        precision: u8,
        size: usize,
    },
    Min { field: String },
    Max { field: String },
}

impl Aggregation {
    pub fn field(&self) -> &str {
        match self {
            Aggregation::Terms { field, .. }
            | Aggregation::DateHistogram { field, .. }
            | Aggregation::GeohashGrid { field, .. }
            | Aggregation::Min { field }
            | Aggregation::Max { field } => field,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Aggregation::Terms { field, size } => {
                json!({"terms": {"field": field, "size": size}})
            }
            Aggregation::DateHistogram { field, interval } => json!({
                "date_histogram": {
                    "field": field,
                    "calendar_interval": interval.as_str(),
                    "min_doc_count": 1,
                }
            }),
            Aggregation::GeohashGrid {
                field,
                precision,
                size,
            } => json!({"geohash_grid": {"field": field, "precision": precision, "size": size}}),
            Aggregation::Min { field } => json!({"min": {"field": field}}),
            Aggregation::Max { field } => json!({"max": {"field": field}}),
        }
    }
}

/// A complete search: the query tree plus sort, page size and continuation.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineQuery {
    pub query: EngineQueryNode,
    pub sort: Vec<SortField>,
    pub size: usize,
    pub search_after: Option<Vec<Value>>,
    pub source: Option<SourceFilter>,
    /// Named aggregations, in request order.
    pub aggregations: IndexMap<String, Aggregation>,
}

impl EngineQuery {
    pub fn to_body(&self, dialect: EngineDialect) -> Result<Value> {
        let mut body = json!({
            "query": self.query.to_json(dialect)?,
            "sort": self.sort.iter().map(SortField::to_json).collect::<Vec<_>>(),
            "size": self.size,
            "track_total_hits": true,
            "seq_no_primary_term": true,
        });
        if let Some(after) = &self.search_after {
            body["search_after"] = Value::Array(after.clone());
        }
        if let Some(source) = &self.source {
            let mut src = serde_json::Map::new();
            if !source.includes.is_empty() {
                src.insert("includes".to_string(), json!(source.includes));
            }
            if !source.excludes.is_empty() {
                src.insert("excludes".to_string(), json!(source.excludes));
            }
            body["_source"] = Value::Object(src);
        }
        if !self.aggregations.is_empty() {
            let aggs: serde_json::Map<String, Value> = self
                .aggregations
                .iter()
                .map(|(name, agg)| (name.clone(), agg.to_json()))
                .collect();
            body["aggs"] = Value::Object(aggs);
        }
        Ok(body)
    }
}
