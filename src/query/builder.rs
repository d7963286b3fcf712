//! Assembles a complete engine search from a STAC search request.

use crate::config::CatalogConfig;
use crate::engine::EngineSearch;
use crate::error::{Result, StacError};
use crate::geo::{Bbox, Geometry};
use crate::index::mapping::{
    COLLECTION_END_FIELD, COLLECTION_SHAPE_FIELD, COLLECTION_START_FIELD, COLLECTION_TEXT_FIELDS,
    TEXT_SEARCH_FIELDS,
};
use crate::index::naming::IndexNaming;
use crate::query::compiler::FilterCompiler;
use crate::query::dsl::{
    BoolQuery, EngineQuery, EngineQueryNode, SortDirection, SortField, SourceFilter,
};
use crate::query::filter::FilterExpr;
use crate::query::query_ext::translate_query;
use crate::query::queryables::{Queryables, SearchScope};
use crate::query::{parse_filter, FilterLang};
use crate::types::parse_rfc3339;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Fields appended to every item sort so the order is total.
const TIE_BREAK_FIELDS: [&str; 2] = ["id", "collection"];
/// Collection ids are unique within the collections index.
const COLLECTION_TIE_BREAK_FIELDS: [&str; 1] = ["id"];
/// Derived search fields kept out of returned collection documents.
const COLLECTION_DERIVED_FIELDS: [&str; 3] = [
    COLLECTION_SHAPE_FIELD,
    COLLECTION_START_FIELD,
    COLLECTION_END_FIELD,
];

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
}

impl SortSpec {
    pub fn asc(field: impl Into<String>) -> Self {
        SortSpec {
            field: field.into(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        SortSpec {
            field: field.into(),
            direction: SortDirection::Desc,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldsSpec {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

/// A search as submitted by a client.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchRequest {
    pub bbox: Option<Vec<f64>>,
    pub intersects: Option<Geometry>,
    /// RFC 3339 instant, or `start/end` with `..` or empty for an open end.
    pub datetime: Option<String>,
    pub collections: Vec<String>,
    pub ids: Vec<String>,
    pub filter: Option<FilterExpr>,
    /// Legacy Query-extension object, AND-ed with `filter`.
    pub query: Option<Value>,
    /// Free-text terms, OR-ed.
    pub q: Vec<String>,
    pub sortby: Vec<SortSpec>,
    pub fields: Option<FieldsSpec>,
    pub limit: Option<usize>,
    pub token: Option<String>,
}

#[derive(Deserialize)]
struct RawSearch {
    bbox: Option<Vec<f64>>,
    intersects: Option<Value>,
    datetime: Option<String>,
    collections: Option<Vec<String>>,
    ids: Option<Vec<String>>,
    filter: Option<Value>,
    #[serde(rename = "filter-lang", alias = "filter_lang")]
    filter_lang: Option<String>,
    query: Option<Value>,
    q: Option<Value>,
    sortby: Option<Value>,
    fields: Option<Value>,
    limit: Option<i64>,
    token: Option<String>,
}

impl SearchRequest {
    /// Parse a STAC API search body. `sortby` and `fields` accept both the
    /// object form and the compact string form (`"-datetime,+id"`,
    /// `"id,-assets"`); `filter` honors `filter-lang`.
    pub fn from_json(value: &Value) -> Result<Self> {
        let raw: RawSearch = serde_json::from_value(value.clone())
            .map_err(|e| StacError::InvalidRequest(format!("invalid search body: {}", e)))?;

        let filter = match raw.filter {
            None | Some(Value::Null) => None,
            Some(f) => {
                let lang = match raw.filter_lang.as_deref() {
                    Some(l) => FilterLang::parse(l)?,
                    None if f.is_string() => FilterLang::Cql2Text,
                    None => FilterLang::Cql2Json,
                };
                Some(parse_filter(&f, lang)?)
            }
        };

        let intersects = raw.intersects.as_ref().map(Geometry::from_json).transpose()?;

        let q = match raw.q {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::String(s)) => s.split(',').map(str::to_string).collect(),
            Some(Value::Array(terms)) => terms
                .iter()
                .map(|t| {
                    t.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| StacError::InvalidRequest("q terms must be strings".into()))
                })
                .collect::<Result<_>>()?,
            Some(other) => {
                return Err(StacError::InvalidRequest(format!("invalid q: {}", other)))
            }
        };

        let sortby = match raw.sortby {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::String(s)) => parse_sort_string(&s),
            Some(v) => serde_json::from_value(v)
                .map_err(|e| StacError::InvalidRequest(format!("invalid sortby: {}", e)))?,
        };

        let fields = match raw.fields {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(parse_fields_string(&s)),
            Some(v) => Some(
                serde_json::from_value(v)
                    .map_err(|e| StacError::InvalidRequest(format!("invalid fields: {}", e)))?,
            ),
        };

        Ok(SearchRequest {
            bbox: raw.bbox,
            intersects,
            datetime: raw.datetime,
            collections: raw.collections.unwrap_or_default(),
            ids: raw.ids.unwrap_or_default(),
            filter,
            query: raw.query.filter(|q| !q.is_null()),
            q,
            sortby,
            fields,
            limit: raw.limit.map(|l| l.max(0) as usize),
            token: raw.token,
        })
    }
}

fn parse_sort_string(s: &str) -> Vec<SortSpec> {
    s.split(',')
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(|f| match f.strip_prefix('-') {
            Some(name) => SortSpec::desc(name),
            None => SortSpec::asc(f.strip_prefix('+').unwrap_or(f)),
        })
        .collect()
}

fn parse_fields_string(s: &str) -> FieldsSpec {
    let mut spec = FieldsSpec::default();
    for f in s.split(',').map(str::trim).filter(|f| !f.is_empty()) {
        match f.strip_prefix('-') {
            Some(name) => spec.exclude.push(name.to_string()),
            None => spec.include.push(f.strip_prefix('+').unwrap_or(f).to_string()),
        }
    }
    spec
}

/// Resolved temporal bounds; `None` is an open end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DatetimeRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl DatetimeRange {
    /// `None` for a fully open interval.
    pub fn parse(s: &str) -> Result<Option<Self>> {
        let s = s.trim();
        let open = |part: &str| part.is_empty() || part == "..";
        let range = match s.split_once('/') {
            Some((a, b)) => DatetimeRange {
                start: if open(a) { None } else { Some(parse_rfc3339("datetime", a)?) },
                end: if open(b) { None } else { Some(parse_rfc3339("datetime", b)?) },
            },
            None if open(s) => {
                return Err(StacError::InvalidRequest(format!("invalid datetime '{}'", s)))
            }
            None => {
                let t = parse_rfc3339("datetime", s)?;
                DatetimeRange {
                    start: Some(t),
                    end: Some(t),
                }
            }
        };
        if let (Some(a), Some(b)) = (range.start, range.end) {
            if a > b {
                return Err(StacError::InvalidRequest(format!(
                    "datetime interval start {} is after end {}",
                    a, b
                )));
            }
        }
        Ok(if range.start.is_none() && range.end.is_none() {
            None
        } else {
            Some(range)
        })
    }
}

/// A validated request with every default applied. Serialized form is the
/// input to the pagination fingerprint, so two requests that normalize
/// equally page identically.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedSearch {
    pub scope: SearchScope,
    pub bbox: Option<Bbox>,
    pub intersects: Option<Geometry>,
    pub datetime: Option<DatetimeRange>,
    pub collections: Vec<String>,
    pub ids: Vec<String>,
    pub filter: Option<FilterExpr>,
    pub q: Vec<String>,
    pub sortby: Vec<SortSpec>,
    pub fields: Option<FieldsSpec>,
    pub limit: usize,
}

pub struct SearchRequestBuilder {
    naming: IndexNaming,
    default_limit: usize,
    max_limit: usize,
}

impl SearchRequestBuilder {
    pub fn new(config: &CatalogConfig) -> Self {
        SearchRequestBuilder {
            naming: IndexNaming::new(
                config.items_index_prefix.clone(),
                config.collections_index.clone(),
            ),
            default_limit: config.default_page_size,
            max_limit: config.page_size_limit(),
        }
    }

    pub fn naming(&self) -> &IndexNaming {
        &self.naming
    }

    /// Validate the request and resolve defaults; the cursor is ignored.
    pub fn normalize(&self, request: &SearchRequest) -> Result<NormalizedSearch> {
        self.normalize_in(request, SearchScope::Items)
    }

    /// As [`Self::normalize`], for a search over collection documents.
    /// `collections` and `ids` both restrict collection ids; `fields` is
    /// ignored.
    pub fn normalize_collections(&self, request: &SearchRequest) -> Result<NormalizedSearch> {
        self.normalize_in(request, SearchScope::Collections)
    }

    fn normalize_in(&self, request: &SearchRequest, scope: SearchScope) -> Result<NormalizedSearch> {
        if request.bbox.is_some() && request.intersects.is_some() {
            return Err(StacError::ConflictingSpatialFilter);
        }
        let bbox = request.bbox.as_deref().map(Bbox::from_slice).transpose()?;
        let intersects = request
            .intersects
            .clone()
            .map(Geometry::normalized)
            .transpose()?;

        let datetime = match request.datetime.as_deref() {
            Some(s) => DatetimeRange::parse(s)?,
            None => None,
        };

        let query_filter = match &request.query {
            Some(q) => translate_query(q)?,
            None => None,
        };
        let filter = FilterExpr::conjoin(request.filter.clone(), query_filter);

        let mut sortby: Vec<SortSpec> = Vec::with_capacity(request.sortby.len() + 2);
        for spec in &request.sortby {
            let path = scope.path(&spec.field);
            if sortby.iter().any(|s| scope.path(&s.field) == path) {
                return Err(StacError::InvalidRequest(format!(
                    "field {} appears twice in sortby",
                    spec.field
                )));
            }
            sortby.push(spec.clone());
        }
        let tie_break: &[&str] = match scope {
            SearchScope::Items => &TIE_BREAK_FIELDS,
            SearchScope::Collections => &COLLECTION_TIE_BREAK_FIELDS,
        };
        for tie in tie_break {
            if !sortby.iter().any(|s| scope.path(&s.field) == *tie) {
                sortby.push(SortSpec::asc(*tie));
            }
        }

        let limit = request
            .limit
            .unwrap_or(self.default_limit)
            .clamp(1, self.max_limit.max(1));

        Ok(NormalizedSearch {
            scope,
            bbox,
            intersects,
            datetime,
            collections: sorted_unique(&request.collections),
            ids: sorted_unique(&request.ids),
            filter,
            q: request
                .q
                .iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
            sortby,
            fields: match scope {
                SearchScope::Items => request.fields.clone(),
                SearchScope::Collections => None,
            },
            limit,
        })
    }

    /// `normalize` followed by [`Self::build_normalized`].
    pub fn build(&self, request: &SearchRequest, queryables: &Queryables) -> Result<EngineSearch> {
        self.build_normalized(&self.normalize(request)?, queryables)
    }

    pub fn build_normalized(
        &self,
        search: &NormalizedSearch,
        queryables: &Queryables,
    ) -> Result<EngineSearch> {
        if queryables.scope() != search.scope {
            return Err(StacError::InvalidRequest(format!(
                "{:?} queryables cannot serve a {:?} search",
                queryables.scope(),
                search.scope
            )));
        }
        let collections_scope = search.scope == SearchScope::Collections;
        let shape_field = if collections_scope {
            COLLECTION_SHAPE_FIELD
        } else {
            "geometry"
        };
        let mut filter = Vec::new();

        if let Some(bbox) = &search.bbox {
            filter.push(EngineQueryNode::GeoShape {
                field: shape_field.to_string(),
                relation: crate::geo::SpatialRelation::Intersects,
                shape: bbox.to_polygon(),
            });
        }
        if let Some(geometry) = &search.intersects {
            filter.push(EngineQueryNode::GeoShape {
                field: shape_field.to_string(),
                relation: crate::geo::SpatialRelation::Intersects,
                shape: geometry.clone(),
            });
        }
        if let Some(range) = &search.datetime {
            filter.push(if collections_scope {
                extent_clause(range)
            } else {
                datetime_clause(range)
            });
        }
        if !search.collections.is_empty() {
            filter.push(EngineQueryNode::Terms {
                field: if collections_scope { "id" } else { "collection" }.to_string(),
                values: search.collections.iter().map(|c| json!(c)).collect(),
            });
        }
        if !search.ids.is_empty() {
            filter.push(EngineQueryNode::Terms {
                field: "id".to_string(),
                values: search.ids.iter().map(|i| json!(i)).collect(),
            });
        }
        if let Some(expr) = &search.filter {
            filter.push(FilterCompiler::new(queryables.clone()).compile(expr)?);
        }

        let mut must = Vec::new();
        if !search.q.is_empty() {
            let text_fields: &[&str] = if collections_scope {
                &COLLECTION_TEXT_FIELDS
            } else {
                &TEXT_SEARCH_FIELDS
            };
            let fields: Vec<String> = text_fields.iter().map(|f| f.to_string()).collect();
            must.push(EngineQueryNode::any_of(
                search
                    .q
                    .iter()
                    .map(|term| EngineQueryNode::MultiMatch {
                        query: term.clone(),
                        fields: fields.clone(),
                    })
                    .collect(),
            ));
        }

        let query = if must.is_empty() && filter.is_empty() {
            EngineQueryNode::MatchAll
        } else {
            EngineQueryNode::Bool(BoolQuery {
                must,
                filter,
                ..Default::default()
            })
        };

        let sort = search
            .sortby
            .iter()
            .map(|spec| {
                let field = queryables.resolve_sortable(&spec.field)?;
                Ok(SortField {
                    unmapped_type: field.kind.engine_type().map(str::to_string),
                    field: field.path,
                    direction: spec.direction,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let source = if collections_scope {
            Some(SourceFilter {
                includes: Vec::new(),
                excludes: COLLECTION_DERIVED_FIELDS.iter().map(|f| f.to_string()).collect(),
            })
        } else {
            self.source_filter(search, &sort)
        };

        let indices = if collections_scope {
            vec![self.naming.collections_index().to_string()]
        } else if search.collections.is_empty() {
            vec![self.naming.items_wildcard()]
        } else {
            search
                .collections
                .iter()
                .map(|c| self.naming.items_index(c))
                .collect::<Result<Vec<_>>>()?
        };

        Ok(EngineSearch {
            indices,
            query: EngineQuery {
                query,
                sort,
                size: search.limit,
                search_after: None,
                source,
                aggregations: Default::default(),
            },
        })
    }

    /// Item `fields` as a source filter; pagination keys are always kept.
    fn source_filter(&self, search: &NormalizedSearch, sort: &[SortField]) -> Option<SourceFilter> {
        search.fields.as_ref().map(|fields| {
            let pinned: Vec<String> = TIE_BREAK_FIELDS
                .iter()
                .map(|f| f.to_string())
                .chain(sort.iter().map(|s| s.field.clone()))
                .collect();
            let mut includes = fields.include.clone();
            if !includes.is_empty() {
                for p in &pinned {
                    if !includes.contains(p) {
                        includes.push(p.clone());
                    }
                }
            }
            let excludes = fields
                .exclude
                .iter()
                .filter(|e| !pinned.contains(e))
                .cloned()
                .collect();
            SourceFilter { includes, excludes }
        })
    }
}

fn sorted_unique(values: &[String]) -> Vec<String> {
    let mut v = values.to_vec();
    v.sort();
    v.dedup();
    v
}

fn timestamp(t: DateTime<Utc>) -> Value {
    json!(t.to_rfc3339_opts(SecondsFormat::AutoSi, true))
}

/// Items whose instant lies in the range, or whose interval overlaps it.
fn datetime_clause(range: &DatetimeRange) -> EngineQueryNode {
    let start = range.start.map(timestamp);
    let end = range.end.map(timestamp);

    let instant = EngineQueryNode::Range {
        field: "properties.datetime".to_string(),
        gt: None,
        gte: start.clone(),
        lt: None,
        lte: end.clone(),
    };
    let mut overlap = Vec::new();
    if let Some(end) = end {
        overlap.push(EngineQueryNode::Range {
            field: "properties.start_datetime".to_string(),
            gt: None,
            gte: None,
            lt: None,
            lte: Some(end),
        });
    }
    if let Some(start) = start {
        overlap.push(EngineQueryNode::Range {
            field: "properties.end_datetime".to_string(),
            gt: None,
            gte: Some(start),
            lt: None,
            lte: None,
        });
    }
    EngineQueryNode::any_of(vec![instant, EngineQueryNode::must(overlap)])
}

/// Collections whose temporal extent overlaps the range. A missing bound is
/// open, so a collection without any temporal extent always overlaps.
fn extent_clause(range: &DatetimeRange) -> EngineQueryNode {
    let open_or = |field: &str, bound: EngineQueryNode| {
        EngineQueryNode::any_of(vec![
            bound,
            EngineQueryNode::none_of(vec![EngineQueryNode::Exists {
                field: field.to_string(),
            }]),
        ])
    };
    let mut clauses = Vec::new();
    if let Some(end) = range.end.map(timestamp) {
        clauses.push(open_or(
            COLLECTION_START_FIELD,
            EngineQueryNode::Range {
                field: COLLECTION_START_FIELD.to_string(),
                gt: None,
                gte: None,
                lt: None,
                lte: Some(end),
            },
        ));
    }
    if let Some(start) = range.start.map(timestamp) {
        clauses.push(open_or(
            COLLECTION_END_FIELD,
            EngineQueryNode::Range {
                field: COLLECTION_END_FIELD.to_string(),
                gt: None,
                gte: Some(start),
                lt: None,
                lte: None,
            },
        ));
    }
    EngineQueryNode::filter(clauses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::SpatialRelation;
    use crate::index::mapping::{FieldKind, IndexMapping};
    use crate::query::filter::{ComparisonOp, Literal};

    fn builder() -> SearchRequestBuilder {
        SearchRequestBuilder::new(&CatalogConfig::for_tests())
    }

    fn queryables() -> Queryables {
        Queryables::new(
            IndexMapping::item_default().with_field("properties.eo:cloud_cover", FieldKind::Float),
        )
    }

    fn filter_clauses(search: &EngineSearch) -> &[EngineQueryNode] {
        match &search.query.query {
            EngineQueryNode::Bool(b) => &b.filter,
            other => panic!("expected bool, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_request_matches_all_sorted_by_id() {
        let search = builder()
            .build(&SearchRequest::default(), &queryables())
            .unwrap();
        assert_eq!(search.query.query, EngineQueryNode::MatchAll);
        assert_eq!(search.indices, vec!["items_*"]);
        let fields: Vec<_> = search.query.sort.iter().map(|s| s.field.as_str()).collect();
        assert_eq!(fields, vec!["id", "collection"]);
        assert_eq!(search.query.size, 10);
    }

    #[test]
    fn test_conjunction_of_constraints() {
        let request = SearchRequest {
            bbox: Some(vec![-10.0, -10.0, 10.0, 10.0]),
            datetime: Some("2020-01-01T00:00:00Z/2020-12-31T23:59:59Z".into()),
            collections: vec!["landsat".into()],
            ids: vec!["b".into(), "a".into(), "a".into()],
            ..Default::default()
        };
        let search = builder().build(&request, &queryables()).unwrap();
        let clauses = filter_clauses(&search);
        assert_eq!(clauses.len(), 4);
        assert!(matches!(
            &clauses[0],
            EngineQueryNode::GeoShape { relation: SpatialRelation::Intersects, .. }
        ));
        assert_eq!(
            clauses[3],
            EngineQueryNode::Terms {
                field: "id".into(),
                values: vec![json!("a"), json!("b")],
            }
        );
        assert_eq!(search.indices, vec!["items_landsat"]);
    }

    #[test]
    fn test_collection_search_targets_extents() {
        let b = builder();
        let request = SearchRequest {
            bbox: Some(vec![-10.0, -10.0, 10.0, 10.0]),
            datetime: Some("2020-01-01T00:00:00Z/..".into()),
            q: vec!["landsat".into()],
            fields: Some(FieldsSpec {
                include: vec!["title".into()],
                exclude: vec![],
            }),
            ..Default::default()
        };
        let normalized = b.normalize_collections(&request).unwrap();
        assert_eq!(normalized.scope, SearchScope::Collections);
        assert!(normalized.fields.is_none());

        let collections = Queryables::for_collections(IndexMapping::collection_default());
        let search = b.build_normalized(&normalized, &collections).unwrap();
        assert_eq!(search.indices, vec!["collections"]);
        let fields: Vec<_> = search.query.sort.iter().map(|s| s.field.as_str()).collect();
        assert_eq!(fields, vec!["id"]);
        let EngineQueryNode::Bool(root) = &search.query.query else {
            panic!("expected bool")
        };
        assert!(matches!(
            &root.filter[0],
            EngineQueryNode::GeoShape { field, .. } if field == "bbox_shape"
        ));
        let EngineQueryNode::Bool(extent) = &root.filter[1] else {
            panic!("expected extent clause")
        };
        // Only the end bound of the extent is constrained by an open-ended range.
        assert_eq!(extent.filter.len(), 1);
        let EngineQueryNode::Bool(text) = &root.must[0] else {
            panic!("expected free-text clause")
        };
        let EngineQueryNode::MultiMatch { fields, .. } = &text.should[0] else {
            panic!("expected free-text match")
        };
        assert_eq!(*fields, vec!["title", "description", "keywords"]);
        assert_eq!(
            search.query.source.as_ref().map(|s| s.excludes.clone()),
            Some(vec!["bbox_shape".to_string(), "extent_start".into(), "extent_end".into()])
        );

        // Same request, different documents: the scopes never share tokens.
        let items = b.normalize(&request).unwrap();
        assert_ne!(
            crate::pagination::Fingerprint::of(&items).unwrap(),
            crate::pagination::Fingerprint::of(&normalized).unwrap()
        );
        assert!(b.build_normalized(&normalized, &queryables()).is_err());
    }

    #[test]
    fn test_bbox_and_intersects_conflict() {
        let request = SearchRequest {
            bbox: Some(vec![0.0, 0.0, 1.0, 1.0]),
            intersects: Some(Geometry::Point {
                coordinates: vec![0.5, 0.5],
            }),
            ..Default::default()
        };
        assert!(matches!(
            builder().build(&request, &queryables()),
            Err(StacError::ConflictingSpatialFilter)
        ));
    }

    #[test]
    fn test_bbox_and_filter_spatial_predicate_are_anded() {
        let request = SearchRequest {
            bbox: Some(vec![0.0, 0.0, 10.0, 10.0]),
            filter: Some(FilterExpr::Spatial {
                field: "geometry".into(),
                relation: SpatialRelation::Within,
                geometry: Bbox::from_slice(&[1.0, 1.0, 2.0, 2.0]).unwrap().to_polygon(),
            }),
            ..Default::default()
        };
        let search = builder().build(&request, &queryables()).unwrap();
        let clauses = filter_clauses(&search);
        assert_eq!(clauses.len(), 2);
        assert!(matches!(
            &clauses[1],
            EngineQueryNode::GeoShape { relation: SpatialRelation::Within, .. }
        ));
    }

    #[test]
    fn test_open_datetime_interval() {
        let range = DatetimeRange::parse("2020-01-01T00:00:00Z/..").unwrap().unwrap();
        assert!(range.end.is_none());
        match datetime_clause(&range) {
            EngineQueryNode::Bool(b) => {
                assert_eq!(b.should.len(), 2);
                let EngineQueryNode::Range { gte, lte, .. } = &b.should[0] else {
                    panic!("expected range")
                };
                assert_eq!(gte, &Some(json!("2020-01-01T00:00:00Z")));
                assert!(lte.is_none());
                let EngineQueryNode::Bool(overlap) = &b.should[1] else {
                    panic!("expected bool")
                };
                assert_eq!(overlap.must.len(), 1);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(DatetimeRange::parse("../..").unwrap().is_none());
        assert!(DatetimeRange::parse("/").unwrap().is_none());
    }

    #[test]
    fn test_invalid_datetimes() {
        assert!(DatetimeRange::parse("..").is_err());
        assert!(DatetimeRange::parse("yesterday").is_err());
        assert!(DatetimeRange::parse("2021-01-01T00:00:00Z/2020-01-01T00:00:00Z").is_err());
    }

    #[test]
    fn test_single_instant() {
        let range = DatetimeRange::parse("2020-06-01T12:00:00+02:00").unwrap().unwrap();
        assert_eq!(range.start, range.end);
    }

    #[test]
    fn test_sort_validation_and_tie_break() {
        let request = SearchRequest {
            sortby: vec![SortSpec::desc("datetime"), SortSpec::asc("collection")],
            ..Default::default()
        };
        let search = builder().build(&request, &queryables()).unwrap();
        let fields: Vec<_> = search
            .query
            .sort
            .iter()
            .map(|s| (s.field.as_str(), s.direction))
            .collect();
        assert_eq!(
            fields,
            vec![
                ("properties.datetime", SortDirection::Desc),
                ("collection", SortDirection::Asc),
                ("id", SortDirection::Asc),
            ]
        );

        let request = SearchRequest {
            sortby: vec![SortSpec::asc("geometry")],
            ..Default::default()
        };
        assert!(matches!(
            builder().build(&request, &queryables()),
            Err(StacError::UnsortableField(_))
        ));
    }

    #[test]
    fn test_limit_clamped() {
        let b = builder();
        let n = |limit| {
            b.normalize(&SearchRequest {
                limit,
                ..Default::default()
            })
            .unwrap()
            .limit
        };
        assert_eq!(n(None), 10);
        assert_eq!(n(Some(0)), 1);
        assert_eq!(n(Some(50_000)), 9_999);
    }

    #[test]
    fn test_free_text_is_scored() {
        let request = SearchRequest {
            q: vec!["water".into(), " ".into()],
            ..Default::default()
        };
        let search = builder().build(&request, &queryables()).unwrap();
        let EngineQueryNode::Bool(b) = &search.query.query else {
            panic!("expected bool")
        };
        assert_eq!(b.must.len(), 1);
        assert!(b.filter.is_empty());
    }

    #[test]
    fn test_fields_keep_pagination_keys() {
        let request = SearchRequest {
            fields: Some(FieldsSpec {
                include: vec!["properties.eo:cloud_cover".into()],
                exclude: vec!["id".into(), "assets".into()],
            }),
            ..Default::default()
        };
        let search = builder().build(&request, &queryables()).unwrap();
        let source = search.query.source.unwrap();
        assert!(source.includes.contains(&"id".to_string()));
        assert!(source.includes.contains(&"collection".to_string()));
        assert_eq!(source.excludes, vec!["assets"]);
    }

    #[test]
    fn test_query_extension_merged_with_filter() {
        let request = SearchRequest {
            filter: Some(FilterExpr::compare(
                "eo:cloud_cover",
                ComparisonOp::Ge,
                Literal::Integer(1),
            )),
            query: Some(json!({"eo:cloud_cover": {"lt": 20}})),
            ..Default::default()
        };
        let normalized = builder().normalize(&request).unwrap();
        assert_eq!(normalized.filter.unwrap().leaf_count(), 2);
    }

    #[test]
    fn test_from_json_body() {
        let request = SearchRequest::from_json(&json!({
            "collections": ["sentinel-2"],
            "filter-lang": "cql2-text",
            "filter": "eo:cloud_cover < 10",
            "sortby": "-datetime,+id",
            "fields": "id,-assets",
            "limit": 5,
            "q": "river,delta"
        }))
        .unwrap();
        assert_eq!(request.sortby, vec![SortSpec::desc("datetime"), SortSpec::asc("id")]);
        assert_eq!(request.fields.as_ref().unwrap().exclude, vec!["assets"]);
        assert_eq!(request.q, vec!["river", "delta"]);
        assert!(request.filter.is_some());

        let request = SearchRequest::from_json(&json!({
            "filter": {"op": "=", "args": [{"property": "platform"}, "s2a"]},
            "sortby": [{"field": "datetime", "direction": "desc"}]
        }))
        .unwrap();
        assert_eq!(request.sortby, vec![SortSpec::desc("datetime")]);
        assert!(request.filter.is_some());
    }
}
