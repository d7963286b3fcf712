//! In-process engine honoring the [`SearchEngine`] contract.
//!
//! Evaluates the query tree directly against stored JSON documents, keeps
//! per-index sequence numbers for optimistic concurrency and applies each
//! document write atomically. New fields are mapped dynamically on write.
//! Writes are visible immediately whatever the requested refresh. Searches
//! asking for more hits than the result window are rejected, as the engine
//! does. Transport failures can be injected for tests.

use super::{
    AggregationResult, Bucket, BulkAction, BulkItemResponse, BulkRequest, EngineSearch, Hit,
    SearchEngine, SearchResponse, TotalHits, TotalRelation,
};
use crate::error::{Result, StacError};
use crate::geo::{geohash, Geometry};
use crate::index::mapping::{FieldKind, IndexMapping};
use crate::query::dsl::{
    Aggregation, BoolQuery, CalendarInterval, EngineQueryNode, SortDirection, SourceFilter,
};
use crate::types::VersionToken;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, SecondsFormat, TimeZone, Timelike, Utc};
use indexmap::IndexMap;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Mutex;
use tokio::sync::RwLock;

const PRIMARY_TERM: u64 = 1;
/// The engine's default `index.max_result_window`.
pub const DEFAULT_RESULT_WINDOW: usize = 10_000;

struct StoredDoc {
    source: Value,
    seq_no: u64,
}

struct MemIndex {
    mapping: IndexMapping,
    docs: BTreeMap<String, StoredDoc>,
    next_seq_no: u64,
}

#[derive(Default)]
struct FailurePlan {
    bulk_skip: usize,
    bulk_failures: usize,
    search_failures: usize,
}

#[derive(Default)]
pub struct MemoryEngine {
    indices: RwLock<BTreeMap<String, MemIndex>>,
    failures: Mutex<FailurePlan>,
    bulk_calls: AtomicUsize,
    search_calls: AtomicUsize,
    bulk_sizes: Mutex<Vec<usize>>,
    search_sizes: Mutex<Vec<usize>>,
    result_window: Option<usize>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_result_window(window: usize) -> Self {
        MemoryEngine {
            result_window: Some(window),
            ..Self::default()
        }
    }

    pub fn result_window(&self) -> usize {
        self.result_window.unwrap_or(DEFAULT_RESULT_WINDOW)
    }

    /// Let `skip` bulk calls through, then fail the next `count` with a
    /// transport error.
    pub fn fail_bulk_calls(&self, skip: usize, count: usize) {
        if let Ok(mut plan) = self.failures.lock() {
            plan.bulk_skip = skip;
            plan.bulk_failures = count;
        }
    }

    pub fn fail_next_searches(&self, count: usize) {
        if let Ok(mut plan) = self.failures.lock() {
            plan.search_failures = count;
        }
    }

    pub fn bulk_calls(&self) -> usize {
        self.bulk_calls.load(AtomicOrdering::SeqCst)
    }

    pub fn search_calls(&self) -> usize {
        self.search_calls.load(AtomicOrdering::SeqCst)
    }

    /// Number of ops in each bulk call that reached the engine.
    pub fn bulk_sizes(&self) -> Vec<usize> {
        self.bulk_sizes
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Requested `size` of each search that reached the engine.
    pub fn search_sizes(&self) -> Vec<usize> {
        self.search_sizes
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub async fn document(&self, index: &str, id: &str) -> Option<Value> {
        let indices = self.indices.read().await;
        indices
            .get(index)
            .and_then(|idx| idx.docs.get(id))
            .map(|d| d.source.clone())
    }

    pub async fn doc_count(&self, index: &str) -> usize {
        let indices = self.indices.read().await;
        indices.get(index).map(|idx| idx.docs.len()).unwrap_or(0)
    }

    pub async fn index_names(&self) -> Vec<String> {
        self.indices.read().await.keys().cloned().collect()
    }

    fn take_failure(&self, bulk: bool) -> bool {
        let Ok(mut plan) = self.failures.lock() else {
            return false;
        };
        if bulk {
            if plan.bulk_skip > 0 {
                plan.bulk_skip -= 1;
                return false;
            }
            if plan.bulk_failures > 0 {
                plan.bulk_failures -= 1;
                return true;
            }
        } else if plan.search_failures > 0 {
            plan.search_failures -= 1;
            return true;
        }
        false
    }
}

fn matches_pattern(pattern: &str, name: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => name.starts_with(prefix),
        None => pattern == name,
    }
}

#[async_trait]
impl SearchEngine for MemoryEngine {
    async fn search(&self, request: &EngineSearch) -> Result<SearchResponse> {
        self.search_calls.fetch_add(1, AtomicOrdering::SeqCst);
        if self.take_failure(false) {
            return Err(StacError::Transport("injected search failure".to_string()));
        }
        if let Ok(mut sizes) = self.search_sizes.lock() {
            sizes.push(request.query.size);
        }
        if request.query.size > self.result_window() {
            return Err(StacError::Engine(format!(
                "illegal_argument_exception: Result window is too large, size [{}] must be \
                 less than or equal to: [{}]",
                request.query.size,
                self.result_window()
            )));
        }

        let indices = self.indices.read().await;
        let query = &request.query;
        let matcher = Matcher::default();

        let mut hits = Vec::new();
        for (name, index) in indices.iter() {
            if !request.indices.iter().any(|p| matches_pattern(p, name)) {
                continue;
            }
            for (id, doc) in &index.docs {
                if !matcher.matches(&query.query, &doc.source)? {
                    continue;
                }
                let sort = query
                    .sort
                    .iter()
                    .map(|s| sort_value(&doc.source, &s.field, index.mapping.field(&s.field)))
                    .collect::<Vec<_>>();
                hits.push(Hit {
                    index: name.clone(),
                    id: id.clone(),
                    source: doc.source.clone(),
                    version: Some(VersionToken::new(doc.seq_no, PRIMARY_TERM)),
                    sort,
                });
            }
        }
        let total = hits.len() as u64;
        let matched: Vec<&Value> = hits.iter().map(|h| &h.source).collect();
        let aggregations: IndexMap<String, AggregationResult> = query
            .aggregations
            .iter()
            .map(|(name, agg)| (name.clone(), aggregate(agg, &matched)))
            .collect();

        let directions: Vec<SortDirection> = query.sort.iter().map(|s| s.direction).collect();
        hits.sort_by(|a, b| {
            compare_sort_keys(&a.sort, &b.sort, &directions)
                .then_with(|| a.index.cmp(&b.index))
                .then_with(|| a.id.cmp(&b.id))
        });
        if let Some(after) = &query.search_after {
            hits.retain(|h| compare_sort_keys(&h.sort, after, &directions) == Ordering::Greater);
        }
        hits.truncate(query.size);
        if let Some(source) = &query.source {
            for hit in &mut hits {
                hit.source = filter_source(&hit.source, source);
            }
        }

        Ok(SearchResponse {
            hits,
            total: TotalHits {
                value: total,
                relation: TotalRelation::Eq,
            },
            aggregations,
        })
    }

    async fn bulk(&self, request: &BulkRequest) -> Result<Vec<BulkItemResponse>> {
        self.bulk_calls.fetch_add(1, AtomicOrdering::SeqCst);
        if self.take_failure(true) {
            return Err(StacError::Transport("injected bulk failure".to_string()));
        }
        if let Ok(mut sizes) = self.bulk_sizes.lock() {
            sizes.push(request.ops.len());
        }

        let mut indices = self.indices.write().await;
        let mut responses = Vec::with_capacity(request.ops.len());
        for op in &request.ops {
            let respond = |status: u16, version: Option<VersionToken>, error: Option<String>| {
                BulkItemResponse {
                    index: op.index.clone(),
                    id: op.id.clone(),
                    status,
                    version,
                    error,
                }
            };

            let Some(index) = indices.get_mut(&op.index) else {
                responses.push(respond(
                    404,
                    None,
                    Some(format!("index_not_found_exception: no such index [{}]", op.index)),
                ));
                continue;
            };

            let current = index
                .docs
                .get(&op.id)
                .map(|d| VersionToken::new(d.seq_no, PRIMARY_TERM));
            if let Some(expected) = op.if_version {
                if current != Some(expected) {
                    responses.push(respond(
                        409,
                        None,
                        Some(format!(
                            "version_conflict_engine_exception: [{}]: version conflict, \
                             required seqNo [{}], primary term [{}]. {}",
                            op.id,
                            expected.seq_no,
                            expected.primary_term,
                            match current {
                                Some(c) => format!(
                                    "current document has seqNo [{}] and primary term [{}]",
                                    c.seq_no, c.primary_term
                                ),
                                None => "but no document was found".to_string(),
                            }
                        )),
                    ));
                    continue;
                }
            }

            match op.action {
                BulkAction::Create | BulkAction::Index => {
                    if op.action == BulkAction::Create && current.is_some() {
                        responses.push(respond(
                            409,
                            None,
                            Some(format!(
                                "version_conflict_engine_exception: [{}] document already exists",
                                op.id
                            )),
                        ));
                        continue;
                    }
                    let Some(source) = op.document.clone().filter(Value::is_object) else {
                        responses.push(respond(
                            400,
                            None,
                            Some("mapper_parsing_exception: source must be an object".into()),
                        ));
                        continue;
                    };
                    index.mapping.learn_dynamic(&source);
                    let seq_no = index.next_seq_no;
                    index.next_seq_no += 1;
                    index.docs.insert(op.id.clone(), StoredDoc { source, seq_no });
                    let status = if current.is_some() { 200 } else { 201 };
                    responses.push(respond(
                        status,
                        Some(VersionToken::new(seq_no, PRIMARY_TERM)),
                        None,
                    ));
                }
                BulkAction::Delete => {
                    if index.docs.remove(&op.id).is_some() {
                        let seq_no = index.next_seq_no;
                        index.next_seq_no += 1;
                        responses.push(respond(
                            200,
                            Some(VersionToken::new(seq_no, PRIMARY_TERM)),
                            None,
                        ));
                    } else {
                        responses.push(respond(404, None, Some("not_found".to_string())));
                    }
                }
            }
        }
        Ok(responses)
    }

    async fn create_index(&self, name: &str, mapping: &IndexMapping) -> Result<()> {
        let mut indices = self.indices.write().await;
        if indices.contains_key(name) {
            return Err(StacError::AlreadyExists(name.to_string()));
        }
        indices.insert(
            name.to_string(),
            MemIndex {
                mapping: mapping.clone(),
                docs: BTreeMap::new(),
                next_seq_no: 0,
            },
        );
        Ok(())
    }

    async fn get_mapping(&self, name: &str) -> Result<Option<IndexMapping>> {
        let indices = self.indices.read().await;
        let mut merged: Option<IndexMapping> = None;
        for (index_name, index) in indices.iter() {
            if matches_pattern(name, index_name) {
                match merged.as_mut() {
                    Some(m) => m.merge(&index.mapping),
                    None => merged = Some(index.mapping.clone()),
                }
            }
        }
        Ok(merged)
    }
}

/// Look up a dotted path, allowing keys that themselves contain dots.
fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let obj = value.as_object()?;
    if let Some(v) = obj.get(path) {
        return Some(v);
    }
    for (i, _) in path.match_indices('.') {
        if let Some(child) = obj.get(&path[..i]) {
            if let Some(found) = lookup(child, &path[i + 1..]) {
                return Some(found);
            }
        }
    }
    None
}

/// Scalar values at `path`, flattening one level of arrays.
fn values_at<'a>(doc: &'a Value, path: &str) -> Vec<&'a Value> {
    match lookup(doc, path) {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.iter().filter(|v| !v.is_null()).collect(),
        Some(v) => vec![v],
    }
}

fn as_instant(value: &Value) -> Option<i64> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.timestamp_millis())
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => match (as_instant(a), as_instant(b)) {
            (Some(tx), Some(ty)) => Some(tx.cmp(&ty)),
            _ => Some(x.cmp(y)),
        },
        (Value::String(_), Value::Number(y)) => {
            let tx = as_instant(a)?;
            (tx as f64).partial_cmp(&y.as_f64()?)
        }
        (Value::Number(x), Value::String(_)) => {
            let ty = as_instant(b)?;
            x.as_f64()?.partial_cmp(&(ty as f64))
        }
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn values_equal(doc_value: &Value, query_value: &Value) -> bool {
    match compare_values(doc_value, query_value) {
        Some(ord) => ord == Ordering::Equal,
        None => match (doc_value, query_value) {
            (Value::String(s), other) | (other, Value::String(s)) => *s == other.to_string(),
            _ => false,
        },
    }
}

/// Date fields sort by epoch millis, as the engine reports them.
fn sort_value(doc: &Value, field: &str, kind: Option<FieldKind>) -> Value {
    let Some(first) = values_at(doc, field).into_iter().next() else {
        return Value::Null;
    };
    if kind == Some(FieldKind::Date) {
        if let Some(ms) = as_instant(first) {
            return Value::from(ms);
        }
    }
    first.clone()
}

/// Missing values sort last in both directions.
fn compare_sort_keys(a: &[Value], b: &[Value], directions: &[SortDirection]) -> Ordering {
    for (i, direction) in directions.iter().enumerate() {
        let (x, y) = (
            a.get(i).unwrap_or(&Value::Null),
            b.get(i).unwrap_or(&Value::Null),
        );
        let ord = match (x.is_null(), y.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => return Ordering::Greater,
            (false, true) => return Ordering::Less,
            (false, false) => {
                let ord = compare_values(x, y).unwrap_or_else(|| x.to_string().cmp(&y.to_string()));
                match direction {
                    SortDirection::Asc => ord,
                    SortDirection::Desc => ord.reverse(),
                }
            }
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn insert_path(target: &mut Map<String, Value>, path: &str, value: Value) {
    match path.split_once('.') {
        Some((head, rest)) => {
            let child = target
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(obj) = child {
                insert_path(obj, rest, value);
            }
        }
        None => {
            target.insert(path.to_string(), value);
        }
    }
}

fn remove_path(target: &mut Value, path: &str) {
    let Some(obj) = target.as_object_mut() else {
        return;
    };
    if obj.remove(path).is_some() {
        return;
    }
    if let Some((head, rest)) = path.split_once('.') {
        if let Some(child) = obj.get_mut(head) {
            remove_path(child, rest);
        }
    }
}

fn aggregate(agg: &Aggregation, docs: &[&Value]) -> AggregationResult {
    match agg {
        Aggregation::Terms { field, size } => {
            let keys = docs.iter().map(|doc| {
                values_at(doc, field)
                    .into_iter()
                    .filter(|v| v.is_string() || v.is_number() || v.is_boolean())
                    .map(|v| v.to_string())
                    .collect::<BTreeSet<_>>()
            });
            AggregationResult::Buckets(top_buckets(keys, *size, |k| {
                serde_json::from_str(k).unwrap_or(Value::Null)
            }))
        }
        Aggregation::GeohashGrid {
            field,
            precision,
            size,
        } => {
            let keys = docs.iter().map(|doc| {
                lookup(doc, field)
                    .and_then(|g| Geometry::from_json(g).ok())
                    .and_then(|g| g.bbox())
                    .map(|b| {
                        let (x, y) = b.center();
                        geohash(x, y, *precision)
                    })
                    .into_iter()
                    .collect::<BTreeSet<_>>()
            });
            AggregationResult::Buckets(top_buckets(keys, *size, |k| Value::String(k.clone())))
        }
        Aggregation::DateHistogram { field, interval } => {
            let mut counts: BTreeMap<DateTime<Utc>, u64> = BTreeMap::new();
            for doc in docs {
                let starts: BTreeSet<DateTime<Utc>> = values_at(doc, field)
                    .into_iter()
                    .filter_map(as_instant)
                    .filter_map(|ms| Utc.timestamp_millis_opt(ms).single())
                    .filter_map(|t| bucket_start(t, *interval))
                    .collect();
                for start in starts {
                    *counts.entry(start).or_default() += 1;
                }
            }
            AggregationResult::Buckets(
                counts
                    .into_iter()
                    .map(|(start, count)| Bucket {
                        key: Value::String(start.to_rfc3339_opts(SecondsFormat::Secs, true)),
                        count,
                    })
                    .collect(),
            )
        }
        Aggregation::Min { field } | Aggregation::Max { field } => {
            let want = if matches!(agg, Aggregation::Min { .. }) {
                Ordering::Less
            } else {
                Ordering::Greater
            };
            let best = docs
                .iter()
                .flat_map(|doc| values_at(doc, field))
                .filter(|v| v.is_number() || as_instant(v).is_some())
                .fold(None::<&Value>, |best, v| match best {
                    Some(b) if compare_values(v, b) != Some(want) => Some(b),
                    _ => Some(v),
                });
            AggregationResult::Value(best.map(|v| match as_instant(v) {
                Some(ms) => Utc
                    .timestamp_millis_opt(ms)
                    .single()
                    .map(|t| Value::String(t.to_rfc3339_opts(SecondsFormat::Secs, true)))
                    .unwrap_or_else(|| v.clone()),
                None => v.clone(),
            }))
        }
    }
}

/// Count each document once per distinct key; most frequent first, ties by key.
fn top_buckets(
    per_doc: impl Iterator<Item = BTreeSet<String>>,
    size: usize,
    key: impl Fn(&String) -> Value,
) -> Vec<Bucket> {
    let mut counts: BTreeMap<String, u64> = BTreeMap::new();
    for keys in per_doc {
        for k in keys {
            *counts.entry(k).or_default() += 1;
        }
    }
    let mut buckets: Vec<(String, u64)> = counts.into_iter().collect();
    buckets.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    buckets
        .into_iter()
        .take(size)
        .map(|(k, count)| Bucket { key: key(&k), count })
        .collect()
}

fn bucket_start(t: DateTime<Utc>, interval: CalendarInterval) -> Option<DateTime<Utc>> {
    let day = t.date_naive();
    let start = match interval {
        CalendarInterval::Hour => day.and_hms_opt(t.hour(), 0, 0)?,
        CalendarInterval::Day => day.and_hms_opt(0, 0, 0)?,
        CalendarInterval::Week => {
            let monday = day - Duration::days(day.weekday().num_days_from_monday() as i64);
            monday.and_hms_opt(0, 0, 0)?
        }
        CalendarInterval::Month => day.with_day(1)?.and_hms_opt(0, 0, 0)?,
        CalendarInterval::Year => day.with_ordinal(1)?.and_hms_opt(0, 0, 0)?,
    };
    Some(start.and_utc())
}

fn filter_source(source: &Value, filter: &SourceFilter) -> Value {
    let mut out = if filter.includes.is_empty() {
        source.clone()
    } else {
        let mut included = Map::new();
        for path in &filter.includes {
            if let Some(v) = lookup(source, path) {
                insert_path(&mut included, path, v.clone());
            }
        }
        Value::Object(included)
    };
    for path in &filter.excludes {
        remove_path(&mut out, path);
    }
    out
}

/// Evaluates query nodes; caches compiled wildcard patterns per search.
#[derive(Default)]
struct Matcher {
    patterns: Mutex<std::collections::HashMap<(String, bool), regex::Regex>>,
}

impl Matcher {
    fn matches(&self, node: &EngineQueryNode, doc: &Value) -> Result<bool> {
        Ok(match node {
            EngineQueryNode::MatchAll => true,
            EngineQueryNode::Term { field, value } => {
                values_at(doc, field).iter().any(|v| values_equal(v, value))
            }
            EngineQueryNode::Terms { field, values } => values_at(doc, field)
                .iter()
                .any(|v| values.iter().any(|q| values_equal(v, q))),
            EngineQueryNode::Range {
                field,
                gt,
                gte,
                lt,
                lte,
            } => values_at(doc, field).iter().any(|v| {
                let check = |bound: &Option<Value>, ok: fn(Ordering) -> bool| match bound {
                    None => true,
                    Some(b) => compare_values(v, b).is_some_and(ok),
                };
                check(gt, |o| o == Ordering::Greater)
                    && check(gte, |o| o != Ordering::Less)
                    && check(lt, |o| o == Ordering::Less)
                    && check(lte, |o| o != Ordering::Greater)
            }),
            EngineQueryNode::Bool(b) => self.matches_bool(b, doc)?,
            EngineQueryNode::GeoShape {
                field,
                relation,
                shape,
            } => match lookup(doc, field) {
                Some(v) if !v.is_null() => Geometry::from_json(v)
                    .map(|g| g.relate(shape, *relation))
                    .unwrap_or(false),
                _ => false,
            },
            EngineQueryNode::Wildcard {
                field,
                pattern,
                case_insensitive,
            } => {
                let re = self.wildcard_regex(pattern, *case_insensitive)?;
                values_at(doc, field)
                    .iter()
                    .filter_map(|v| v.as_str())
                    .any(|s| re.is_match(s))
            }
            EngineQueryNode::Exists { field } => !values_at(doc, field).is_empty(),
            EngineQueryNode::MultiMatch { query, fields } => {
                let terms: Vec<String> = tokenize(query);
                fields.iter().any(|f| {
                    values_at(doc, f).iter().filter_map(|v| v.as_str()).any(|text| {
                        let tokens = tokenize(text);
                        terms.iter().any(|t| tokens.contains(t))
                    })
                })
            }
        })
    }

    fn matches_bool(&self, b: &BoolQuery, doc: &Value) -> Result<bool> {
        for clause in b.must.iter().chain(&b.filter) {
            if !self.matches(clause, doc)? {
                return Ok(false);
            }
        }
        for clause in &b.must_not {
            if self.matches(clause, doc)? {
                return Ok(false);
            }
        }
        if b.should.is_empty() {
            return Ok(true);
        }
        let required = match b.minimum_should_match {
            Some(n) => n as usize,
            None if b.must.is_empty() && b.filter.is_empty() => 1,
            None => 0,
        };
        let mut matched = 0;
        for clause in &b.should {
            if self.matches(clause, doc)? {
                matched += 1;
            }
        }
        Ok(matched >= required)
    }

    fn wildcard_regex(&self, pattern: &str, case_insensitive: bool) -> Result<regex::Regex> {
        let key = (pattern.to_string(), case_insensitive);
        if let Ok(cache) = self.patterns.lock() {
            if let Some(re) = cache.get(&key) {
                return Ok(re.clone());
            }
        }
        let mut expr = String::from(if case_insensitive { "(?is)^" } else { "(?s)^" });
        let mut chars = pattern.chars();
        while let Some(c) = chars.next() {
            match c {
                '*' => expr.push_str(".*"),
                '?' => expr.push('.'),
                '\\' => {
                    if let Some(escaped) = chars.next() {
                        expr.push_str(&regex::escape(&escaped.to_string()));
                    }
                }
                other => expr.push_str(&regex::escape(&other.to_string())),
            }
        }
        expr.push('$');
        let re = regex::Regex::new(&expr)
            .map_err(|e| StacError::InvalidQuery(format!("bad wildcard {}: {}", pattern, e)))?;
        if let Ok(mut cache) = self.patterns.lock() {
            cache.insert(key, re.clone());
        }
        Ok(re)
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::BulkOp;
    use crate::engine::Refresh;
    use crate::query::dsl::{EngineQuery, SortField};
    use serde_json::json;

    async fn engine_with(docs: &[Value]) -> MemoryEngine {
        let engine = MemoryEngine::new();
        engine
            .create_index("items_test", &IndexMapping::item_default())
            .await
            .unwrap();
        let ops = docs
            .iter()
            .map(|d| BulkOp::index("items_test", d["id"].as_str().unwrap(), d.clone()))
            .collect();
        engine
            .bulk(&BulkRequest {
                ops,
                refresh: Refresh::Immediate,
            })
            .await
            .unwrap();
        engine
    }

    fn search(query: EngineQueryNode, size: usize) -> EngineSearch {
        EngineSearch {
            indices: vec!["items_*".into()],
            query: EngineQuery {
                query,
                sort: vec![SortField {
                    field: "id".into(),
                    direction: SortDirection::Asc,
                    unmapped_type: None,
                }],
                size,
                search_after: None,
                source: None,
                aggregations: IndexMap::new(),
            },
        }
    }

    #[tokio::test]
    async fn test_range_and_term() {
        let engine = engine_with(&[
            json!({"id": "a", "properties": {"eo:cloud_cover": 5, "platform": "s2a"}}),
            json!({"id": "b", "properties": {"eo:cloud_cover": 50, "platform": "s2a"}}),
            json!({"id": "c", "properties": {"platform": "l8"}}),
        ])
        .await;
        let q = EngineQueryNode::filter(vec![
            EngineQueryNode::Range {
                field: "properties.eo:cloud_cover".into(),
                gt: None,
                gte: None,
                lt: Some(json!(10)),
                lte: None,
            },
            EngineQueryNode::Term {
                field: "properties.platform".into(),
                value: json!("s2a"),
            },
        ]);
        let res = engine.search(&search(q, 10)).await.unwrap();
        assert_eq!(res.hits.len(), 1);
        assert_eq!(res.hits[0].id, "a");
    }

    #[tokio::test]
    async fn test_search_after_and_total() {
        let engine = engine_with(&[
            json!({"id": "1"}),
            json!({"id": "2"}),
            json!({"id": "3"}),
        ])
        .await;
        let mut s = search(EngineQueryNode::MatchAll, 1);
        s.query.search_after = Some(vec![json!("1")]);
        let res = engine.search(&s).await.unwrap();
        assert_eq!(res.total.value, 3);
        assert_eq!(res.hits.len(), 1);
        assert_eq!(res.hits[0].id, "2");
        assert_eq!(res.hits[0].sort, vec![json!("2")]);
    }

    #[tokio::test]
    async fn test_optimistic_version_check() {
        let engine = engine_with(&[json!({"id": "x"})]).await;
        let stale = VersionToken::new(99, PRIMARY_TERM);
        let res = engine
            .bulk(&BulkRequest {
                ops: vec![BulkOp::index("items_test", "x", json!({"id": "x"})).if_version(Some(stale))],
                refresh: Refresh::WaitFor,
            })
            .await
            .unwrap();
        assert_eq!(res[0].status, 409);
        let reason = res[0].error.clone().unwrap_or_default();
        assert!(reason.contains("current document has seqNo [0] and primary term [1]"), "{}", reason);

        let res = engine
            .bulk(&BulkRequest {
                ops: vec![BulkOp::create("items_test", "x", json!({"id": "x"}))],
                refresh: Refresh::WaitFor,
            })
            .await
            .unwrap();
        assert_eq!(res[0].status, 409);
    }

    #[tokio::test]
    async fn test_wildcard_and_exists() {
        let engine = engine_with(&[
            json!({"id": "a", "properties": {"platform": "Sentinel-2A"}}),
            json!({"id": "b", "properties": {"platform": "landsat-8"}}),
        ])
        .await;
        let q = EngineQueryNode::Wildcard {
            field: "properties.platform".into(),
            pattern: "sentinel*".into(),
            case_insensitive: true,
        };
        let res = engine.search(&search(q, 10)).await.unwrap();
        assert_eq!(res.hits.len(), 1);

        let q = EngineQueryNode::none_of(vec![EngineQueryNode::Exists {
            field: "properties.platform".into(),
        }]);
        assert!(engine.search(&search(q, 10)).await.unwrap().hits.is_empty());
    }

    #[tokio::test]
    async fn test_missing_index_is_skipped() {
        let engine = MemoryEngine::new();
        let mut s = search(EngineQueryNode::MatchAll, 10);
        s.indices = vec!["items_nope".into()];
        let res = engine.search(&s).await.unwrap();
        assert!(res.hits.is_empty());
        assert_eq!(res.total.value, 0);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let engine = MemoryEngine::new();
        engine.fail_next_searches(1);
        assert!(matches!(
            engine.search(&search(EngineQueryNode::MatchAll, 1)).await,
            Err(StacError::Transport(_))
        ));
        assert!(engine.search(&search(EngineQueryNode::MatchAll, 1)).await.is_ok());
        assert_eq!(engine.search_calls(), 2);
    }

    #[tokio::test]
    async fn test_result_window() {
        let engine = MemoryEngine::with_result_window(5);
        assert!(engine.search(&search(EngineQueryNode::MatchAll, 5)).await.is_ok());
        assert!(matches!(
            engine.search(&search(EngineQueryNode::MatchAll, 6)).await,
            Err(StacError::Engine(ref m)) if m.contains("Result window is too large")
        ));
        assert_eq!(engine.search_sizes(), vec![5, 6]);
        assert_eq!(MemoryEngine::new().result_window(), DEFAULT_RESULT_WINDOW);
    }

    #[tokio::test]
    async fn test_aggregations_cover_every_match() {
        let engine = engine_with(&[
            json!({"id": "a", "collection": "s2", "geometry": {"type": "Point", "coordinates": [-5.6, 42.6]},
                   "properties": {"datetime": "2020-01-15T10:00:00Z", "eo:cloud_cover": 5}}),
            json!({"id": "b", "collection": "s2", "geometry": {"type": "Point", "coordinates": [-5.6, 42.6]},
                   "properties": {"datetime": "2020-01-20T00:00:00Z", "eo:cloud_cover": 40}}),
            json!({"id": "c", "collection": "l8", "geometry": {"type": "Point", "coordinates": [10.4, 57.6]},
                   "properties": {"datetime": "2020-03-01T00:00:00Z"}}),
        ])
        .await;
        let mut s = search(EngineQueryNode::MatchAll, 0);
        for (name, agg) in [
            ("collections", Aggregation::Terms { field: "collection".into(), size: 10 }),
            ("months", Aggregation::DateHistogram {
                field: "properties.datetime".into(),
                interval: CalendarInterval::Month,
            }),
            ("cells", Aggregation::GeohashGrid { field: "geometry".into(), precision: 2, size: 10 }),
            ("first", Aggregation::Min { field: "properties.datetime".into() }),
            ("cloudiest", Aggregation::Max { field: "properties.eo:cloud_cover".into() }),
            ("none", Aggregation::Max { field: "properties.gsd".into() }),
        ] {
            s.query.aggregations.insert(name.to_string(), agg);
        }
        let res = engine.search(&s).await.unwrap();
        assert!(res.hits.is_empty());
        assert_eq!(res.total.value, 3);

        let bucket = |key: Value, count| Bucket { key, count };
        assert_eq!(
            res.aggregations["collections"],
            AggregationResult::Buckets(vec![bucket(json!("s2"), 2), bucket(json!("l8"), 1)])
        );
        assert_eq!(
            res.aggregations["months"],
            AggregationResult::Buckets(vec![
                bucket(json!("2020-01-01T00:00:00Z"), 2),
                bucket(json!("2020-03-01T00:00:00Z"), 1),
            ])
        );
        assert_eq!(
            res.aggregations["cells"],
            AggregationResult::Buckets(vec![bucket(json!("ez"), 2), bucket(json!("u4"), 1)])
        );
        assert_eq!(
            res.aggregations["first"],
            AggregationResult::Value(Some(json!("2020-01-15T10:00:00Z")))
        );
        assert_eq!(res.aggregations["cloudiest"], AggregationResult::Value(Some(json!(40))));
        assert_eq!(res.aggregations["none"], AggregationResult::Value(None));
    }

    #[test]
    fn test_source_filter() {
        let doc = json!({"id": "a", "properties": {"datetime": "x", "gsd": 10}, "assets": {}});
        let filtered = filter_source(
            &doc,
            &SourceFilter {
                includes: vec!["id".into(), "properties.gsd".into()],
                excludes: vec![],
            },
        );
        assert_eq!(filtered, json!({"id": "a", "properties": {"gsd": 10}}));
        let filtered = filter_source(
            &doc,
            &SourceFilter {
                includes: vec![],
                excludes: vec!["assets".into(), "properties.datetime".into()],
            },
        );
        assert_eq!(filtered, json!({"id": "a", "properties": {"gsd": 10}}));
    }
}
