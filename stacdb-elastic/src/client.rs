use crate::config::ElasticConfig;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use indexmap::IndexMap;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{RequestBuilder, StatusCode};
use serde_json::{json, Map, Value};
use stacdb::engine::{
    AggregationResult, Bucket, BulkAction, BulkItemResponse, BulkOp, BulkRequest, EngineSearch,
    Hit, SearchEngine, SearchResponse, TotalHits, TotalRelation,
};
use stacdb::index::IndexMapping;
use stacdb::query::dsl::{Aggregation, EngineDialect};
use stacdb::{Result, StacError, VersionToken};

const COMPAT_JSON: &str = "application/vnd.elasticsearch+json; compatible-with=7";
const COMPAT_NDJSON: &str = "application/vnd.elasticsearch+x-ndjson; compatible-with=7";
const PLAIN_JSON: &str = "application/json";
const PLAIN_NDJSON: &str = "application/x-ndjson";

/// HTTP client for one Elasticsearch or OpenSearch cluster.
pub struct ElasticClient {
    base_url: String,
    http: reqwest::Client,
    dialect: EngineDialect,
    credentials: Option<(String, String)>,
}

impl ElasticClient {
    pub fn new(config: &ElasticConfig, dialect: EngineDialect) -> Result<Self> {
        Self::with_base_url(config, config.base_url(), dialect)
    }

    /// Same as [`ElasticClient::new`] against an explicit base URL.
    pub fn with_base_url(
        config: &ElasticConfig,
        base_url: impl Into<String>,
        dialect: EngineDialect,
    ) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if uses_compat_headers(dialect) {
            headers.insert(ACCEPT, HeaderValue::from_static(COMPAT_JSON));
        }
        if let Some(key) = &config.api_key {
            let value = HeaderValue::from_str(key)
                .map_err(|_| StacError::Config("ES_API_KEY is not a valid header value".to_string()))?;
            headers.insert("x-api-key", value);
        }

        let mut builder = reqwest::Client::builder()
            .timeout(config.timeout)
            .default_headers(headers);
        if config.use_ssl {
            if !config.verify_certs {
                tracing::warn!("TLS certificate verification is disabled");
                builder = builder.danger_accept_invalid_certs(true);
            } else if let Some(path) = &config.ca_bundle {
                let pem = std::fs::read(path).map_err(|e| {
                    StacError::Config(format!("cannot read CA bundle {}: {}", path.display(), e))
                })?;
                let certs = reqwest::Certificate::from_pem_bundle(&pem).map_err(|e| {
                    StacError::Config(format!("invalid CA bundle {}: {}", path.display(), e))
                })?;
                for cert in certs {
                    builder = builder.add_root_certificate(cert);
                }
            }
        }
        let http = builder
            .build()
            .map_err(|e| StacError::Config(format!("cannot build HTTP client: {}", e)))?;

        Ok(ElasticClient {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            dialect,
            credentials: if config.use_ssl {
                config.credentials.clone()
            } else {
                None
            },
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn json_type(&self) -> &'static str {
        if uses_compat_headers(self.dialect) {
            COMPAT_JSON
        } else {
            PLAIN_JSON
        }
    }

    fn ndjson_type(&self) -> &'static str {
        if uses_compat_headers(self.dialect) {
            COMPAT_NDJSON
        } else {
            PLAIN_NDJSON
        }
    }

    /// Send a request and read its JSON body. Connection failures, 429 and
    /// 5xx become `Transport`; every other status is returned to the caller.
    async fn send(&self, request: RequestBuilder, what: &str) -> Result<(StatusCode, Value)> {
        let request = match &self.credentials {
            Some((user, pass)) => request.basic_auth(user, Some(pass)),
            None => request,
        };
        let response = request
            .send()
            .await
            .map_err(|e| StacError::Transport(format!("{}: {}", what, e)))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| StacError::Transport(format!("{}: reading response: {}", what, e)))?;
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(StacError::Transport(format!(
                "{} returned {}: {}",
                what,
                status,
                error_reason(&serde_json::from_str(&text).unwrap_or(Value::String(text)))
            )));
        }
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text)
                .map_err(|e| StacError::Engine(format!("{}: unparseable response: {}", what, e)))?
        };
        Ok((status, body))
    }
}

fn uses_compat_headers(dialect: EngineDialect) -> bool {
    !matches!(dialect, EngineDialect::OpenSearch)
}

/// `type: reason` of an engine error body, or the body itself.
fn error_reason(body: &Value) -> String {
    match body.get("error") {
        Some(Value::Object(err)) => {
            let kind = err.get("type").and_then(Value::as_str).unwrap_or("error");
            let reason = err.get("reason").and_then(Value::as_str).unwrap_or("");
            format!("{}: {}", kind, reason)
        }
        Some(Value::String(s)) => s.clone(),
        _ => match body {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        },
    }
}

fn version_of(v: &Value) -> Option<VersionToken> {
    match (v.get("_seq_no")?.as_u64(), v.get("_primary_term")?.as_u64()) {
        (Some(seq_no), Some(term)) => Some(VersionToken::new(seq_no, term)),
        _ => None,
    }
}

fn parse_hit(v: &Value) -> Result<Hit> {
    let field = |name: &str| {
        v.get(name)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| StacError::Engine(format!("search hit without {}", name)))
    };
    Ok(Hit {
        index: field("_index")?,
        id: field("_id")?,
        source: v.get("_source").cloned().unwrap_or_else(|| json!({})),
        version: version_of(v),
        sort: v
            .get("sort")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default(),
    })
}

fn format_instant(t: DateTime<Utc>) -> Value {
    Value::String(t.to_rfc3339_opts(SecondsFormat::Secs, true))
}

/// Date values come back as epoch millis or engine-formatted strings;
/// both are reported as RFC 3339 UTC.
fn normalize_date(v: &Value) -> Value {
    let parsed = match v {
        Value::Number(n) => n.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        Value::String(s) => DateTime::parse_from_rfc3339(s).ok().map(|t| t.with_timezone(&Utc)),
        _ => None,
    };
    parsed.map(format_instant).unwrap_or_else(|| v.clone())
}

fn parse_buckets(name: &str, body: &Value, dates: bool) -> Result<Vec<Bucket>> {
    body.get("buckets")
        .and_then(Value::as_array)
        .ok_or_else(|| StacError::Engine(format!("aggregation {} without buckets", name)))?
        .iter()
        .map(|b| {
            let key = b
                .get("key")
                .ok_or_else(|| StacError::Engine(format!("bucket of {} without key", name)))?;
            Ok(Bucket {
                key: if dates { normalize_date(key) } else { key.clone() },
                count: b.get("doc_count").and_then(Value::as_u64).unwrap_or(0),
            })
        })
        .collect()
}

fn parse_aggregations(
    body: &Value,
    requested: &IndexMap<String, Aggregation>,
) -> Result<IndexMap<String, AggregationResult>> {
    let mut out = IndexMap::new();
    for (name, agg) in requested {
        let Some(result) = body.pointer("/aggregations").and_then(|a| a.get(name)) else {
            return Err(StacError::Engine(format!("response lacks aggregation {}", name)));
        };
        let parsed = match agg {
            Aggregation::Terms { .. } | Aggregation::GeohashGrid { .. } => {
                AggregationResult::Buckets(parse_buckets(name, result, false)?)
            }
            Aggregation::DateHistogram { .. } => {
                AggregationResult::Buckets(parse_buckets(name, result, true)?)
            }
            Aggregation::Min { .. } | Aggregation::Max { .. } => {
                match (result.get("value_as_string"), result.get("value")) {
                    (_, None) | (_, Some(Value::Null)) => AggregationResult::Value(None),
                    (Some(s), _) => AggregationResult::Value(Some(normalize_date(s))),
                    (None, Some(v)) => AggregationResult::Value(Some(v.clone())),
                }
            }
        };
        out.insert(name.clone(), parsed);
    }
    Ok(out)
}

pub(crate) fn parse_search_response(
    body: &Value,
    aggregations: &IndexMap<String, Aggregation>,
) -> Result<SearchResponse> {
    let hits = body
        .pointer("/hits/hits")
        .and_then(Value::as_array)
        .ok_or_else(|| StacError::Engine("search response without hits".to_string()))?
        .iter()
        .map(parse_hit)
        .collect::<Result<Vec<_>>>()?;
    let total = match body.pointer("/hits/total") {
        Some(Value::Object(t)) => TotalHits {
            value: t.get("value").and_then(Value::as_u64).unwrap_or(0),
            relation: match t.get("relation").and_then(Value::as_str) {
                Some("gte") => TotalRelation::Gte,
                _ => TotalRelation::Eq,
            },
        },
        Some(Value::Number(n)) => TotalHits {
            value: n.as_u64().unwrap_or(0),
            relation: TotalRelation::Eq,
        },
        _ => TotalHits {
            value: hits.len() as u64,
            relation: TotalRelation::Gte,
        },
    };
    Ok(SearchResponse {
        hits,
        total,
        aggregations: parse_aggregations(body, aggregations)?,
    })
}

/// NDJSON body of a `_bulk` call: an action line per op, plus a source line
/// for creates and indexes.
pub(crate) fn bulk_payload(ops: &[BulkOp]) -> Result<String> {
    let mut out = String::new();
    for op in ops {
        let mut meta = Map::new();
        meta.insert("_index".to_string(), json!(op.index));
        meta.insert("_id".to_string(), json!(op.id));
        if let Some(v) = op.if_version {
            meta.insert("if_seq_no".to_string(), json!(v.seq_no));
            meta.insert("if_primary_term".to_string(), json!(v.primary_term));
        }
        let mut action = Map::new();
        action.insert(op.action.as_str().to_string(), Value::Object(meta));
        out.push_str(&serde_json::to_string(&action)?);
        out.push('\n');

        if op.action != BulkAction::Delete {
            let doc = op.document.as_ref().ok_or_else(|| {
                StacError::InvalidRequest(format!("{} of {} has no document", op.action.as_str(), op.id))
            })?;
            out.push_str(&serde_json::to_string(doc)?);
            out.push('\n');
        }
    }
    Ok(out)
}

fn parse_bulk_item(v: &Value) -> Result<BulkItemResponse> {
    let inner = v
        .as_object()
        .and_then(|o| o.values().next())
        .ok_or_else(|| StacError::Engine(format!("malformed bulk item: {}", v)))?;
    let status = inner
        .get("status")
        .and_then(Value::as_u64)
        .and_then(|s| u16::try_from(s).ok())
        .ok_or_else(|| StacError::Engine(format!("bulk item without status: {}", inner)))?;
    Ok(BulkItemResponse {
        index: inner.get("_index").and_then(Value::as_str).unwrap_or_default().to_string(),
        id: inner.get("_id").and_then(Value::as_str).unwrap_or_default().to_string(),
        status,
        version: version_of(inner),
        error: inner.get("error").map(|e| error_reason(&json!({ "error": e }))),
    })
}

#[async_trait]
impl SearchEngine for ElasticClient {
    fn dialect(&self) -> EngineDialect {
        self.dialect
    }

    async fn search(&self, request: &EngineSearch) -> Result<SearchResponse> {
        if request.indices.is_empty() {
            return Ok(SearchResponse {
                hits: Vec::new(),
                total: TotalHits {
                    value: 0,
                    relation: TotalRelation::Eq,
                },
                aggregations: IndexMap::new(),
            });
        }
        let url = format!(
            "{}/{}/_search?ignore_unavailable=true&allow_no_indices=true",
            self.base_url,
            request.indices.join(",")
        );
        let body = serde_json::to_vec(&request.query.to_body(self.dialect)?)?;
        tracing::debug!("[SEARCH {}] {} bytes", request.indices.join(","), body.len());
        let (status, body) = self
            .send(
                self.http.post(url).header(CONTENT_TYPE, self.json_type()).body(body),
                "search",
            )
            .await?;
        if !status.is_success() {
            return Err(StacError::Engine(format!(
                "search returned {}: {}",
                status,
                error_reason(&body)
            )));
        }
        parse_search_response(&body, &request.query.aggregations)
    }

    async fn bulk(&self, request: &BulkRequest) -> Result<Vec<BulkItemResponse>> {
        if request.ops.is_empty() {
            return Ok(Vec::new());
        }
        let payload = bulk_payload(&request.ops)?;
        let url = format!("{}/_bulk?refresh={}", self.base_url, request.refresh.as_param());
        let (status, body) = self
            .send(
                self.http
                    .post(url)
                    .header(CONTENT_TYPE, self.ndjson_type())
                    .body(payload),
                "bulk",
            )
            .await?;
        if !status.is_success() {
            return Err(StacError::Engine(format!(
                "bulk returned {}: {}",
                status,
                error_reason(&body)
            )));
        }
        let items = body
            .get("items")
            .and_then(Value::as_array)
            .ok_or_else(|| StacError::Engine("bulk response without items".to_string()))?;
        if items.len() != request.ops.len() {
            return Err(StacError::Engine(format!(
                "bulk response has {} items for {} ops",
                items.len(),
                request.ops.len()
            )));
        }
        items.iter().map(parse_bulk_item).collect()
    }

    async fn create_index(&self, name: &str, mapping: &IndexMapping) -> Result<()> {
        let url = format!("{}/{}", self.base_url, name);
        let body = serde_json::to_vec(&json!({ "mappings": mapping.to_json() }))?;
        let (status, body) = self
            .send(
                self.http.put(url).header(CONTENT_TYPE, self.json_type()).body(body),
                "create_index",
            )
            .await?;
        if status.is_success() {
            return Ok(());
        }
        let kind = body.pointer("/error/type").and_then(Value::as_str);
        if kind == Some("resource_already_exists_exception") {
            return Err(StacError::AlreadyExists(format!("index {}", name)));
        }
        Err(StacError::Engine(format!(
            "create index {} returned {}: {}",
            name,
            status,
            error_reason(&body)
        )))
    }

    async fn get_mapping(&self, name: &str) -> Result<Option<IndexMapping>> {
        let url = format!(
            "{}/{}/_mapping?ignore_unavailable=true&allow_no_indices=true",
            self.base_url, name
        );
        let (status, body) = self.send(self.http.get(url), "get_mapping").await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(StacError::Engine(format!(
                "get mapping {} returned {}: {}",
                name,
                status,
                error_reason(&body)
            )));
        }
        let indices = match body.as_object() {
            Some(o) if !o.is_empty() => o,
            _ => return Ok(None),
        };
        let mut merged = IndexMapping::new();
        for index in indices.values() {
            merged.merge(&IndexMapping::from_json(
                index.get("mappings").unwrap_or(&Value::Null),
            ));
        }
        Ok(Some(merged))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bulk_payload_lines() {
        let ops = vec![
            BulkOp::index("items_c", "a", json!({"id": "a"}))
                .if_version(Some(VersionToken::new(4, 1))),
            BulkOp::delete("items_c", "b"),
            BulkOp::create("items_c", "c", json!({"id": "c"})),
        ];
        let payload = bulk_payload(&ops).unwrap();
        let lines: Vec<Value> = payload
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[0]["index"]["_id"], "a");
        assert_eq!(lines[0]["index"]["if_seq_no"], 4);
        assert_eq!(lines[0]["index"]["if_primary_term"], 1);
        assert_eq!(lines[1]["id"], "a");
        assert_eq!(lines[2]["delete"]["_index"], "items_c");
        assert!(lines[2]["delete"].get("if_seq_no").is_none());
        assert_eq!(lines[3]["create"]["_id"], "c");
        assert!(payload.ends_with('\n'));
    }

    #[test]
    fn test_parse_search_response() {
        let body = json!({
            "hits": {
                "total": {"value": 12, "relation": "gte"},
                "hits": [{
                    "_index": "items_c",
                    "_id": "a",
                    "_seq_no": 3,
                    "_primary_term": 2,
                    "_source": {"id": "a"},
                    "sort": ["a", "c"]
                }]
            }
        });
        let r = parse_search_response(&body, &IndexMap::new()).unwrap();
        assert_eq!(r.total.relation, TotalRelation::Gte);
        assert_eq!(r.hits[0].version, Some(VersionToken::new(3, 2)));
        assert_eq!(r.hits[0].sort, vec![json!("a"), json!("c")]);
        assert!(r.aggregations.is_empty());
    }

    #[test]
    fn test_parse_aggregations() {
        let mut requested = IndexMap::new();
        requested.insert(
            "datetime_frequency".to_string(),
            Aggregation::DateHistogram {
                field: "properties.datetime".into(),
                interval: stacdb::query::dsl::CalendarInterval::Month,
            },
        );
        requested.insert(
            "collection_frequency".to_string(),
            Aggregation::Terms {
                field: "collection".into(),
                size: 10,
            },
        );
        requested.insert(
            "datetime_min".to_string(),
            Aggregation::Min {
                field: "properties.datetime".into(),
            },
        );
        requested.insert(
            "datetime_max".to_string(),
            Aggregation::Max {
                field: "properties.datetime".into(),
            },
        );
        let body = json!({
            "hits": {"total": {"value": 3, "relation": "eq"}, "hits": []},
            "aggregations": {
                "datetime_frequency": {"buckets": [
                    {"key_as_string": "2020-01-01T00:00:00.000Z", "key": 1577836800000i64, "doc_count": 2}
                ]},
                "collection_frequency": {"buckets": [{"key": "s2", "doc_count": 3}]},
                "datetime_min": {"value": 1579082400000.0, "value_as_string": "2020-01-15T10:00:00.000Z"},
                "datetime_max": {"value": null}
            }
        });
        let r = parse_search_response(&body, &requested).unwrap();
        assert_eq!(
            r.aggregations["datetime_frequency"],
            AggregationResult::Buckets(vec![Bucket {
                key: json!("2020-01-01T00:00:00Z"),
                count: 2
            }])
        );
        assert_eq!(
            r.aggregations["collection_frequency"],
            AggregationResult::Buckets(vec![Bucket {
                key: json!("s2"),
                count: 3
            }])
        );
        assert_eq!(
            r.aggregations["datetime_min"],
            AggregationResult::Value(Some(json!("2020-01-15T10:00:00Z")))
        );
        assert_eq!(r.aggregations["datetime_max"], AggregationResult::Value(None));

        let missing = json!({"hits": {"hits": []}});
        assert!(parse_search_response(&missing, &requested).is_err());
    }

    #[test]
    fn test_parse_bulk_item_error() {
        let item = json!({"index": {
            "_index": "items_c",
            "_id": "a",
            "status": 409,
            "error": {"type": "version_conflict_engine_exception", "reason": "stale"}
        }});
        let r = parse_bulk_item(&item).unwrap();
        assert_eq!(r.status, 409);
        assert_eq!(r.error.as_deref(), Some("version_conflict_engine_exception: stale"));
        assert!(r.version.is_none());
    }

    #[test]
    fn test_opensearch_uses_plain_json() {
        assert!(uses_compat_headers(EngineDialect::Elasticsearch8));
        assert!(!uses_compat_headers(EngineDialect::OpenSearch));
    }
}
