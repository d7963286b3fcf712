//! ElasticClient against a mocked cluster.

use serde_json::json;
use stacdb::engine::{BulkOp, BulkRequest, EngineSearch, Refresh, SearchEngine, TotalRelation};
use stacdb::index::{FieldKind, IndexMapping};
use stacdb::query::dsl::{EngineDialect, EngineQuery, EngineQueryNode};
use stacdb::{CatalogConfig, IndexManager, StacError, VersionToken};
use stacdb_elastic::{ElasticClient, ElasticConfig};
use std::sync::Arc;
use wiremock::matchers::{body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer, dialect: EngineDialect) -> ElasticClient {
    let config = ElasticConfig {
        use_ssl: false,
        ..Default::default()
    };
    ElasticClient::with_base_url(&config, server.uri(), dialect).unwrap()
}

fn search_for(indices: &[&str]) -> EngineSearch {
    EngineSearch {
        indices: indices.iter().map(|s| s.to_string()).collect(),
        query: EngineQuery {
            query: EngineQueryNode::MatchAll,
            sort: Vec::new(),
            size: 3,
            search_after: None,
            source: None,
            aggregations: Default::default(),
        },
    }
}

#[tokio::test]
async fn test_search_sends_compat_headers_and_parses_hits() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/items_a,items_b/_search"))
        .and(query_param("ignore_unavailable", "true"))
        .and(header(
            "accept",
            "application/vnd.elasticsearch+json; compatible-with=7",
        ))
        .and(body_string_contains("seq_no_primary_term"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "hits": {
                "total": {"value": 1, "relation": "eq"},
                "hits": [{
                    "_index": "items_a",
                    "_id": "x",
                    "_seq_no": 7,
                    "_primary_term": 1,
                    "_source": {"id": "x", "collection": "a"},
                    "sort": ["x", "a"]
                }]
            }
        })))
        .mount(&server)
        .await;

    let engine = client(&server, EngineDialect::Elasticsearch8);
    let response = engine.search(&search_for(&["items_a", "items_b"])).await.unwrap();
    assert_eq!(response.total.value, 1);
    assert_eq!(response.total.relation, TotalRelation::Eq);
    assert_eq!(response.hits[0].id, "x");
    assert_eq!(response.hits[0].version, Some(VersionToken::new(7, 1)));
}

#[tokio::test]
async fn test_unavailable_cluster_is_transport_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_json(json!({
            "error": {"type": "cluster_block_exception", "reason": "blocked"}
        })))
        .mount(&server)
        .await;
    let engine = client(&server, EngineDialect::Elasticsearch8);
    let err = engine.search(&search_for(&["items_a"])).await.unwrap_err();
    assert!(matches!(err, StacError::Transport(ref m) if m.contains("cluster_block_exception")));

    let err = engine
        .bulk(&BulkRequest {
            ops: vec![BulkOp::delete("items_a", "x")],
            refresh: Refresh::Eventual,
        })
        .await
        .unwrap_err();
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_connection_refused_is_transport_error() {
    let config = ElasticConfig {
        use_ssl: false,
        ..Default::default()
    };
    let engine =
        ElasticClient::with_base_url(&config, "http://127.0.0.1:1", EngineDialect::Elasticsearch8)
            .unwrap();
    let err = engine.get_mapping("items_a").await.unwrap_err();
    assert!(matches!(err, StacError::Transport(_)));
}

#[tokio::test]
async fn test_bulk_reports_items_in_order() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/_bulk"))
        .and(query_param("refresh", "wait_for"))
        .and(header(
            "content-type",
            "application/vnd.elasticsearch+x-ndjson; compatible-with=7",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errors": true,
            "items": [
                {"index": {"_index": "items_a", "_id": "1", "status": 201, "_seq_no": 0, "_primary_term": 1}},
                {"index": {"_index": "items_a", "_id": "2", "status": 409,
                           "error": {"type": "version_conflict_engine_exception", "reason": "stale"}}}
            ]
        })))
        .mount(&server)
        .await;

    let engine = client(&server, EngineDialect::Elasticsearch8);
    let responses = engine
        .bulk(&BulkRequest {
            ops: vec![
                BulkOp::index("items_a", "1", json!({"id": "1"})),
                BulkOp::index("items_a", "2", json!({"id": "2"}))
                    .if_version(Some(VersionToken::new(3, 1))),
            ],
            refresh: Refresh::WaitFor,
        })
        .await
        .unwrap();
    assert_eq!(responses.len(), 2);
    assert!(responses[0].is_success());
    assert_eq!(responses[0].version, Some(VersionToken::new(0, 1)));
    assert_eq!(responses[1].status, 409);
}

#[tokio::test]
async fn test_create_existing_index() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/items_a"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": {"type": "resource_already_exists_exception", "reason": "index [items_a] already exists"},
            "status": 400
        })))
        .mount(&server)
        .await;
    let engine = client(&server, EngineDialect::OpenSearch);
    let err = engine
        .create_index("items_a", &IndexMapping::item_default())
        .await
        .unwrap_err();
    assert!(matches!(err, StacError::AlreadyExists(_)));
}

#[tokio::test]
async fn test_get_mapping_missing_and_merged() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/items_missing/_mapping"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "error": {"type": "index_not_found_exception", "reason": "no such index"}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/items_*/_mapping"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items_a": {"mappings": {"properties": {
                "geometry": {"type": "geo_shape"},
                "properties": {"properties": {"eo:cloud_cover": {"type": "float"}}}
            }}},
            "items_b": {"mappings": {"properties": {
                "properties": {"properties": {"platform": {"type": "keyword"}}}
            }}}
        })))
        .mount(&server)
        .await;

    let engine = client(&server, EngineDialect::Elasticsearch8);
    assert!(engine.get_mapping("items_missing").await.unwrap().is_none());
    let merged = engine.get_mapping("items_*").await.unwrap().unwrap();
    assert_eq!(merged.field("geometry"), Some(FieldKind::GeoShape));
    assert_eq!(merged.field("properties.eo:cloud_cover"), Some(FieldKind::Float));
    assert_eq!(merged.field("properties.platform"), Some(FieldKind::Keyword));
}

#[tokio::test]
async fn test_index_manager_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/items_landsat/_mapping"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/items_landsat"))
        .and(body_string_contains("geo_shape"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"acknowledged": true})))
        .expect(1)
        .mount(&server)
        .await;

    let engine = Arc::new(client(&server, EngineDialect::Elasticsearch8));
    let indices = IndexManager::new(engine, &CatalogConfig::for_tests());
    assert_eq!(indices.ensure_index("landsat").await.unwrap(), "items_landsat");
    assert_eq!(indices.ensure_index("landsat").await.unwrap(), "items_landsat");
}
