mod common;

use async_trait::async_trait;
use common::{fixture, fixture_with, item, load};
use serde_json::json;
use stacdb::engine::{
    BulkItemResponse, BulkRequest, EngineSearch, SearchResponse, TotalHits, TotalRelation,
};
use stacdb::index::IndexMapping;
use stacdb::{
    BulkOutcome, CatalogConfig, ErrorKind, IndexManager, MutationCoordinator, Refresh,
    SearchEngine, StacError, VersionToken,
};
use std::sync::Arc;

/// Rejects every conditional write with a fixed reason, and whose search has
/// not caught up with the writes yet.
struct UnrefreshedEngine {
    conflict: &'static str,
}

#[async_trait]
impl SearchEngine for UnrefreshedEngine {
    async fn search(&self, _request: &EngineSearch) -> stacdb::Result<SearchResponse> {
        Ok(SearchResponse {
            hits: Vec::new(),
            total: TotalHits {
                value: 0,
                relation: TotalRelation::Eq,
            },
            aggregations: Default::default(),
        })
    }

    async fn bulk(&self, request: &BulkRequest) -> stacdb::Result<Vec<BulkItemResponse>> {
        Ok(request
            .ops
            .iter()
            .map(|op| BulkItemResponse {
                index: op.index.clone(),
                id: op.id.clone(),
                status: 409,
                version: None,
                error: Some(self.conflict.to_string()),
            })
            .collect())
    }

    async fn create_index(&self, _name: &str, _mapping: &IndexMapping) -> stacdb::Result<()> {
        Ok(())
    }

    async fn get_mapping(&self, _name: &str) -> stacdb::Result<Option<IndexMapping>> {
        Ok(Some(IndexMapping::item_default()))
    }
}

fn unrefreshed(conflict: &'static str) -> MutationCoordinator {
    let engine = Arc::new(UnrefreshedEngine { conflict });
    let config = CatalogConfig::for_tests();
    let indices = IndexManager::new(engine.clone(), &config);
    MutationCoordinator::new(engine, indices, &config)
}

#[tokio::test]
async fn test_concurrent_replace_has_one_winner() {
    let f = fixture();
    load(&f, "c", vec![item("c", "x", 0.0, 0.0, "2020-01-01T00:00:00Z", json!({}))]).await;
    let v0 = f.mutations.get("c", "x").await.unwrap().version;

    let first = item("c", "x", 0.0, 0.0, "2020-01-01T00:00:00Z", json!({"writer": "first"}));
    let second = item("c", "x", 0.0, 0.0, "2020-01-01T00:00:00Z", json!({"writer": "second"}));
    let (a, b) = tokio::join!(
        f.mutations.replace(first, v0, None),
        f.mutations.replace(second, v0, None)
    );

    let (winner, loser) = match (a, b) {
        (Ok(v), Err(e)) => (("first", v), e),
        (Err(e), Ok(v)) => (("second", v), e),
        other => panic!("expected exactly one winner, got {:?}", other),
    };
    assert!(matches!(loser, StacError::VersionConflict { .. }));
    assert!(winner.1 > v0);

    let stored = f.mutations.get("c", "x").await.unwrap();
    assert_eq!(stored.version, winner.1);
    assert_eq!(stored.item.properties["writer"], winner.0);
}

#[tokio::test]
async fn test_stale_patch_is_rejected_without_writing() {
    let f = fixture();
    load(&f, "c", vec![item("c", "x", 0.0, 0.0, "2020-01-01T00:00:00Z", json!({"gsd": 10}))]).await;
    let v0 = f.mutations.get("c", "x").await.unwrap().version;

    let delta = json!({"gsd": 30}).as_object().cloned().unwrap_or_default();
    let v1 = f.mutations.patch("c", "x", delta.clone(), v0, None).await.unwrap();
    let writes = f.engine.bulk_calls();

    let err = f.mutations.patch("c", "x", delta, v0, None).await.unwrap_err();
    assert!(matches!(err, StacError::VersionConflict { .. }));
    assert_eq!(f.engine.bulk_calls(), writes);
    assert_eq!(f.mutations.get("c", "x").await.unwrap().version, v1);
}

#[tokio::test]
async fn test_bulk_with_one_invalid_record() {
    let f = fixture();
    f.indices.ensure_index("c").await.unwrap();
    let mut items: Vec<_> = (0..10)
        .map(|i| item("c", &format!("i{}", i), 0.0, 0.0, "2020-01-01T00:00:00Z", json!({})))
        .collect();
    items[6].properties.insert("datetime".into(), json!("not a date"));

    let outcomes = f.mutations.bulk_upsert(items, Some(Refresh::Immediate)).await;
    assert_eq!(outcomes.len(), 10);
    for (i, outcome) in outcomes.iter().enumerate() {
        assert_eq!(outcome.id(), format!("i{}", i));
        if i == 6 {
            assert_eq!(outcome.kind(), Some(ErrorKind::Validation));
        } else {
            assert!(outcome.is_success(), "{:?}", outcome);
        }
    }
    assert_eq!(f.engine.doc_count("items_c").await, 9);
}

#[tokio::test]
async fn test_exhausted_chunk_keeps_earlier_chunks() {
    let config = CatalogConfig {
        bulk_chunk_docs: 3,
        ..CatalogConfig::for_tests()
    };
    let f = fixture_with(config);
    f.indices.ensure_index("c").await.unwrap();
    let items = (0..7)
        .map(|i| item("c", &format!("i{}", i), 0.0, 0.0, "2020-01-01T00:00:00Z", json!({})))
        .collect();

    // The first chunk lands; every attempt at the second fails.
    f.engine.fail_bulk_calls(1, 3);
    let outcomes = f.mutations.bulk_upsert(items, None).await;

    let kinds: Vec<Option<ErrorKind>> = outcomes.iter().map(BulkOutcome::kind).collect();
    assert_eq!(
        kinds,
        vec![
            None,
            None,
            None,
            Some(ErrorKind::Transport),
            Some(ErrorKind::Transport),
            Some(ErrorKind::Transport),
            None,
        ]
    );
    assert_eq!(f.engine.doc_count("items_c").await, 4);
}

#[tokio::test]
async fn test_bulk_respects_chunk_limits() {
    let config = CatalogConfig {
        bulk_chunk_docs: 4,
        bulk_chunk_bytes: 1_000_000,
        ..CatalogConfig::for_tests()
    };
    let f = fixture_with(config);
    f.indices.ensure_index("c").await.unwrap();
    let items = (0..10)
        .map(|i| item("c", &format!("i{}", i), 0.0, 0.0, "2020-01-01T00:00:00Z", json!({})))
        .collect();
    let outcomes = f.mutations.bulk_upsert(items, None).await;
    assert!(outcomes.iter().all(BulkOutcome::is_success));
    assert_eq!(f.engine.bulk_sizes(), vec![4, 4, 2]);
}

#[tokio::test]
async fn test_bulk_upsert_overwrites() {
    let f = fixture();
    load(&f, "c", vec![item("c", "x", 0.0, 0.0, "2020-01-01T00:00:00Z", json!({"gsd": 10}))]).await;
    load(&f, "c", vec![item("c", "x", 0.0, 0.0, "2020-01-01T00:00:00Z", json!({"gsd": 20}))]).await;
    let stored = f.mutations.get("c", "x").await.unwrap();
    assert_eq!(stored.item.properties["gsd"], 20);
    assert_eq!(f.engine.doc_count("items_c").await, 1);
}

#[tokio::test]
async fn test_double_delete() {
    let f = fixture();
    load(&f, "c", vec![item("c", "x", 0.0, 0.0, "2020-01-01T00:00:00Z", json!({}))]).await;
    f.mutations.delete("c", "x", None, None).await.unwrap();
    f.mutations.delete("c", "x", None, None).await.unwrap();
    assert!(matches!(
        f.mutations.get("c", "x").await,
        Err(StacError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_versioned_delete_of_missing_item() {
    let f = fixture();
    load(&f, "c", vec![item("c", "x", 0.0, 0.0, "2020-01-01T00:00:00Z", json!({}))]).await;
    let v = f.mutations.get("c", "x").await.unwrap().version;
    f.mutations.delete("c", "x", Some(v), None).await.unwrap();
    let err = f.mutations.delete("c", "x", Some(v), None).await.unwrap_err();
    assert!(matches!(err, StacError::NotFound(_)));
}

#[tokio::test]
async fn test_written_items_are_searchable_by_new_fields() {
    let f = fixture();
    load(&f, "c", vec![item("c", "x", 0.0, 0.0, "2020-01-01T00:00:00Z", json!({}))]).await;
    // Warm the mapping cache before the new field exists.
    f.indices.queryables(&["c".to_string()]).await.unwrap();

    f.mutations
        .create(
            item("c", "y", 0.0, 0.0, "2020-01-01T00:00:00Z", json!({"sat:orbit_state": "ascending"})),
            Some(Refresh::Immediate),
        )
        .await
        .unwrap();

    let request = stacdb::query::SearchRequest::from_json(&json!({
        "collections": ["c"],
        "filter": "sat:orbit_state = 'ascending'"
    }))
    .unwrap();
    let page = f.paginator.page(&request).await.unwrap();
    assert_eq!(common::ids(page.documents().cloned()), vec!["y"]);
}

#[tokio::test]
async fn test_stale_write_before_refresh_is_a_version_conflict() {
    let mutations = unrefreshed(
        "version_conflict_engine_exception: [x]: version conflict, required seqNo [3], \
         primary term [1]. current document has seqNo [7] and primary term [1]",
    );
    let expected = VersionToken::new(3, 1);
    let x = item("c", "x", 0.0, 0.0, "2020-01-01T00:00:00Z", json!({}));

    match mutations.replace(x, expected, None).await {
        Err(StacError::VersionConflict { message, .. }) => assert!(message.contains("1:7")),
        other => panic!("expected a version conflict, got {:?}", other),
    }
    let err = mutations.delete("c", "x", Some(expected), None).await.unwrap_err();
    assert!(matches!(err, StacError::VersionConflict { .. }));
}

#[tokio::test]
async fn test_conditional_write_on_missing_document_is_not_found() {
    let mutations = unrefreshed(
        "version_conflict_engine_exception: [x]: version conflict, required seqNo [3], \
         primary term [1]. but no document was found",
    );
    let x = item("c", "x", 0.0, 0.0, "2020-01-01T00:00:00Z", json!({}));
    let err = mutations
        .replace(x, VersionToken::new(3, 1), None)
        .await
        .unwrap_err();
    assert!(matches!(err, StacError::NotFound(_)));
}
