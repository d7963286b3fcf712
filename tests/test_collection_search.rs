mod common;

use common::{fixture, Fixture};
use serde_json::json;
use stacdb::query::SearchRequest;
use stacdb::{Collection, CollectionPage, Extent, SpatialExtent, StacError, TemporalExtent};

fn collection(
    id: &str,
    title: &str,
    keywords: &[&str],
    bbox: Option<[f64; 4]>,
    interval: [Option<&str>; 2],
) -> Collection {
    let mut c = Collection::new(id);
    c.title = Some(title.to_string());
    c.keywords = keywords.iter().map(|k| k.to_string()).collect();
    c.extent = Extent {
        spatial: SpatialExtent {
            bbox: bbox.map(|b| vec![b.to_vec()]).unwrap_or_default(),
        },
        temporal: TemporalExtent {
            interval: vec![interval.map(|t| t.map(str::to_string))],
        },
    };
    c
}

async fn catalog() -> Fixture {
    let f = fixture();
    for c in [
        collection(
            "landsat-c2",
            "Landsat Collection 2",
            &["landsat", "usgs"],
            Some([-125.0, 24.0, -66.0, 50.0]),
            [Some("2013-04-11T00:00:00Z"), Some("2021-12-31T23:59:59Z")],
        ),
        collection(
            "sentinel-2-l2a",
            "Sentinel-2 Level-2A",
            &["sentinel", "esa"],
            Some([0.0, 40.0, 20.0, 60.0]),
            [Some("2017-03-28T00:00:00Z"), None],
        ),
        collection("naip", "NAIP aerial imagery", &["usda"], None, [None, None]),
    ] {
        f.collections.create(c).await.unwrap();
    }
    f
}

async fn search(f: &Fixture, body: serde_json::Value) -> CollectionPage {
    let request = SearchRequest::from_json(&body).unwrap();
    f.collections.search(&request).await.unwrap()
}

fn ids(page: &CollectionPage) -> Vec<&str> {
    page.collections.iter().map(|c| c.id.as_str()).collect()
}

#[tokio::test]
async fn test_bbox_matches_spatial_extent() {
    let f = catalog().await;
    let page = search(&f, json!({"bbox": [5.0, 45.0, 6.0, 46.0]})).await;
    assert_eq!(ids(&page), vec!["sentinel-2-l2a"]);
    // Derived search fields never leak into returned documents.
    assert_eq!(page.collections[0].keywords, vec!["sentinel", "esa"]);

    let page = search(&f, json!({"bbox": [-130.0, 0.0, 30.0, 70.0]})).await;
    assert_eq!(ids(&page), vec!["landsat-c2", "sentinel-2-l2a"]);
}

#[tokio::test]
async fn test_datetime_overlaps_temporal_extent() {
    let f = catalog().await;
    // Open-ended and unbounded extents overlap anything after their start.
    let page = search(&f, json!({"datetime": "2023-01-01T00:00:00Z/.."})).await;
    assert_eq!(ids(&page), vec!["naip", "sentinel-2-l2a"]);

    let page = search(&f, json!({"datetime": "2014-06-01T00:00:00Z"})).await;
    assert_eq!(ids(&page), vec!["landsat-c2", "naip"]);

    let page = search(&f, json!({"datetime": "../2013-01-01T00:00:00Z"})).await;
    assert_eq!(ids(&page), vec!["naip"]);
}

#[tokio::test]
async fn test_free_text_and_filter() {
    let f = catalog().await;
    let page = search(&f, json!({"q": "usgs,aerial"})).await;
    assert_eq!(ids(&page), vec!["landsat-c2", "naip"]);

    let page = search(&f, json!({"filter": "id LIKE 'sentinel%'"})).await;
    assert_eq!(ids(&page), vec!["sentinel-2-l2a"]);

    let page = search(&f, json!({"collections": ["naip", "landsat-c2"], "q": "landsat"})).await;
    assert_eq!(ids(&page), vec!["landsat-c2"]);
}

#[tokio::test]
async fn test_collection_pages_follow_tokens() {
    let f = catalog().await;
    let first = search(&f, json!({"limit": 2})).await;
    assert_eq!(ids(&first), vec!["landsat-c2", "naip"]);
    assert_eq!(first.matched.value, 3);
    let token = first.next.clone().unwrap();

    let second = search(&f, json!({"limit": 2, "token": token})).await;
    assert_eq!(ids(&second), vec!["sentinel-2-l2a"]);
    assert!(second.next.is_none());

    // A token only pages the search that issued it.
    let request = SearchRequest::from_json(&json!({"limit": 2, "q": "landsat", "token": token})).unwrap();
    assert!(matches!(
        f.collections.search(&request).await,
        Err(StacError::CursorMismatch)
    ));
}
