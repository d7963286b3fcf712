use serde_json::{json, Value};
use stacdb::{
    CatalogConfig, CollectionCatalog, IndexManager, Item, MemoryEngine, MutationCoordinator,
    Paginator, Refresh,
};
use std::sync::Arc;

pub struct Fixture {
    pub engine: Arc<MemoryEngine>,
    pub indices: Arc<IndexManager>,
    pub paginator: Paginator,
    pub mutations: MutationCoordinator,
    pub collections: CollectionCatalog,
}

#[allow(dead_code)]
pub fn fixture() -> Fixture {
    fixture_with(CatalogConfig::for_tests())
}

pub fn fixture_with(config: CatalogConfig) -> Fixture {
    fixture_on(MemoryEngine::new(), config)
}

pub fn fixture_on(engine: MemoryEngine, config: CatalogConfig) -> Fixture {
    let engine = Arc::new(engine);
    let indices = IndexManager::new(engine.clone(), &config);
    Fixture {
        paginator: Paginator::new(engine.clone(), indices.clone(), &config),
        mutations: MutationCoordinator::new(engine.clone(), indices.clone(), &config),
        collections: CollectionCatalog::new(engine.clone(), indices.clone(), &config),
        engine,
        indices,
    }
}

/// A point item with the given properties merged over a `datetime`.
#[allow(dead_code)]
pub fn item(collection: &str, id: &str, lon: f64, lat: f64, datetime: &str, extra: Value) -> Item {
    let mut properties = json!({ "datetime": datetime });
    if let (Some(props), Some(extra)) = (properties.as_object_mut(), extra.as_object()) {
        props.extend(extra.clone());
    }
    Item::from_json(json!({
        "type": "Feature",
        "id": id,
        "collection": collection,
        "geometry": {"type": "Point", "coordinates": [lon, lat]},
        "properties": properties,
        "links": []
    }))
    .unwrap()
}

/// Create the collection and load the items, asserting every write succeeds.
#[allow(dead_code)]
pub async fn load(f: &Fixture, collection: &str, items: Vec<Item>) {
    f.indices.ensure_index(collection).await.unwrap();
    let outcomes = f.mutations.bulk_upsert(items, Some(Refresh::Immediate)).await;
    for outcome in &outcomes {
        assert!(outcome.is_success(), "load failed: {:?}", outcome);
    }
}

#[allow(dead_code)]
pub fn ids(docs: impl Iterator<Item = Value>) -> Vec<String> {
    docs.map(|d| d["id"].as_str().unwrap_or_default().to_string())
        .collect()
}
