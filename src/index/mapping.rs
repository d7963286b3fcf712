use crate::error::{Result, StacError};
use indexmap::IndexMap;
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    Keyword,
    /// Analyzed text: searchable by free text, not sortable or term-matchable.
    Text,
    Date,
    Float,
    Long,
    Boolean,
    GeoShape,
    /// Stored but not indexed (`enabled: false` objects, `index: false` fields).
    Disabled,
    /// A mapping type this crate does not interpret; still filterable by term.
    Unknown,
}

impl FieldKind {
    pub fn from_engine_type(t: &str) -> Self {
        match t {
            "keyword" | "constant_keyword" | "wildcard" => FieldKind::Keyword,
            "text" | "match_only_text" => FieldKind::Text,
            "date" | "date_nanos" => FieldKind::Date,
            "float" | "double" | "half_float" | "scaled_float" => FieldKind::Float,
            "long" | "integer" | "short" | "byte" | "unsigned_long" => FieldKind::Long,
            "boolean" => FieldKind::Boolean,
            "geo_shape" | "geo_point" | "shape" => FieldKind::GeoShape,
            _ => FieldKind::Unknown,
        }
    }

    pub fn engine_type(&self) -> Option<&'static str> {
        match self {
            FieldKind::Keyword => Some("keyword"),
            FieldKind::Text => Some("text"),
            FieldKind::Date => Some("date"),
            FieldKind::Float => Some("float"),
            FieldKind::Long => Some("long"),
            FieldKind::Boolean => Some("boolean"),
            FieldKind::GeoShape => Some("geo_shape"),
            FieldKind::Disabled | FieldKind::Unknown => None,
        }
    }

    pub fn is_sortable(&self) -> bool {
        matches!(
            self,
            FieldKind::Keyword
                | FieldKind::Date
                | FieldKind::Float
                | FieldKind::Long
                | FieldKind::Boolean
        )
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, FieldKind::Float | FieldKind::Long)
    }
}

/// A field mapping flattened to dotted engine paths, plus dynamic templates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexMapping {
    fields: IndexMap<String, FieldKind>,
    dynamic_templates: Vec<Value>,
}

/// Top-level item fields that are not nested under `properties`.
pub const ITEM_ROOT_FIELDS: [&str; 4] = ["id", "collection", "geometry", "bbox"];

/// Derived geo_shape of a collection's overall spatial extent.
pub const COLLECTION_SHAPE_FIELD: &str = "bbox_shape";
/// Derived bounds of a collection's overall temporal extent; absent when open.
pub const COLLECTION_START_FIELD: &str = "extent_start";
pub const COLLECTION_END_FIELD: &str = "extent_end";

/// Free-text search targets of collections.
pub const COLLECTION_TEXT_FIELDS: [&str; 3] = ["title", "description", "keywords"];

/// Free-text search targets.
pub const TEXT_SEARCH_FIELDS: [&str; 3] = [
    "properties.title",
    "properties.description",
    "properties.keywords",
];

impl IndexMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, path: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.insert(path.into(), kind);
        self
    }

    pub fn with_dynamic_template(mut self, name: &str, template: Value) -> Self {
        self.dynamic_templates.push(json!({ name: template }));
        self
    }

    /// The mapping every item index is created with.
    pub fn item_default() -> Self {
        IndexMapping::new()
            .with_field("id", FieldKind::Keyword)
            .with_field("collection", FieldKind::Keyword)
            .with_field("geometry", FieldKind::GeoShape)
            .with_field("bbox", FieldKind::Float)
            .with_field("properties.datetime", FieldKind::Date)
            .with_field("properties.start_datetime", FieldKind::Date)
            .with_field("properties.end_datetime", FieldKind::Date)
            .with_field("properties.created", FieldKind::Date)
            .with_field("properties.updated", FieldKind::Date)
            .with_field("properties.title", FieldKind::Text)
            .with_field("properties.description", FieldKind::Text)
            .with_field("properties.keywords", FieldKind::Text)
            .with_field("assets", FieldKind::Disabled)
            .with_field("links", FieldKind::Disabled)
            .with_dynamic_template(
                "descriptions",
                json!({"match_mapping_type": "string", "match": "description", "mapping": {"type": "text"}}),
            )
            .with_dynamic_template(
                "titles",
                json!({"match_mapping_type": "string", "match": "title", "mapping": {"type": "text"}}),
            )
            .with_dynamic_template(
                "proj_epsg",
                json!({"match": "proj:epsg", "mapping": {"type": "integer"}}),
            )
            .with_dynamic_template(
                "proj_projjson",
                json!({"match": "proj:projjson", "mapping": {"type": "object", "enabled": false}}),
            )
            .with_dynamic_template(
                "proj_geometry",
                json!({"match": "proj:geometry", "mapping": {"type": "object", "enabled": false}}),
            )
            .with_dynamic_template(
                "no_index_href",
                json!({"match": "href", "mapping": {"type": "text", "index": false}}),
            )
            .with_dynamic_template(
                "strings",
                json!({"match_mapping_type": "string", "mapping": {"type": "keyword"}}),
            )
            .with_dynamic_template(
                "numerics",
                json!({"match_mapping_type": "long", "mapping": {"type": "float"}}),
            )
    }

    /// The mapping of the collections index.
    pub fn collection_default() -> Self {
        IndexMapping::new()
            .with_field("id", FieldKind::Keyword)
            .with_field("title", FieldKind::Text)
            .with_field("description", FieldKind::Text)
            .with_field("keywords", FieldKind::Text)
            .with_field("extent.spatial.bbox", FieldKind::Float)
            .with_field("extent.temporal.interval", FieldKind::Date)
            .with_field(COLLECTION_SHAPE_FIELD, FieldKind::GeoShape)
            .with_field(COLLECTION_START_FIELD, FieldKind::Date)
            .with_field(COLLECTION_END_FIELD, FieldKind::Date)
            .with_field("summaries", FieldKind::Disabled)
            .with_field("links", FieldKind::Disabled)
    }

    pub fn field(&self, path: &str) -> Option<FieldKind> {
        self.fields.get(path).copied()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, FieldKind)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Union with another mapping; on conflicting kinds the existing one wins.
    pub fn merge(&mut self, other: &IndexMapping) {
        for (path, kind) in &other.fields {
            self.fields.entry(path.clone()).or_insert(*kind);
        }
        for t in &other.dynamic_templates {
            if !self.dynamic_templates.contains(t) {
                self.dynamic_templates.push(t.clone());
            }
        }
    }

    /// Map fields first seen in `doc` the way the engine's dynamic mapping
    /// does with the item templates. Already-mapped paths, including
    /// disabled objects, are left alone.
    pub fn learn_dynamic(&mut self, doc: &Value) {
        if let Some(obj) = doc.as_object() {
            self.learn_object(obj, "");
        }
    }

    fn learn_object(&mut self, obj: &serde_json::Map<String, Value>, prefix: &str) {
        for (name, value) in obj {
            let path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{}.{}", prefix, name)
            };
            if self.fields.contains_key(&path) {
                continue;
            }
            let sample = match value {
                Value::Array(values) => match values.iter().find(|v| !v.is_null()) {
                    Some(v) => v,
                    None => continue,
                },
                other => other,
            };
            let kind = match sample {
                Value::Object(children) => {
                    self.learn_object(children, &path);
                    continue;
                }
                Value::Null | Value::Array(_) => continue,
                Value::String(_) if name == "title" || name == "description" => FieldKind::Text,
                Value::String(s) if chrono::DateTime::parse_from_rfc3339(s).is_ok() => FieldKind::Date,
                Value::String(_) => FieldKind::Keyword,
                Value::Number(_) if name == "proj:epsg" => FieldKind::Long,
                Value::Number(_) => FieldKind::Float,
                Value::Bool(_) => FieldKind::Boolean,
            };
            self.fields.insert(path, kind);
        }
    }

    /// Existing indices must agree with the fields every item query relies on.
    pub fn validate_item_mapping(&self, index: &str) -> Result<()> {
        for (path, want) in [
            ("geometry", FieldKind::GeoShape),
            ("properties.datetime", FieldKind::Date),
            ("id", FieldKind::Keyword),
            ("collection", FieldKind::Keyword),
        ] {
            match self.field(path) {
                Some(kind) if kind == want => {}
                Some(kind) => {
                    return Err(StacError::InvalidSchema(format!(
                        "index {} maps {} as {:?}, expected {:?}",
                        index, path, kind, want
                    )))
                }
                None => {
                    return Err(StacError::InvalidSchema(format!(
                        "index {} has no mapping for {}",
                        index, path
                    )))
                }
            }
        }
        Ok(())
    }

    /// Engine JSON (`{"dynamic_templates": [...], "properties": {...}}`).
    pub fn to_json(&self) -> Value {
        let mut root = serde_json::Map::new();
        for (path, kind) in &self.fields {
            let segments: Vec<&str> = path.split('.').collect();
            insert_path(&mut root, &segments, *kind);
        }
        let mut body = serde_json::Map::new();
        if !self.dynamic_templates.is_empty() {
            body.insert(
                "dynamic_templates".to_string(),
                Value::Array(self.dynamic_templates.clone()),
            );
        }
        body.insert("properties".to_string(), Value::Object(root));
        Value::Object(body)
    }

    /// Parse the `mappings` object returned by the engine.
    pub fn from_json(value: &Value) -> Self {
        let mut mapping = IndexMapping::new();
        if let Some(templates) = value.get("dynamic_templates").and_then(|t| t.as_array()) {
            mapping.dynamic_templates = templates.clone();
        }
        if let Some(props) = value.get("properties").and_then(|p| p.as_object()) {
            collect_fields(props, "", &mut mapping.fields);
        }
        mapping
    }
}

fn leaf_json(kind: FieldKind) -> Value {
    match kind {
        FieldKind::Disabled => json!({"type": "object", "enabled": false}),
        FieldKind::Unknown => json!({"type": "keyword"}),
        other => json!({"type": other.engine_type()}),
    }
}

fn insert_path(node: &mut serde_json::Map<String, Value>, segments: &[&str], kind: FieldKind) {
    let (head, rest) = match segments.split_first() {
        Some(split) => split,
        None => return,
    };
    if rest.is_empty() {
        node.insert(head.to_string(), leaf_json(kind));
        return;
    }
    let child = node
        .entry(head.to_string())
        .or_insert_with(|| json!({"type": "object", "properties": {}}));
    if child.get("properties").is_none() {
        child["properties"] = json!({});
    }
    if let Some(props) = child["properties"].as_object_mut() {
        insert_path(props, rest, kind);
    }
}

fn collect_fields(
    props: &serde_json::Map<String, Value>,
    prefix: &str,
    out: &mut IndexMap<String, FieldKind>,
) {
    for (name, spec) in props {
        let path = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{}.{}", prefix, name)
        };
        let disabled = spec.get("enabled").and_then(|e| e.as_bool()) == Some(false)
            || spec.get("index").and_then(|e| e.as_bool()) == Some(false);
        if disabled {
            out.insert(path, FieldKind::Disabled);
            continue;
        }
        match spec.get("type").and_then(|t| t.as_str()) {
            Some("object") | Some("nested") | None => {
                if let Some(children) = spec.get("properties").and_then(|p| p.as_object()) {
                    collect_fields(children, &path, out);
                }
            }
            Some(t) => {
                out.insert(path, FieldKind::from_engine_type(t));
            }
        }
    }
}
