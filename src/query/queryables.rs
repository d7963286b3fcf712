use crate::error::{Result, StacError};
use crate::index::mapping::{FieldKind, IndexMapping, COLLECTION_SHAPE_FIELD, ITEM_ROOT_FIELDS};
use serde::Serialize;

/// Which documents a search runs over; decides how client names map to
/// engine paths.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchScope {
    #[default]
    Items,
    Collections,
}

impl SearchScope {
    /// Engine path of a client field name.
    ///
    /// Item names follow STAC conventions: `id`, `collection`, `geometry` and
    /// `bbox` address the item root, everything else addresses
    /// `properties.*` (an explicit `properties.` prefix is accepted too).
    /// Collection names address the document root; `geometry` is the
    /// collection's spatial extent.
    pub fn path(&self, name: &str) -> String {
        match self {
            SearchScope::Items => {
                if ITEM_ROOT_FIELDS.contains(&name) || name.starts_with("properties.") {
                    name.to_string()
                } else {
                    format!("properties.{}", name)
                }
            }
            SearchScope::Collections => match name {
                "geometry" => COLLECTION_SHAPE_FIELD.to_string(),
                other => other.to_string(),
            },
        }
    }
}

/// A field name as written by a client, resolved against the index mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedField {
    pub path: String,
    pub kind: FieldKind,
}

/// The set of fields a filter or sort may reference, named per
/// [`SearchScope::path`].
#[derive(Debug, Clone, Default)]
pub struct Queryables {
    mapping: IndexMapping,
    scope: SearchScope,
}

impl Queryables {
    pub fn new(mapping: IndexMapping) -> Self {
        Queryables {
            mapping,
            scope: SearchScope::Items,
        }
    }

    pub fn for_collections(mapping: IndexMapping) -> Self {
        Queryables {
            mapping,
            scope: SearchScope::Collections,
        }
    }

    pub fn item_default() -> Self {
        Queryables::new(IndexMapping::item_default())
    }

    pub fn mapping(&self) -> &IndexMapping {
        &self.mapping
    }

    pub fn scope(&self) -> SearchScope {
        self.scope
    }

    /// Item-scope engine path of a client name.
    pub fn engine_path(name: &str) -> String {
        SearchScope::Items.path(name)
    }

    pub fn resolve(&self, name: &str) -> Result<ResolvedField> {
        let path = self.scope.path(name);
        match self.mapping.field(&path) {
            Some(FieldKind::Disabled) | None => Err(StacError::UnsupportedField(name.to_string())),
            Some(kind) => Ok(ResolvedField { path, kind }),
        }
    }

    pub fn resolve_sortable(&self, name: &str) -> Result<ResolvedField> {
        let field = self
            .resolve(name)
            .map_err(|_| StacError::UnsortableField(name.to_string()))?;
        if field.kind.is_sortable() {
            Ok(field)
        } else {
            Err(StacError::UnsortableField(name.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stac_names_map_to_engine_paths() {
        assert_eq!(Queryables::engine_path("id"), "id");
        assert_eq!(Queryables::engine_path("datetime"), "properties.datetime");
        assert_eq!(
            Queryables::engine_path("properties.eo:cloud_cover"),
            "properties.eo:cloud_cover"
        );
    }

    #[test]
    fn test_unknown_and_disabled_fields_rejected() {
        let q = Queryables::item_default();
        assert!(matches!(
            q.resolve("eo:cloud_cover"),
            Err(StacError::UnsupportedField(_))
        ));
        assert!(matches!(q.resolve("assets"), Err(StacError::UnsupportedField(_))));
        assert_eq!(q.resolve("datetime").unwrap().kind, FieldKind::Date);
    }

    #[test]
    fn test_collection_names_address_the_root() {
        let q = Queryables::for_collections(IndexMapping::collection_default());
        assert_eq!(q.resolve("title").unwrap().path, "title");
        assert_eq!(q.resolve("title").unwrap().kind, FieldKind::Text);
        assert_eq!(q.resolve("geometry").unwrap().path, "bbox_shape");
        assert_eq!(q.resolve("geometry").unwrap().kind, FieldKind::GeoShape);
        assert!(q.resolve("collection").is_err());
        assert!(q.resolve_sortable("id").is_ok());
    }

    #[test]
    fn test_sortable_resolution() {
        let q = Queryables::item_default();
        assert!(q.resolve_sortable("id").is_ok());
        assert!(matches!(
            q.resolve_sortable("geometry"),
            Err(StacError::UnsortableField(_))
        ));
        assert!(matches!(
            q.resolve_sortable("title"),
            Err(StacError::UnsortableField(_))
        ));
    }
}
