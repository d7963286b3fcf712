use crate::error::{Result, StacError};

/// Characters the engine refuses in index names.
const INVALID_INDEX_CHARS: [char; 12] = ['\\', '/', '*', '?', '"', '<', '>', '|', ' ', ',', '#', ':'];

/// Maps logical collection ids to physical index names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexNaming {
    items_prefix: String,
    collections_index: String,
}

impl Default for IndexNaming {
    fn default() -> Self {
        IndexNaming::new("items_", "collections")
    }
}

impl IndexNaming {
    pub fn new(items_prefix: impl Into<String>, collections_index: impl Into<String>) -> Self {
        IndexNaming {
            items_prefix: items_prefix.into(),
            collections_index: collections_index.into(),
        }
    }

    pub fn items_index(&self, collection_id: &str) -> Result<String> {
        Ok(format!("{}{}", self.items_prefix, sanitize(collection_id)?))
    }

    /// Pattern matching every items index.
    pub fn items_wildcard(&self) -> String {
        format!("{}*", self.items_prefix)
    }

    pub fn collections_index(&self) -> &str {
        &self.collections_index
    }
}

/// Lowercase, replace forbidden characters with `_`, strip leading `_ - +`.
pub fn sanitize(collection_id: &str) -> Result<String> {
    let lowered: String = collection_id
        .chars()
        .map(|c| {
            if INVALID_INDEX_CHARS.contains(&c) {
                '_'
            } else {
                c
            }
        })
        .flat_map(char::to_lowercase)
        .collect();
    let trimmed = lowered.trim_start_matches(&['_', '-', '+'][..]);
    if trimmed.is_empty() {
        return Err(StacError::InvalidRequest(format!(
            "collection id '{}' does not yield a valid index name",
            collection_id
        )));
    }
    Ok(trimmed.to_string())
}
