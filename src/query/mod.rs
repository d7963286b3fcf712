pub mod builder;
pub mod compiler;
pub mod cql2;
pub mod cql2_text;
pub mod dsl;
pub mod filter;
pub mod query_ext;
pub mod queryables;

pub use builder::{SearchRequest, SearchRequestBuilder, SortSpec};
pub use compiler::FilterCompiler;
pub use filter::FilterExpr;
pub use queryables::{Queryables, SearchScope};

use crate::error::{Result, StacError};
use serde_json::Value;

/// Encoding of a filter expression on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterLang {
    Cql2Json,
    Cql2Text,
}

impl FilterLang {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "cql2-json" => Ok(FilterLang::Cql2Json),
            "cql2-text" => Ok(FilterLang::Cql2Text),
            other => Err(StacError::InvalidRequest(format!(
                "unsupported filter-lang '{}'",
                other
            ))),
        }
    }
}

/// Parse a filter in either CQL2 encoding into a [`FilterExpr`].
///
/// A CQL2-JSON filter may arrive as an object or as a JSON-encoded string.
pub fn parse_filter(filter: &Value, lang: FilterLang) -> Result<FilterExpr> {
    match (lang, filter) {
        (FilterLang::Cql2Text, Value::String(s)) => cql2_text::parse_cql2_text(s),
        (FilterLang::Cql2Text, other) => Err(StacError::InvalidQuery(format!(
            "cql2-text filter must be a string, got {}",
            other
        ))),
        (FilterLang::Cql2Json, Value::String(s)) => cql2::parse_cql2_json_str(s),
        (FilterLang::Cql2Json, other) => cql2::parse_cql2_json(other),
    }
}
