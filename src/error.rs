use http::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum StacError {
    #[error("Unsupported field: {0}")]
    UnsupportedField(String),

    #[error("Unsupported operator: {0}")]
    UnsupportedOperator(String),

    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("Only one of bbox or intersects may be supplied")]
    ConflictingSpatialFilter,

    #[error("Field is not sortable: {0}")]
    UnsortableField(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("Version conflict for {collection}/{id}: {message}")]
    VersionConflict {
        collection: String,
        id: String,
        message: String,
    },

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),

    #[error("Cursor was issued for a different search request")]
    CursorMismatch,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, StacError>;

/// Stable error category, used where an error is reported as data (bulk outcomes)
/// instead of being returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    VersionConflict,
    AlreadyExists,
    NotFound,
    InvalidCursor,
    CursorMismatch,
    Transport,
    Engine,
}

impl From<serde_json::Error> for StacError {
    fn from(e: serde_json::Error) -> Self {
        StacError::Json(e.to_string())
    }
}

impl StacError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StacError::UnsupportedField(_)
            | StacError::UnsupportedOperator(_)
            | StacError::InvalidGeometry(_)
            | StacError::ConflictingSpatialFilter
            | StacError::UnsortableField(_)
            | StacError::InvalidQuery(_)
            | StacError::InvalidRequest(_)
            | StacError::InvalidSchema(_)
            | StacError::Json(_) => ErrorKind::Validation,
            StacError::VersionConflict { .. } => ErrorKind::VersionConflict,
            StacError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            StacError::NotFound(_) => ErrorKind::NotFound,
            StacError::InvalidCursor(_) => ErrorKind::InvalidCursor,
            StacError::CursorMismatch => ErrorKind::CursorMismatch,
            StacError::Transport(_) => ErrorKind::Transport,
            StacError::Engine(_) | StacError::Config(_) => ErrorKind::Engine,
        }
    }

    /// Only transport failures are retried, and only for idempotent operations.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StacError::Transport(_))
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            StacError::UnsupportedField(_) => StatusCode::BAD_REQUEST,
            StacError::UnsupportedOperator(_) => StatusCode::BAD_REQUEST,
            StacError::InvalidGeometry(_) => StatusCode::BAD_REQUEST,
            StacError::ConflictingSpatialFilter => StatusCode::BAD_REQUEST,
            StacError::UnsortableField(_) => StatusCode::BAD_REQUEST,
            StacError::InvalidQuery(_) => StatusCode::BAD_REQUEST,
            StacError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            StacError::InvalidSchema(_) => StatusCode::BAD_REQUEST,
            StacError::VersionConflict { .. } => StatusCode::CONFLICT,
            StacError::AlreadyExists(_) => StatusCode::CONFLICT,
            StacError::NotFound(_) => StatusCode::NOT_FOUND,
            StacError::InvalidCursor(_) => StatusCode::BAD_REQUEST,
            StacError::CursorMismatch => StatusCode::BAD_REQUEST,
            StacError::Transport(_) => StatusCode::SERVICE_UNAVAILABLE,
            StacError::Engine(_) => StatusCode::INTERNAL_SERVER_ERROR,
            StacError::Json(_) => StatusCode::BAD_REQUEST,
            StacError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_family_maps_to_bad_request() {
        for err in [
            StacError::UnsupportedField("foo".into()),
            StacError::UnsupportedOperator("s_crosses".into()),
            StacError::InvalidGeometry("ring not closed".into()),
            StacError::ConflictingSpatialFilter,
            StacError::UnsortableField("assets".into()),
        ] {
            assert_eq!(err.kind(), ErrorKind::Validation);
            assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
            assert!(!err.is_retryable());
        }
    }

    #[test]
    fn only_transport_is_retryable() {
        assert!(StacError::Transport("connection reset".into()).is_retryable());
        assert!(!StacError::Engine("boom".into()).is_retryable());
        assert!(!StacError::CursorMismatch.is_retryable());
    }

    #[test]
    fn conflict_errors_map_to_409() {
        let err = StacError::VersionConflict {
            collection: "c".into(),
            id: "r".into(),
            message: "stale".into(),
        };
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
        assert_eq!(err.kind(), ErrorKind::VersionConflict);
        assert_eq!(
            StacError::AlreadyExists("c/r".into()).status_code(),
            StatusCode::CONFLICT
        );
    }
}
