//! Error type shared by the facade and every backend.

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("object `{key}` not found")]
    NotFound { key: String },
    #[error("precondition failed for object `{key}`")]
    PreconditionFailed { key: String },
    #[error("invalid object key `{0}`")]
    InvalidKey(String),
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: String },
    #[error("invalid ttl `{0}`")]
    InvalidTtl(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("object store error: {0}")]
    ObjectStore(String),
    #[error("cdn error: {0}")]
    Cdn(String),
    #[error("search index returned {status}: {message}")]
    Search { status: u16, message: String },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type CacheResult<T> = Result<T, CacheError>;

impl CacheError {
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    pub fn precondition_failed(key: impl Into<String>) -> Self {
        Self::PreconditionFailed { key: key.into() }
    }

    /// Map an HTTP status from a backend onto the conditional-request errors
    /// callers branch on. Returns `None` for statuses with no dedicated variant.
    pub fn from_status(status: u16, key: &str) -> Option<Self> {
        match status {
            404 => Some(Self::not_found(key)),
            304 | 412 => Some(Self::precondition_failed(key)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_covers_conditional_failures() {
        assert!(matches!(
            CacheError::from_status(404, "a"),
            Some(CacheError::NotFound { key }) if key == "a"
        ));
        assert!(matches!(
            CacheError::from_status(412, "a"),
            Some(CacheError::PreconditionFailed { .. })
        ));
        assert!(CacheError::from_status(500, "a").is_none());
    }

    #[test]
    fn display_names_the_key() {
        let err = CacheError::precondition_failed("0.0.1/img.png");
        assert_eq!(
            err.to_string(),
            "precondition failed for object `0.0.1/img.png`"
        );
    }
}
