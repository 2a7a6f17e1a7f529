//! Search index queries and hits.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Indexed field a search pattern is matched against.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SearchField {
    #[serde(rename = "originUrl")]
    OriginUrl,
    #[serde(rename = "key")]
    Key,
}

impl SearchField {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OriginUrl => "originUrl",
            Self::Key => "key",
        }
    }
}

/// Prefix match of `prefix` against `field`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchQuery {
    pub field: SearchField,
    pub prefix: String,
}

impl SearchQuery {
    pub fn origin_url(prefix: impl Into<String>) -> Self {
        Self {
            field: SearchField::OriginUrl,
            prefix: prefix.into(),
        }
    }

    pub fn key(prefix: impl Into<String>) -> Self {
        Self {
            field: SearchField::Key,
            prefix: prefix.into(),
        }
    }
}

/// A stored object as described by the search index.
///
/// Fields other than the ones named here are kept in `extra`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IndexedObject {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl IndexedObject {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            origin_url: None,
            content_type: None,
            extra: Map::new(),
        }
    }
}
