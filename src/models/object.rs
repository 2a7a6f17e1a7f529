//! Request and response shapes for object store calls.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::PathBuf, time::Duration};

/// Metadata returned by a head or get against the object store.
///
/// `key` is the namespaced key as the store knows it.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectHead {
    pub key: String,

    /// Content type (MIME type).
    pub content_type: Option<String>,

    /// Size in bytes.
    pub content_length: u64,

    /// Opaque version token, without surrounding quotes.
    pub etag: Option<String>,

    pub last_modified: Option<DateTime<Utc>>,

    /// Absolute expiry recorded at upload time.
    pub expires: Option<DateTime<Utc>>,

    /// User-supplied key/value tags.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// A local file to upload.
#[derive(Clone, Debug)]
pub struct UploadFile {
    pub path: PathBuf,
    pub content_type: Option<String>,
}

impl UploadFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            content_type: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// Optional settings for `put`.
#[derive(Clone, Debug, Default)]
pub struct PutOptions {
    /// Lifetime of the object; becomes an absolute expiry at upload time.
    pub ttl: Option<Duration>,
    pub meta: HashMap<String, String>,
}

/// Fully resolved upload handed to an object store backend.
#[derive(Clone, Debug)]
pub struct PutObjectRequest {
    pub key: String,
    pub source: PathBuf,
    pub content_type: String,
    pub expires: Option<DateTime<Utc>>,
    pub metadata: HashMap<String, String>,
}

/// Upload acknowledgment.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PutAck {
    pub key: String,
    pub etag: Option<String>,
    pub version_id: Option<String>,
}

/// Result of a batch delete. Missing keys count as deleted.
#[derive(Serialize, Clone, Debug, Default, PartialEq)]
pub struct DeleteSummary {
    pub deleted: usize,
    /// `(key, reason)` for every key the store refused.
    pub failed: Vec<(String, String)>,
}

/// An object downloaded into the staging directory.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DownloadedFile {
    pub path: PathBuf,
    pub content_type: Option<String>,
    pub ext: Option<String>,
}
