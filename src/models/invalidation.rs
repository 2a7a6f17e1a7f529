//! CDN invalidation requests and job handles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Paths to purge, submitted as one batch.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationBatch {
    /// Uniqueness token for the request.
    pub caller_reference: String,
    pub paths: Vec<String>,
}

/// Asynchronous invalidation job as reported by the CDN.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Invalidation {
    pub id: String,
    pub status: String,
    pub create_time: Option<DateTime<Utc>>,
    pub caller_reference: String,
    pub paths: Vec<String>,
    /// Job URL, when the CDN returns one.
    pub location: Option<String>,
}
