//! Object store seam used by the facade.

use crate::{
    errors::CacheResult,
    models::object::{DeleteSummary, ObjectHead, PutAck, PutObjectRequest},
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::{io, pin::Pin};

/// Object body streamed from a backend.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// A conditional download: metadata plus the not-yet-read body.
pub struct ObjectDownload {
    pub head: ObjectHead,
    pub body: ByteStream,
}

/// Blob storage with ETag preconditions.
///
/// All keys passed here are already namespaced.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch metadata, failing when `if_match` is set and does not match.
    async fn head_object(&self, key: &str, if_match: Option<&str>) -> CacheResult<ObjectHead>;

    /// Upload the file at `request.source`, streaming it from disk.
    async fn put_object(&self, request: PutObjectRequest) -> CacheResult<PutAck>;

    /// Open the object body, failing when `if_match` is set and does not match.
    async fn get_object(&self, key: &str, if_match: Option<&str>) -> CacheResult<ObjectDownload>;

    /// Remove many keys at once. Keys that do not exist count as deleted.
    async fn delete_objects(&self, keys: &[String]) -> CacheResult<DeleteSummary>;
}

/// Strip the quotes stores put around ETags.
pub fn normalize_etag(etag: &str) -> &str {
    let etag = etag.trim();
    let etag = etag.strip_prefix("W/").unwrap_or(etag);
    etag.trim_matches('"')
}

/// `If-Match` semantics: `*` matches any existing object, otherwise the
/// unquoted tags must be equal.
pub fn etag_matches(expected: &str, actual: Option<&str>) -> bool {
    let expected = expected.trim();
    if expected == "*" {
        return true;
    }
    match actual {
        Some(actual) => normalize_etag(expected) == normalize_etag(actual),
        None => false,
    }
}
