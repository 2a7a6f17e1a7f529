//! src/services/cache_service.rs
//!
//! CacheService — maps cache operations (head/put/get/invalid/search/delete/
//! stream) onto the object store, CDN and search index it was built with.
//! It keeps no data of its own; every call is a one-shot request against a
//! backend, and backend errors propagate unchanged except from `delete`.

use crate::{
    config::CacheConfig,
    errors::{CacheError, CacheResult},
    models::{
        invalidation::{Invalidation, InvalidationBatch},
        object::{DownloadedFile, ObjectHead, PutAck, PutObjectRequest, PutOptions, UploadFile},
        search::{IndexedObject, SearchQuery},
    },
    services::{
        cdn::CdnInvalidator,
        object_store::{ByteStream, ObjectStore},
        search_index::SearchIndex,
    },
};
use chrono::Utc;
use futures::{StreamExt, TryStreamExt, stream};
use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
    time::Duration,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Extensions preferred over `mime_guess`'s first (alphabetical) candidate.
const PREFERRED_EXTENSIONS: &[(&str, &str)] = &[
    ("application/json", "json"),
    ("application/octet-stream", "bin"),
    ("application/pdf", "pdf"),
    ("application/xml", "xml"),
    ("application/zip", "zip"),
    ("audio/mpeg", "mp3"),
    ("image/gif", "gif"),
    ("image/jpeg", "jpeg"),
    ("image/png", "png"),
    ("image/svg+xml", "svg"),
    ("image/webp", "webp"),
    ("text/css", "css"),
    ("text/html", "html"),
    ("text/javascript", "js"),
    ("text/plain", "txt"),
    ("video/mp4", "mp4"),
    ("video/webm", "webm"),
];

#[derive(Clone)]
pub struct CacheService {
    config: Arc<CacheConfig>,
    objects: Arc<dyn ObjectStore>,
    cdn: Arc<dyn CdnInvalidator>,
    search: Arc<dyn SearchIndex>,
    /// Last caller reference handed out, in epoch milliseconds.
    last_reference: Arc<AtomicI64>,
}

impl CacheService {
    pub fn new(
        config: CacheConfig,
        objects: Arc<dyn ObjectStore>,
        cdn: Arc<dyn CdnInvalidator>,
        search: Arc<dyn SearchIndex>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            objects,
            cdn,
            search,
            last_reference: Arc::new(AtomicI64::new(0)),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Object store key for a logical cache key: `{version}/{key}`.
    pub fn cloud_path(&self, key: &str) -> String {
        self.config.cloud_path(key)
    }

    /// Conditional metadata lookup.
    pub async fn head(&self, key: &str, etag: Option<&str>) -> CacheResult<ObjectHead> {
        let path = self.cloud_path(key);
        debug!("head {} (if-match {:?})", path, etag);
        self.objects.head_object(&path, etag).await
    }

    /// Upload `file` under `key`.
    ///
    /// Content type is the file's own, else guessed from its extension, else
    /// `application/octet-stream`. A ttl becomes an absolute expiry.
    pub async fn put(
        &self,
        key: &str,
        file: &UploadFile,
        options: PutOptions,
    ) -> CacheResult<PutAck> {
        let content_type = file
            .content_type
            .clone()
            .or_else(|| {
                mime_guess::from_path(&file.path)
                    .first()
                    .map(|mime| mime.essence_str().to_string())
            })
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());

        let expires = match options.ttl {
            Some(ttl) => {
                let ttl = chrono::Duration::from_std(ttl)
                    .map_err(|_| CacheError::InvalidTtl(humantime::format_duration(ttl).to_string()))?;
                Some(
                    Utc::now()
                        .checked_add_signed(ttl)
                        .ok_or_else(|| CacheError::InvalidTtl(ttl.to_string()))?,
                )
            }
            None => None,
        };

        let request = PutObjectRequest {
            key: self.cloud_path(key),
            source: file.path.clone(),
            content_type,
            expires,
            metadata: options.meta,
        };
        info!(
            "put {} ({}, expires {:?})",
            request.key, request.content_type, request.expires
        );
        self.objects.put_object(request).await
    }

    /// Conditional download into the staging directory.
    ///
    /// The file lands at `{download_dir}/{uuid}.{ext}` with the extension
    /// inferred from the returned content type. Partial files are removed.
    pub async fn get(&self, key: &str, etag: Option<&str>) -> CacheResult<DownloadedFile> {
        let path = self.cloud_path(key);
        debug!("get {} (if-match {:?})", path, etag);
        let download = self.objects.get_object(&path, etag).await?;

        let content_type = download.head.content_type.clone();
        let ext = content_type.as_deref().and_then(extension_for);
        let local_path = self.allocate_local_path(ext.as_deref()).await?;

        if let Err(err) = write_body(&local_path, download.body).await {
            let _ = fs::remove_file(&local_path).await;
            return Err(err);
        }

        debug!("downloaded {} to {}", path, local_path.display());
        Ok(DownloadedFile {
            path: local_path,
            content_type,
            ext,
        })
    }

    /// Submit one invalidation batch for `patterns`.
    ///
    /// Each call gets its own caller reference, so identical batches are
    /// never deduplicated by the CDN.
    pub async fn invalid(
        &self,
        distribution_id: &str,
        patterns: &[String],
    ) -> CacheResult<Invalidation> {
        if patterns.is_empty() {
            return Err(CacheError::InvalidRequest(
                "an invalidation needs at least one path".into(),
            ));
        }

        let batch = InvalidationBatch {
            caller_reference: self.next_caller_reference().to_string(),
            paths: patterns
                .iter()
                .map(|pattern| {
                    if pattern.starts_with('/') {
                        pattern.clone()
                    } else {
                        format!("/{}", pattern)
                    }
                })
                .collect(),
        };
        info!(
            "invalidating {} paths on {} (ref {})",
            batch.paths.len(),
            distribution_id,
            batch.caller_reference
        );
        self.cdn.create_invalidation(distribution_id, &batch).await
    }

    /// Objects whose origin URL or key starts with any of `patterns`.
    ///
    /// Returns the union of all hits, deduplicated by key and ordered by first
    /// occurrence: pattern order, origin-URL hits before key hits.
    pub async fn search(
        &self,
        identifier: &str,
        patterns: &[String],
    ) -> CacheResult<Vec<IndexedObject>> {
        let queries: Vec<SearchQuery> = patterns
            .iter()
            .flat_map(|pattern| {
                [
                    SearchQuery::origin_url(pattern.as_str()),
                    SearchQuery::key(pattern.as_str()),
                ]
            })
            .collect();

        let pages: Vec<Vec<IndexedObject>> = stream::iter(queries.iter())
            .map(|query| self.search.search_all(identifier, query))
            .buffered(self.config.search_concurrency.max(1))
            .try_collect()
            .await?;

        let found = dedupe_by_key(pages.into_iter().flatten());
        debug!(
            "search {} over {} patterns -> {} objects",
            identifier,
            patterns.len(),
            found.len()
        );
        Ok(found)
    }

    /// Best-effort batch delete. Failures are logged, never returned.
    pub async fn delete(&self, keys: &[String]) {
        if keys.is_empty() {
            return;
        }
        let paths: Vec<String> = keys.iter().map(|key| self.cloud_path(key)).collect();
        match self.objects.delete_objects(&paths).await {
            Ok(summary) => {
                for (key, reason) in &summary.failed {
                    warn!("failed to delete {}: {}", key, reason);
                }
                info!(
                    "deleted {} of {} objects",
                    summary.deleted,
                    paths.len()
                );
            }
            Err(err) => error!("batch delete of {} objects failed: {}", paths.len(), err),
        }
    }

    /// Open the object body without staging it on disk.
    pub async fn stream(&self, key: &str, etag: Option<&str>) -> CacheResult<ByteStream> {
        let path = self.cloud_path(key);
        debug!("stream {} (if-match {:?})", path, etag);
        Ok(self.objects.get_object(&path, etag).await?.body)
    }

    async fn allocate_local_path(&self, ext: Option<&str>) -> CacheResult<PathBuf> {
        fs::create_dir_all(&self.config.download_dir).await?;
        let name = match ext {
            Some(ext) => format!("{}.{}", Uuid::new_v4(), ext),
            None => Uuid::new_v4().to_string(),
        };
        Ok(self.config.download_dir.join(name))
    }

    /// Current epoch milliseconds, bumped past the previous reference when the
    /// clock has not advanced.
    fn next_caller_reference(&self) -> i64 {
        let now = Utc::now().timestamp_millis();
        let mut last = self.last_reference.load(Ordering::Relaxed);
        loop {
            let next = now.max(last + 1);
            match self.last_reference.compare_exchange_weak(
                last,
                next,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(current) => last = current,
            }
        }
    }
}

async fn write_body(path: &Path, mut body: ByteStream) -> CacheResult<()> {
    let mut file = File::create(path).await?;
    while let Some(chunk) = body.next().await {
        file.write_all(&chunk?).await?;
    }
    file.flush().await?;
    Ok(())
}

fn dedupe_by_key(objects: impl IntoIterator<Item = IndexedObject>) -> Vec<IndexedObject> {
    let mut seen = HashSet::new();
    objects
        .into_iter()
        .filter(|object| seen.insert(object.key.clone()))
        .collect()
}

/// File extension for a content type, ignoring parameters like `charset`.
pub fn extension_for(content_type: &str) -> Option<String> {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    if essence.is_empty() {
        return None;
    }
    if let Some((_, ext)) = PREFERRED_EXTENSIONS.iter().find(|(ty, _)| *ty == essence) {
        return Some(ext.to_string());
    }
    mime_guess::get_mime_extensions_str(&essence)
        .and_then(|exts| exts.first())
        .map(|ext| ext.to_string())
}

/// Parse a ttl the way cache callers write them: `"2d"`, `"1h 30m"`, or a
/// bare number of milliseconds.
pub fn parse_ttl(value: &str) -> CacheResult<Duration> {
    let value = value.trim();
    if let Ok(millis) = value.parse::<u64>() {
        return Ok(Duration::from_millis(millis));
    }
    humantime::parse_duration(value).map_err(|_| CacheError::InvalidTtl(value.to_string()))
}
