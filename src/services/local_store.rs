//! src/services/local_store.rs
//!
//! LocalObjectStore — an `ObjectStore` backed by SQLite for metadata and local
//! disk for payloads, sharded beneath `base_path/{bucket}/{shard}/{shard}/{key}`.
//! Used for development and tests in place of a managed object store.

use crate::{
    errors::{CacheError, CacheResult},
    models::object::{DeleteSummary, ObjectHead, PutAck, PutObjectRequest},
    services::object_store::{ObjectDownload, ObjectStore, etag_matches},
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt, pin_mut};
use md5::Context;
use sqlx::{
    FromRow, SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::{
    collections::HashMap,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};
use uuid::Uuid;

const MAX_OBJECT_KEY_LEN: usize = 1024;
const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS objects (
    id            BLOB PRIMARY KEY,
    bucket        TEXT NOT NULL,
    key           TEXT NOT NULL,
    content_type  TEXT,
    size_bytes    INTEGER NOT NULL,
    etag          TEXT,
    metadata      TEXT NOT NULL DEFAULT '{}',
    expires_at    TEXT,
    last_modified TEXT NOT NULL,
    UNIQUE (bucket, key)
);
CREATE INDEX IF NOT EXISTS idx_objects_bucket_key ON objects (bucket, key);
"#;

/// Metadata row for one stored object.
#[derive(Clone, FromRow, Debug)]
struct StoredObject {
    key: String,
    content_type: Option<String>,
    size_bytes: i64,
    etag: Option<String>,
    metadata: String,
    expires_at: Option<DateTime<Utc>>,
    last_modified: DateTime<Utc>,
}

impl StoredObject {
    fn into_head(self) -> CacheResult<ObjectHead> {
        let metadata: HashMap<String, String> = serde_json::from_str(&self.metadata)?;
        Ok(ObjectHead {
            key: self.key,
            content_type: self.content_type,
            content_length: self.size_bytes.max(0) as u64,
            etag: self.etag,
            last_modified: Some(self.last_modified),
            expires: self.expires_at,
            metadata,
        })
    }
}

/// Single-bucket object store on local disk.
#[derive(Clone)]
pub struct LocalObjectStore {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where object payloads are stored.
    pub base_path: PathBuf,

    bucket: String,
}

impl LocalObjectStore {
    /// Wrap an existing pool. The schema must already exist; see [`Self::connect`].
    pub fn new(
        db: Arc<SqlitePool>,
        base_path: impl Into<PathBuf>,
        bucket: &str,
    ) -> CacheResult<Self> {
        validate_bucket_name(bucket)?;
        Ok(Self {
            db,
            base_path: base_path.into(),
            bucket: bucket.to_string(),
        })
    }

    /// Open (creating if needed) the metadata database at `database_url`,
    /// apply the schema and prepare the payload directory.
    pub async fn connect(
        database_url: &str,
        base_path: impl Into<PathBuf>,
        bucket: &str,
    ) -> CacheResult<Self> {
        validate_bucket_name(bucket)?;
        let base_path = base_path.into();

        let db_path = database_url
            .trim_start_matches("sqlite://")
            .trim_start_matches("sqlite:");
        if !db_path.starts_with(":memory:") {
            if let Some(parent) = Path::new(db_path).parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    fs::create_dir_all(parent).await?;
                    info!("Created missing directory {:?}", parent);
                }
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let db = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        apply_schema(&db).await?;

        fs::create_dir_all(base_path.join(bucket)).await?;
        debug!("local object store ready at {}", base_path.display());

        Self::new(Arc::new(db), base_path, bucket)
    }

    /// Compute the physical base folder path for the bucket.
    fn bucket_root(&self) -> PathBuf {
        self.base_path.join(&self.bucket)
    }

    /// Generate two-level shard identifiers for an object key.
    ///
    /// Uses MD5(bucket/key) and returns the first two bytes as lowercase
    /// hexadecimal strings (00–ff). Reduces file count per directory.
    fn object_shards(bucket_name: &str, key: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", bucket_name, key));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// Construct a fully-qualified object payload path.
    /// Parent directories may not exist yet.
    fn object_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(&self.bucket, key);
        let mut path = self.bucket_root();
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    async fn fetch_object(&self, key: &str) -> CacheResult<StoredObject> {
        sqlx::query_as::<_, StoredObject>(
            "SELECT key, content_type, size_bytes, etag, metadata, expires_at, last_modified
             FROM objects
             WHERE bucket = ? AND key = ?",
        )
        .bind(&self.bucket)
        .bind(key)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => CacheError::not_found(key),
            other => CacheError::Sqlx(other),
        })
    }

    /// Look up an object and apply the `If-Match` precondition.
    async fn fetch_matching(&self, key: &str, if_match: Option<&str>) -> CacheResult<StoredObject> {
        ensure_key_safe(key)?;
        let object = self.fetch_object(key).await?;
        if let Some(expected) = if_match {
            if !etag_matches(expected, object.etag.as_deref()) {
                debug!("etag mismatch for {}: wanted {}", key, expected);
                return Err(CacheError::precondition_failed(key));
            }
        }
        Ok(object)
    }

    /// Stream bytes into a temp file next to `file_path`.
    ///
    /// Returns the temp path, size and MD5 etag. The temp file is removed on
    /// every error; on success the caller moves it with [`Self::commit_payload`].
    async fn stage_payload<S>(
        &self,
        file_path: &Path,
        stream: S,
    ) -> CacheResult<(PathBuf, i64, String)>
    where
        S: Stream<Item = io::Result<Bytes>>,
    {
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            CacheError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut size_bytes: i64 = 0;
        let mut digest = Context::new();
        pin_mut!(stream);
        while let Some(chunk_res) = stream.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(CacheError::Io(err));
                }
            };
            size_bytes += chunk.len() as i64;
            digest.consume(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(CacheError::Io(err));
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(CacheError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(CacheError::Io(err));
        }
        drop(file);

        Ok((tmp_path, size_bytes, format!("{:x}", digest.compute())))
    }

    /// Move a staged payload over `file_path`, removing the temp file on failure.
    async fn commit_payload(tmp_path: &Path, file_path: &Path) -> CacheResult<()> {
        match fs::rename(tmp_path, file_path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                let replaced = match fs::remove_file(file_path).await {
                    Ok(()) => fs::rename(tmp_path, file_path).await,
                    Err(err) => Err(err),
                };
                if replaced.is_err() {
                    let _ = fs::remove_file(tmp_path).await;
                }
                replaced.map_err(CacheError::Io)
            }
            Err(err) => {
                let _ = fs::remove_file(tmp_path).await;
                Err(CacheError::Io(err))
            }
        }
    }

    async fn delete_one(&self, key: &str) -> CacheResult<()> {
        ensure_key_safe(key)?;
        sqlx::query("DELETE FROM objects WHERE bucket = ? AND key = ?")
            .bind(&self.bucket)
            .bind(key)
            .execute(&*self.db)
            .await?;

        let file_path = self.object_path(key);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => return Err(CacheError::Io(err)),
        }

        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent, &self.bucket_root()).await;
        }
        Ok(())
    }

    /// Remove empty directories upward, stopping at the bucket root or the
    /// first directory that is not empty.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn head_object(&self, key: &str, if_match: Option<&str>) -> CacheResult<ObjectHead> {
        self.fetch_matching(key, if_match).await?.into_head()
    }

    async fn put_object(&self, request: PutObjectRequest) -> CacheResult<PutAck> {
        ensure_key_safe(&request.key)?;
        let source = File::open(&request.source).await?;
        let file_path = self.object_path(&request.key);
        let (tmp_path, size_bytes, etag) = self
            .stage_payload(&file_path, ReaderStream::new(source))
            .await?;

        // Commit the row only once the payload is in place.
        let stored = async {
            let metadata = serde_json::to_string(&request.metadata)?;
            let mut tx = self.db.begin().await?;
            sqlx::query(
                r#"
                INSERT INTO objects (
                    id, bucket, key, content_type, size_bytes,
                    etag, metadata, expires_at, last_modified
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(bucket, key) DO UPDATE SET
                    content_type = excluded.content_type,
                    size_bytes = excluded.size_bytes,
                    etag = excluded.etag,
                    metadata = excluded.metadata,
                    expires_at = excluded.expires_at,
                    last_modified = excluded.last_modified
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(&self.bucket)
            .bind(&request.key)
            .bind(&request.content_type)
            .bind(size_bytes)
            .bind(&etag)
            .bind(metadata)
            .bind(request.expires)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;

            Self::commit_payload(&tmp_path, &file_path).await?;
            tx.commit().await?;
            Ok::<_, CacheError>(())
        }
        .await;

        if let Err(err) = stored {
            let _ = fs::remove_file(&tmp_path).await;
            debug!("put {} rolled back: {}", request.key, err);
            return Err(err);
        }

        Ok(PutAck {
            key: request.key,
            etag: Some(etag),
            version_id: None,
        })
    }

    async fn get_object(&self, key: &str, if_match: Option<&str>) -> CacheResult<ObjectDownload> {
        let object = self.fetch_matching(key, if_match).await?;

        let file_path = self.object_path(key);
        let file = File::open(&file_path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                CacheError::not_found(key)
            } else {
                CacheError::Io(err)
            }
        })?;

        Ok(ObjectDownload {
            head: object.into_head()?,
            body: Box::pin(ReaderStream::new(file)),
        })
    }

    async fn delete_objects(&self, keys: &[String]) -> CacheResult<DeleteSummary> {
        let mut summary = DeleteSummary::default();
        for key in keys {
            match self.delete_one(key).await {
                Ok(()) => summary.deleted += 1,
                Err(err) => summary.failed.push((key.clone(), err.to_string())),
            }
        }
        Ok(summary)
    }
}

/// Apply the embedded schema one statement at a time.
async fn apply_schema(db: &SqlitePool) -> CacheResult<()> {
    let statements = SCHEMA
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    for stmt in statements {
        debug!("Executing schema SQL: {}", stmt);
        sqlx::query(stmt).execute(db).await?;
    }
    Ok(())
}

/// Reject empty or oversized keys and trivial path traversal vectors.
fn ensure_key_safe(key: &str) -> CacheResult<()> {
    let invalid = key.is_empty()
        || key.len() > MAX_OBJECT_KEY_LEN
        || key.starts_with('/')
        || key.contains("..")
        || key.bytes().any(|b| b.is_ascii_control() || b == b'\\');
    if invalid {
        return Err(CacheError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Validate bucket name format.
///
/// Enforces S3-like naming rules:
/// - 3–63 characters
/// - lowercase letters, digits, dots, hyphens only
/// - cannot start/end with dot or hyphen
/// - cannot contain consecutive dots or dot-hyphen patterns
/// - cannot look like an IPv4 address
pub fn validate_bucket_name(name: &str) -> CacheResult<()> {
    let invalid = |reason: &str| CacheError::InvalidBucketName {
        name: name.to_string(),
        reason: reason.into(),
    };

    let len = name.len();
    if !(BUCKET_NAME_MIN_LEN..=BUCKET_NAME_MAX_LEN).contains(&len) {
        return Err(invalid("must be between 3 and 63 characters"));
    }

    if !name
        .chars()
        .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
    {
        return Err(invalid(
            "allowed characters are lowercase letters, digits, dots, and hyphens",
        ));
    }

    if name.starts_with(['.', '-']) || name.ends_with(['.', '-']) {
        return Err(invalid("must start and end with a lowercase letter or digit"));
    }

    if name.contains("..") || name.contains("-.") || name.contains(".-") {
        return Err(invalid(
            "cannot contain consecutive dots or dot-hyphen combinations",
        ));
    }

    if is_ipv4_like(name) {
        return Err(invalid("must not be formatted like an IP address"));
    }

    Ok(())
}

/// Check if a string matches IPv4-like dotted decimal form.
fn is_ipv4_like(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() == 4
        && parts.iter().all(|segment| {
            !segment.is_empty()
                && segment.len() <= 3
                && segment.chars().all(|c| c.is_ascii_digit())
                && segment.parse::<u8>().is_ok()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use tempfile::TempDir;

    async fn store(dir: &TempDir) -> LocalObjectStore {
        let db_url = format!("sqlite://{}", dir.path().join("meta/objects.db").display());
        LocalObjectStore::connect(&db_url, dir.path().join("objects"), "media-cache")
            .await
            .expect("connect local store")
    }

    async fn put_text(store: &LocalObjectStore, dir: &TempDir, key: &str, body: &str) -> PutAck {
        let source = dir.path().join(format!("src-{}", Uuid::new_v4()));
        tokio::fs::write(&source, body).await.unwrap();
        store
            .put_object(PutObjectRequest {
                key: key.into(),
                source,
                content_type: "text/plain".into(),
                expires: None,
                metadata: HashMap::from([("owner".to_string(), "tests".to_string())]),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn put_then_head_reports_metadata() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let ack = put_text(&store, &dir, "0.0.1/a.txt", "hello").await;

        let head = store.head_object("0.0.1/a.txt", None).await.unwrap();
        assert_eq!(head.content_type.as_deref(), Some("text/plain"));
        assert_eq!(head.content_length, 5);
        assert_eq!(head.etag, ack.etag);
        assert_eq!(head.etag.as_deref(), Some("5d41402abc4b2a76b9719d911017c592"));
        assert_eq!(head.metadata.get("owner").map(String::as_str), Some("tests"));
    }

    #[tokio::test]
    async fn conditional_get_checks_etag() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let ack = put_text(&store, &dir, "k.txt", "body").await;

        let err = store.get_object("k.txt", Some("\"nope\"")).await.err().unwrap();
        assert!(matches!(err, CacheError::PreconditionFailed { .. }));

        let etag = format!("\"{}\"", ack.etag.unwrap());
        let download = store.get_object("k.txt", Some(&etag)).await.unwrap();
        let chunks: Vec<Bytes> = download.body.try_collect().await.unwrap();
        assert_eq!(chunks.concat(), b"body");
    }

    #[tokio::test]
    async fn overwrite_replaces_payload_and_etag() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let first = put_text(&store, &dir, "k.txt", "one").await;
        let second = put_text(&store, &dir, "k.txt", "two!").await;
        assert_ne!(first.etag, second.etag);

        let head = store.head_object("k.txt", None).await.unwrap();
        assert_eq!(head.content_length, 4);
    }

    #[tokio::test]
    async fn failed_metadata_write_keeps_previous_object() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let first = put_text(&store, &dir, "k.txt", "original").await;

        sqlx::query(
            "CREATE TRIGGER freeze_objects BEFORE UPDATE ON objects
             BEGIN SELECT RAISE(ABORT, 'objects are frozen'); END",
        )
        .execute(&*store.db)
        .await
        .unwrap();

        let source = dir.path().join("replacement");
        tokio::fs::write(&source, "replacement").await.unwrap();
        let err = store
            .put_object(PutObjectRequest {
                key: "k.txt".into(),
                source,
                content_type: "text/plain".into(),
                expires: None,
                metadata: HashMap::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Sqlx(_)));

        let head = store.head_object("k.txt", None).await.unwrap();
        assert_eq!(head.etag, first.etag);
        let download = store.get_object("k.txt", None).await.unwrap();
        let chunks: Vec<Bytes> = download.body.try_collect().await.unwrap();
        assert_eq!(chunks.concat(), b"original");

        let shard_dir = store.object_path("k.txt").parent().unwrap().to_path_buf();
        let mut entries = tokio::fs::read_dir(&shard_dir).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            assert!(!entry.file_name().to_string_lossy().starts_with(".tmp-"));
        }
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let err = store.head_object("absent", None).await.unwrap_err();
        assert!(matches!(err, CacheError::NotFound { key } if key == "absent"));
    }

    #[tokio::test]
    async fn delete_removes_rows_and_prunes_dirs() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        put_text(&store, &dir, "x/y.txt", "1").await;
        let path = store.object_path("x/y.txt");
        assert!(path.exists());

        let summary = store
            .delete_objects(&["x/y.txt".to_string(), "never-there".to_string()])
            .await
            .unwrap();
        assert_eq!(summary.deleted, 2);
        assert!(summary.failed.is_empty());
        assert!(!path.exists());
        assert!(store.bucket_root().exists());
        assert!(matches!(
            store.head_object("x/y.txt", None).await,
            Err(CacheError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn unsafe_keys_are_reported_per_key() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let summary = store
            .delete_objects(&["../escape".to_string()])
            .await
            .unwrap();
        assert_eq!(summary.deleted, 0);
        assert_eq!(summary.failed.len(), 1);
    }

    #[test]
    fn key_validation() {
        assert!(ensure_key_safe("0.0.1/photos/a.jpg").is_ok());
        assert!(ensure_key_safe("").is_err());
        assert!(ensure_key_safe("/abs").is_err());
        assert!(ensure_key_safe("a/../b").is_err());
        assert!(ensure_key_safe("a\\b").is_err());
        assert!(ensure_key_safe(&"k".repeat(MAX_OBJECT_KEY_LEN + 1)).is_err());
    }

    #[test]
    fn bucket_validation() {
        assert!(validate_bucket_name("media-cache").is_ok());
        assert!(validate_bucket_name("ab").is_err());
        assert!(validate_bucket_name("Upper").is_err());
        assert!(validate_bucket_name("-lead").is_err());
        assert!(validate_bucket_name("a..b").is_err());
        assert!(validate_bucket_name("192.168.1.1").is_err());
    }
}
