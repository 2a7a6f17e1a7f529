//! `ObjectStore` over the S3 API.

use crate::{
    config::CacheConfig,
    errors::{CacheError, CacheResult},
    models::object::{DeleteSummary, ObjectHead, PutAck, PutObjectRequest},
    services::object_store::{ObjectDownload, ObjectStore, normalize_etag},
};
use async_trait::async_trait;
use aws_sdk_s3::{
    Client,
    error::{DisplayErrorContext, SdkError},
    primitives::{ByteStream, DateTime as AwsDateTime},
    types::{Delete, ObjectIdentifier},
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

/// S3 rejects DeleteObjects requests with more keys than this.
const MAX_DELETE_BATCH: usize = 1000;

#[derive(Clone, Debug)]
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// Build a client from the shared AWS configuration plus the facade's
    /// region and optional custom endpoint.
    pub async fn from_config(cfg: &CacheConfig) -> Self {
        let shared = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(cfg.region.clone()))
            .load()
            .await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = &cfg.endpoint_url {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Self::new(Client::from_conf(builder.build()), cfg.bucket.clone())
    }
}

/// Translate an SDK failure, keeping 404/412 distinguishable.
fn classify<E>(err: SdkError<E>, key: &str) -> CacheError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let status = err.raw_response().map(|resp| resp.status().as_u16());
    if let Some(mapped) = status.and_then(|status| CacheError::from_status(status, key)) {
        return mapped;
    }
    CacheError::ObjectStore(format!("{}: {}", key, DisplayErrorContext(&err)))
}

fn to_chrono(value: Option<&AwsDateTime>) -> Option<DateTime<Utc>> {
    value.and_then(|dt| DateTime::from_timestamp(dt.secs(), dt.subsec_nanos()))
}

fn build_head(
    key: &str,
    content_type: Option<&str>,
    content_length: Option<i64>,
    etag: Option<&str>,
    last_modified: Option<&AwsDateTime>,
    metadata: Option<&HashMap<String, String>>,
) -> ObjectHead {
    ObjectHead {
        key: key.to_string(),
        content_type: content_type.map(str::to_string),
        content_length: content_length.unwrap_or(0).max(0) as u64,
        etag: etag.map(|e| normalize_etag(e).to_string()),
        last_modified: to_chrono(last_modified),
        expires: None,
        metadata: metadata.cloned().unwrap_or_default(),
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn head_object(&self, key: &str, if_match: Option<&str>) -> CacheResult<ObjectHead> {
        debug!("s3 head {}/{}", self.bucket, key);
        let out = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .set_if_match(if_match.map(str::to_string))
            .send()
            .await
            .map_err(|err| classify(err, key))?;

        Ok(build_head(
            key,
            out.content_type(),
            out.content_length(),
            out.e_tag(),
            out.last_modified(),
            out.metadata(),
        ))
    }

    async fn put_object(&self, request: PutObjectRequest) -> CacheResult<PutAck> {
        debug!(
            "s3 put {}/{} from {}",
            self.bucket,
            request.key,
            request.source.display()
        );
        let body = ByteStream::from_path(&request.source)
            .await
            .map_err(|err| CacheError::ObjectStore(format!("reading upload source: {}", err)))?;

        let out = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&request.key)
            .content_type(&request.content_type)
            .set_expires(
                request
                    .expires
                    .map(|at| AwsDateTime::from_secs(at.timestamp())),
            )
            .set_metadata(Some(request.metadata.clone()))
            .body(body)
            .send()
            .await
            .map_err(|err| classify(err, &request.key))?;

        Ok(PutAck {
            etag: out.e_tag().map(|e| normalize_etag(e).to_string()),
            version_id: out.version_id().map(str::to_string),
            key: request.key,
        })
    }

    async fn get_object(&self, key: &str, if_match: Option<&str>) -> CacheResult<ObjectDownload> {
        debug!("s3 get {}/{}", self.bucket, key);
        let out = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .set_if_match(if_match.map(str::to_string))
            .send()
            .await
            .map_err(|err| classify(err, key))?;

        let head = build_head(
            key,
            out.content_type(),
            out.content_length(),
            out.e_tag(),
            out.last_modified(),
            out.metadata(),
        );
        let body = ReaderStream::new(out.body.into_async_read());

        Ok(ObjectDownload {
            head,
            body: Box::pin(body),
        })
    }

    async fn delete_objects(&self, keys: &[String]) -> CacheResult<DeleteSummary> {
        let mut summary = DeleteSummary::default();
        for chunk in keys.chunks(MAX_DELETE_BATCH) {
            let objects = chunk
                .iter()
                .map(|key| ObjectIdentifier::builder().key(key).build())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|err| CacheError::ObjectStore(err.to_string()))?;
            let delete = Delete::builder()
                .set_objects(Some(objects))
                .quiet(true)
                .build()
                .map_err(|err| CacheError::ObjectStore(err.to_string()))?;

            let out = self
                .client
                .delete_objects()
                .bucket(&self.bucket)
                .delete(delete)
                .send()
                .await
                .map_err(|err| {
                    CacheError::ObjectStore(format!(
                        "batch delete of {} keys: {}",
                        chunk.len(),
                        DisplayErrorContext(&err)
                    ))
                })?;

            let errors = out.errors();
            for failure in errors {
                let key = failure.key().unwrap_or_default().to_string();
                let reason = failure
                    .message()
                    .or(failure.code())
                    .unwrap_or("unknown error")
                    .to_string();
                warn!("s3 refused to delete {}: {}", key, reason);
                summary.failed.push((key, reason));
            }
            summary.deleted += chunk.len().saturating_sub(errors.len());
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
    use wiremock::matchers::{header, method, path, path_regex, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_store(server: &MockServer) -> S3ObjectStore {
        let conf = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .credentials_provider(Credentials::new("akid", "secret", None, None, "test"))
            .endpoint_url(server.uri())
            .force_path_style(true)
            .build();
        S3ObjectStore::new(Client::from_conf(conf), "media-cache")
    }

    #[tokio::test]
    async fn head_maps_metadata_and_strips_quotes() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/media-cache/0.0.1/a.png"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/png")
                    .insert_header("etag", "\"abc123\"")
                    .insert_header("x-amz-meta-owner", "tests"),
            )
            .mount(&server)
            .await;

        let head = test_store(&server)
            .head_object("0.0.1/a.png", None)
            .await
            .unwrap();
        assert_eq!(head.content_type.as_deref(), Some("image/png"));
        assert_eq!(head.etag.as_deref(), Some("abc123"));
        assert_eq!(head.metadata.get("owner").map(String::as_str), Some("tests"));
    }

    #[tokio::test]
    async fn head_precondition_failure() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/media-cache/0.0.1/a.png"))
            .and(header("if-match", "\"stale\""))
            .respond_with(ResponseTemplate::new(412))
            .mount(&server)
            .await;

        let err = test_store(&server)
            .head_object("0.0.1/a.png", Some("\"stale\""))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::PreconditionFailed { .. }));
    }

    #[tokio::test]
    async fn get_missing_object_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/media-cache/0.0.1/missing"))
            .respond_with(ResponseTemplate::new(404).set_body_string(
                "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
                 <Error><Code>NoSuchKey</Code><Message>gone</Message></Error>",
            ))
            .mount(&server)
            .await;

        let err = test_store(&server)
            .get_object("0.0.1/missing", None)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CacheError::NotFound { key } if key == "0.0.1/missing"));
    }

    #[tokio::test]
    async fn delete_splits_batches_and_collects_refusals() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path_regex("^/media-cache/?$"))
            .and(query_param("delete", ""))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/xml")
                    .set_body_string(
                        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
                         <DeleteResult xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">\
                         <Error><Key>0.0.1/locked</Key><Code>AccessDenied</Code>\
                         <Message>Access Denied</Message></Error>\
                         </DeleteResult>",
                    ),
            )
            .expect(2)
            .mount(&server)
            .await;

        let keys: Vec<String> = (0..1001).map(|i| format!("0.0.1/k{}", i)).collect();
        let summary = test_store(&server).delete_objects(&keys).await.unwrap();

        assert_eq!(summary.failed.len(), 2);
        assert!(
            summary
                .failed
                .iter()
                .all(|(key, reason)| key == "0.0.1/locked" && reason == "Access Denied")
        );
        assert_eq!(summary.deleted, 999);
    }
}
