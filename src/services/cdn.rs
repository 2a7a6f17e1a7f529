//! CDN invalidation seam and its CloudFront implementation.

use crate::{
    config::CacheConfig,
    errors::{CacheError, CacheResult},
    models::invalidation::{Invalidation, InvalidationBatch},
};
use async_trait::async_trait;
use aws_sdk_cloudfront::{
    Client,
    error::DisplayErrorContext,
    types::{InvalidationBatch as CfInvalidationBatch, Paths},
};
use chrono::DateTime;
use tracing::debug;

/// Purges cached paths at the edge.
#[async_trait]
pub trait CdnInvalidator: Send + Sync {
    async fn create_invalidation(
        &self,
        distribution_id: &str,
        batch: &InvalidationBatch,
    ) -> CacheResult<Invalidation>;
}

#[derive(Clone, Debug)]
pub struct CloudFrontInvalidator {
    client: Client,
}

impl CloudFrontInvalidator {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn from_config(cfg: &CacheConfig) -> Self {
        let shared = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(cfg.region.clone()))
            .load()
            .await;
        Self::new(Client::new(&shared))
    }
}

#[async_trait]
impl CdnInvalidator for CloudFrontInvalidator {
    async fn create_invalidation(
        &self,
        distribution_id: &str,
        batch: &InvalidationBatch,
    ) -> CacheResult<Invalidation> {
        debug!(
            "creating invalidation on {} for {} paths (ref {})",
            distribution_id,
            batch.paths.len(),
            batch.caller_reference
        );

        let paths = Paths::builder()
            .quantity(batch.paths.len() as i32)
            .set_items(Some(batch.paths.clone()))
            .build()
            .map_err(|err| CacheError::Cdn(err.to_string()))?;
        let request = CfInvalidationBatch::builder()
            .paths(paths)
            .caller_reference(&batch.caller_reference)
            .build()
            .map_err(|err| CacheError::Cdn(err.to_string()))?;

        let out = self
            .client
            .create_invalidation()
            .distribution_id(distribution_id)
            .invalidation_batch(request)
            .send()
            .await
            .map_err(|err| {
                CacheError::Cdn(format!("{}: {}", distribution_id, DisplayErrorContext(&err)))
            })?;

        let location = out.location().map(str::to_string);
        let job = out
            .invalidation()
            .ok_or_else(|| CacheError::Cdn("response carried no invalidation".into()))?;
        let created = job.create_time();

        Ok(Invalidation {
            id: job.id().to_string(),
            status: job.status().to_string(),
            create_time: DateTime::from_timestamp(created.secs(), created.subsec_nanos()),
            caller_reference: batch.caller_reference.clone(),
            paths: batch.paths.clone(),
            location,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_cloudfront::config::{BehaviorVersion, Credentials, Region};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const CREATED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Invalidation xmlns="http://cloudfront.amazonaws.com/doc/2020-05-31/">
  <Id>I2J0I21PCUYOIK</Id>
  <Status>InProgress</Status>
  <CreateTime>2026-10-16T12:00:00Z</CreateTime>
  <InvalidationBatch>
    <Paths><Quantity>1</Quantity><Items><Path>/img/*</Path></Items></Paths>
    <CallerReference>1760616000000</CallerReference>
  </InvalidationBatch>
</Invalidation>"#;

    #[tokio::test]
    async fn create_invalidation_maps_job() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/2020-05-31/distribution/EDFDVBD6EXAMPLE/invalidation"))
            .respond_with(
                ResponseTemplate::new(201)
                    .insert_header("content-type", "text/xml")
                    .insert_header(
                        "location",
                        "https://cloudfront.amazonaws.com/2020-05-31/distribution/EDFDVBD6EXAMPLE/invalidation/I2J0I21PCUYOIK",
                    )
                    .set_body_string(CREATED),
            )
            .expect(1)
            .mount(&server)
            .await;

        let conf = aws_sdk_cloudfront::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .credentials_provider(Credentials::new("akid", "secret", None, None, "test"))
            .endpoint_url(server.uri())
            .build();
        let cdn = CloudFrontInvalidator::new(Client::from_conf(conf));

        let batch = InvalidationBatch {
            caller_reference: "1760616000000".into(),
            paths: vec!["/img/*".into()],
        };
        let job = cdn
            .create_invalidation("EDFDVBD6EXAMPLE", &batch)
            .await
            .unwrap();
        assert_eq!(job.id, "I2J0I21PCUYOIK");
        assert_eq!(job.status, "InProgress");
        assert_eq!(job.paths, vec!["/img/*".to_string()]);
        assert!(job.create_time.is_some());
        assert!(job.location.is_some());
    }
}
