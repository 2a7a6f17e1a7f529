//! Search index seam and an Elasticsearch-backed implementation.

use crate::{
    config::CacheConfig,
    errors::{CacheError, CacheResult},
    models::search::{IndexedObject, SearchQuery},
};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

const USER_AGENT_VALUE: &str = concat!("cache-facade/", env!("CARGO_PKG_VERSION"));
const DEFAULT_PAGE_SIZE: usize = 500;

/// Finds stored objects by field prefix, scoped to a tenant identifier.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Every hit for `query`, across all result pages.
    async fn search_all(
        &self,
        identifier: &str,
        query: &SearchQuery,
    ) -> CacheResult<Vec<IndexedObject>>;
}

#[derive(Debug, Clone)]
pub struct ElasticSearchIndex {
    client: reqwest::Client,
    base_url: String,
    index: String,
    page_size: usize,
}

#[derive(Deserialize)]
struct SearchResponse {
    hits: Hits,
}

#[derive(Deserialize)]
struct Hits {
    #[serde(default)]
    total: Option<Total>,
    #[serde(default)]
    hits: Vec<Hit>,
}

/// `hits.total` is an object on 7.x+ and a bare number before that.
#[derive(Deserialize)]
#[serde(untagged)]
enum Total {
    Object { value: u64 },
    Count(u64),
}

impl Total {
    fn value(&self) -> u64 {
        match self {
            Self::Object { value } => *value,
            Self::Count(value) => *value,
        }
    }
}

#[derive(Deserialize)]
struct Hit {
    #[serde(rename = "_source")]
    source: IndexedObject,
}

impl ElasticSearchIndex {
    pub fn new(
        base_url: &str,
        index: impl Into<String>,
        api_key: Option<&str>,
    ) -> CacheResult<Self> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));
        if let Some(key) = api_key {
            let value = HeaderValue::from_str(&format!("ApiKey {}", key)).map_err(|_| {
                CacheError::InvalidRequest("search api key is not a valid header value".into())
            })?;
            default_headers.insert(AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .default_headers(default_headers)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            index: index.into(),
            page_size: DEFAULT_PAGE_SIZE,
        })
    }

    pub fn from_config(cfg: &CacheConfig) -> CacheResult<Self> {
        Self::new(
            &cfg.search_url,
            cfg.search_index.clone(),
            cfg.search_api_key.as_deref(),
        )
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn request_body(&self, identifier: &str, query: &SearchQuery, from: usize) -> Value {
        json!({
            "from": from,
            "size": self.page_size,
            "query": {
                "bool": {
                    "filter": [
                        { "term": { "identifier": identifier } },
                        { "prefix": { query.field.as_str(): query.prefix } }
                    ]
                }
            }
        })
    }

    async fn fetch_page(
        &self,
        identifier: &str,
        query: &SearchQuery,
        from: usize,
    ) -> CacheResult<Hits> {
        let url = format!("{}/{}/_search", self.base_url, self.index);
        let response = self
            .client
            .post(&url)
            .json(&self.request_body(identifier, query, from))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(CacheError::Search {
                status: status.as_u16(),
                message,
            });
        }

        let body: SearchResponse = response.json().await?;
        Ok(body.hits)
    }
}

#[async_trait]
impl SearchIndex for ElasticSearchIndex {
    async fn search_all(
        &self,
        identifier: &str,
        query: &SearchQuery,
    ) -> CacheResult<Vec<IndexedObject>> {
        let mut objects = Vec::new();
        loop {
            let page = self.fetch_page(identifier, query, objects.len()).await?;
            let fetched = page.hits.len();
            objects.extend(page.hits.into_iter().map(|hit| hit.source));

            let reached_total = page
                .total
                .is_some_and(|total| objects.len() as u64 >= total.value());
            if fetched < self.page_size || reached_total {
                break;
            }
        }

        debug!(
            "search {} {}={}* -> {} objects",
            identifier,
            query.field.as_str(),
            query.prefix,
            objects.len()
        );
        Ok(objects)
    }
}
