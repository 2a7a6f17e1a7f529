//! Cache facade over a managed object store, a CDN edge cache and a search
//! index.
//!
//! [`CacheService`] is the entry point; the backends it talks to sit behind
//! the [`ObjectStore`], [`CdnInvalidator`] and [`SearchIndex`] traits.

pub mod config;
pub mod errors;
pub mod models;
pub mod services;

pub use config::{BackendKind, CacheConfig, ConfigArgs};
pub use errors::{CacheError, CacheResult};
pub use services::{
    cache_service::{CacheService, extension_for, parse_ttl},
    cdn::{CdnInvalidator, CloudFrontInvalidator},
    local_store::LocalObjectStore,
    object_store::{ByteStream, ObjectDownload, ObjectStore},
    s3_store::S3ObjectStore,
    search_index::{ElasticSearchIndex, SearchIndex},
};
