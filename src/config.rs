use anyhow::{Context, Result, bail};
use clap::Args;
use std::{env, path::PathBuf};

pub const DEFAULT_VERSION: &str = "0.0.1";
pub const DEFAULT_SEARCH_CONCURRENCY: usize = 4;

/// Which object store implementation the facade talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    S3,
    Local,
}

impl BackendKind {
    fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "s3" => Ok(Self::S3),
            "local" => Ok(Self::Local),
            other => bail!("unknown backend `{}` (expected `s3` or `local`)", other),
        }
    }
}

/// Centralized facade configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Bucket all objects live in.
    pub bucket: String,
    /// Namespacing prefix prepended to every object key.
    pub version: String,
    /// Default CDN distribution for invalidations.
    pub distribution_id: Option<String>,
    pub region: String,
    /// Custom S3-compatible endpoint; enables path-style addressing.
    pub endpoint_url: Option<String>,
    pub search_url: String,
    pub search_index: String,
    pub search_api_key: Option<String>,
    /// Upper bound on in-flight search queries.
    pub search_concurrency: usize,
    /// Staging directory for downloaded objects.
    pub download_dir: PathBuf,
    pub backend: BackendKind,
    /// Payload root for the local backend.
    pub storage_dir: String,
    /// SQLite URL for the local backend's metadata.
    pub database_url: String,
}

/// Command-line overrides for the environment configuration.
#[derive(Args, Debug, Default, Clone)]
pub struct ConfigArgs {
    /// Bucket name (overrides CACHE_BUCKET)
    #[arg(long, global = true)]
    pub bucket: Option<String>,

    /// Key namespace version (overrides CACHE_VERSION)
    #[arg(long, global = true)]
    pub cache_version: Option<String>,

    /// Default CDN distribution id (overrides CACHE_DISTRIBUTION_ID)
    #[arg(long, global = true)]
    pub distribution_id: Option<String>,

    /// AWS region (overrides CACHE_REGION)
    #[arg(long, global = true)]
    pub region: Option<String>,

    /// S3-compatible endpoint URL (overrides CACHE_S3_ENDPOINT)
    #[arg(long, global = true)]
    pub endpoint_url: Option<String>,

    /// Search index base URL (overrides CACHE_SEARCH_URL)
    #[arg(long, global = true)]
    pub search_url: Option<String>,

    /// Search index name (overrides CACHE_SEARCH_INDEX)
    #[arg(long, global = true)]
    pub search_index: Option<String>,

    /// Directory for downloaded objects (overrides CACHE_DOWNLOAD_DIR)
    #[arg(long, global = true)]
    pub download_dir: Option<PathBuf>,

    /// Object store backend: s3 or local (overrides CACHE_BACKEND)
    #[arg(long, global = true)]
    pub backend: Option<String>,

    /// Payload directory for the local backend (overrides CACHE_STORAGE_DIR)
    #[arg(long, global = true)]
    pub storage_dir: Option<String>,

    /// Metadata database for the local backend (overrides CACHE_DATABASE_URL)
    #[arg(long, global = true)]
    pub database_url: Option<String>,
}

impl CacheConfig {
    /// Configuration with defaults for everything but the bucket.
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            version: DEFAULT_VERSION.into(),
            distribution_id: None,
            region: "us-east-1".into(),
            endpoint_url: None,
            search_url: "http://127.0.0.1:9200".into(),
            search_index: "objects".into(),
            search_api_key: None,
            search_concurrency: DEFAULT_SEARCH_CONCURRENCY,
            download_dir: env::temp_dir().join("cache-facade"),
            backend: BackendKind::S3,
            storage_dir: "./data/objects".into(),
            database_url: "sqlite://./data/meta/cache.db".into(),
        }
    }

    /// Parse environment variables + CLI args into a CacheConfig.
    pub fn from_env_and_args(args: &ConfigArgs) -> Result<Self> {
        Self::from_sources(args, |name| env::var(name).ok())
    }

    /// Merge `args` over values produced by `lookup`, falling back to defaults.
    pub fn from_sources<F>(args: &ConfigArgs, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::new("cache");

        let search_concurrency = match lookup("CACHE_SEARCH_CONCURRENCY") {
            Some(value) => value.parse::<usize>().with_context(|| {
                format!("parsing CACHE_SEARCH_CONCURRENCY value `{}`", value)
            })?,
            None => defaults.search_concurrency,
        };
        if search_concurrency == 0 {
            bail!("CACHE_SEARCH_CONCURRENCY must be at least 1");
        }

        let backend = match args.backend.clone().or_else(|| lookup("CACHE_BACKEND")) {
            Some(value) => BackendKind::parse(&value).context("reading CACHE_BACKEND")?,
            None => defaults.backend,
        };

        let cfg = Self {
            bucket: args
                .bucket
                .clone()
                .or_else(|| lookup("CACHE_BUCKET"))
                .unwrap_or(defaults.bucket),
            version: args
                .cache_version
                .clone()
                .or_else(|| lookup("CACHE_VERSION"))
                .unwrap_or(defaults.version),
            distribution_id: args
                .distribution_id
                .clone()
                .or_else(|| lookup("CACHE_DISTRIBUTION_ID")),
            region: args
                .region
                .clone()
                .or_else(|| lookup("CACHE_REGION"))
                .unwrap_or(defaults.region),
            endpoint_url: args
                .endpoint_url
                .clone()
                .or_else(|| lookup("CACHE_S3_ENDPOINT")),
            search_url: args
                .search_url
                .clone()
                .or_else(|| lookup("CACHE_SEARCH_URL"))
                .unwrap_or(defaults.search_url),
            search_index: args
                .search_index
                .clone()
                .or_else(|| lookup("CACHE_SEARCH_INDEX"))
                .unwrap_or(defaults.search_index),
            search_api_key: lookup("CACHE_SEARCH_API_KEY"),
            search_concurrency,
            download_dir: args
                .download_dir
                .clone()
                .or_else(|| lookup("CACHE_DOWNLOAD_DIR").map(PathBuf::from))
                .unwrap_or(defaults.download_dir),
            backend,
            storage_dir: args
                .storage_dir
                .clone()
                .or_else(|| lookup("CACHE_STORAGE_DIR"))
                .unwrap_or(defaults.storage_dir),
            database_url: args
                .database_url
                .clone()
                .or_else(|| lookup("CACHE_DATABASE_URL"))
                .unwrap_or(defaults.database_url),
        };

        Ok(cfg)
    }

    /// Object store key for a logical cache key.
    pub fn cloud_path(&self, key: &str) -> String {
        format!("{}/{}", self.version, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn cloud_path_prefixes_version() {
        let mut cfg = CacheConfig::new("media");
        assert_eq!(cfg.cloud_path("img/a.png"), "0.0.1/img/a.png");
        cfg.version = "2.3.0".into();
        assert_eq!(cfg.cloud_path(""), "2.3.0/");
    }

    #[test]
    fn defaults_apply_without_env() {
        let cfg = CacheConfig::from_sources(&ConfigArgs::default(), |_| None).unwrap();
        assert_eq!(cfg.version, DEFAULT_VERSION);
        assert_eq!(cfg.backend, BackendKind::S3);
        assert_eq!(cfg.search_concurrency, DEFAULT_SEARCH_CONCURRENCY);
        assert!(cfg.distribution_id.is_none());
    }

    #[test]
    fn args_override_env() {
        let lookup = lookup_from(&[
            ("CACHE_BUCKET", "from-env"),
            ("CACHE_VERSION", "1.0.0"),
            ("CACHE_BACKEND", "local"),
        ]);
        let args = ConfigArgs {
            bucket: Some("from-flag".into()),
            ..ConfigArgs::default()
        };
        let cfg = CacheConfig::from_sources(&args, lookup).unwrap();
        assert_eq!(cfg.bucket, "from-flag");
        assert_eq!(cfg.version, "1.0.0");
        assert_eq!(cfg.backend, BackendKind::Local);
    }

    #[test]
    fn bad_concurrency_names_the_variable() {
        let lookup = lookup_from(&[("CACHE_SEARCH_CONCURRENCY", "many")]);
        let err = CacheConfig::from_sources(&ConfigArgs::default(), lookup).unwrap_err();
        assert!(format!("{:#}", err).contains("CACHE_SEARCH_CONCURRENCY"));

        let lookup = lookup_from(&[("CACHE_SEARCH_CONCURRENCY", "0")]);
        assert!(CacheConfig::from_sources(&ConfigArgs::default(), lookup).is_err());
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let lookup = lookup_from(&[("CACHE_BACKEND", "gcs")]);
        assert!(CacheConfig::from_sources(&ConfigArgs::default(), lookup).is_err());
    }
}
