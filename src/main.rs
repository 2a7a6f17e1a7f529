use anyhow::{Context, Result, bail};
use cache_facade::{
    BackendKind, CacheConfig, CacheService, CloudFrontInvalidator, ConfigArgs,
    ElasticSearchIndex, LocalObjectStore, ObjectStore, S3ObjectStore,
    models::object::{PutOptions, UploadFile},
    parse_ttl,
};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use serde::Serialize;
use std::{collections::HashMap, path::PathBuf, sync::Arc};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Cache facade over object storage, CDN and search")]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show object metadata
    Head {
        key: String,
        /// Only succeed if the object still has this ETag
        #[arg(long)]
        etag: Option<String>,
    },
    /// Upload a local file
    Put {
        key: String,
        file: PathBuf,
        #[arg(long)]
        content_type: Option<String>,
        /// Lifetime such as `2d` or `90m`; bare numbers are milliseconds
        #[arg(long)]
        ttl: Option<String>,
        /// Metadata tag, repeatable
        #[arg(long = "meta", value_name = "KEY=VALUE", value_parser = parse_meta)]
        meta: Vec<(String, String)>,
    },
    /// Download an object into the staging directory
    Get {
        key: String,
        #[arg(long)]
        etag: Option<String>,
    },
    /// Purge paths from the CDN
    Invalid {
        #[arg(required = true)]
        patterns: Vec<String>,
    },
    /// Find objects by origin URL or key prefix
    Search {
        identifier: String,
        #[arg(required = true)]
        patterns: Vec<String>,
    },
    /// Delete objects, ignoring failures
    Delete {
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// Copy an object body to a file or stdout
    Stream {
        key: String,
        #[arg(long)]
        etag: Option<String>,
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
}

fn parse_meta(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got `{}`", raw)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = CacheConfig::from_env_and_args(&cli.config)?;
    tracing::debug!("Starting cache-facade with config: {:?}", cfg);

    let service = build_service(cfg).await?;
    run(&service, cli.command).await
}

/// Wire the configured backends into a facade.
async fn build_service(cfg: CacheConfig) -> Result<CacheService> {
    let objects: Arc<dyn ObjectStore> = match cfg.backend {
        BackendKind::S3 => Arc::new(S3ObjectStore::from_config(&cfg).await),
        BackendKind::Local => Arc::new(
            LocalObjectStore::connect(&cfg.database_url, &cfg.storage_dir, &cfg.bucket)
                .await
                .context("opening local object store")?,
        ),
    };
    let cdn = Arc::new(CloudFrontInvalidator::from_config(&cfg).await);
    let search =
        Arc::new(ElasticSearchIndex::from_config(&cfg).context("building search client")?);

    Ok(CacheService::new(cfg, objects, cdn, search))
}

async fn run(service: &CacheService, command: Command) -> Result<()> {
    match command {
        Command::Head { key, etag } => print_json(&service.head(&key, etag.as_deref()).await?),
        Command::Put {
            key,
            file,
            content_type,
            ttl,
            meta,
        } => {
            let mut upload = UploadFile::new(file);
            upload.content_type = content_type;
            let options = PutOptions {
                ttl: ttl.as_deref().map(parse_ttl).transpose()?,
                meta: meta.into_iter().collect::<HashMap<_, _>>(),
            };
            print_json(&service.put(&key, &upload, options).await?)
        }
        Command::Get { key, etag } => print_json(&service.get(&key, etag.as_deref()).await?),
        Command::Invalid { patterns } => {
            let Some(distribution_id) = service.config().distribution_id.as_deref() else {
                bail!("no distribution id: pass --distribution-id or set CACHE_DISTRIBUTION_ID");
            };
            print_json(&service.invalid(distribution_id, &patterns).await?)
        }
        Command::Search {
            identifier,
            patterns,
        } => print_json(&service.search(&identifier, &patterns).await?),
        Command::Delete { keys } => {
            service.delete(&keys).await;
            Ok(())
        }
        Command::Stream { key, etag, output } => {
            let body = service.stream(&key, etag.as_deref()).await?;
            match output {
                Some(path) => {
                    let file = tokio::fs::File::create(&path)
                        .await
                        .with_context(|| format!("creating {}", path.display()))?;
                    copy_body(body, file).await
                }
                None => copy_body(body, tokio::io::stdout()).await,
            }
        }
    }
}

async fn copy_body<W>(mut body: cache_facade::ByteStream, mut out: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(chunk) = body.next().await {
        out.write_all(&chunk?).await?;
    }
    out.flush().await?;
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
