//! Sync orchestration: configuration, the run pipeline and the invocation handler.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use futures::future::try_join_all;
use futures::FutureExt;
use postsync_core::{SyncOutcome, SyncResponse, SyncSummary, Watermark};
use postsync_notion::{normalize_all, NotionClient, NotionConfig, PostSource, SourceError};
use postsync_storage::{
    save_posts_to_database, DatabaseConfig, ParameterWatermarkStore, PgPostSink, PostSink,
    SsmParameterStore, WatermarkError, WatermarkStore, WriteError, DEFAULT_WATERMARK_PARAMETER,
};
use thiserror::Error;
use tracing::{error, info, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "postsync-sync";

const DEFAULT_DB_PORT: u16 = 5432;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variables: {}", .0.join(", "))]
    Missing(Vec<&'static str>),
    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
    #[error("database CA certificate not found at {}", .0.display())]
    MissingCertificate(PathBuf),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("watermark: {0}")]
    Watermark(#[from] WatermarkError),
    #[error("source: {0}")]
    Source(#[from] SourceError),
    #[error("sink: {0}")]
    Write(#[from] WriteError),
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub region: String,
    pub database: DatabaseConfig,
    pub notion: NotionConfig,
    pub watermark_parameter: String,
}

/// The subset of [`SyncConfig`] needed to reach the watermark parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatermarkConfig {
    pub region: String,
    pub parameter: String,
}

impl WatermarkConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let region = var("AWS_REGION").ok_or_else(|| ConfigError::Missing(vec!["AWS_REGION"]))?;
        Ok(Self {
            region,
            parameter: var("SYNC_TIMESTAMP_PARAMETER")
                .unwrap_or_else(|| DEFAULT_WATERMARK_PARAMETER.to_string()),
        })
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from any variable source. Performs no network
    /// I/O; only the CA bundle's presence on disk is checked.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let mut missing = Vec::new();
        let mut required = |name: &'static str| {
            var(name).unwrap_or_else(|| {
                missing.push(name);
                String::new()
            })
        };
        let host = required("DB_HOST");
        let user = required("DB_USER");
        let password = required("DB_PASSWORD");
        let database = required("DB_NAME");
        let region = required("AWS_REGION");
        let api_key = required("NOTION_API_KEY");
        let database_id = required("NOTION_DATABASE_ID");
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }

        let port = parse_or(var("DB_PORT"), "DB_PORT", DEFAULT_DB_PORT)?;
        let max_connections = parse_or(
            var("DB_MAX_CONNECTIONS"),
            "DB_MAX_CONNECTIONS",
            DEFAULT_DB_MAX_CONNECTIONS,
        )?;

        let cert_dir = var("DB_CA_CERT_DIR")
            .or_else(|| var("LAMBDA_TASK_ROOT"))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let ca_cert_path = ca_bundle_path(&cert_dir, &region);
        if !ca_cert_path.is_file() {
            return Err(ConfigError::MissingCertificate(ca_cert_path));
        }

        let mut notion = NotionConfig::new(api_key, database_id);
        if let Some(base_url) = var("NOTION_API_BASE_URL") {
            notion.base_url = base_url;
        }
        if let Some(version) = var("NOTION_VERSION") {
            notion.notion_version = version;
        }
        notion.max_concurrency = parse_or(
            var("NOTION_MAX_CONCURRENCY"),
            "NOTION_MAX_CONCURRENCY",
            notion.max_concurrency,
        )?;
        let timeout_secs = parse_or(
            var("NOTION_TIMEOUT_SECS"),
            "NOTION_TIMEOUT_SECS",
            notion.timeout.as_secs(),
        )?;
        notion.timeout = Duration::from_secs(timeout_secs);

        Ok(Self {
            region,
            database: DatabaseConfig {
                host,
                port,
                user,
                password,
                database,
                ca_cert_path,
                max_connections,
            },
            notion,
            watermark_parameter: var("SYNC_TIMESTAMP_PARAMETER")
                .unwrap_or_else(|| DEFAULT_WATERMARK_PARAMETER.to_string()),
        })
    }

    pub fn watermark(&self) -> WatermarkConfig {
        WatermarkConfig {
            region: self.region.clone(),
            parameter: self.watermark_parameter.clone(),
        }
    }
}

/// `<dir>/<region>-bundle.pem`
pub fn ca_bundle_path(dir: &Path, region: &str) -> PathBuf {
    dir.join(format!("{region}-bundle.pem"))
}

fn parse_or<T: std::str::FromStr>(
    raw: Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match raw {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
    }
}

/// One incremental sync: watermark read, source query and fetch, normalize,
/// write, watermark advance.
#[derive(Debug)]
pub struct SyncPipeline<S, K, W> {
    source: S,
    sink: K,
    watermark: W,
}

pub type NotionSyncPipeline =
    SyncPipeline<NotionClient, PgPostSink, ParameterWatermarkStore<SsmParameterStore>>;

impl<S, K, W> SyncPipeline<S, K, W>
where
    S: PostSource,
    K: PostSink,
    W: WatermarkStore,
{
    pub fn new(source: S, sink: K, watermark: W) -> Self {
        Self {
            source,
            sink,
            watermark,
        }
    }

    pub fn watermark_store(&self) -> &W {
        &self.watermark
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    pub async fn run_once(&self) -> Result<SyncOutcome, SyncError> {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("sync_run", %run_id);
        self.run(run_id).instrument(span).await
    }

    async fn run(&self, run_id: Uuid) -> Result<SyncOutcome, SyncError> {
        let started_at = Utc::now();
        let previous = self.watermark.get().await?;

        let records = self.source.query_updated(&previous).await?;
        if records.is_empty() {
            info!(watermark = %previous, "no new posts to sync");
            return Ok(SyncOutcome::NoChanges {
                run_id,
                watermark: previous,
            });
        }
        info!(count = records.len(), "found posts to sync");

        let records = try_join_all(records.into_iter().map(|record| async move {
            let content = self.source.fetch_content(&record).await?;
            Ok::<_, SourceError>(record.with_content(content))
        }))
        .await?;

        let posts = normalize_all(&records);
        for post in &posts {
            info!(
                post_id = %post.id,
                title = %post.title,
                pinned = post.is_pinned,
                last_edited = %post.last_edited_time,
                "syncing post"
            );
        }

        let report = save_posts_to_database(&self.sink, &posts).await?;

        let new_watermark = Watermark::now();
        self.watermark.put(&new_watermark).await?;

        let summary = SyncSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            previous_watermark: previous,
            new_watermark,
            posts: posts.len(),
            inserted: report.inserted,
            updated: report.updated,
        };
        info!(
            posts = summary.posts,
            inserted = summary.inserted,
            updated = summary.updated,
            watermark = %summary.new_watermark,
            "sync complete"
        );
        Ok(SyncOutcome::Synced(summary))
    }
}

impl NotionSyncPipeline {
    /// Wires the production clients. The Postgres pool connects lazily.
    pub async fn from_config(config: &SyncConfig) -> Result<Self, SyncError> {
        let source = NotionClient::new(config.notion.clone())?;
        let sink = PgPostSink::connect_lazy(&config.database);
        let watermark = watermark_store_for(&config.watermark()).await;
        Ok(Self::new(source, sink, watermark))
    }
}

pub async fn watermark_store_for(
    config: &WatermarkConfig,
) -> ParameterWatermarkStore<SsmParameterStore> {
    let parameters = SsmParameterStore::from_region(&config.region).await;
    ParameterWatermarkStore::new(parameters, config.parameter.clone())
}

/// Runs the pipeline once and folds every outcome, including panics, into a
/// single response.
pub async fn handle_invocation<S, K, W>(pipeline: &SyncPipeline<S, K, W>) -> SyncResponse
where
    S: PostSource,
    K: PostSink,
    W: WatermarkStore,
{
    match AssertUnwindSafe(pipeline.run_once()).catch_unwind().await {
        Ok(Ok(outcome)) => SyncResponse::from(&outcome),
        Ok(Err(err)) => {
            error!(error = %err, "error during sync");
            SyncResponse::failure()
        }
        Err(panic) => {
            error!(panic = %panic_message(panic.as_ref()), "sync run panicked");
            SyncResponse::failure()
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
