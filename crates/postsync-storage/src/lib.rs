//! Relational sink for normalized posts and the parameter-backed sync watermark.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_ssm::error::DisplayErrorContext;
use aws_sdk_ssm::types::ParameterType;
use chrono::{DateTime, NaiveDate};
use futures::future::try_join_all;
use postsync_core::{NormalizedPost, UpsertAction, Watermark};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "postsync-storage";

pub const DEFAULT_WATERMARK_PARAMETER: &str = "/my-blog/notion-sync/lastSuccessfulSyncTimestamp";

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("acquiring database connection: {0}")]
    Connection(#[source] sqlx::Error),
    #[error("upserting post {post_id}: {source}")]
    Query {
        post_id: String,
        #[source]
        source: sqlx::Error,
    },
}

/// Destination table for normalized posts.
#[async_trait]
pub trait PostSink: Send + Sync {
    async fn upsert(&self, post: &NormalizedPost) -> Result<UpsertAction, WriteError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub inserted: usize,
    pub updated: usize,
}

/// Upserts every post concurrently. Fails on the first failed upsert; rows
/// written before that failure stay committed.
pub async fn save_posts_to_database<S>(
    sink: &S,
    posts: &[NormalizedPost],
) -> Result<BatchReport, WriteError>
where
    S: PostSink + ?Sized,
{
    let actions = try_join_all(posts.iter().map(|post| sink.upsert(post))).await?;
    let report = actions
        .into_iter()
        .fold(BatchReport::default(), |mut report, action| {
            match action {
                UpsertAction::Inserted => report.inserted += 1,
                UpsertAction::Updated => report.updated += 1,
            }
            report
        });
    info!(
        count = posts.len(),
        inserted = report.inserted,
        updated = report.updated,
        "synced posts to the database"
    );
    Ok(report)
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub ca_cert_path: PathBuf,
    pub max_connections: u32,
}

impl DatabaseConfig {
    /// Verify-full TLS against the bundled CA certificate.
    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.database)
            .ssl_mode(PgSslMode::VerifyFull)
            .ssl_root_cert(&self.ca_cert_path)
    }
}

#[derive(Debug, Clone)]
pub struct PgPostSink {
    pool: PgPool,
}

impl PgPostSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Builds the pool without connecting; connections open on first use.
    pub fn connect_lazy(config: &DatabaseConfig) -> Self {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_lazy_with(config.connect_options());
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl PostSink for PgPostSink {
    async fn upsert(&self, post: &NormalizedPost) -> Result<UpsertAction, WriteError> {
        let query_err = |source| WriteError::Query {
            post_id: post.id.clone(),
            source,
        };
        let mut conn = self.pool.acquire().await.map_err(WriteError::Connection)?;
        let published_date = parse_published_date(&post.published_date);

        let existing = sqlx::query("SELECT id FROM posts WHERE id = $1")
            .bind(&post.id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(query_err)?;

        if existing.is_some() {
            info!(post_id = %post.id, title = %post.title, "updating post");
            sqlx::query(
                "UPDATE posts
                 SET title = $1, slug = $2, summary = $3, published_date = $4, is_pinned = $5,
                     tags = $6, cover = $7, icon = $8, markdown = $9, updated_at = CURRENT_TIMESTAMP
                 WHERE id = $10",
            )
            .bind(&post.title)
            .bind(&post.slug)
            .bind(&post.summary)
            .bind(published_date)
            .bind(post.is_pinned)
            .bind(&post.tags)
            .bind(&post.cover)
            .bind(&post.icon)
            .bind(&post.markdown)
            .bind(&post.id)
            .execute(&mut *conn)
            .await
            .map_err(query_err)?;
            Ok(UpsertAction::Updated)
        } else {
            info!(post_id = %post.id, title = %post.title, "inserting new post");
            sqlx::query(
                "INSERT INTO posts (id, title, slug, summary, published_date, is_pinned, tags, cover, icon, markdown)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            )
            .bind(&post.id)
            .bind(&post.title)
            .bind(&post.slug)
            .bind(&post.summary)
            .bind(published_date)
            .bind(post.is_pinned)
            .bind(&post.tags)
            .bind(&post.cover)
            .bind(&post.icon)
            .bind(&post.markdown)
            .execute(&mut *conn)
            .await
            .map_err(query_err)?;
            Ok(UpsertAction::Inserted)
        }
    }
}

/// Notion date starts are either `YYYY-MM-DD` or a full RFC 3339 timestamp.
pub fn parse_published_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.date_naive()))
}

#[derive(Debug, Error)]
pub enum WatermarkError {
    #[error("reading parameter {name}: {message}")]
    Read { name: String, message: String },
    #[error("writing parameter {name}: {message}")]
    Write { name: String, message: String },
    #[error("parameter {name} holds an invalid timestamp {value:?}: {source}")]
    Malformed {
        name: String,
        value: String,
        #[source]
        source: chrono::ParseError,
    },
}

/// Key-value parameter store with not-found reported as `Ok(None)`.
#[async_trait]
pub trait ParameterStore: Send + Sync {
    async fn get_parameter(&self, name: &str) -> Result<Option<String>, WatermarkError>;
    async fn put_parameter(&self, name: &str, value: &str) -> Result<(), WatermarkError>;
}

#[derive(Debug, Clone)]
pub struct SsmParameterStore {
    client: aws_sdk_ssm::Client,
}

impl SsmParameterStore {
    pub fn new(client: aws_sdk_ssm::Client) -> Self {
        Self { client }
    }

    pub async fn from_region(region: &str) -> Self {
        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region.to_string()))
            .load()
            .await;
        Self::new(aws_sdk_ssm::Client::new(&config))
    }
}

#[async_trait]
impl ParameterStore for SsmParameterStore {
    async fn get_parameter(&self, name: &str) -> Result<Option<String>, WatermarkError> {
        match self.client.get_parameter().name(name).send().await {
            Ok(output) => Ok(output
                .parameter()
                .and_then(|parameter| parameter.value())
                .map(str::to_string)),
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(|service| service.is_parameter_not_found()) =>
            {
                Ok(None)
            }
            Err(err) => Err(WatermarkError::Read {
                name: name.to_string(),
                message: DisplayErrorContext(&err).to_string(),
            }),
        }
    }

    async fn put_parameter(&self, name: &str, value: &str) -> Result<(), WatermarkError> {
        self.client
            .put_parameter()
            .name(name)
            .value(value)
            .r#type(ParameterType::String)
            .overwrite(true)
            .send()
            .await
            .map(|_| ())
            .map_err(|err| WatermarkError::Write {
                name: name.to_string(),
                message: DisplayErrorContext(&err).to_string(),
            })
    }
}

/// Single-slot storage for the sync watermark.
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    async fn get(&self) -> Result<Watermark, WatermarkError>;
    async fn put(&self, watermark: &Watermark) -> Result<(), WatermarkError>;
}

#[derive(Debug, Clone)]
pub struct ParameterWatermarkStore<P> {
    parameters: P,
    name: String,
}

impl<P: ParameterStore> ParameterWatermarkStore<P> {
    pub fn new(parameters: P, name: impl Into<String>) -> Self {
        Self {
            parameters,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl<P: ParameterStore> WatermarkStore for ParameterWatermarkStore<P> {
    async fn get(&self) -> Result<Watermark, WatermarkError> {
        let Some(value) = self.parameters.get_parameter(&self.name).await? else {
            info!(parameter = %self.name, "watermark parameter not found, starting from epoch");
            return Ok(Watermark::epoch());
        };
        let watermark = Watermark::parse(&value).map_err(|source| WatermarkError::Malformed {
            name: self.name.clone(),
            value: value.clone(),
            source,
        })?;
        info!(watermark = %watermark, "last sync was at");
        Ok(watermark)
    }

    async fn put(&self, watermark: &Watermark) -> Result<(), WatermarkError> {
        let value = watermark.to_iso_string();
        debug!(parameter = %self.name, %value, "saving sync timestamp");
        self.parameters.put_parameter(&self.name, &value).await?;
        info!(watermark = %value, "updated sync timestamp");
        Ok(())
    }
}

/// Process-local watermark slot for dry runs and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryWatermarkStore {
    slot: Arc<Mutex<Option<Watermark>>>,
}

impl MemoryWatermarkStore {
    pub fn new(initial: Option<Watermark>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(initial)),
        }
    }

    pub async fn current(&self) -> Option<Watermark> {
        *self.slot.lock().await
    }
}

#[async_trait]
impl WatermarkStore for MemoryWatermarkStore {
    async fn get(&self) -> Result<Watermark, WatermarkError> {
        Ok(self.current().await.unwrap_or_else(Watermark::epoch))
    }

    async fn put(&self, watermark: &Watermark) -> Result<(), WatermarkError> {
        *self.slot.lock().await = Some(*watermark);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use postsync_core::EPOCH_WATERMARK;
    use std::collections::HashMap;

    #[derive(Default, Clone)]
    struct MemoryParameters {
        values: Arc<Mutex<HashMap<String, String>>>,
        fail_reads: bool,
    }

    #[async_trait]
    impl ParameterStore for MemoryParameters {
        async fn get_parameter(&self, name: &str) -> Result<Option<String>, WatermarkError> {
            if self.fail_reads {
                return Err(WatermarkError::Read {
                    name: name.to_string(),
                    message: "AccessDenied".to_string(),
                });
            }
            Ok(self.values.lock().await.get(name).cloned())
        }

        async fn put_parameter(&self, name: &str, value: &str) -> Result<(), WatermarkError> {
            self.values
                .lock()
                .await
                .insert(name.to_string(), value.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn missing_parameter_reads_as_epoch() {
        let store = ParameterWatermarkStore::new(MemoryParameters::default(), "/wm");
        let watermark = store.get().await.expect("not-found is recovered");
        assert_eq!(watermark.to_iso_string(), EPOCH_WATERMARK);
    }

    #[tokio::test]
    async fn other_read_failures_propagate() {
        let params = MemoryParameters {
            fail_reads: true,
            ..Default::default()
        };
        let store = ParameterWatermarkStore::new(params, "/wm");
        assert!(matches!(store.get().await, Err(WatermarkError::Read { .. })));
    }

    #[tokio::test]
    async fn put_overwrites_the_single_slot() {
        let params = MemoryParameters::default();
        let store = ParameterWatermarkStore::new(params.clone(), "/wm");
        let first = Watermark::parse("2024-01-01T00:00:00Z").unwrap();
        let second = Watermark::parse("2024-02-01T12:30:00.250Z").unwrap();

        store.put(&first).await.unwrap();
        store.put(&second).await.unwrap();

        assert_eq!(store.get().await.unwrap(), second);
        let values = params.values.lock().await;
        assert_eq!(values.len(), 1);
        assert_eq!(values["/wm"], "2024-02-01T12:30:00.250Z");
    }

    #[tokio::test]
    async fn malformed_stored_value_is_an_error() {
        let params = MemoryParameters::default();
        params
            .put_parameter("/wm", "not a timestamp")
            .await
            .unwrap();
        let store = ParameterWatermarkStore::new(params, "/wm");
        assert!(matches!(
            store.get().await,
            Err(WatermarkError::Malformed { .. })
        ));
    }

    #[tokio::test]
    async fn memory_store_starts_at_epoch_and_keeps_last_put() {
        let store = MemoryWatermarkStore::default();
        assert_eq!(store.get().await.unwrap(), Watermark::epoch());
        let at = Watermark::parse("2024-03-01T00:00:00Z").unwrap();
        store.put(&at).await.unwrap();
        assert_eq!(store.current().await, Some(at));
    }

    #[test]
    fn published_dates_accept_date_and_datetime() {
        assert_eq!(
            parse_published_date("2024-01-08"),
            NaiveDate::from_ymd_opt(2024, 1, 8)
        );
        assert_eq!(
            parse_published_date("2023-11-30T10:00:00.000+01:00"),
            NaiveDate::from_ymd_opt(2023, 11, 30)
        );
        assert_eq!(parse_published_date(""), None);
        assert_eq!(parse_published_date("soon"), None);
    }

    struct FlakySink {
        fail_id: Option<&'static str>,
        written: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PostSink for FlakySink {
        async fn upsert(&self, post: &NormalizedPost) -> Result<UpsertAction, WriteError> {
            if self.fail_id == Some(post.id.as_str()) {
                return Err(WriteError::Connection(sqlx::Error::PoolTimedOut));
            }
            self.written.lock().await.push(post.id.clone());
            if post.id.starts_with("new") {
                Ok(UpsertAction::Inserted)
            } else {
                Ok(UpsertAction::Updated)
            }
        }
    }

    fn post(id: &str) -> NormalizedPost {
        NormalizedPost {
            id: id.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn batch_counts_inserts_and_updates() {
        let sink = FlakySink {
            fail_id: None,
            written: Mutex::new(Vec::new()),
        };
        let report = save_posts_to_database(&sink, &[post("new-1"), post("old-1"), post("new-2")])
            .await
            .unwrap();
        assert_eq!(report, BatchReport { inserted: 2, updated: 1 });
    }

    #[tokio::test]
    async fn batch_fails_when_any_upsert_fails() {
        let sink = FlakySink {
            fail_id: Some("old-1"),
            written: Mutex::new(Vec::new()),
        };
        let result = save_posts_to_database(&sink, &[post("new-1"), post("old-1")]).await;
        assert!(matches!(result, Err(WriteError::Connection(_))));
    }

    #[test]
    fn connect_options_use_verified_tls() {
        let config = DatabaseConfig {
            host: "db.internal".into(),
            port: 5433,
            user: "sync".into(),
            password: "pw".into(),
            database: "blog".into(),
            ca_cert_path: PathBuf::from("/var/task/us-east-1-bundle.pem"),
            max_connections: 2,
        };
        let options = config.connect_options();
        assert_eq!(options.get_host(), "db.internal");
        assert_eq!(options.get_port(), 5433);
        assert_eq!(options.get_username(), "sync");
        assert_eq!(options.get_database(), Some("blog"));
        assert!(matches!(options.get_ssl_mode(), PgSslMode::VerifyFull));
    }
}
