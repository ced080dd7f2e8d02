use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use postsync_core::Watermark;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tracing::{debug, info, Instrument};

use crate::markdown::{render_blocks, Block};
use crate::model::SourceRecord;
use crate::normalize::{PUBLISHED_DATE, PUBLISHED_STATUS, STATUS};
use crate::{PostSource, SourceError};

pub const DEFAULT_BASE_URL: &str = "https://api.notion.com";
pub const DEFAULT_NOTION_VERSION: &str = "2022-06-28";
const PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone)]
pub struct NotionConfig {
    pub api_key: String,
    pub database_id: String,
    pub base_url: String,
    pub notion_version: String,
    pub timeout: Duration,
    pub max_concurrency: usize,
}

impl NotionConfig {
    pub fn new(api_key: impl Into<String>, database_id: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            database_id: database_id.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            notion_version: DEFAULT_NOTION_VERSION.to_string(),
            timeout: Duration::from_secs(30),
            max_concurrency: 3,
        }
    }
}

/// Filter and ordering applied to the database query.
#[derive(Debug, Clone)]
pub struct SourceQuery {
    pub status_property: String,
    pub status_value: String,
    pub sort_property: String,
}

impl Default for SourceQuery {
    fn default() -> Self {
        Self {
            status_property: STATUS.to_string(),
            status_value: PUBLISHED_STATUS.to_string(),
            sort_property: PUBLISHED_DATE.to_string(),
        }
    }
}

impl SourceQuery {
    /// Request body for `POST /v1/databases/{id}/query`. Notion floors
    /// `last_edited_time` to the minute, so the lower bound is floored too.
    pub fn body(&self, since: &Watermark, start_cursor: Option<&str>) -> Value {
        let mut body = json!({
            "filter": {
                "and": [
                    {
                        "property": self.status_property,
                        "status": { "equals": self.status_value }
                    },
                    {
                        "timestamp": "last_edited_time",
                        "last_edited_time": { "on_or_after": since.truncated_to_minute().to_iso_string() }
                    }
                ]
            },
            "sorts": [
                { "property": self.sort_property, "direction": "descending" }
            ],
            "page_size": PAGE_SIZE
        });
        if let Some(cursor) = start_cursor {
            body["start_cursor"] = Value::String(cursor.to_string());
        }
        body
    }
}

#[derive(Debug)]
pub struct NotionClient {
    http: reqwest::Client,
    config: NotionConfig,
    query: SourceQuery,
    limit: Arc<Semaphore>,
}

impl NotionClient {
    pub fn new(config: NotionConfig) -> Result<Self, SourceError> {
        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", config.api_key))
            .map_err(|_| SourceError::InvalidHeader("Authorization"))?;
        headers.insert(AUTHORIZATION, bearer);
        let version = HeaderValue::from_str(&config.notion_version)
            .map_err(|_| SourceError::InvalidHeader("Notion-Version"))?;
        headers.insert("Notion-Version", version);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .gzip(true)
            .build()
            .map_err(SourceError::Client)?;

        Ok(Self {
            http,
            limit: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            config,
            query: SourceQuery::default(),
        })
    }

    pub fn with_query(mut self, query: SourceQuery) -> Self {
        self.query = query;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// All published pages edited on or after `since`, following pagination.
    pub async fn query_updated_pages(
        &self,
        since: &Watermark,
    ) -> Result<Vec<SourceRecord>, SourceError> {
        let url = self.url(&format!("databases/{}/query", self.config.database_id));
        let mut cursor: Option<String> = None;
        let mut records = Vec::new();

        loop {
            let body = self.query.body(since, cursor.as_deref());
            let page = self.send_json(self.http.post(&url).json(&body), &url).await?;

            let results = page
                .get("results")
                .and_then(Value::as_array)
                .ok_or_else(|| SourceError::Malformed {
                    url: url.clone(),
                    message: "missing results array".to_string(),
                })?;
            records.extend(results.iter().filter_map(SourceRecord::from_page));

            cursor = next_cursor(&page);
            if cursor.is_none() {
                break;
            }
        }

        info!(count = records.len(), since = %since, "queried updated notion pages");
        Ok(records)
    }

    /// Full page body rendered as markdown.
    pub async fn page_markdown(&self, page_id: &str) -> Result<String, SourceError> {
        let blocks = self.block_tree(page_id.to_string()).await?;
        Ok(render_blocks(&blocks))
    }

    fn block_tree(&self, block_id: String) -> BoxFuture<'_, Result<Vec<Block>, SourceError>> {
        async move {
            let mut blocks = self.block_children(&block_id).await?;
            for block in &mut blocks {
                if block.has_children && !block.id.is_empty() {
                    block.children = self.block_tree(block.id.clone()).await?;
                }
            }
            Ok(blocks)
        }
        .boxed()
    }

    async fn block_children(&self, block_id: &str) -> Result<Vec<Block>, SourceError> {
        let url = self.url(&format!("blocks/{block_id}/children"));
        let mut cursor: Option<String> = None;
        let mut blocks = Vec::new();

        loop {
            let mut request = self
                .http
                .get(&url)
                .query(&[("page_size", PAGE_SIZE.to_string())]);
            if let Some(cursor) = &cursor {
                request = request.query(&[("start_cursor", cursor.as_str())]);
            }
            let page = self.send_json(request, &url).await?;

            if let Some(results) = page.get("results").and_then(Value::as_array) {
                blocks.extend(results.iter().map(Block::from_json));
            }

            cursor = next_cursor(&page);
            if cursor.is_none() {
                break;
            }
        }
        Ok(blocks)
    }

    async fn send_json(
        &self,
        request: reqwest::RequestBuilder,
        url: &str,
    ) -> Result<Value, SourceError> {
        let _permit = self
            .limit
            .acquire()
            .await
            .map_err(|_| SourceError::LimiterClosed)?;

        let span = tracing::debug_span!("notion_request", url);
        async move {
            let response = request.send().await?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(SourceError::Http {
                    status: status.as_u16(),
                    url: url.to_string(),
                    body,
                });
            }
            let value = response.json::<Value>().await?;
            debug!(status = status.as_u16(), "notion response");
            Ok(value)
        }
        .instrument(span)
        .await
    }
}

fn next_cursor(page: &Value) -> Option<String> {
    let has_more = page.get("has_more").and_then(Value::as_bool).unwrap_or(false);
    if !has_more {
        return None;
    }
    page.get("next_cursor")
        .and_then(Value::as_str)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl PostSource for NotionClient {
    async fn query_updated(&self, since: &Watermark) -> Result<Vec<SourceRecord>, SourceError> {
        self.query_updated_pages(since).await
    }

    async fn fetch_content(&self, record: &SourceRecord) -> Result<String, SourceError> {
        self.page_markdown(&record.id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_body_filters_published_since_watermark() {
        let since = Watermark::parse("2024-01-01T00:00:00Z").unwrap();
        let body = SourceQuery::default().body(&since, None);

        assert_eq!(body["filter"]["and"][0]["property"], "Status");
        assert_eq!(body["filter"]["and"][0]["status"]["equals"], "Published");
        assert_eq!(body["filter"]["and"][1]["timestamp"], "last_edited_time");
        assert_eq!(
            body["filter"]["and"][1]["last_edited_time"]["on_or_after"],
            "2024-01-01T00:00:00.000Z"
        );
        assert_eq!(body["sorts"][0]["property"], "PublishedDate");
        assert_eq!(body["sorts"][0]["direction"], "descending");
        assert!(body.get("start_cursor").is_none());

        let next = SourceQuery::default().body(&since, Some("cursor-2"));
        assert_eq!(next["start_cursor"], "cursor-2");
    }

    #[test]
    fn lower_bound_is_floored_to_the_minute() {
        let since = Watermark::parse("2024-01-05T12:00:10.250Z").unwrap();
        let body = SourceQuery::default().body(&since, None);
        assert_eq!(
            body["filter"]["and"][1]["last_edited_time"]["on_or_after"],
            "2024-01-05T12:00:00.000Z"
        );
    }

    #[test]
    fn cursor_only_follows_when_has_more() {
        assert_eq!(
            next_cursor(&json!({"has_more": true, "next_cursor": "abc"})).as_deref(),
            Some("abc")
        );
        assert_eq!(next_cursor(&json!({"has_more": false, "next_cursor": "abc"})), None);
        assert_eq!(next_cursor(&json!({"has_more": true, "next_cursor": null})), None);
    }
}
