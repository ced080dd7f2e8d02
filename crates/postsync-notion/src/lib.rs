//! Notion source connector: database query, page content as markdown, and
//! normalization of page properties into [`postsync_core::NormalizedPost`].

pub mod client;
pub mod markdown;
pub mod model;
pub mod normalize;

use async_trait::async_trait;
use postsync_core::Watermark;
use thiserror::Error;

pub use client::{NotionClient, NotionConfig, SourceQuery};
pub use model::{Media, PropertyValue, SourceRecord};
pub use normalize::{normalize, normalize_all};

pub const CRATE_NAME: &str = "postsync-notion";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("building notion http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("invalid {0} header value")]
    InvalidHeader(&'static str),
    #[error("notion request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("notion returned http {status} for {url}: {body}")]
    Http { status: u16, url: String, body: String },
    #[error("unexpected notion response from {url}: {message}")]
    Malformed { url: String, message: String },
    #[error("notion request limiter closed")]
    LimiterClosed,
}

/// Document source the sync pipeline reads changed posts from.
#[async_trait]
pub trait PostSource: Send + Sync {
    /// Published records edited on or after `since`, in business-date order.
    async fn query_updated(&self, since: &Watermark) -> Result<Vec<SourceRecord>, SourceError>;

    /// Markdown body of one record.
    async fn fetch_content(&self, record: &SourceRecord) -> Result<String, SourceError>;
}
