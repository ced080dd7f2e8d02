//! Core domain model for postsync: normalized posts, the sync watermark and run results.

use std::fmt;

use chrono::{DateTime, DurationRound, SecondsFormat, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "postsync-core";

/// ISO form of the watermark used when no sync has completed yet.
pub const EPOCH_WATERMARK: &str = "1970-01-01T00:00:00.000Z";

pub const MESSAGE_NO_CHANGES: &str = "No new posts to sync.";
pub const MESSAGE_SUCCESS: &str = "Sync successful!";
pub const MESSAGE_FAILURE: &str = "Error during sync.";

/// Completion time of the last successful sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Watermark(DateTime<Utc>);

impl Watermark {
    pub fn epoch() -> Self {
        Self(DateTime::<Utc>::UNIX_EPOCH)
    }

    pub fn now() -> Self {
        Self(Utc::now())
    }

    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        Self(at)
    }

    /// Parses a stored RFC 3339 value; blank input is treated as the epoch.
    pub fn parse(raw: &str) -> Result<Self, chrono::ParseError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(Self::epoch());
        }
        Ok(Self(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc)))
    }

    pub fn at(&self) -> DateTime<Utc> {
        self.0
    }

    /// Floor to the whole minute, the resolution Notion reports edit times at.
    pub fn truncated_to_minute(&self) -> Self {
        self.0
            .duration_trunc(TimeDelta::minutes(1))
            .map(Self)
            .unwrap_or(*self)
    }

    /// Millisecond-precision UTC ISO string, e.g. `2024-01-01T00:00:00.000Z`.
    pub fn to_iso_string(&self) -> String {
        self.0.to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_iso_string())
    }
}

/// Canonical post shape written to the relational store, keyed by `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NormalizedPost {
    pub id: String,
    pub title: String,
    pub slug: String,
    pub summary: String,
    pub published_date: String,
    pub updated_date: String,
    pub last_edited_time: String,
    pub is_pinned: bool,
    pub tags: Vec<String>,
    pub cover: String,
    pub icon: String,
    pub markdown: String,
}

/// Stable sort that moves pinned posts ahead of the rest without reordering
/// posts within either group.
pub fn sort_pinned_first(posts: &mut [NormalizedPost]) {
    posts.sort_by_key(|post| !post.is_pinned);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertAction {
    Inserted,
    Updated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub previous_watermark: Watermark,
    pub new_watermark: Watermark,
    pub posts: usize,
    pub inserted: usize,
    pub updated: usize,
}

/// Result of one successful sync run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    NoChanges {
        run_id: Uuid,
        watermark: Watermark,
    },
    Synced(SyncSummary),
}

impl SyncOutcome {
    pub fn message(&self) -> &'static str {
        match self {
            SyncOutcome::NoChanges { .. } => MESSAGE_NO_CHANGES,
            SyncOutcome::Synced(_) => MESSAGE_SUCCESS,
        }
    }
}

/// HTTP-like result object returned to the invoker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResponse {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    pub body: String,
}

impl SyncResponse {
    pub fn ok(message: &str) -> Self {
        Self::with_message(200, message)
    }

    pub fn failure() -> Self {
        Self::with_message(500, MESSAGE_FAILURE)
    }

    fn with_message(status_code: u16, message: &str) -> Self {
        Self {
            status_code,
            body: serde_json::json!({ "message": message }).to_string(),
        }
    }

    pub fn message(&self) -> Option<String> {
        let body: serde_json::Value = serde_json::from_str(&self.body).ok()?;
        body.get("message")?.as_str().map(str::to_string)
    }
}

impl From<&SyncOutcome> for SyncResponse {
    fn from(outcome: &SyncOutcome) -> Self {
        SyncResponse::ok(outcome.message())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post(id: &str, pinned: bool) -> NormalizedPost {
        NormalizedPost {
            id: id.to_string(),
            is_pinned: pinned,
            ..Default::default()
        }
    }

    #[test]
    fn pinned_posts_move_first_and_keep_relative_order() {
        let mut posts = vec![
            post("A", false),
            post("B", true),
            post("C", true),
            post("D", false),
        ];
        sort_pinned_first(&mut posts);
        let ids: Vec<_> = posts.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["B", "C", "A", "D"]);
    }

    #[test]
    fn epoch_watermark_formats_like_iso_zero() {
        assert_eq!(Watermark::epoch().to_iso_string(), EPOCH_WATERMARK);
        assert_eq!(Watermark::parse("").unwrap(), Watermark::epoch());
    }

    #[test]
    fn watermark_parses_offsets_into_utc() {
        let wm = Watermark::parse("2024-01-01T02:00:00+02:00").unwrap();
        assert_eq!(wm.to_iso_string(), "2024-01-01T00:00:00.000Z");
        assert!(Watermark::parse("yesterday").is_err());
    }

    #[test]
    fn minute_truncation_floors_seconds_and_millis() {
        let wm = Watermark::parse("2024-01-05T12:00:10.250Z").unwrap();
        assert_eq!(wm.truncated_to_minute().to_iso_string(), "2024-01-05T12:00:00.000Z");
        assert!(wm.truncated_to_minute() <= wm);
        assert_eq!(Watermark::epoch().truncated_to_minute(), Watermark::epoch());
    }

    #[test]
    fn response_bodies_carry_a_message_field() {
        let ok = SyncResponse::ok(MESSAGE_SUCCESS);
        assert_eq!(ok.status_code, 200);
        assert_eq!(ok.body, r#"{"message":"Sync successful!"}"#);

        let failed = SyncResponse::failure();
        assert_eq!(failed.status_code, 500);
        assert_eq!(failed.message().as_deref(), Some(MESSAGE_FAILURE));

        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["statusCode"], 200);
    }
}
