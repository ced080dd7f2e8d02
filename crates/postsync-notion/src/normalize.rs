use postsync_core::{sort_pinned_first, NormalizedPost};

use crate::model::{Media, SourceRecord};

pub const TITLE: &str = "Title";
pub const SLUG: &str = "Slug";
pub const SUMMARY: &str = "Summary";
pub const PUBLISHED_DATE: &str = "PublishedDate";
pub const UPDATED_DATE: &str = "UpdatedDate";
pub const TAGS: &str = "Tags";
pub const FLAG: &str = "Flag";
pub const STATUS: &str = "Status";

pub const PUBLISHED_STATUS: &str = "Published";
pub const PINNED_FLAG: &str = "Pinned";

/// Maps a source page into the canonical post shape. Total: missing or
/// oddly-typed properties become empty values.
pub fn normalize(record: &SourceRecord) -> NormalizedPost {
    NormalizedPost {
        id: record.id.clone(),
        title: record.property(TITLE).text(),
        slug: record.property(SLUG).text(),
        summary: record.property(SUMMARY).text(),
        published_date: record.property(PUBLISHED_DATE).text(),
        updated_date: record.property(UPDATED_DATE).text(),
        last_edited_time: record.last_edited_time.clone(),
        is_pinned: record.property(FLAG).text() == PINNED_FLAG,
        tags: record.property(TAGS).list(),
        cover: Media::resolve(&record.cover),
        icon: Media::resolve(&record.icon),
        markdown: record.content.clone(),
    }
}

/// Normalizes a query result and applies the pinned-first ordering.
pub fn normalize_all(records: &[SourceRecord]) -> Vec<NormalizedPost> {
    let mut posts: Vec<_> = records.iter().map(normalize).collect();
    sort_pinned_first(&mut posts);
    posts
}
