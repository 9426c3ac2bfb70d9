use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::feed::opml::OpmlError;
use crate::feed::ParsedItem;

// ============================================================================
// Error Types
// ============================================================================

/// Errors produced by the feed store.
///
/// `FeedExists` and `Opml` are validation faults, the `*NotFound` variants
/// map to missing identifiers, and `Db` covers statement and transaction
/// infrastructure faults that abort the whole call.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The URL is already subscribed; AddFeed refuses duplicates.
    #[error("feed with URL '{0}' is already subscribed")]
    FeedExists(String),

    /// Referenced feed id does not exist.
    #[error("feed with ID {0} does not exist")]
    FeedNotFound(i64),

    /// Referenced entry id does not exist.
    #[error("entry with ID {0} does not exist")]
    EntryNotFound(i64),

    /// OPML payload could not be decoded or encoded.
    #[error(transparent)]
    Opml(#[from] OpmlError),

    /// Statement or transaction failure.
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}

// ============================================================================
// Data Structures
// ============================================================================

/// A subscribed feed with its metadata and, depending on the operation,
/// a subset of its entries.
///
/// `entries` is populated by AddFeed (the initial fetch) and by pulls
/// (changed entries only); listing operations leave it empty.
#[derive(Debug, Clone, Serialize)]
pub struct Feed {
    pub id: i64,
    pub title: String,
    pub description: Option<String>,
    pub feed_url: String,
    pub site_url: Option<String>,
    pub is_starred: bool,
    pub tags: Vec<String>,
    /// Subscription time, Unix milliseconds. Immutable after AddFeed.
    pub subscribed: i64,
    /// Latest content timestamp, Unix milliseconds. Feed-level value when the
    /// source provides one, otherwise inferred from entry timestamps.
    pub updated: Option<i64>,
    /// Time of the most recent poll attempt, Unix milliseconds.
    pub last_pulled: Option<i64>,
    pub entries: Vec<Entry>,
}

/// One article belonging to exactly one feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Entry {
    pub id: i64,
    pub feed_id: i64,
    pub title: String,
    pub is_read: bool,
    /// The source feed's own item identifier; natural key for upsert,
    /// unique within the owning feed.
    pub ext_id: String,
    pub updated: Option<i64>,
    pub published: Option<i64>,
    pub description: Option<String>,
    pub content: Option<String>,
    pub url: Option<String>,
}

/// Input to AddFeed: parser-derived metadata with user overrides already
/// applied, plus the items of the initial fetch (possibly none).
#[derive(Debug, Clone)]
pub struct NewFeed {
    pub title: String,
    pub description: Option<String>,
    pub feed_url: String,
    pub site_url: Option<String>,
    pub is_starred: bool,
    pub tags: Vec<String>,
    pub updated: Option<i64>,
    pub entries: Vec<ParsedItem>,
}

/// Field-level feed edit. `None` leaves the field unchanged; `Some` sets it,
/// including `Some(vec![])` for tags, which clears the whole tag set.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeedEditOp {
    pub id: i64,
    pub title: Option<String>,
    pub description: Option<String>,
    pub tags: Option<Vec<String>>,
    pub is_starred: Option<bool>,
}

/// Field-level entry edit with the same unset-means-unchanged contract.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EntryEditOp {
    pub id: i64,
    pub is_read: Option<bool>,
}

/// Subscription-wide statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub num_feeds: i64,
    pub num_entries: i64,
    pub num_entries_unread: i64,
    pub last_pull_time: Option<i64>,
    pub most_recent_update_time: Option<i64>,
}

// ============================================================================
// Row Helpers
// ============================================================================

/// Row type for feed queries; tags arrive as a JSON array built by
/// `json_group_array`.
pub(crate) type FeedRow = (
    i64,            // id
    String,         // title
    Option<String>, // description
    String,         // feed_url
    Option<String>, // site_url
    bool,           // is_starred
    i64,            // subscription_time
    Option<i64>,    // update_time
    Option<i64>,    // last_pull_time
    String,         // tags (JSON array)
);

pub(crate) fn feed_from_row(row: FeedRow) -> Feed {
    let (
        id,
        title,
        description,
        feed_url,
        site_url,
        is_starred,
        subscribed,
        updated,
        last_pulled,
        tags,
    ) = row;
    // json_group_array always yields valid JSON; an unreadable value is a
    // query bug, not user data.
    let tags: Vec<String> = serde_json::from_str(&tags).unwrap_or_default();
    Feed {
        id,
        title,
        description,
        feed_url,
        site_url,
        is_starred,
        tags,
        subscribed,
        updated,
        last_pulled,
        entries: Vec::new(),
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct EntryRow {
    pub id: i64,
    pub feed_id: i64,
    pub title: String,
    pub is_read: bool,
    pub ext_id: String,
    pub update_time: Option<i64>,
    pub publication_time: Option<i64>,
    pub description: Option<String>,
    pub content: Option<String>,
    pub url: Option<String>,
}

impl EntryRow {
    pub(crate) fn into_entry(self) -> Entry {
        Entry {
            id: self.id,
            feed_id: self.feed_id,
            title: self.title,
            is_read: self.is_read,
            ext_id: self.ext_id,
            updated: self.update_time,
            published: self.publication_time,
            description: self.description,
            content: self.content,
            url: self.url,
        }
    }
}

/// Current time as Unix milliseconds, the storage-wide timestamp unit.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
