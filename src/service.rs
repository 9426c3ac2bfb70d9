//! The service surface: every remote-facing operation as a typed method.
//!
//! [`FeedService`] composes the store and the fetcher. Transports stay out
//! of this module; request and response types are plain serde structs so a
//! wire layer can map onto them directly.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::feed::{FeedFetcher, FetchError};
use crate::storage::{
    Database, Entry, EntryEditOp, Feed, FeedEditOp, NewFeed, PullResult, Stats, StoreError,
};
use crate::version;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The initial fetch of a new subscription failed.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("invalid feed URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
}

// ============================================================================
// Request / Response Types
// ============================================================================

/// Subscribe to a feed. Unset metadata fields take the values the feed
/// document itself provides.
#[derive(Debug, Clone, Deserialize)]
pub struct AddFeedRequest {
    pub url: String,
    pub title: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub is_starred: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PullFeedsRequest {
    /// Restrict the pull to these feed ids; `None` pulls everything.
    pub feed_ids: Option<Vec<i64>>,
    /// Overall batch deadline in seconds.
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportOpmlResponse {
    pub num_processed: u32,
    pub num_imported: u32,
}

/// Build identity.
#[derive(Debug, Clone, Serialize)]
pub struct Info {
    pub name: &'static str,
    pub version: &'static str,
    pub git_commit: Option<&'static str>,
    pub build_time: Option<&'static str>,
}

// ============================================================================
// FeedService
// ============================================================================

#[derive(Clone)]
pub struct FeedService {
    db: Database,
    fetcher: Arc<FeedFetcher>,
}

impl FeedService {
    pub fn new(db: Database, fetcher: Arc<FeedFetcher>) -> Self {
        Self { db, fetcher }
    }

    /// Fetch the feed once to validate it and seed its entries, then store
    /// the subscription. Request fields override parsed metadata.
    pub async fn add_feed(&self, req: AddFeedRequest) -> Result<Feed, ServiceError> {
        url::Url::parse(&req.url).map_err(|e| ServiceError::InvalidUrl {
            url: req.url.clone(),
            reason: e.to_string(),
        })?;

        let parsed = self.fetcher.fetch(&req.url).await?;
        let updated = parsed.resolved_updated();
        // Untitled feeds fall back to their URL.
        let title = req
            .title
            .or(parsed.title)
            .unwrap_or_else(|| req.url.clone());
        let new = NewFeed {
            title,
            description: req.description.or(parsed.description),
            feed_url: req.url,
            site_url: parsed.site_url,
            is_starred: req.is_starred,
            tags: req.tags,
            updated,
            entries: parsed.items,
        };
        Ok(self.db.add_feed(new).await?)
    }

    pub async fn list_feeds(&self) -> Result<Vec<Feed>, ServiceError> {
        Ok(self.db.list_feeds().await?)
    }

    pub async fn edit_feeds(&self, ops: &[FeedEditOp]) -> Result<Vec<Feed>, ServiceError> {
        Ok(self.db.edit_feeds(ops).await?)
    }

    pub async fn delete_feeds(&self, ids: &[i64]) -> Result<(), ServiceError> {
        Ok(self.db.delete_feeds(ids).await?)
    }

    /// Start a pull batch and return the result stream.
    pub fn pull_feeds(&self, req: PullFeedsRequest) -> mpsc::Receiver<PullResult> {
        let deadline = req.timeout_secs.map(Duration::from_secs);
        self.db
            .pull_feeds(self.fetcher.clone(), req.feed_ids, deadline)
    }

    pub async fn list_entries(&self, feed_id: i64) -> Result<Vec<Entry>, ServiceError> {
        Ok(self.db.list_entries(feed_id).await?)
    }

    pub async fn get_entry(&self, id: i64) -> Result<Entry, ServiceError> {
        Ok(self.db.get_entry(id).await?)
    }

    pub async fn edit_entries(&self, ops: &[EntryEditOp]) -> Result<Vec<Entry>, ServiceError> {
        Ok(self.db.edit_entries(ops).await?)
    }

    pub async fn export_opml(&self, title: Option<&str>) -> Result<String, ServiceError> {
        Ok(self.db.export_opml(title).await?)
    }

    pub async fn import_opml(&self, payload: &str) -> Result<ImportOpmlResponse, ServiceError> {
        let (num_processed, num_imported) = self.db.import_opml(payload).await?;
        Ok(ImportOpmlResponse {
            num_processed,
            num_imported,
        })
    }

    pub async fn get_stats(&self) -> Result<Stats, ServiceError> {
        Ok(self.db.stats().await?)
    }

    pub fn get_info(&self) -> Info {
        Info {
            name: version::APP_NAME,
            version: version::version(),
            git_commit: version::git_commit(),
            build_time: version::build_time(),
        }
    }
}
