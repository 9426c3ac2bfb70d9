//! Concurrent feed polling.
//!
//! A pull batch runs inside a single write transaction shared by all
//! per-feed workers. Fetching and parsing happen fully in parallel; the
//! transaction is guarded by a mutex, so workers serialize only for their
//! brief store phase. Results stream out in completion order and the
//! transaction commits once every worker has finished.

use std::sync::Arc;
use std::time::Duration;

use sqlx::{QueryBuilder, Sqlite, SqliteConnection, Transaction};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio::time::Instant;

use super::entries::{get_entries_by_ext_ids, insert_entry, update_entry};
use super::feeds::{get_entry_keys, get_feed, record_pull};
use super::schema::Database;
use super::types::{now_ms, Feed, StoreError};
use crate::feed::diff::diff_entries;
use crate::feed::{FeedFetcher, FetchError, ParsedFeed};

/// Why a feed, or the whole batch, failed to pull.
#[derive(Debug, Error)]
pub enum PullError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// The batch deadline expired before this feed's fetch completed.
    #[error("pull deadline exceeded")]
    DeadlineExceeded,

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The batch shut down before its transaction could be committed.
    #[error("pull batch shut down before completion")]
    Shutdown,
}

/// One message on the pull stream.
///
/// `Success` and `Failure` are per-feed outcomes; `Aborted` is a batch-level
/// fault (the transaction failed to open or commit) after which no feed's
/// writes survive.
#[derive(Debug)]
pub enum PullResult {
    /// The feed synced. `entries` holds only the entries this pull inserted
    /// or updated, newest first.
    Success(Feed),
    Failure {
        feed_id: i64,
        url: String,
        error: PullError,
    },
    Aborted(PullError),
}

#[derive(Debug, Clone)]
struct PullKey {
    id: i64,
    url: String,
}

type SharedTx = Arc<Mutex<Transaction<'static, Sqlite>>>;

impl Database {
    /// Pull feeds concurrently and stream per-feed results.
    ///
    /// `selection` limits the batch to the given feed ids (unknown ids are
    /// skipped); `None` pulls every feed. `deadline` bounds the whole batch:
    /// fetches still in flight when it expires fail with
    /// [`PullError::DeadlineExceeded`], but feeds already synced keep their
    /// writes. The channel closes once the batch transaction is resolved.
    pub fn pull_feeds(
        &self,
        fetcher: Arc<FeedFetcher>,
        selection: Option<Vec<i64>>,
        deadline: Option<Duration>,
    ) -> mpsc::Receiver<PullResult> {
        let (out, rx) = mpsc::channel(16);
        let db = self.clone();
        tokio::spawn(async move {
            run_pull(db, fetcher, selection, deadline, out).await;
        });
        rx
    }
}

async fn run_pull(
    db: Database,
    fetcher: Arc<FeedFetcher>,
    selection: Option<Vec<i64>>,
    deadline: Option<Duration>,
    out: mpsc::Sender<PullResult>,
) {
    let _writer = db.write_lock.clone().lock_owned().await;

    let mut tx = match db.pool.begin().await {
        Ok(tx) => tx,
        Err(e) => {
            let _ = out.send(PullResult::Aborted(StoreError::from(e).into())).await;
            return;
        }
    };

    let keys = match get_pull_keys(&mut tx, selection.as_deref()).await {
        Ok(keys) => keys,
        Err(e) => {
            let _ = out.send(PullResult::Aborted(e.into())).await;
            return;
        }
    };
    if keys.is_empty() {
        return;
    }

    tracing::info!(feeds = keys.len(), "pull batch started");
    let deadline = deadline.map(|d| Instant::now() + d);
    let shared: SharedTx = Arc::new(Mutex::new(tx));

    let mut workers = JoinSet::new();
    for key in keys {
        workers.spawn(pull_one(fetcher.clone(), shared.clone(), key, deadline));
    }

    let mut num_ok = 0usize;
    let mut num_failed = 0usize;
    while let Some(joined) = workers.join_next().await {
        let Ok(result) = joined else { continue };
        match &result {
            PullResult::Success(_) => num_ok += 1,
            _ => num_failed += 1,
        }
        // A dropped receiver stops delivery but not the batch; completed
        // syncs still commit below.
        let _ = out.send(result).await;
    }

    // Every worker has joined, so ours is the only handle left.
    let tx = match Arc::try_unwrap(shared) {
        Ok(mutex) => mutex.into_inner(),
        Err(_) => {
            let _ = out.send(PullResult::Aborted(PullError::Shutdown)).await;
            return;
        }
    };
    if let Err(e) = tx.commit().await {
        let _ = out.send(PullResult::Aborted(StoreError::from(e).into())).await;
        return;
    }

    tracing::info!(ok = num_ok, failed = num_failed, "pull batch committed");
}

async fn get_pull_keys(
    conn: &mut SqliteConnection,
    selection: Option<&[i64]>,
) -> Result<Vec<PullKey>, StoreError> {
    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT id, feed_url FROM feeds");
    if let Some(ids) = selection {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        builder.push(" WHERE id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");
    }

    let rows: Vec<(i64, String)> = builder.build_query_as().fetch_all(conn).await?;
    Ok(rows
        .into_iter()
        .map(|(id, url)| PullKey { id, url })
        .collect())
}

/// Fetch one feed and sync it into the shared transaction.
///
/// The fetch happens without holding the transaction lock; only the store
/// phase serializes.
async fn pull_one(
    fetcher: Arc<FeedFetcher>,
    tx: SharedTx,
    key: PullKey,
    deadline: Option<Instant>,
) -> PullResult {
    let fetched = match deadline {
        Some(at) => match tokio::time::timeout_at(at, fetcher.fetch(&key.url)).await {
            Ok(result) => result,
            Err(_) => {
                return PullResult::Failure {
                    feed_id: key.id,
                    url: key.url,
                    error: PullError::DeadlineExceeded,
                }
            }
        },
        None => fetcher.fetch(&key.url).await,
    };
    let parsed = match fetched {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::warn!(feed_id = key.id, url = %key.url, error = %e, "feed fetch failed");
            return PullResult::Failure {
                feed_id: key.id,
                url: key.url,
                error: e.into(),
            };
        }
    };

    let mut guard = tx.lock().await;
    match sync_one(&mut guard, key.id, &parsed).await {
        Ok(feed) => {
            tracing::debug!(
                feed_id = key.id,
                changed = feed.entries.len(),
                "feed synced"
            );
            PullResult::Success(feed)
        }
        Err(e) => PullResult::Failure {
            feed_id: key.id,
            url: key.url,
            error: e.into(),
        },
    }
}

/// Apply one fetched feed to the store and read back what changed.
async fn sync_one(
    conn: &mut SqliteConnection,
    feed_id: i64,
    parsed: &ParsedFeed,
) -> Result<Feed, StoreError> {
    // The pull attempt is recorded even when no item changed.
    record_pull(&mut *conn, feed_id, parsed.resolved_updated(), now_ms()).await?;

    let existing = get_entry_keys(&mut *conn, feed_id).await?;
    let diff = diff_entries(&existing, &parsed.items);
    for item in &diff.inserts {
        insert_entry(&mut *conn, feed_id, item).await?;
    }
    for item in &diff.updates {
        update_entry(&mut *conn, feed_id, item).await?;
    }

    let changed = diff.changed_ext_ids();
    let mut feed = get_feed(&mut *conn, feed_id).await?;
    feed.entries = get_entries_by_ext_ids(&mut *conn, feed_id, &changed).await?;
    Ok(feed)
}
