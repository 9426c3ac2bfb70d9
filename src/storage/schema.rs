use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use tokio::sync::Mutex;

use super::types::StoreError;

// ============================================================================
// Database
// ============================================================================

/// Handle to the feed store. Cheap to clone; all clones share the pool and
/// the writer lock.
#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
    /// Serializes write transactions store-wide. SQLite is single-writer;
    /// taking this lock before `begin()` turns lock contention into queueing
    /// instead of SQLITE_BUSY failures, and keeps concurrent pulls and edits
    /// from interleaving their writes.
    pub(crate) write_lock: Arc<Mutex<()>>,
}

impl Database {
    /// Open a database connection pool and run migrations.
    ///
    /// Pass `":memory:"` for an ephemeral store (used throughout the tests).
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        let in_memory = path == ":memory:";

        // busy_timeout=5000: wait up to 5s for locks instead of failing with
        // SQLITE_BUSY. foreign_keys is per-connection, so both pragmas go on
        // the connect options to cover every pooled connection.
        let options = if in_memory {
            SqliteConnectOptions::new().in_memory(true)
        } else {
            SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path))?
        }
        .pragma("busy_timeout", "5000")
        .pragma("foreign_keys", "ON");

        // An in-memory database exists per connection, so the pool must not
        // open more than one.
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await?;

        let db = Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        };
        db.migrate().await?;
        Ok(db)
    }

    /// Run schema migrations atomically within one transaction.
    ///
    /// All statements use `IF NOT EXISTS`, so re-running on an existing
    /// database is a no-op.
    async fn migrate(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feeds (
                id INTEGER PRIMARY KEY,
                title TEXT NOT NULL,
                description TEXT,
                feed_url TEXT UNIQUE NOT NULL,
                site_url TEXT,
                is_starred INTEGER NOT NULL DEFAULT 0,
                subscription_time INTEGER NOT NULL,
                update_time INTEGER,
                last_pull_time INTEGER
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entries (
                id INTEGER PRIMARY KEY,
                feed_id INTEGER NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
                ext_id TEXT NOT NULL,
                title TEXT NOT NULL,
                is_read INTEGER NOT NULL DEFAULT 0,
                description TEXT,
                content TEXT,
                url TEXT,
                update_time INTEGER,
                publication_time INTEGER,
                UNIQUE(feed_id, ext_id)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feed_tags (
                id INTEGER PRIMARY KEY,
                name TEXT UNIQUE NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feeds_x_feed_tags (
                feed_id INTEGER NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
                feed_tag_id INTEGER NOT NULL REFERENCES feed_tags(id),
                PRIMARY KEY(feed_id, feed_tag_id)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_entries_feed ON entries(feed_id)")
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}
