use std::collections::HashSet;

use sqlx::{QueryBuilder, SqliteConnection};

use super::entries::{get_feed_entries, insert_entry};
use super::schema::Database;
use super::types::{feed_from_row, now_ms, Feed, FeedEditOp, FeedRow, NewFeed, Stats, StoreError};
use crate::feed::opml::{self, Outline};

const FEED_COLUMNS: &str = r#"
    f.id,
    f.title,
    f.description,
    f.feed_url,
    f.site_url,
    f.is_starred,
    f.subscription_time,
    f.update_time,
    f.last_pull_time,
    json_group_array(ft.name) FILTER (WHERE ft.name IS NOT NULL) AS tags
"#;

impl Database {
    // ========================================================================
    // Feed Operations
    // ========================================================================

    /// Subscribe to a new feed.
    ///
    /// Fails with [`StoreError::FeedExists`] when the URL is already
    /// subscribed. The returned feed carries the entries of the initial
    /// fetch, which may be empty.
    pub async fn add_feed(&self, new: NewFeed) -> Result<Feed, StoreError> {
        let _writer = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        if feed_url_exists(&mut tx, &new.feed_url).await? {
            return Err(StoreError::FeedExists(new.feed_url));
        }

        let feed_id = insert_feed_row(&mut tx, &new, now_ms()).await?;
        for item in &new.entries {
            insert_entry(&mut tx, feed_id, item).await?;
        }
        replace_feed_tags(&mut tx, feed_id, &new.tags).await?;

        let mut feed = get_feed(&mut tx, feed_id).await?;
        feed.entries = get_feed_entries(&mut tx, feed_id).await?;

        tx.commit().await?;

        tracing::info!(
            feed_id = feed.id,
            url = %feed.feed_url,
            entries = feed.entries.len(),
            "feed subscribed"
        );
        Ok(feed)
    }

    /// List all subscribed feeds, most recently updated (or subscribed)
    /// first. Entry lists are not populated here.
    pub async fn list_feeds(&self) -> Result<Vec<Feed>, StoreError> {
        let sql = format!(
            r#"
            SELECT {FEED_COLUMNS}
            FROM feeds f
                LEFT JOIN feeds_x_feed_tags fxft ON fxft.feed_id = f.id
                LEFT JOIN feed_tags ft ON fxft.feed_tag_id = ft.id
            GROUP BY f.id
            ORDER BY COALESCE(f.update_time, f.subscription_time) DESC
        "#
        );
        let rows: Vec<FeedRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(feed_from_row).collect())
    }

    /// Apply field-level edits, one feed per op, in input order.
    ///
    /// The whole call is one transaction: the first failing op rolls back
    /// every previous op's writes.
    pub async fn edit_feeds(&self, ops: &[FeedEditOp]) -> Result<Vec<Feed>, StoreError> {
        let _writer = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let mut feeds = Vec::with_capacity(ops.len());
        for op in ops {
            apply_feed_edit(&mut tx, op).await?;
            feeds.push(get_feed(&mut tx, op.id).await?);
        }

        tx.commit().await?;
        Ok(feeds)
    }

    /// Delete feeds by id, cascading to their entries and pruning tags left
    /// unreferenced. Best-effort over the set: unknown ids are ignored.
    pub async fn delete_feeds(&self, ids: &[i64]) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }

        let _writer = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let mut builder: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new("DELETE FROM feeds WHERE id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");
        let deleted = builder.build().execute(&mut *tx).await?.rows_affected();

        prune_orphan_tags(&mut tx).await?;
        tx.commit().await?;

        tracing::info!(requested = ids.len(), deleted = deleted, "feeds deleted");
        Ok(())
    }

    /// Subscription-wide statistics.
    pub async fn stats(&self) -> Result<Stats, StoreError> {
        let row: (i64, i64, i64, Option<i64>, Option<i64>) = sqlx::query_as(
            r#"
            SELECT
                (SELECT COUNT(*) FROM feeds),
                (SELECT COUNT(*) FROM entries),
                (SELECT COUNT(*) FROM entries WHERE is_read = 0),
                (SELECT MAX(last_pull_time) FROM feeds),
                (SELECT MAX(update_time) FROM feeds)
        "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(Stats {
            num_feeds: row.0,
            num_entries: row.1,
            num_entries_unread: row.2,
            last_pull_time: row.3,
            most_recent_update_time: row.4,
        })
    }

    // ========================================================================
    // OPML Bridge
    // ========================================================================

    /// Serialize all current subscriptions into an OPML payload.
    pub async fn export_opml(&self, title: Option<&str>) -> Result<String, StoreError> {
        let feeds = self.list_feeds().await?;
        let outlines: Vec<Outline> = feeds
            .into_iter()
            .map(|f| Outline {
                title: f.title,
                xml_url: f.feed_url,
                html_url: f.site_url,
            })
            .collect();
        Ok(opml::encode(title, &outlines)?)
    }

    /// Subscribe every outline of an OPML payload whose URL is not yet in
    /// the store. No network fetch happens here; entries arrive on the next
    /// pull. Returns `(num_processed, num_imported)`.
    pub async fn import_opml(&self, payload: &str) -> Result<(u32, u32), StoreError> {
        let outlines = opml::decode(payload)?;

        let _writer = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let mut num_processed = 0u32;
        let mut num_imported = 0u32;
        for outline in outlines {
            num_processed += 1;
            if feed_url_exists(&mut tx, &outline.xml_url).await? {
                continue;
            }
            let new = NewFeed {
                title: outline.title,
                description: None,
                feed_url: outline.xml_url,
                site_url: outline.html_url,
                is_starred: false,
                tags: Vec::new(),
                updated: None,
                entries: Vec::new(),
            };
            insert_feed_row(&mut tx, &new, now_ms()).await?;
            num_imported += 1;
        }

        tx.commit().await?;

        tracing::info!(
            processed = num_processed,
            imported = num_imported,
            "OPML import finished"
        );
        Ok((num_processed, num_imported))
    }
}

// ============================================================================
// Shared statement helpers (used by CRUD and by the puller's transaction)
// ============================================================================

pub(crate) async fn get_feed(conn: &mut SqliteConnection, id: i64) -> Result<Feed, StoreError> {
    let sql = format!(
        r#"
        SELECT {FEED_COLUMNS}
        FROM feeds f
            LEFT JOIN feeds_x_feed_tags fxft ON fxft.feed_id = f.id
            LEFT JOIN feed_tags ft ON fxft.feed_tag_id = ft.id
        WHERE f.id = ?
        GROUP BY f.id
    "#
    );
    let row: Option<FeedRow> = sqlx::query_as(&sql).bind(id).fetch_optional(conn).await?;
    row.map(feed_from_row).ok_or(StoreError::FeedNotFound(id))
}

pub(crate) async fn feed_url_exists(
    conn: &mut SqliteConnection,
    url: &str,
) -> Result<bool, StoreError> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT id FROM feeds WHERE feed_url = ?")
        .bind(url)
        .fetch_optional(conn)
        .await?;
    Ok(row.is_some())
}

async fn insert_feed_row(
    conn: &mut SqliteConnection,
    new: &NewFeed,
    subscribed: i64,
) -> Result<i64, StoreError> {
    let row: (i64,) = sqlx::query_as(
        r#"
        INSERT INTO feeds (title, description, feed_url, site_url, is_starred, subscription_time, update_time)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        RETURNING id
    "#,
    )
    .bind(&new.title)
    .bind(&new.description)
    .bind(&new.feed_url)
    .bind(&new.site_url)
    .bind(new.is_starred)
    .bind(subscribed)
    .bind(new.updated)
    .fetch_one(conn)
    .await?;
    Ok(row.0)
}

async fn apply_feed_edit(conn: &mut SqliteConnection, op: &FeedEditOp) -> Result<(), StoreError> {
    // Existence check up front so a no-field op still reports NotFound.
    get_feed(&mut *conn, op.id).await?;

    if let Some(ref title) = op.title {
        sqlx::query("UPDATE feeds SET title = ? WHERE id = ?")
            .bind(title)
            .bind(op.id)
            .execute(&mut *conn)
            .await?;
    }
    if let Some(ref description) = op.description {
        sqlx::query("UPDATE feeds SET description = ? WHERE id = ?")
            .bind(description)
            .bind(op.id)
            .execute(&mut *conn)
            .await?;
    }
    if let Some(is_starred) = op.is_starred {
        sqlx::query("UPDATE feeds SET is_starred = ? WHERE id = ?")
            .bind(is_starred)
            .bind(op.id)
            .execute(&mut *conn)
            .await?;
    }
    if let Some(ref tags) = op.tags {
        sqlx::query("DELETE FROM feeds_x_feed_tags WHERE feed_id = ?")
            .bind(op.id)
            .execute(&mut *conn)
            .await?;
        replace_feed_tags(&mut *conn, op.id, tags).await?;
        prune_orphan_tags(&mut *conn).await?;
    }
    Ok(())
}

/// Insert the given tag names (deduplicated, order-preserving) and associate
/// them with the feed. Existing associations are kept; callers wanting a
/// full replace delete the join rows first.
async fn replace_feed_tags(
    conn: &mut SqliteConnection,
    feed_id: i64,
    tags: &[String],
) -> Result<(), StoreError> {
    let mut seen = HashSet::new();
    for tag in tags {
        if !seen.insert(tag.as_str()) {
            continue;
        }
        sqlx::query("INSERT OR IGNORE INTO feed_tags (name) VALUES (?)")
            .bind(tag)
            .execute(&mut *conn)
            .await?;
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO feeds_x_feed_tags (feed_id, feed_tag_id)
            SELECT ?, id FROM feed_tags WHERE name = ?
        "#,
        )
        .bind(feed_id)
        .bind(tag)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// Remove tag rows no feed references anymore.
pub(crate) async fn prune_orphan_tags(conn: &mut SqliteConnection) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        DELETE FROM feed_tags
        WHERE id IN (
            SELECT ft.id
            FROM feed_tags ft
                LEFT JOIN feeds_x_feed_tags fxft ON fxft.feed_tag_id = ft.id
            WHERE fxft.feed_id IS NULL
        )
    "#,
    )
    .execute(conn)
    .await?;
    Ok(())
}

/// Set the feed's resolved update time and record the poll attempt.
pub(crate) async fn record_pull(
    conn: &mut SqliteConnection,
    feed_id: i64,
    updated: Option<i64>,
    pulled_at: i64,
) -> Result<(), StoreError> {
    sqlx::query("UPDATE feeds SET update_time = ?, last_pull_time = ? WHERE id = ?")
        .bind(updated)
        .bind(pulled_at)
        .bind(feed_id)
        .execute(conn)
        .await?;
    Ok(())
}

/// A feed's items as stored, reduced to the diff inputs.
pub(crate) async fn get_entry_keys(
    conn: &mut SqliteConnection,
    feed_id: i64,
) -> Result<Vec<(String, Option<i64>)>, StoreError> {
    let rows: Vec<(String, Option<i64>)> =
        sqlx::query_as("SELECT ext_id, update_time FROM entries WHERE feed_id = ?")
            .bind(feed_id)
            .fetch_all(conn)
            .await?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use crate::storage::{Database, FeedEditOp, NewFeed};
    use pretty_assertions::assert_eq;

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    fn new_feed(url: &str, title: &str) -> NewFeed {
        NewFeed {
            title: title.to_string(),
            description: Some("A test feed".to_string()),
            feed_url: url.to_string(),
            site_url: Some("http://example.com".to_string()),
            is_starred: false,
            tags: Vec::new(),
            updated: None,
            entries: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_add_feed_and_list() {
        let db = test_db().await;
        let feed = db
            .add_feed(new_feed("http://a.com/feed.xml", "Feed A"))
            .await
            .unwrap();
        assert!(feed.id > 0);
        assert_eq!(feed.title, "Feed A");
        assert!(feed.subscribed > 0);
        assert_eq!(feed.last_pulled, None);

        let feeds = db.list_feeds().await.unwrap();
        assert_eq!(feeds.len(), 1);
        assert_eq!(feeds[0].feed_url, "http://a.com/feed.xml");
    }

    #[tokio::test]
    async fn test_add_feed_duplicate_url_rejected() {
        let db = test_db().await;
        db.add_feed(new_feed("http://a.com/feed.xml", "Feed A"))
            .await
            .unwrap();

        let err = db
            .add_feed(new_feed("http://a.com/feed.xml", "Feed A again"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::storage::StoreError::FeedExists(url) if url == "http://a.com/feed.xml"
        ));

        // The duplicate attempt must not have touched the stored title.
        let feeds = db.list_feeds().await.unwrap();
        assert_eq!(feeds.len(), 1);
        assert_eq!(feeds[0].title, "Feed A");
    }

    #[tokio::test]
    async fn test_add_feed_with_tags_dedups() {
        let db = test_db().await;
        let mut new = new_feed("http://a.com/feed.xml", "Feed A");
        new.tags = vec!["news".into(), "rust".into(), "news".into()];

        let feed = db.add_feed(new).await.unwrap();
        assert_eq!(feed.tags, vec!["news".to_string(), "rust".to_string()]);
    }

    #[tokio::test]
    async fn test_list_feeds_ordering() {
        let db = test_db().await;
        let mut a = new_feed("http://a.com/feed.xml", "Feed A");
        a.updated = Some(100);
        let mut x = new_feed("http://x.com/feed.xml", "Feed X");
        x.updated = Some(200);
        db.add_feed(a).await.unwrap();
        db.add_feed(x).await.unwrap();

        let feeds = db.list_feeds().await.unwrap();
        assert_eq!(feeds[0].title, "Feed X");
        assert_eq!(feeds[1].title, "Feed A");
    }

    #[tokio::test]
    async fn test_edit_feed_fields() {
        let db = test_db().await;
        let feed = db
            .add_feed(new_feed("http://a.com/feed.xml", "Feed A"))
            .await
            .unwrap();

        let edited = db
            .edit_feeds(&[FeedEditOp {
                id: feed.id,
                title: Some("Renamed".into()),
                is_starred: Some(true),
                ..Default::default()
            }])
            .await
            .unwrap();

        assert_eq!(edited.len(), 1);
        assert_eq!(edited[0].title, "Renamed");
        assert!(edited[0].is_starred);
        // Unset fields are untouched.
        assert_eq!(edited[0].description.as_deref(), Some("A test feed"));
    }

    #[tokio::test]
    async fn test_edit_feed_unknown_id_rolls_back() {
        let db = test_db().await;
        let feed = db
            .add_feed(new_feed("http://a.com/feed.xml", "Feed A"))
            .await
            .unwrap();

        let err = db
            .edit_feeds(&[
                FeedEditOp {
                    id: feed.id,
                    title: Some("Renamed".into()),
                    ..Default::default()
                },
                FeedEditOp {
                    id: 9999,
                    title: Some("Ghost".into()),
                    ..Default::default()
                },
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, crate::storage::StoreError::FeedNotFound(9999)));

        // First op rolled back with the failing call.
        let feeds = db.list_feeds().await.unwrap();
        assert_eq!(feeds[0].title, "Feed A");
    }

    #[tokio::test]
    async fn test_tag_replace_prunes_orphans() {
        let db = test_db().await;
        let mut new = new_feed("http://a.com/feed.xml", "Feed A");
        new.tags = vec!["news".into(), "rust".into()];
        let feed = db.add_feed(new).await.unwrap();

        let edited = db
            .edit_feeds(&[FeedEditOp {
                id: feed.id,
                tags: Some(vec!["tech".into()]),
                ..Default::default()
            }])
            .await
            .unwrap();
        assert_eq!(edited[0].tags, vec!["tech".to_string()]);

        // Clearing the set leaves no associations and no orphan rows.
        let edited = db
            .edit_feeds(&[FeedEditOp {
                id: feed.id,
                tags: Some(Vec::new()),
                ..Default::default()
            }])
            .await
            .unwrap();
        assert!(edited[0].tags.is_empty());

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM feed_tags")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_tags_shared_across_feeds_survive_replace() {
        let db = test_db().await;
        let mut a = new_feed("http://a.com/feed.xml", "Feed A");
        a.tags = vec!["shared".into()];
        let mut x = new_feed("http://x.com/feed.xml", "Feed X");
        x.tags = vec!["shared".into()];
        let feed_a = db.add_feed(a).await.unwrap();
        let feed_x = db.add_feed(x).await.unwrap();

        db.edit_feeds(&[FeedEditOp {
            id: feed_a.id,
            tags: Some(Vec::new()),
            ..Default::default()
        }])
        .await
        .unwrap();

        let feeds = db.list_feeds().await.unwrap();
        let x = feeds.iter().find(|f| f.id == feed_x.id).unwrap();
        assert_eq!(x.tags, vec!["shared".to_string()]);
    }

    #[tokio::test]
    async fn test_delete_feeds_best_effort() {
        let db = test_db().await;
        let feed = db
            .add_feed(new_feed("http://a.com/feed.xml", "Feed A"))
            .await
            .unwrap();

        // Unknown ids are not an error.
        db.delete_feeds(&[feed.id, 424242]).await.unwrap();
        assert!(db.list_feeds().await.unwrap().is_empty());

        db.delete_feeds(&[]).await.unwrap();
    }

    #[tokio::test]
    async fn test_stats() {
        let db = test_db().await;
        assert_eq!(db.stats().await.unwrap().num_feeds, 0);

        let mut new = new_feed("http://a.com/feed.xml", "Feed A");
        new.updated = Some(500);
        db.add_feed(new).await.unwrap();

        let stats = db.stats().await.unwrap();
        assert_eq!(stats.num_feeds, 1);
        assert_eq!(stats.num_entries, 0);
        assert_eq!(stats.most_recent_update_time, Some(500));
        assert_eq!(stats.last_pull_time, None);
    }
}
