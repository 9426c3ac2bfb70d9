use sqlx::{QueryBuilder, SqliteConnection};

use super::schema::Database;
use super::types::{Entry, EntryEditOp, EntryRow, StoreError};
use crate::feed::ParsedItem;

const ENTRY_COLUMNS: &str = r#"
    id,
    feed_id,
    title,
    is_read,
    ext_id,
    update_time,
    publication_time,
    description,
    content,
    url
"#;

impl Database {
    /// List a feed's entries, most recent first. Entries without an update
    /// time sort by their publication time instead.
    pub async fn list_entries(&self, feed_id: i64) -> Result<Vec<Entry>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        // Listing an unknown feed is an error, not an empty list.
        super::feeds::get_feed(&mut conn, feed_id).await?;
        get_feed_entries(&mut conn, feed_id).await
    }

    /// Fetch a single entry by id.
    pub async fn get_entry(&self, id: i64) -> Result<Entry, StoreError> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM entries WHERE id = ?");
        let row: Option<EntryRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(EntryRow::into_entry)
            .ok_or(StoreError::EntryNotFound(id))
    }

    /// Apply field-level entry edits in input order, atomically.
    pub async fn edit_entries(&self, ops: &[EntryEditOp]) -> Result<Vec<Entry>, StoreError> {
        let _writer = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let mut entries = Vec::with_capacity(ops.len());
        for op in ops {
            if let Some(is_read) = op.is_read {
                sqlx::query("UPDATE entries SET is_read = ? WHERE id = ?")
                    .bind(is_read)
                    .bind(op.id)
                    .execute(&mut *tx)
                    .await?;
            }
            let sql = format!("SELECT {ENTRY_COLUMNS} FROM entries WHERE id = ?");
            let row: Option<EntryRow> = sqlx::query_as(&sql)
                .bind(op.id)
                .fetch_optional(&mut *tx)
                .await?;
            entries.push(
                row.map(EntryRow::into_entry)
                    .ok_or(StoreError::EntryNotFound(op.id))?,
            );
        }

        tx.commit().await?;
        Ok(entries)
    }
}

// ============================================================================
// Shared statement helpers
// ============================================================================

pub(crate) async fn get_feed_entries(
    conn: &mut SqliteConnection,
    feed_id: i64,
) -> Result<Vec<Entry>, StoreError> {
    let sql = format!(
        r#"
        SELECT {ENTRY_COLUMNS} FROM entries
        WHERE feed_id = ?
        ORDER BY COALESCE(update_time, publication_time) DESC
    "#
    );
    let rows: Vec<EntryRow> = sqlx::query_as(&sql).bind(feed_id).fetch_all(conn).await?;
    Ok(rows.into_iter().map(EntryRow::into_entry).collect())
}

/// Insert a parsed item as a fresh, unread entry.
pub(crate) async fn insert_entry(
    conn: &mut SqliteConnection,
    feed_id: i64,
    item: &ParsedItem,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO entries
            (feed_id, ext_id, title, description, content, url, update_time, publication_time)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
    "#,
    )
    .bind(feed_id)
    .bind(&item.ext_id)
    .bind(&item.title)
    .bind(&item.description)
    .bind(&item.content)
    .bind(&item.url)
    .bind(item.resolved_updated())
    .bind(item.resolved_published())
    .execute(conn)
    .await?;
    Ok(())
}

/// Overwrite an existing entry's content and timestamps with the fetched
/// item. Local state (`is_read`) is preserved.
pub(crate) async fn update_entry(
    conn: &mut SqliteConnection,
    feed_id: i64,
    item: &ParsedItem,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE entries
        SET title = ?, description = ?, content = ?, url = ?,
            update_time = ?, publication_time = ?
        WHERE feed_id = ? AND ext_id = ?
    "#,
    )
    .bind(&item.title)
    .bind(&item.description)
    .bind(&item.content)
    .bind(&item.url)
    .bind(item.resolved_updated())
    .bind(item.resolved_published())
    .bind(feed_id)
    .bind(&item.ext_id)
    .execute(conn)
    .await?;
    Ok(())
}

/// Read back the entries matching the given external ids, newest first.
/// An empty id set short-circuits to an empty list.
pub(crate) async fn get_entries_by_ext_ids(
    conn: &mut SqliteConnection,
    feed_id: i64,
    ext_ids: &[&str],
) -> Result<Vec<Entry>, StoreError> {
    if ext_ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(format!(
        "SELECT {ENTRY_COLUMNS} FROM entries WHERE feed_id = "
    ));
    builder.push_bind(feed_id);
    builder.push(" AND ext_id IN (");
    let mut separated = builder.separated(", ");
    for ext_id in ext_ids {
        separated.push_bind(*ext_id);
    }
    separated.push_unseparated(")");
    builder.push(" ORDER BY COALESCE(update_time, publication_time) DESC");

    let rows: Vec<EntryRow> = builder.build_query_as().fetch_all(conn).await?;
    Ok(rows.into_iter().map(EntryRow::into_entry).collect())
}
