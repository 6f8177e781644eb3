//! SQLite implementation of the state ports
//!
//! This module provides the concrete SQLite-based implementation of the
//! index, settings and history ports defined in driftsync-core. It handles
//! domain type serialization/deserialization and SQL query construction.
//!
//! ## Type Mapping
//!
//! | Domain Type    | SQL Type | Strategy                                        |
//! |----------------|----------|-------------------------------------------------|
//! | PathKey        | TEXT     | `.as_str()` / `PathKey::from_stored()`          |
//! | RemotePath     | TEXT     | `.as_str()` / `RemotePath::new()`               |
//! | Revision       | TEXT     | `.as_str()` / `Revision::new()`                 |
//! | ContentHash    | TEXT     | `.as_str()` / `ContentHash::new()`              |
//! | ItemType       | TEXT     | `Display` / `FromStr`                           |
//! | HistoryAction  | TEXT     | `Display` / `FromStr`                           |
//! | DateTime<Utc>  | TEXT     | `to_rfc3339()` / `DateTime::parse_from_rfc3339()` |
//! | ExclusionSet   | TEXT     | serde_json array under the `excluded_items` key |

use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use driftsync_core::domain::{
    ContentHash, Cursor, EventSource, ExclusionSet, HistoryAction, HistoryEntry, IndexEntry,
    ItemType, PathKey, RemotePath, Revision,
};
use driftsync_core::ports::{IHistoryStore, IIndexStore, ISettingsStore};

use crate::CacheError;

/// Settings keys
const KEY_EXCLUDED_ITEMS: &str = "excluded_items";
const KEY_CURSOR: &str = "cursor";
const KEY_LOCAL_ROOT: &str = "local_root";
const KEY_LAST_REINDEX: &str = "last_reindex";

/// SQLite-based implementation of the state ports
///
/// One instance serves the index, the settings and the history; all
/// operations go through the shared connection pool.
#[derive(Clone)]
pub struct SqliteStateRepository {
    pool: SqlitePool,
}

impl SqliteStateRepository {
    /// Creates a new repository instance with the given connection pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>, CacheError> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), CacheError> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_setting(&self, key: &str) -> Result<(), CacheError> {
        sqlx::query("DELETE FROM settings WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ============================================================================
// Helper functions for type conversion
// ============================================================================

/// Format a timestamp for storage; fixed precision keeps text ordering
/// identical to chronological ordering
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a DateTime<Utc> from an ISO 8601 string
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, CacheError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            CacheError::SerializationError(format!("Failed to parse datetime '{}': {}", s, e))
        })
}

/// Parse an optional DateTime<Utc> from an optional string
fn parse_optional_datetime(s: Option<String>) -> Result<Option<DateTime<Utc>>, CacheError> {
    match s {
        Some(ref val) if !val.is_empty() => parse_datetime(val).map(Some),
        _ => Ok(None),
    }
}

fn serialization<E: std::fmt::Display>(what: &'static str) -> impl FnOnce(E) -> CacheError {
    move |e| CacheError::SerializationError(format!("Invalid {what}: {e}"))
}

/// `LIKE` pattern matching every key strictly below `key`
fn descendant_pattern(key: &PathKey) -> String {
    let mut pattern = String::with_capacity(key.as_str().len() + 2);
    for c in key.as_str().chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    if key.as_str() != "/" {
        pattern.push('/');
    }
    pattern.push('%');
    pattern
}

// ============================================================================
// Row mapping functions
// ============================================================================

/// Reconstruct an IndexEntry from a database row
fn index_entry_from_row(row: &SqliteRow) -> Result<IndexEntry, CacheError> {
    let path_lower: String = row.try_get("path_lower")?;
    let path_cased: String = row.try_get("path_cased")?;
    let item_type: String = row.try_get("item_type")?;
    let revision: String = row.try_get("revision")?;
    let content_hash: Option<String> = row.try_get("content_hash")?;
    let local_mtime: Option<String> = row.try_get("local_mtime")?;

    let path = RemotePath::new(path_cased).map_err(serialization("path"))?;
    if path.key() != PathKey::from_stored(&path_lower) {
        return Err(CacheError::SerializationError(format!(
            "Key {path_lower} does not match path {path}"
        )));
    }
    let item_type = ItemType::from_str(&item_type).map_err(serialization("item type"))?;
    let revision = Revision::new(revision).map_err(serialization("revision"))?;
    let content_hash = content_hash
        .map(ContentHash::new)
        .transpose()
        .map_err(serialization("content hash"))?;
    let local_mtime = parse_optional_datetime(local_mtime)?;

    IndexEntry::restore(path, item_type, revision, content_hash, local_mtime)
        .map_err(serialization("index entry"))
}

/// Reconstruct a HistoryEntry from a database row
fn history_entry_from_row(row: &SqliteRow) -> Result<HistoryEntry, CacheError> {
    let path: String = row.try_get("path")?;
    let action: String = row.try_get("action")?;
    let item_type: String = row.try_get("item_type")?;
    let origin: String = row.try_get("origin")?;
    let timestamp: String = row.try_get("timestamp")?;

    let origin = match origin.as_str() {
        "local" => EventSource::Local,
        "remote" => EventSource::Remote,
        other => {
            return Err(CacheError::SerializationError(format!(
                "Unknown history origin: {other}"
            )))
        }
    };

    Ok(HistoryEntry {
        path: RemotePath::new(path).map_err(serialization("path"))?,
        action: HistoryAction::from_str(&action).map_err(serialization("action"))?,
        item_type: ItemType::from_str(&item_type).map_err(serialization("item type"))?,
        origin,
        timestamp: parse_datetime(&timestamp)?,
    })
}

async fn delete_entries_below<'e, E>(executor: E, key: &PathKey) -> Result<u64, CacheError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let result = sqlx::query(
        "DELETE FROM index_entries WHERE path_lower = ? OR path_lower LIKE ? ESCAPE '\\'",
    )
    .bind(key.as_str())
    .bind(descendant_pattern(key))
    .execute(executor)
    .await?;
    Ok(result.rows_affected())
}

async fn upsert_entry<'e, E>(executor: E, entry: &IndexEntry) -> Result<(), CacheError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(
        "INSERT INTO index_entries \
         (path_lower, path_cased, item_type, revision, content_hash, local_mtime) \
         VALUES (?, ?, ?, ?, ?, ?) \
         ON CONFLICT(path_lower) DO UPDATE SET \
         path_cased = excluded.path_cased, item_type = excluded.item_type, \
         revision = excluded.revision, content_hash = excluded.content_hash, \
         local_mtime = excluded.local_mtime",
    )
    .bind(entry.path_lower().as_str())
    .bind(entry.path_cased().as_str())
    .bind(entry.item_type().to_string())
    .bind(entry.revision().as_str())
    .bind(entry.content_hash().map(|h| h.as_str().to_string()))
    .bind(entry.local_mtime().as_ref().map(format_datetime))
    .execute(executor)
    .await?;
    Ok(())
}

// ============================================================================
// IIndexStore implementation
// ============================================================================

#[async_trait::async_trait]
impl IIndexStore for SqliteStateRepository {
    async fn load_all(&self) -> anyhow::Result<Vec<IndexEntry>> {
        let rows = sqlx::query("SELECT * FROM index_entries ORDER BY path_lower")
            .fetch_all(&self.pool)
            .await?;

        let entries = rows
            .iter()
            .map(index_entry_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!(count = entries.len(), "Loaded index");
        Ok(entries)
    }

    async fn put(&self, entry: &IndexEntry) -> anyhow::Result<()> {
        upsert_entry(&self.pool, entry).await?;
        tracing::trace!(path = %entry.path_cased(), "Saved index entry");
        Ok(())
    }

    async fn put_batch(&self, entries: &[IndexEntry]) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        for entry in entries {
            upsert_entry(&mut *tx, entry).await?;
        }
        tx.commit().await?;
        tracing::trace!(count = entries.len(), "Saved index batch");
        Ok(())
    }

    async fn delete(&self, key: &PathKey) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM index_entries WHERE path_lower = ?")
            .bind(key.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_subtree(&self, key: &PathKey) -> anyhow::Result<u64> {
        Ok(delete_entries_below(&self.pool, key).await?)
    }

    async fn replace_subtree(&self, key: &PathKey, entries: &[IndexEntry]) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        let removed = delete_entries_below(&mut *tx, key).await?;
        for entry in entries {
            upsert_entry(&mut *tx, entry).await?;
        }
        tx.commit().await?;
        tracing::trace!(%key, removed, written = entries.len(), "Replaced index subtree");
        Ok(())
    }

    async fn clear(&self) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM index_entries")
            .execute(&self.pool)
            .await?;
        tracing::info!("Index cleared");
        Ok(())
    }
}

// ============================================================================
// ISettingsStore implementation
// ============================================================================

#[async_trait::async_trait]
impl ISettingsStore for SqliteStateRepository {
    async fn get_excluded_items(&self) -> anyhow::Result<ExclusionSet> {
        match self.get_setting(KEY_EXCLUDED_ITEMS).await? {
            Some(json) => {
                let set: ExclusionSet = serde_json::from_str(&json)
                    .map_err(|e| CacheError::SerializationError(e.to_string()))?;
                Ok(set)
            }
            None => Ok(ExclusionSet::new()),
        }
    }

    async fn set_excluded_items(&self, items: &ExclusionSet) -> anyhow::Result<()> {
        let json = serde_json::to_string(items)
            .map_err(|e| CacheError::SerializationError(e.to_string()))?;
        self.set_setting(KEY_EXCLUDED_ITEMS, &json).await?;
        tracing::debug!(count = items.len(), "Saved excluded items");
        Ok(())
    }

    async fn get_cursor(&self) -> anyhow::Result<Option<Cursor>> {
        let value = self.get_setting(KEY_CURSOR).await?;
        Ok(value
            .map(Cursor::new)
            .transpose()
            .map_err(serialization("cursor"))?)
    }

    async fn set_cursor(&self, cursor: Option<&Cursor>) -> anyhow::Result<()> {
        match cursor {
            Some(c) => self.set_setting(KEY_CURSOR, c.as_str()).await?,
            None => self.delete_setting(KEY_CURSOR).await?,
        }
        Ok(())
    }

    async fn get_local_root(&self) -> anyhow::Result<Option<PathBuf>> {
        Ok(self.get_setting(KEY_LOCAL_ROOT).await?.map(PathBuf::from))
    }

    async fn set_local_root(&self, path: &Path) -> anyhow::Result<()> {
        let value = path.to_str().ok_or_else(|| {
            CacheError::SerializationError(format!("Path is not UTF-8: {}", path.display()))
        })?;
        self.set_setting(KEY_LOCAL_ROOT, value).await?;
        Ok(())
    }

    async fn get_last_reindex(&self) -> anyhow::Result<Option<DateTime<Utc>>> {
        Ok(parse_optional_datetime(self.get_setting(KEY_LAST_REINDEX).await?)?)
    }

    async fn set_last_reindex(&self, at: DateTime<Utc>) -> anyhow::Result<()> {
        self.set_setting(KEY_LAST_REINDEX, &format_datetime(&at))
            .await?;
        Ok(())
    }
}

// ============================================================================
// IHistoryStore implementation
// ============================================================================

#[async_trait::async_trait]
impl IHistoryStore for SqliteStateRepository {
    async fn append(&self, entry: &HistoryEntry) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO history (path, action, item_type, origin, timestamp) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(entry.path.as_str())
        .bind(entry.action.to_string())
        .bind(entry.item_type.to_string())
        .bind(entry.origin.to_string())
        .bind(format_datetime(&entry.timestamp))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_recent(&self, limit: usize) -> anyhow::Result<Vec<HistoryEntry>> {
        let rows = sqlx::query("SELECT * FROM history ORDER BY id DESC LIMIT ?")
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .iter()
            .map(history_entry_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn prune(&self, max_entries: usize, before: DateTime<Utc>) -> anyhow::Result<u64> {
        let by_age = sqlx::query("DELETE FROM history WHERE timestamp < ?")
            .bind(format_datetime(&before))
            .execute(&self.pool)
            .await?
            .rows_affected();

        let by_count = sqlx::query(
            "DELETE FROM history WHERE id NOT IN \
             (SELECT id FROM history ORDER BY id DESC LIMIT ?)",
        )
        .bind(i64::try_from(max_entries).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await?
        .rows_affected();

        let removed = by_age + by_count;
        if removed > 0 {
            tracing::debug!(removed, "Pruned history");
        }
        Ok(removed)
    }

    async fn clear(&self) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM history").execute(&self.pool).await?;
        Ok(())
    }
}
