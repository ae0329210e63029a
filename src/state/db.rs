//! State database trait and SQLite implementation.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension};

use super::error::StateError;
use super::schema;
use super::types::{
    CycleStats, FetchRecord, ItemRecord, RecordStatus, SkipRecord, SourceSummary, Watermark,
};
use crate::source::ItemKind;
use crate::types::SourceKind;

/// Both source loops may hold the file open at once.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const ITEM_COLUMNS: &str =
    "source, item_id, name, kind, status, local_path, size_bytes, checksum, reason, recorded_at";

/// Trait for state database operations.
///
/// Object-safe so each source loop can hold an `Arc<dyn StateDb>`.
#[async_trait]
pub trait StateDb: Send + Sync {
    /// Ids already settled (fetched or skipped) for a source.
    async fn load_known_ids(&self, source: SourceKind) -> Result<HashSet<String>, StateError>;

    /// Persist a fetch. Callers must have completed the rename first.
    async fn record_fetched(
        &self,
        source: SourceKind,
        record: &FetchRecord,
    ) -> Result<(), StateError>;

    async fn record_skipped(&self, source: SourceKind, record: &SkipRecord)
        -> Result<(), StateError>;

    async fn get_watermark(&self, source: SourceKind) -> Result<Watermark, StateError>;

    /// Store a watermark. Fails with [`StateError::WatermarkRegression`]
    /// when `watermark` is older than the stored one.
    async fn set_watermark(&self, watermark: &Watermark) -> Result<(), StateError>;

    async fn load_logged_messages(&self, source: SourceKind)
        -> Result<HashSet<String>, StateError>;

    async fn mark_message_logged(&self, source: SourceKind, key: &str) -> Result<(), StateError>;

    /// Start a poll cycle and return its id.
    async fn start_cycle(&self, source: SourceKind) -> Result<i64, StateError>;

    async fn complete_cycle(&self, cycle_id: i64, stats: &CycleStats) -> Result<(), StateError>;

    async fn get_summary(&self, source: SourceKind) -> Result<SourceSummary, StateError>;

    /// Fetched records, for one source or all of them.
    async fn get_fetched(&self, source: Option<SourceKind>) -> Result<Vec<ItemRecord>, StateError>;

    async fn get_skipped(&self, source: Option<SourceKind>) -> Result<Vec<ItemRecord>, StateError>;

    /// Forget skip decisions so the items are evaluated again.
    ///
    /// Returns the number of records removed.
    async fn reset_skipped(&self, source: Option<SourceKind>) -> Result<u64, StateError>;

    /// Remove one record. Returns false if it did not exist.
    async fn forget(&self, source: SourceKind, item_id: &str) -> Result<bool, StateError>;
}

/// SQLite implementation of the state database.
pub struct SqliteStateDb {
    /// Wrapped in Mutex because rusqlite::Connection is not Sync.
    conn: Mutex<Connection>,
    /// Path to the database file (for error messages).
    path: PathBuf,
}

impl std::fmt::Debug for SqliteStateDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStateDb")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteStateDb {
    /// Open or create a database at the given path.
    pub async fn open(path: &Path) -> Result<Self, StateError> {
        let path = path.to_path_buf();
        let path_clone = path.clone();

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path_clone).map_err(|e| StateError::Open {
                path: path_clone.clone(),
                source: e,
            })?;

            conn.busy_timeout(BUSY_TIMEOUT)
                .map_err(StateError::Migration)?;

            // WAL lets `status` read while a poll loop writes.
            conn.pragma_update(None, "journal_mode", "WAL")
                .map_err(StateError::Migration)?;

            // FULL: a record must not outlive a power loss that its file survived.
            conn.pragma_update(None, "synchronous", "FULL")
                .map_err(StateError::Migration)?;

            schema::migrate(&conn)?;

            Ok::<_, StateError>(conn)
        })
        .await??;

        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Open an in-memory database (for testing).
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StateError> {
        let conn = Connection::open_in_memory().map_err(|e| StateError::Open {
            path: PathBuf::from(":memory:"),
            source: e,
        })?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StateError> {
        self.conn
            .lock()
            .map_err(|e| StateError::Query(e.to_string()))
    }

    fn query_items(
        &self,
        status: RecordStatus,
        source: Option<SourceKind>,
    ) -> Result<Vec<ItemRecord>, StateError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM items WHERE status = ?1 AND (?2 IS NULL OR source = ?2) ORDER BY source, recorded_at, item_id",
            ITEM_COLUMNS
        );
        let mut stmt = conn.prepare_cached(&sql).map_err(StateError::query)?;
        let records = stmt
            .query_map(
                rusqlite::params![status.as_str(), source.map(|s| s.as_str())],
                |row| Ok(row_to_item_record(row)),
            )
            .map_err(StateError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StateError::query)?;
        Ok(records.into_iter().flatten().collect())
    }
}

#[async_trait]
impl StateDb for SqliteStateDb {
    async fn load_known_ids(&self, source: SourceKind) -> Result<HashSet<String>, StateError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare_cached("SELECT item_id FROM items WHERE source = ?1")
            .map_err(StateError::query)?;
        let ids = stmt
            .query_map([source.as_str()], |row| row.get::<_, String>(0))
            .map_err(StateError::query)?
            .collect::<Result<HashSet<_>, _>>()
            .map_err(StateError::query)?;
        Ok(ids)
    }

    async fn record_fetched(
        &self,
        source: SourceKind,
        record: &FetchRecord,
    ) -> Result<(), StateError> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO items (source, item_id, name, kind, status, local_path, size_bytes, checksum, reason, recorded_at)
            VALUES (?1, ?2, ?3, ?4, 'fetched', ?5, ?6, ?7, NULL, ?8)
            ON CONFLICT(source, item_id) DO UPDATE SET
                name = excluded.name,
                kind = excluded.kind,
                status = 'fetched',
                local_path = excluded.local_path,
                size_bytes = excluded.size_bytes,
                checksum = excluded.checksum,
                reason = NULL,
                recorded_at = excluded.recorded_at
            "#,
            rusqlite::params![
                source.as_str(),
                &record.item_id,
                &record.name,
                record.kind.as_str(),
                record.local_path.to_string_lossy(),
                record.size_bytes as i64,
                &record.checksum,
                record.fetched_at.timestamp(),
            ],
        )
        .map_err(StateError::query)?;
        Ok(())
    }

    async fn record_skipped(
        &self,
        source: SourceKind,
        record: &SkipRecord,
    ) -> Result<(), StateError> {
        let conn = self.lock()?;
        // A skip never overwrites an earlier successful fetch.
        conn.execute(
            r#"
            INSERT INTO items (source, item_id, name, kind, status, reason, recorded_at)
            VALUES (?1, ?2, ?3, ?4, 'skipped', ?5, ?6)
            ON CONFLICT(source, item_id) DO UPDATE SET
                reason = excluded.reason,
                recorded_at = excluded.recorded_at
            WHERE items.status = 'skipped'
            "#,
            rusqlite::params![
                source.as_str(),
                &record.item_id,
                &record.name,
                record.kind.as_str(),
                &record.reason,
                record.skipped_at.timestamp(),
            ],
        )
        .map_err(StateError::query)?;
        Ok(())
    }

    async fn get_watermark(&self, source: SourceKind) -> Result<Watermark, StateError> {
        let conn = self.lock()?;
        let micros: Option<Option<i64>> = conn
            .query_row(
                "SELECT cursor FROM watermarks WHERE source = ?1",
                [source.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(StateError::query)?;
        Ok(Watermark::from_micros(source, micros.flatten()))
    }

    async fn set_watermark(&self, watermark: &Watermark) -> Result<(), StateError> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                r#"
                INSERT INTO watermarks (source, cursor, updated_at) VALUES (?1, ?2, ?3)
                ON CONFLICT(source) DO UPDATE SET
                    cursor = excluded.cursor,
                    updated_at = excluded.updated_at
                WHERE watermarks.cursor IS NULL
                   OR (excluded.cursor IS NOT NULL AND excluded.cursor >= watermarks.cursor)
                "#,
                rusqlite::params![
                    watermark.source.as_str(),
                    watermark.to_micros(),
                    Utc::now().timestamp(),
                ],
            )
            .map_err(StateError::query)?;

        if changed == 0 {
            let stored: Option<i64> = conn
                .query_row(
                    "SELECT cursor FROM watermarks WHERE source = ?1",
                    [watermark.source.as_str()],
                    |row| row.get(0),
                )
                .map_err(StateError::query)?;
            let current = Watermark::from_micros(watermark.source, stored);
            return Err(StateError::WatermarkRegression {
                kind: watermark.source,
                current: current.to_string(),
                requested: watermark.to_string(),
            });
        }
        Ok(())
    }

    async fn load_logged_messages(
        &self,
        source: SourceKind,
    ) -> Result<HashSet<String>, StateError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare_cached("SELECT message_key FROM logged_messages WHERE source = ?1")
            .map_err(StateError::query)?;
        let keys = stmt
            .query_map([source.as_str()], |row| row.get::<_, String>(0))
            .map_err(StateError::query)?
            .collect::<Result<HashSet<_>, _>>()
            .map_err(StateError::query)?;
        Ok(keys)
    }

    async fn mark_message_logged(&self, source: SourceKind, key: &str) -> Result<(), StateError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO logged_messages (source, message_key, logged_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![source.as_str(), key, Utc::now().timestamp()],
        )
        .map_err(StateError::query)?;
        Ok(())
    }

    async fn start_cycle(&self, source: SourceKind) -> Result<i64, StateError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO poll_cycles (source, started_at) VALUES (?1, ?2)",
            rusqlite::params![source.as_str(), Utc::now().timestamp()],
        )
        .map_err(StateError::query)?;
        Ok(conn.last_insert_rowid())
    }

    async fn complete_cycle(&self, cycle_id: i64, stats: &CycleStats) -> Result<(), StateError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE poll_cycles SET completed_at = ?1, items_listed = ?2, items_fetched = ?3, items_skipped = ?4, items_deferred = ?5, messages_logged = ?6, interrupted = ?7 WHERE id = ?8",
            rusqlite::params![
                Utc::now().timestamp(),
                stats.listed as i64,
                stats.fetched as i64,
                stats.skipped as i64,
                stats.deferred as i64,
                stats.messages_logged as i64,
                stats.interrupted as i64,
                cycle_id,
            ],
        )
        .map_err(StateError::query)?;
        Ok(())
    }

    async fn get_summary(&self, source: SourceKind) -> Result<SourceSummary, StateError> {
        let watermark = self.get_watermark(source).await?;
        let conn = self.lock()?;

        let (fetched, total_bytes): (i64, i64) = conn
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(size_bytes), 0) FROM items WHERE source = ?1 AND status = 'fetched'",
                [source.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(StateError::query)?;

        let skipped: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM items WHERE source = ?1 AND status = 'skipped'",
                [source.as_str()],
                |row| row.get(0),
            )
            .map_err(StateError::query)?;

        let logged_messages: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM logged_messages WHERE source = ?1",
                [source.as_str()],
                |row| row.get(0),
            )
            .map_err(StateError::query)?;

        let last_cycle: Option<(i64, Option<i64>)> = conn
            .query_row(
                "SELECT started_at, completed_at FROM poll_cycles WHERE source = ?1 ORDER BY id DESC LIMIT 1",
                [source.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(StateError::query)?;

        let (last_cycle_started, last_cycle_completed) = match last_cycle {
            Some((started, completed)) => (
                Utc.timestamp_opt(started, 0).single(),
                completed.and_then(|ts| Utc.timestamp_opt(ts, 0).single()),
            ),
            None => (None, None),
        };

        Ok(SourceSummary {
            source,
            fetched: fetched as u64,
            skipped: skipped as u64,
            total_bytes: total_bytes as u64,
            watermark,
            logged_messages: logged_messages as u64,
            last_cycle_started,
            last_cycle_completed,
        })
    }

    async fn get_fetched(&self, source: Option<SourceKind>) -> Result<Vec<ItemRecord>, StateError> {
        self.query_items(RecordStatus::Fetched, source)
    }

    async fn get_skipped(&self, source: Option<SourceKind>) -> Result<Vec<ItemRecord>, StateError> {
        self.query_items(RecordStatus::Skipped, source)
    }

    async fn reset_skipped(&self, source: Option<SourceKind>) -> Result<u64, StateError> {
        let conn = self.lock()?;
        let rows = conn
            .execute(
                "DELETE FROM items WHERE status = 'skipped' AND (?1 IS NULL OR source = ?1)",
                [source.map(|s| s.as_str())],
            )
            .map_err(StateError::query)?;
        Ok(rows as u64)
    }

    async fn forget(&self, source: SourceKind, item_id: &str) -> Result<bool, StateError> {
        let conn = self.lock()?;
        let rows = conn
            .execute(
                "DELETE FROM items WHERE source = ?1 AND item_id = ?2",
                [source.as_str(), item_id],
            )
            .map_err(StateError::query)?;
        Ok(rows > 0)
    }
}

/// Convert a database row to an ItemRecord. Rows with an unknown source,
/// kind or status (written by a newer version) are ignored.
fn row_to_item_record(row: &rusqlite::Row<'_>) -> Option<ItemRecord> {
    let source: String = row.get(0).ok()?;
    let kind: String = row.get(3).ok()?;
    let status: String = row.get(4).ok()?;
    RecordStatus::from_str(&status)?;
    let recorded_at: i64 = row.get(9).unwrap_or(0);

    Some(ItemRecord {
        source: SourceKind::from_str(&source)?,
        item_id: row.get(1).ok()?,
        name: row.get(2).unwrap_or_default(),
        kind: ItemKind::from_str(&kind)?,
        local_path: row.get::<_, Option<String>>(5).ok().flatten().map(PathBuf::from),
        size_bytes: row
            .get::<_, Option<i64>>(6)
            .ok()
            .flatten()
            .map(|n| n as u64),
        checksum: row.get(7).ok().flatten(),
        reason: row.get(8).ok().flatten(),
        recorded_at: Utc
            .timestamp_opt(recorded_at, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
    })
}
