//! Offline cache for readings that could not be published
//!
//! Uses SQLite for persistent storage. Each device identity owns one logical
//! FIFO queue, ordered by the autoincrement row id so that creation order
//! survives restarts.

use crate::error::CloudResult;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use tbmon_core::Reading;
use tracing::{debug, error, info};

/// File name of the cache database inside `storage.cache_dir`
pub const CACHE_FILE: &str = "cache.db";

/// Store-assigned entry id, monotonic across the whole store
pub type EntryId = i64;

/// A cached reading awaiting delivery
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub id: EntryId,
    pub device: String,
    pub reading: Reading,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
}

/// Pending entries of one device
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceQueueStats {
    pub device: String,
    pub pending: usize,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
    pub max_retries: u32,
}

/// Durable per-device queue of undelivered readings.
///
/// `drain_oldest` only peeks; an entry leaves the queue through `confirm`.
pub trait CacheStore: Send + Sync {
    /// Persist one reading at the tail of the device's queue
    fn append(&self, device: &str, reading: &Reading) -> CloudResult<EntryId>;

    /// Oldest pending entry for the device, left in place
    fn drain_oldest(&self, device: &str) -> CloudResult<Option<CacheEntry>>;

    /// Remove an entry. Confirming an unknown id is a no-op.
    fn confirm(&self, device: &str, id: EntryId) -> CloudResult<()>;

    /// Bump the retry counter after a failed replay
    fn record_failure(&self, device: &str, id: EntryId) -> CloudResult<()>;

    fn pending_count(&self, device: &str) -> CloudResult<usize>;

    fn has_pending(&self, device: &str) -> CloudResult<bool> {
        Ok(self.pending_count(device)? > 0)
    }

    /// Per-device statistics, ordered by device identity
    fn stats(&self) -> CloudResult<Vec<DeviceQueueStats>>;
}

/// SQLite-backed cache store
pub struct SqliteCacheStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteCacheStore {
    /// Open (or create) `<dir>/cache.db`
    pub fn open(dir: impl AsRef<Path>) -> CloudResult<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;

        let path = dir.join(CACHE_FILE);
        let conn = Connection::open(&path)?;
        Self::init_schema(&conn)?;

        info!("Offline cache opened at {}", path.display());

        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path),
        })
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> CloudResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    fn init_schema(conn: &Connection) -> CloudResult<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS cached_readings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                device TEXT NOT NULL,
                reading_json TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_cached_readings_device
             ON cached_readings(device, id)",
            [],
        )?;

        Ok(())
    }

    /// Database file, if this store is on disk
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

impl CacheStore for SqliteCacheStore {
    fn append(&self, device: &str, reading: &Reading) -> CloudResult<EntryId> {
        let json = serde_json::to_string(reading)?;
        let conn = self.conn.lock();

        conn.execute(
            "INSERT INTO cached_readings (device, reading_json, created_at) VALUES (?1, ?2, ?3)",
            params![device, json, Utc::now().timestamp_millis()],
        )?;
        let id = conn.last_insert_rowid();

        debug!("Cached reading {} for device {}", id, device);
        Ok(id)
    }

    fn drain_oldest(&self, device: &str) -> CloudResult<Option<CacheEntry>> {
        let conn = self.conn.lock();

        loop {
            let row = conn
                .query_row(
                    "SELECT id, reading_json, created_at, retry_count FROM cached_readings
                     WHERE device = ?1 ORDER BY id ASC LIMIT 1",
                    params![device],
                    |row| {
                        let id: i64 = row.get(0)?;
                        let json: String = row.get(1)?;
                        let created_at: i64 = row.get(2)?;
                        let retry_count: u32 = row.get(3)?;
                        Ok((id, json, created_at, retry_count))
                    },
                )
                .optional()?;

            let Some((id, json, created_at, retry_count)) = row else {
                return Ok(None);
            };

            match serde_json::from_str::<Reading>(&json) {
                Ok(reading) => {
                    return Ok(Some(CacheEntry {
                        id,
                        device: device.to_string(),
                        reading,
                        created_at: millis_to_datetime(created_at),
                        retry_count,
                    }));
                }
                Err(e) => {
                    error!(
                        "Removing undecodable cache entry {} for device {}: {}",
                        id, device, e
                    );
                    conn.execute("DELETE FROM cached_readings WHERE id = ?1", params![id])?;
                }
            }
        }
    }

    fn confirm(&self, device: &str, id: EntryId) -> CloudResult<()> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM cached_readings WHERE device = ?1 AND id = ?2",
            params![device, id],
        )?;
        if deleted > 0 {
            debug!("Confirmed cache entry {} for device {}", id, device);
        }
        Ok(())
    }

    fn record_failure(&self, device: &str, id: EntryId) -> CloudResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE cached_readings SET retry_count = retry_count + 1
             WHERE device = ?1 AND id = ?2",
            params![device, id],
        )?;
        Ok(())
    }

    fn pending_count(&self, device: &str) -> CloudResult<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM cached_readings WHERE device = ?1",
            params![device],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn stats(&self) -> CloudResult<Vec<DeviceQueueStats>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT device, COUNT(*), MIN(created_at), MAX(created_at), MAX(retry_count)
             FROM cached_readings GROUP BY device ORDER BY device",
        )?;

        let rows = stmt.query_map([], |row| {
            let device: String = row.get(0)?;
            let pending: i64 = row.get(1)?;
            let oldest: Option<i64> = row.get(2)?;
            let newest: Option<i64> = row.get(3)?;
            let max_retries: Option<u32> = row.get(4)?;
            Ok(DeviceQueueStats {
                device,
                pending: pending as usize,
                oldest: oldest.map(millis_to_datetime),
                newest: newest.map(millis_to_datetime),
                max_retries: max_retries.unwrap_or(0),
            })
        })?;

        let mut stats = Vec::new();
        for row in rows {
            stats.push(row?);
        }
        Ok(stats)
    }
}
