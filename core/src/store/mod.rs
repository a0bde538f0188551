//! SQLite persistence layer.
//!
//! RULE: Only the store talks to the database.
//! Services call store methods; they never execute SQL directly.
//! Multi-row operations compose store calls inside `atomically()`.

use crate::error::{LineageError, LineageResult};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row};
use std::time::Duration;

mod artifact;
mod pool;
mod progress;
mod run_queue;
mod suite;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct LineageStore {
    conn: Connection,
    path: Option<String>, // None for :memory:, Some(path) for file
}

impl LineageStore {
    pub fn open(path: &str) -> LineageResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        // WAL mode only for real files (shared-memory and :memory: ignore it).
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(Self {
            conn,
            path: Some(path.to_string()),
        })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> LineageResult<Self> {
        let conn = Connection::open(":memory:")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn, path: None })
    }

    /// Reopen a new connection to the same database.
    /// For in-memory databases, this returns a new in-memory database (isolated).
    /// For file-based databases, this opens the same file.
    pub fn reopen(&self) -> LineageResult<Self> {
        match &self.path {
            Some(p) => Self::open(p),
            None => Self::in_memory(),
        }
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Apply all schema migrations in order. Safe to call repeatedly.
    pub fn migrate(&self) -> LineageResult<()> {
        self.conn
            .execute_batch(include_str!("../../../migrations/001_run_queue.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/002_artifacts.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/003_pools_and_snapshots.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/004_suites.sql"))?;
        Ok(())
    }

    /// Run `f` as one unit: commit if it returns Ok, roll back otherwise.
    ///
    /// At top level this opens an IMMEDIATE transaction (the write lock is
    /// taken up front, so concurrent writers queue on `busy_timeout` instead
    /// of failing mid-transaction). Nested calls become savepoints, so store
    /// methods that are atomic on their own compose into larger units.
    pub fn atomically<T>(
        &self,
        f: impl FnOnce(&Self) -> LineageResult<T>,
    ) -> LineageResult<T> {
        let guard = TxGuard::begin(&self.conn)?;
        let value = f(self)?;
        guard.commit()?;
        Ok(value)
    }
}

/// Rolls back on drop unless committed (covers early returns and panics).
struct TxGuard<'c> {
    conn: &'c Connection,
    nested: bool,
    done: bool,
}

impl<'c> TxGuard<'c> {
    fn begin(conn: &'c Connection) -> LineageResult<Self> {
        let nested = !conn.is_autocommit();
        if nested {
            conn.execute_batch("SAVEPOINT lineage_unit")?;
        } else {
            conn.execute_batch("BEGIN IMMEDIATE")?;
        }
        Ok(Self { conn, nested, done: false })
    }

    fn commit(mut self) -> LineageResult<()> {
        self.done = true;
        if self.nested {
            self.conn.execute_batch("RELEASE lineage_unit")?;
        } else {
            self.conn.execute_batch("COMMIT")?;
        }
        Ok(())
    }
}

impl Drop for TxGuard<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let sql = if self.nested {
            "ROLLBACK TO lineage_unit; RELEASE lineage_unit"
        } else {
            "ROLLBACK"
        };
        if let Err(e) = self.conn.execute_batch(sql) {
            log::error!("store: rollback failed: {e}");
        }
    }
}

// ── Column helpers ─────────────────────────────────────────────────────

pub(crate) fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_millis(idx: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}

pub(crate) fn ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    from_millis(idx, row.get(idx)?)
}

pub(crate) fn opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<i64>>(idx)?
        .map(|ms| from_millis(idx, ms))
        .transpose()
}

/// Decode a JSON text column inside a row mapper.
pub(crate) fn json_col<T: serde::de::DeserializeOwned>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub(crate) fn opt_json_col<T: serde::de::DeserializeOwned>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| {
        serde_json::from_str(&raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
    })
    .transpose()
}

/// Map a domain decode error into a row-mapper error.
pub(crate) fn decode_err(idx: usize, e: LineageError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

/// True when `e` is a UNIQUE/PRIMARY KEY violation.
pub(crate) fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

/// A validated `LIMIT`/`OFFSET` window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: u32,
    pub offset: u32,
}

impl Page {
    pub fn new(limit: u32, offset: u32) -> Self {
        Self { limit, offset }
    }
}
