//! SQLite persistence for the recognition log and the blacklist.

use chrono::{DateTime, Days, NaiveDate, NaiveTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use vigil_core::{Blacklist, BlacklistEntry, LogEntry, LogSink, SinkError};

/// Upper bound on rows returned by [`Store::recent_logs`].
pub const MAX_LOG_LIMIT: u32 = 500;
/// Names listed in [`Analytics::top_names`].
const TOP_NAMES: usize = 10;
const MAX_ANALYTICS_DAYS: u32 = 366;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS recognition_log (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL,
    confidence  REAL,
    timestamp   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_recognition_log_timestamp ON recognition_log(timestamp);
CREATE TABLE IF NOT EXISTS blacklist (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL,
    notes       TEXT,
    created_at  TEXT NOT NULL,
    active      INTEGER NOT NULL DEFAULT 1
);
CREATE INDEX IF NOT EXISTS idx_blacklist_name ON blacklist(name);
";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to create database directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("blacklist entry {0} not found")]
    NotFound(i64),
    #[error("blacklist name must not be empty")]
    EmptyName,
}

/// One row of the recognition log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    pub id: i64,
    pub name: String,
    /// `None` when the decision carried no score.
    pub confidence: Option<f32>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailyCount {
    pub date: NaiveDate,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NameCount {
    pub name: String,
    pub count: u64,
}

/// Recognition counts over a trailing window of days.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Analytics {
    /// One entry per day, oldest first, zero-filled.
    pub daily: Vec<DailyCount>,
    /// Most frequently logged names in the window.
    pub top_names: Vec<NameCount>,
}

/// Single-connection store. Writers and readers serialize on the mutex.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::info!(path = %path.display(), journal_mode = %mode, "database opened");
        Self::with_connection(conn)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn append_log(&self, entry: &LogEntry) -> Result<i64, StoreError> {
        let confidence = entry
            .confidence
            .is_finite()
            .then_some(f64::from(entry.confidence));
        let conn = self.conn();
        conn.execute(
            "INSERT INTO recognition_log (name, confidence, timestamp) VALUES (?1, ?2, ?3)",
            params![entry.name, confidence, entry.timestamp],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent log rows, newest first. `limit` is clamped to
    /// `1..=MAX_LOG_LIMIT`.
    pub fn recent_logs(&self, limit: u32) -> Result<Vec<LogRecord>, StoreError> {
        let limit = limit.clamp(1, MAX_LOG_LIMIT);
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, name, confidence, timestamp FROM recognition_log
             ORDER BY timestamp DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok(LogRecord {
                id: row.get(0)?,
                name: row.get(1)?,
                confidence: row.get::<_, Option<f64>>(2)?.map(|c| c as f32),
                timestamp: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Add an active blacklist entry, returning its id.
    pub fn add_blacklist(&self, name: &str, notes: Option<&str>) -> Result<i64, StoreError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StoreError::EmptyName);
        }
        let notes = notes.map(str::trim).filter(|n| !n.is_empty());
        let conn = self.conn();
        conn.execute(
            "INSERT INTO blacklist (name, notes, created_at, active) VALUES (?1, ?2, ?3, 1)",
            params![name, notes, Utc::now()],
        )?;
        let id = conn.last_insert_rowid();
        tracing::info!(id, name, "blacklist entry added");
        Ok(id)
    }

    /// Flip the active flag of entry `id`, returning the new state.
    pub fn toggle_blacklist(&self, id: i64) -> Result<bool, StoreError> {
        let active: Option<bool> = self
            .conn()
            .query_row(
                "UPDATE blacklist SET active = NOT active WHERE id = ?1 RETURNING active",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        let active = active.ok_or(StoreError::NotFound(id))?;
        tracing::info!(id, active, "blacklist entry toggled");
        Ok(active)
    }

    pub fn list_blacklist(&self) -> Result<Vec<BlacklistEntry>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, name, notes, active, created_at FROM blacklist ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(BlacklistEntry {
                id: row.get(0)?,
                name: row.get(1)?,
                notes: row.get(2)?,
                active: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Exact, case-sensitive match against active entries.
    pub fn is_active_blacklisted(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.conn().query_row(
            "SELECT EXISTS(SELECT 1 FROM blacklist WHERE name = ?1 AND active = 1)",
            params![name],
            |row| row.get(0),
        )?)
    }

    /// Counts for the `days` days ending with `today` (UTC dates).
    pub fn analytics(&self, days: u32, today: NaiveDate) -> Result<Analytics, StoreError> {
        let days = days.clamp(1, MAX_ANALYTICS_DAYS);
        let first = today - Days::new(u64::from(days - 1));
        let since = first.and_time(NaiveTime::MIN).and_utc();
        let conn = self.conn();

        let mut per_day: HashMap<NaiveDate, u64> = HashMap::new();
        let mut stmt = conn.prepare(
            "SELECT substr(timestamp, 1, 10) AS day, COUNT(*) FROM recognition_log
             WHERE timestamp >= ?1 GROUP BY day",
        )?;
        let rows = stmt.query_map(params![since], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (day, count) = row?;
            match NaiveDate::parse_from_str(&day, "%Y-%m-%d") {
                Ok(date) => {
                    per_day.insert(date, count.max(0) as u64);
                }
                Err(_) => tracing::warn!(day = %day, "skipping log rows with malformed timestamp"),
            }
        }

        let daily = first
            .iter_days()
            .take(days as usize)
            .map(|date| DailyCount {
                date,
                count: per_day.get(&date).copied().unwrap_or(0),
            })
            .collect();

        let mut stmt = conn.prepare(
            "SELECT name, COUNT(*) AS n FROM recognition_log
             WHERE timestamp >= ?1 GROUP BY name ORDER BY n DESC, name ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![since, TOP_NAMES as i64], |row| {
            Ok(NameCount {
                name: row.get(0)?,
                count: row.get::<_, i64>(1)?.max(0) as u64,
            })
        })?;
        let top_names = rows.collect::<Result<_, _>>()?;

        Ok(Analytics { daily, top_names })
    }
}

impl LogSink for Store {
    fn append(&self, entry: &LogEntry) -> Result<(), SinkError> {
        self.append_log(entry)
            .map(|_| ())
            .map_err(|e| SinkError::Write(e.to_string()))
    }
}

impl Blacklist for Store {
    fn is_blacklisted(&self, name: &str) -> Result<bool, SinkError> {
        self.is_active_blacklisted(name)
            .map_err(|e| SinkError::Query(e.to_string()))
    }
}
