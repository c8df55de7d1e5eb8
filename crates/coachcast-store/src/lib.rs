//! # Coachcast Store
//!
//! SQLite persistence for the delivery pipeline:
//!
//! ```text
//! subscribers ──┬── daily_content   (script + audio per date)
//!               ├── delivery_queue  (pending → processing → delivered | failed)
//!               │     └── delivery_attempts
//!               └── inbox           (in-app notifications)
//! ```
//!
//! One connection behind a mutex. Claims run in an IMMEDIATE transaction so a
//! second process sharing the file cannot claim the same row.

mod content;
mod inbox;
mod queue;
mod subscribers;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use coachcast_core::error::{CoachcastError, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS subscribers (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        email TEXT,
        phone TEXT,
        telegram_chat_id TEXT,
        push_token TEXT,
        timezone TEXT NOT NULL,
        delivery_time TEXT NOT NULL,
        channels TEXT NOT NULL DEFAULT '[]',
        quiet_start TEXT,
        quiet_end TEXT,
        active INTEGER NOT NULL DEFAULT 1,
        paused_until TEXT,
        quiz TEXT NOT NULL DEFAULT 'null',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS daily_content (
        id TEXT PRIMARY KEY,
        subscriber_id TEXT NOT NULL,
        date TEXT NOT NULL,
        title TEXT NOT NULL,
        script TEXT NOT NULL,
        audio_url TEXT,
        created_at TEXT NOT NULL,
        UNIQUE (subscriber_id, date)
    );

    CREATE TABLE IF NOT EXISTS delivery_queue (
        id TEXT PRIMARY KEY,
        subscriber_id TEXT NOT NULL,
        content_date TEXT NOT NULL,
        status TEXT NOT NULL,
        channel_index INTEGER NOT NULL DEFAULT 0,
        channel TEXT,
        attempts INTEGER NOT NULL DEFAULT 0,
        total_attempts INTEGER NOT NULL DEFAULT 0,
        scheduled_for TEXT NOT NULL,
        next_attempt_at TEXT NOT NULL,
        claimed_at TEXT,
        last_error TEXT,
        provider_message_id TEXT,
        delivered_at TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE (subscriber_id, content_date)
    );
    CREATE INDEX IF NOT EXISTS idx_queue_due ON delivery_queue (status, next_attempt_at);

    CREATE TABLE IF NOT EXISTS delivery_attempts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id TEXT NOT NULL,
        channel TEXT NOT NULL,
        attempt INTEGER NOT NULL,
        success INTEGER NOT NULL,
        error TEXT,
        at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_attempts_job ON delivery_attempts (job_id);

    CREATE TABLE IF NOT EXISTS inbox (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        subscriber_id TEXT NOT NULL,
        title TEXT NOT NULL,
        body TEXT NOT NULL,
        link TEXT,
        audio_url TEXT,
        read INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_inbox_subscriber ON inbox (subscriber_id, read);
";

/// SQLite-backed store shared by the scheduler, channels and gateway.
pub struct DeliveryStore {
    conn: Mutex<Connection>,
}

impl DeliveryStore {
    /// Open or create a store at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(db_err)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .map_err(db_err)?;
        conn.busy_timeout(std::time::Duration::from_secs(5)).map_err(db_err)?;
        let store = Self::with_connection(conn)?;
        tracing::debug!("Delivery store opened: {}", path.display());
        Ok(store)
    }

    /// Private in-memory database, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| CoachcastError::store(format!("Store lock poisoned: {e}")))
    }
}

pub(crate) fn db_err(e: rusqlite::Error) -> CoachcastError {
    CoachcastError::store(e.to_string())
}

/// Fixed-width UTC timestamps, so string order equals time order in SQL.
pub(crate) fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn date_str(d: &NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

/// Wrap a parse failure as a column conversion error.
pub(crate) fn conv<T, E>(idx: usize, r: std::result::Result<T, E>) -> rusqlite::Result<T>
where
    E: std::error::Error + Send + Sync + 'static,
{
    r.map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

pub(crate) fn parse_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    conv(idx, DateTime::parse_from_rfc3339(s).map(|d| d.with_timezone(&Utc)))
}

pub(crate) fn parse_opt_ts(idx: usize, s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.map(|s| parse_ts(idx, &s)).transpose()
}

pub(crate) fn parse_date(idx: usize, s: &str) -> rusqlite::Result<NaiveDate> {
    conv(idx, s.parse::<NaiveDate>())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_on_disk_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("coachcast.db");
        let store = DeliveryStore::open(&path).unwrap();
        assert!(path.exists());
        store.upsert_subscriber(&test_support::subscriber("u1")).unwrap();
        drop(store);

        let reopened = DeliveryStore::open(&path).unwrap();
        assert!(reopened.get_subscriber("u1").unwrap().is_some());
    }

    #[test]
    fn test_timestamps_sort_lexicographically() {
        let a = test_support::at(7, 0);
        let b = test_support::at(17, 0);
        assert!(ts(&a) < ts(&b));
        assert_eq!(ts(&a), "2026-03-10T07:00:00.000Z");
    }
}
