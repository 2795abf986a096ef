//! SQLite store for sealed metric windows.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, Result as SqlResult};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::metrics::window::MetricWindow;

/// Storage error. Flush failures are logged and retried on the next tick;
/// they never block the collection loop.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("migration error: {0}")]
    Migration(String),
}

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// Thread-safe window store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("init migration failed: {}", e)))?;
        Ok(())
    }

    /// Upsert a batch of sealed windows. Replaying a window overwrites the
    /// same row, so flush retries and daily re-folds are idempotent.
    pub fn upsert_windows(&self, windows: &[MetricWindow]) -> Result<(), DbError> {
        if windows.is_empty() {
            return Ok(());
        }

        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO metric_windows (time, name, window_seconds, count, sum, min, max, tdigest_data)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(time, name, window_seconds) DO UPDATE SET
                 count=excluded.count, sum=excluded.sum, min=excluded.min,
                 max=excluded.max, tdigest_data=excluded.tdigest_data",
            )?;
            for w in windows {
                stmt.execute(params![
                    w.start.format(TIME_FORMAT).to_string(),
                    w.name,
                    w.window_seconds,
                    w.count,
                    w.sum,
                    w.min,
                    w.max,
                    w.digest_data,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Windows for one series and granularity within `[start, end)`.
    pub fn get_windows(
        &self,
        name: &str,
        window_seconds: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MetricWindow>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT time, name, window_seconds, count, sum, min, max, tdigest_data
             FROM metric_windows
             WHERE name = ?1 AND window_seconds = ?2 AND time >= ?3 AND time < ?4
             ORDER BY time ASC",
        )?;

        let windows = stmt
            .query_map(
                params![
                    name,
                    window_seconds,
                    start.format(TIME_FORMAT).to_string(),
                    end.format(TIME_FORMAT).to_string(),
                ],
                row_to_window,
            )?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(windows)
    }

    /// All series names currently stored.
    pub fn metric_names(&self) -> Result<Vec<String>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT DISTINCT name FROM metric_windows ORDER BY name ASC")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(names)
    }

    /// Delete windows older than the retention cutoff. Returns rows removed.
    pub fn delete_windows_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute(
            "DELETE FROM metric_windows WHERE time < ?1",
            params![cutoff.format(TIME_FORMAT).to_string()],
        )?;
        Ok(removed)
    }
}

fn row_to_window(row: &rusqlite::Row<'_>) -> SqlResult<MetricWindow> {
    let time_str: String = row.get(0)?;
    let start = parse_db_time(&time_str).unwrap_or_else(Utc::now);
    Ok(MetricWindow {
        start,
        name: row.get(1)?,
        window_seconds: row.get(2)?,
        count: row.get(3)?,
        sum: row.get(4)?,
        min: row.get(5)?,
        max: row.get(6)?,
        digest_data: row.get(7)?,
    })
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        "%Y-%m-%d %H:%M:%S%.9f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}
