//! SQLite backend.
//!
//! Instants are stored as RFC3339 text with nine fractional digits and a `Z` suffix. For the
//! years protobuf timestamps allow (0001..=9999) that form is fixed-width, so text order is
//! time order and range filters work on the raw column.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, ToSql, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

use super::backend::{Backend, Cursor, OrderField, Page, RangeQuery, StoreError};
use crate::measurement::StorableMeasurement;

/// Default maximum page size, matching what hosted document stores typically allow.
pub const DEFAULT_PAGE_LIMIT: usize = 1000;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS measurements (
    key TEXT PRIMARY KEY,
    device_id TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    upload_timestamp TEXT,
    temp REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_measurements_timestamp
    ON measurements (timestamp, key);
CREATE INDEX IF NOT EXISTS idx_measurements_upload_timestamp
    ON measurements (upload_timestamp, key);
CREATE INDEX IF NOT EXISTS idx_measurements_device_timestamp
    ON measurements (device_id, timestamp);
";

const COLUMNS: &str = "device_id, timestamp, upload_timestamp, temp";

/// Decoded form of a [`Cursor`]: the ordered field's value and the key of the last row.
#[derive(Debug, Serialize, Deserialize)]
struct Position {
    value: String,
    key: String,
}

impl Position {
    fn encode(&self) -> Result<Cursor, StoreError> {
        let json = serde_json::to_vec(self).map_err(|e| StoreError::InvalidCursor(e.to_string()))?;
        Ok(Cursor::new(URL_SAFE_NO_PAD.encode(json)))
    }

    fn decode(cursor: &Cursor) -> Result<Self, StoreError> {
        let json = URL_SAFE_NO_PAD
            .decode(cursor.as_str())
            .map_err(|e| StoreError::InvalidCursor(e.to_string()))?;
        serde_json::from_slice(&json).map_err(|e| StoreError::InvalidCursor(e.to_string()))
    }
}

pub struct SqliteBackend {
    conn: Mutex<Connection>,
    page_limit: usize,
}

impl SqliteBackend {
    /// Open or create a database file. Uses WAL journaling.
    pub fn open(path: impl AsRef<Path>, page_limit: usize) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        Self::with_connection(conn, page_limit)
    }

    pub fn in_memory(page_limit: usize) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?, page_limit)
    }

    fn with_connection(conn: Connection, page_limit: usize) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            page_limit: page_limit.max(1),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

fn format_instant(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_instant(idx: usize, text: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn row_to_measurement(row: &Row<'_>) -> rusqlite::Result<StorableMeasurement> {
    let timestamp: String = row.get(1)?;
    let upload_timestamp: Option<String> = row.get(2)?;
    let temp: f64 = row.get(3)?;

    Ok(StorableMeasurement {
        device_id: row.get(0)?,
        timestamp: parse_instant(1, &timestamp)?,
        upload_timestamp: upload_timestamp
            .as_deref()
            .map(|t| parse_instant(2, t))
            .transpose()?,
        temp: temp as f32,
    })
}

impl Backend for SqliteBackend {
    fn insert_if_absent(&self, key: &str, m: &StorableMeasurement) -> Result<bool, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let exists = tx
            .query_row("SELECT 1 FROM measurements WHERE key = ?1", [key], |_| Ok(()))
            .optional()?
            .is_some();

        if !exists {
            tx.execute(
                "INSERT INTO measurements (key, device_id, timestamp, upload_timestamp, temp)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    key,
                    m.device_id,
                    format_instant(m.timestamp),
                    m.upload_timestamp.map(format_instant),
                    f64::from(m.temp),
                ],
            )?;
        }

        tx.commit()?;
        Ok(!exists)
    }

    fn latest(&self, device_id: &str) -> Result<Option<StorableMeasurement>, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {COLUMNS} FROM measurements WHERE device_id = ?1
             ORDER BY timestamp DESC LIMIT 1"
        );
        Ok(conn
            .query_row(&sql, [device_id], row_to_measurement)
            .optional()?)
    }

    fn run(
        &self,
        query: &RangeQuery,
        start: Option<&Cursor>,
        limit: usize,
    ) -> Result<Page, StoreError> {
        let limit = limit.clamp(1, self.page_limit);
        let column = query.field.column();

        let range_start = format_instant(query.start);
        let range_end = query.end.map(format_instant);
        let after = start.map(Position::decode).transpose()?;
        let limit_param = limit as i64;

        let mut sql = format!(
            "SELECT {COLUMNS}, key FROM measurements
             WHERE {column} IS NOT NULL AND {column} >= :start"
        );
        let mut named: Vec<(&str, &dyn ToSql)> = vec![(":start", &range_start)];

        if let Some(end) = &range_end {
            sql.push_str(&format!(" AND {column} <= :end"));
            named.push((":end", end));
        }
        if let Some(after) = &after {
            sql.push_str(&format!(
                " AND ({column} > :after_value OR ({column} = :after_value AND key > :after_key))"
            ));
            named.push((":after_value", &after.value));
            named.push((":after_key", &after.key));
        }
        sql.push_str(&format!(" ORDER BY {column}, key LIMIT :limit"));
        named.push((":limit", &limit_param));

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(named.as_slice(), |row| {
            let key: String = row.get(4)?;
            Ok((row_to_measurement(row)?, key))
        })?;

        let mut records = Vec::with_capacity(limit);
        let mut last_key = None;
        for row in rows {
            let (m, key) = row?;
            records.push(m);
            last_key = Some(key);
        }

        let cursor = match (records.last(), last_key) {
            (Some(m), Some(key)) => {
                let value = match query.field {
                    OrderField::Timestamp => Some(m.timestamp),
                    OrderField::UploadTimestamp => m.upload_timestamp,
                };
                let value = value.map(format_instant).unwrap_or_default();
                Some(Position { value, key }.encode()?)
            }
            _ => None,
        };

        debug!(column, fetched = records.len(), limit, "ran range sub-query");
        Ok(Page { records, cursor })
    }

    fn max_page_size(&self) -> usize {
        self.page_limit
    }

    fn count(&self) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM measurements", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}
