//! Seam between the measurement store and the database that backs it.

use chrono::{DateTime, Utc};

use crate::measurement::{ConversionError, StorableMeasurement};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store: database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("store: invalid cursor: {0}")]
    InvalidCursor(String),
    #[error("store: {0}")]
    Conversion(#[from] ConversionError),
    #[error("store: connection lock poisoned")]
    Poisoned,
    #[error("store: background task failed: {0}")]
    Task(String),
}

/// Field a range query filters and orders on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrderField {
    Timestamp,
    UploadTimestamp,
}

impl OrderField {
    pub fn column(&self) -> &'static str {
        match self {
            OrderField::Timestamp => "timestamp",
            OrderField::UploadTimestamp => "upload_timestamp",
        }
    }
}

/// All measurements whose `field` lies in `[start, end]`, ordered by `field` ascending.
/// Measurements without a value for `field` never match.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RangeQuery {
    pub field: OrderField,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
}

impl RangeQuery {
    pub fn since(start: DateTime<Utc>) -> Self {
        Self {
            field: OrderField::Timestamp,
            start,
            end: None,
        }
    }

    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            field: OrderField::Timestamp,
            start,
            end: Some(end),
        }
    }

    /// Measurements uploaded late, by upload time.
    pub fn delayed_since(start: DateTime<Utc>) -> Self {
        Self {
            field: OrderField::UploadTimestamp,
            start,
            end: None,
        }
    }
}

/// Opaque continuation token. Only the backend that issued it can interpret it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One bounded sub-query result.
#[derive(Debug, Default)]
pub struct Page {
    pub records: Vec<StorableMeasurement>,
    /// Position just after the last record; `None` for an empty page.
    pub cursor: Option<Cursor>,
}

pub trait Backend: Send + Sync {
    /// Insert `m` under `key` unless the key already exists, atomically. Returns whether a row
    /// was written. An existing row is left as is, whatever its contents.
    fn insert_if_absent(&self, key: &str, m: &StorableMeasurement) -> Result<bool, StoreError>;

    /// Most recent measurement for a device by timestamp.
    fn latest(&self, device_id: &str) -> Result<Option<StorableMeasurement>, StoreError>;

    /// Up to `limit` matches of `query`, starting after `start` if given. `limit` is clamped to
    /// [`Backend::max_page_size`].
    fn run(
        &self,
        query: &RangeQuery,
        start: Option<&Cursor>,
        limit: usize,
    ) -> Result<Page, StoreError>;

    /// Largest page a single sub-query may return.
    fn max_page_size(&self) -> usize;

    fn count(&self) -> Result<usize, StoreError>;
}
