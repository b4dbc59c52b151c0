//! Canonical measurement record shared by the uploader, the pending queue and the store.
//!
//! [`StorableMeasurement`] carries no protobuf-specific types, so it can be written to JSON for
//! the pending queue and to SQLite rows for the store. The protobuf wire type lives in [`wire`].

mod validate;
pub mod wire;

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub use validate::{validate, validate_device_id, ValidationError};
pub use wire::{ConversionError, Measurement};

/// Separator for key components. Device IDs and RFC3339 timestamps can't contain it.
pub const KEY_SEP: &str = "#";

/// Seconds from the Unix epoch to 0001-01-01T00:00:00Z.
const ZERO_UNIX_SECS: i64 = -62_135_596_800;

/// The zero instant, 0001-01-01T00:00:00Z. A record carrying it has no timestamp.
pub fn zero_timestamp() -> DateTime<Utc> {
    DateTime::from_timestamp(ZERO_UNIX_SECS, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Measurement record in storage form.
///
/// `upload_timestamp` is `None` unless the measurement was delivered late (replayed from the
/// pending queue). Absence is preserved in every conversion; it is never defaulted to an instant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StorableMeasurement {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_timestamp: Option<DateTime<Utc>>,
    pub temp: f32,
}

impl Default for StorableMeasurement {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            timestamp: zero_timestamp(),
            upload_timestamp: None,
            temp: 0.0,
        }
    }
}

impl StorableMeasurement {
    pub fn new(device_id: impl Into<String>, timestamp: DateTime<Utc>, temp: f32) -> Self {
        Self {
            device_id: device_id.into(),
            timestamp,
            upload_timestamp: None,
            temp,
        }
    }

    pub fn with_upload_timestamp(mut self, upload_timestamp: DateTime<Utc>) -> Self {
        self.upload_timestamp = Some(upload_timestamp);
        self
    }

    /// True if the record has no timestamp.
    pub fn has_zero_timestamp(&self) -> bool {
        self.timestamp == zero_timestamp()
    }

    /// Store key: `<device_id>#<timestamp RFC3339>`.
    ///
    /// Timestamps are rendered at second precision, so two measurements from one device within
    /// the same second share a key. Callers guarantee that doesn't happen.
    pub fn db_key(&self) -> String {
        [self.device_id.as_str(), &rfc3339(self.timestamp)].join(KEY_SEP)
    }

    /// Time between taking the measurement and uploading it, if it was delivered late.
    pub fn upload_delay(&self) -> Option<TimeDelta> {
        self.upload_timestamp.map(|t| t - self.timestamp)
    }
}

impl fmt::Display for StorableMeasurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:.3}°C {}",
            self.device_id,
            self.temp,
            rfc3339(self.timestamp)
        )?;
        if let Some(delay) = self.upload_delay() {
            write!(f, " ({} upload delay)", format_duration(delay))?;
        }
        Ok(())
    }
}

/// RFC3339 at second precision with a `Z` suffix.
pub fn rfc3339(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Render a duration as hours, minutes and seconds (`14h40m0s`, `1m30s`, `1.5s`).
/// Sub-second durations use the largest fitting unit (`250ms`, `12µs`, `7ns`).
pub fn format_duration(d: TimeDelta) -> String {
    const NANOS_PER_SEC: u128 = 1_000_000_000;

    let total = i128::from(d.num_seconds()) * NANOS_PER_SEC as i128 + i128::from(d.subsec_nanos());
    let sign = if total < 0 { "-" } else { "" };
    let nanos = total.unsigned_abs();

    if nanos == 0 {
        return "0s".to_string();
    }

    if nanos < NANOS_PER_SEC {
        let (scaled, unit) = match nanos {
            n if n < 1_000 => (fixed_point(n, 0), "ns"),
            n if n < 1_000_000 => (fixed_point(n, 3), "µs"),
            n => (fixed_point(n, 6), "ms"),
        };
        return format!("{sign}{scaled}{unit}");
    }

    let hours = nanos / (3600 * NANOS_PER_SEC);
    let minutes = (nanos / (60 * NANOS_PER_SEC)) % 60;
    let seconds = fixed_point(nanos % (60 * NANOS_PER_SEC), 9);

    if hours > 0 {
        format!("{sign}{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{sign}{minutes}m{seconds}s")
    } else {
        format!("{sign}{seconds}s")
    }
}

/// Format `value / 10^digits` with trailing fractional zeros trimmed.
fn fixed_point(value: u128, digits: u32) -> String {
    let scale = 10u128.pow(digits);
    let whole = value / scale;
    let frac = value % scale;
    if frac == 0 {
        return whole.to_string();
    }
    let frac = format!("{:0width$}", frac, width = digits as usize);
    format!("{}.{}", whole, frac.trim_end_matches('0'))
}
