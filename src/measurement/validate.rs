use once_cell::sync::Lazy;
use regex::Regex;

use super::wire::{timestamp_to_datetime, Measurement};
use super::zero_timestamp;

/// Device IDs start with a letter, are 3 to 255 characters long, and contain only letters,
/// digits and `+ . % ~ _ -`.
static DEVICE_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z][a-zA-Z0-9+.%~_\-]{2,254}$").expect("device ID pattern is valid")
});

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("measurement: invalid device ID {0:?}")]
    InvalidDeviceId(String),
    #[error("measurement: missing or invalid timestamp")]
    InvalidTimestamp,
    #[error("measurement: temperature must be finite")]
    InvalidTemperature,
}

pub fn validate_device_id(id: &str) -> Result<(), ValidationError> {
    if DEVICE_ID.is_match(id) {
        Ok(())
    } else {
        Err(ValidationError::InvalidDeviceId(id.to_string()))
    }
}

/// Check a wire measurement before it reaches the queue or the store.
pub fn validate(m: &Measurement) -> Result<(), ValidationError> {
    validate_device_id(&m.device_id)?;

    match m.timestamp.as_ref().map(timestamp_to_datetime) {
        Some(Ok(t)) if t != zero_timestamp() => {}
        _ => return Err(ValidationError::InvalidTimestamp),
    }

    if !m.temp.is_finite() {
        return Err(ValidationError::InvalidTemperature);
    }
    Ok(())
}
