//! Protobuf wire form of a measurement, declared by hand with prost derives.

use super::StorableMeasurement;
use chrono::{DateTime, Utc};
use prost_types::Timestamp;
use std::fmt;

/// Smallest valid protobuf timestamp, 0001-01-01T00:00:00Z.
const MIN_VALID_SECONDS: i64 = -62_135_596_800;
/// Largest valid protobuf timestamp, 9999-12-31T23:59:59Z.
const MAX_VALID_SECONDS: i64 = 253_402_300_799;

/// A single temperature reading as published by a device.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Measurement {
    #[prost(string, tag = "1")]
    pub device_id: String,
    #[prost(message, optional, tag = "2")]
    pub timestamp: Option<Timestamp>,
    #[prost(message, optional, tag = "3")]
    pub upload_timestamp: Option<Timestamp>,
    #[prost(float, tag = "4")]
    pub temp: f32,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConversionError {
    #[error("measurement: timestamp cannot be nil")]
    ZeroTimestamp,
    #[error("measurement: invalid timestamp (seconds: {seconds}, nanos: {nanos})")]
    InvalidTimestamp { seconds: i64, nanos: i32 },
}

/// Convert a protobuf timestamp, rejecting values outside the range protobuf allows.
pub fn timestamp_to_datetime(ts: &Timestamp) -> Result<DateTime<Utc>, ConversionError> {
    let invalid = || ConversionError::InvalidTimestamp {
        seconds: ts.seconds,
        nanos: ts.nanos,
    };
    if !(MIN_VALID_SECONDS..=MAX_VALID_SECONDS).contains(&ts.seconds)
        || !(0..1_000_000_000).contains(&ts.nanos)
    {
        return Err(invalid());
    }
    DateTime::from_timestamp(ts.seconds, ts.nanos as u32).ok_or_else(invalid)
}

pub fn datetime_to_timestamp(t: DateTime<Utc>) -> Timestamp {
    Timestamp {
        seconds: t.timestamp(),
        nanos: t.timestamp_subsec_nanos() as i32,
    }
}

impl TryFrom<&Measurement> for StorableMeasurement {
    type Error = ConversionError;

    fn try_from(m: &Measurement) -> Result<Self, Self::Error> {
        let timestamp = m
            .timestamp
            .as_ref()
            .ok_or(ConversionError::ZeroTimestamp)
            .and_then(timestamp_to_datetime)?;
        if timestamp == super::zero_timestamp() {
            return Err(ConversionError::ZeroTimestamp);
        }

        let upload_timestamp = m
            .upload_timestamp
            .as_ref()
            .map(timestamp_to_datetime)
            .transpose()?;

        Ok(StorableMeasurement {
            device_id: m.device_id.clone(),
            timestamp,
            upload_timestamp,
            temp: m.temp,
        })
    }
}

impl TryFrom<&StorableMeasurement> for Measurement {
    type Error = ConversionError;

    fn try_from(m: &StorableMeasurement) -> Result<Self, Self::Error> {
        if m.has_zero_timestamp() {
            return Err(ConversionError::ZeroTimestamp);
        }

        Ok(Measurement {
            device_id: m.device_id.clone(),
            timestamp: Some(datetime_to_timestamp(m.timestamp)),
            upload_timestamp: m.upload_timestamp.map(datetime_to_timestamp),
            temp: m.temp,
        })
    }
}

impl Measurement {
    /// Storage form with unconvertible timestamps mapped to the zero instant. Only for display.
    fn to_storable_lossy(&self) -> StorableMeasurement {
        let convert = |ts: &Timestamp| timestamp_to_datetime(ts).ok();
        StorableMeasurement {
            device_id: self.device_id.clone(),
            timestamp: self
                .timestamp
                .as_ref()
                .and_then(convert)
                .unwrap_or_else(super::zero_timestamp),
            upload_timestamp: self.upload_timestamp.as_ref().and_then(convert),
            temp: self.temp,
        }
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.to_storable_lossy().fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::tests::ts;
    use prost::Message;

    struct Case {
        name: &'static str,
        wire: Measurement,
        storable: StorableMeasurement,
        valid: bool,
    }

    fn cases() -> Vec<Case> {
        vec![
            Case {
                name: "valid_no_upload_timestamp",
                wire: Measurement {
                    device_id: "foo".into(),
                    timestamp: Some(datetime_to_timestamp(ts(0, 0))),
                    upload_timestamp: None,
                    temp: 18.5,
                },
                storable: StorableMeasurement::new("foo", ts(0, 0), 18.5),
                valid: true,
            },
            Case {
                name: "valid_with_upload_timestamp",
                wire: Measurement {
                    device_id: "foo".into(),
                    timestamp: Some(datetime_to_timestamp(ts(0, 0))),
                    upload_timestamp: Some(datetime_to_timestamp(ts(14, 40))),
                    temp: 18.5,
                },
                storable: StorableMeasurement::new("foo", ts(0, 0), 18.5)
                    .with_upload_timestamp(ts(14, 40)),
                valid: true,
            },
            Case {
                name: "nil_timestamp",
                wire: Measurement {
                    device_id: "foo".into(),
                    timestamp: None,
                    upload_timestamp: None,
                    temp: 18.5,
                },
                storable: StorableMeasurement {
                    device_id: "foo".into(),
                    temp: 18.5,
                    ..Default::default()
                },
                valid: false,
            },
        ]
    }

    #[test]
    fn zero_instant_on_the_wire_is_a_zero_timestamp() {
        let m = Measurement {
            device_id: "foo".into(),
            timestamp: Some(Timestamp {
                seconds: MIN_VALID_SECONDS,
                nanos: 0,
            }),
            upload_timestamp: None,
            temp: 18.5,
        };
        assert_eq!(
            StorableMeasurement::try_from(&m),
            Err(ConversionError::ZeroTimestamp)
        );

        let just_after = Measurement {
            timestamp: Some(Timestamp {
                seconds: MIN_VALID_SECONDS,
                nanos: 1,
            }),
            ..m
        };
        assert!(StorableMeasurement::try_from(&just_after).is_ok());
    }

    #[test]
    fn wire_to_storable() {
        for c in cases() {
            let got = StorableMeasurement::try_from(&c.wire);
            match (got, c.valid) {
                (Ok(got), true) => assert_eq!(got, c.storable, "case {}", c.name),
                (Err(e), true) => panic!("case {}: unexpected error {}", c.name, e),
                (Ok(_), false) => panic!("case {}: expected error", c.name),
                (Err(e), false) => assert_eq!(e, ConversionError::ZeroTimestamp, "case {}", c.name),
            }
        }
    }

    #[test]
    fn storable_to_wire() {
        for c in cases() {
            let got = Measurement::try_from(&c.storable);
            match (got, c.valid) {
                (Ok(got), true) => assert_eq!(got, c.wire, "case {}", c.name),
                (Err(e), true) => panic!("case {}: unexpected error {}", c.name, e),
                (Ok(_), false) => panic!("case {}: expected error", c.name),
                (Err(e), false) => assert_eq!(e, ConversionError::ZeroTimestamp, "case {}", c.name),
            }
        }
    }

    #[test]
    fn round_trip_preserves_absent_upload_timestamp() {
        let original = Measurement {
            device_id: "foo".into(),
            timestamp: Some(Timestamp {
                seconds: 1_521_936_000,
                nanos: 123_456_789,
            }),
            upload_timestamp: None,
            temp: 18.5,
        };
        let bytes = original.encode_to_vec();
        let decoded = Measurement::decode(bytes.as_slice()).unwrap();
        let storable = StorableMeasurement::try_from(&decoded).unwrap();
        assert!(storable.upload_timestamp.is_none());

        let back = Measurement::try_from(&storable).unwrap();
        assert_eq!(back, original);
        assert!(back.upload_timestamp.is_none());
    }

    #[test]
    fn out_of_range_timestamp_is_not_zero_timestamp() {
        let m = Measurement {
            device_id: "foo".into(),
            timestamp: Some(Timestamp {
                seconds: MAX_VALID_SECONDS + 1,
                nanos: 0,
            }),
            upload_timestamp: None,
            temp: 1.0,
        };
        assert!(matches!(
            StorableMeasurement::try_from(&m),
            Err(ConversionError::InvalidTimestamp { .. })
        ));

        let bad_nanos = Measurement {
            timestamp: Some(Timestamp {
                seconds: 0,
                nanos: -1,
            }),
            ..m
        };
        assert!(matches!(
            StorableMeasurement::try_from(&bad_nanos),
            Err(ConversionError::InvalidTimestamp { .. })
        ));
    }

    #[test]
    fn display_matches_storage_form() {
        assert_eq!(Measurement::default().to_string(), " 0.000°C 0001-01-01T00:00:00Z");

        let m = Measurement {
            device_id: "foo".into(),
            timestamp: Some(datetime_to_timestamp(ts(0, 0))),
            upload_timestamp: Some(datetime_to_timestamp(ts(14, 40))),
            temp: 18.3748,
        };
        assert_eq!(
            m.to_string(),
            "foo 18.375°C 2018-03-25T00:00:00Z (14h40m0s upload delay)"
        );
    }
}
