//! Telemetry snapshot and its wire payload.
//!
//! The payload is compact JSON:
//!
//! ```text
//! {"deviceId":"printer-01","metrics":{"jobsPrinted":12,"tempC":41,"errors":0},"ts":"2024-05-01T12:00:03.000Z"}
//! ```
//!
//! Fields the seed document carries beyond these (firmware, location, ...)
//! ride along untouched in `extra`.

use crate::DeviceId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::ops::RangeInclusive;

/// Plausible print-head temperature band, in whole degrees Celsius.
pub const TEMP_RANGE_C: RangeInclusive<i32> = 35..=49;

/// One telemetry reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySnapshot {
    pub device_id: DeviceId,
    pub metrics: Metrics,
    #[serde(with = "iso_millis")]
    pub ts: DateTime<Utc>,
    /// Additional top-level fields carried over from the seed.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TelemetrySnapshot {
    pub fn new(device_id: DeviceId, metrics: Metrics, ts: DateTime<Utc>) -> Self {
        Self {
            device_id,
            metrics,
            ts,
            extra: Map::new(),
        }
    }

    /// Encode as the wire payload.
    pub fn to_payload(&self) -> Result<String, SnapshotError> {
        serde_json::to_string(self).map_err(SnapshotError::Encode)
    }

    /// Decode a wire payload.
    pub fn from_payload(payload: &str) -> Result<Self, SnapshotError> {
        serde_json::from_str(payload).map_err(SnapshotError::Decode)
    }
}

/// The metrics record of a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    /// Lifetime job counter. Only ever increments.
    pub jobs_printed: u64,
    pub temp_c: i32,
    pub errors: ErrorFlag,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Metrics {
    pub fn new(jobs_printed: u64, temp_c: i32, errors: ErrorFlag) -> Self {
        Self {
            jobs_printed,
            temp_c,
            errors,
            extra: Map::new(),
        }
    }

    /// Whether `temp_c` lies inside [`TEMP_RANGE_C`].
    pub fn temp_in_range(&self) -> bool {
        TEMP_RANGE_C.contains(&self.temp_c)
    }
}

/// Error indicator, encoded on the wire as `0` or `1`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ErrorFlag {
    #[default]
    Clear,
    Raised,
}

impl ErrorFlag {
    pub fn is_raised(self) -> bool {
        self == ErrorFlag::Raised
    }
}

impl TryFrom<u8> for ErrorFlag {
    type Error = SnapshotError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ErrorFlag::Clear),
            1 => Ok(ErrorFlag::Raised),
            other => Err(SnapshotError::ErrorFlag(other)),
        }
    }
}

impl From<ErrorFlag> for u8 {
    fn from(flag: ErrorFlag) -> Self {
        match flag {
            ErrorFlag::Clear => 0,
            ErrorFlag::Raised => 1,
        }
    }
}

/// Error encoding or decoding a snapshot.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("failed to encode snapshot: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode snapshot: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("errors flag must be 0 or 1, got {0}")]
    ErrorFlag(u8),
}

/// ISO-8601 UTC with millisecond precision and a `Z` suffix.
pub(crate) mod iso_millis {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> TelemetrySnapshot {
        TelemetrySnapshot {
            device_id: DeviceId::new("printer-01").unwrap(),
            metrics: Metrics::new(12, 41, ErrorFlag::Clear),
            ts: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 3).unwrap(),
            extra: Map::new(),
        }
    }

    #[test]
    fn payload_shape() {
        let payload = sample().to_payload().unwrap();
        assert_eq!(
            payload,
            r#"{"deviceId":"printer-01","metrics":{"jobsPrinted":12,"tempC":41,"errors":0},"ts":"2024-05-01T12:00:03.000Z"}"#
        );
    }

    #[test]
    fn decode_preserves_extra_fields() {
        let payload = r#"{"deviceId":"printer-02","model":"LX-500","metrics":{"jobsPrinted":3,"tempC":38,"errors":1,"tonerPct":80},"ts":"2024-05-01T12:00:03.250Z"}"#;
        let snapshot = TelemetrySnapshot::from_payload(payload).unwrap();
        assert_eq!(snapshot.metrics.errors, ErrorFlag::Raised);
        assert_eq!(snapshot.extra["model"], "LX-500");
        assert_eq!(snapshot.metrics.extra["tonerPct"], 80);
        assert_eq!(snapshot.ts.timestamp_subsec_millis(), 250);

        let again = TelemetrySnapshot::from_payload(&snapshot.to_payload().unwrap()).unwrap();
        assert_eq!(again, snapshot);
    }

    #[test]
    fn rejects_out_of_domain_error_flag() {
        let payload = r#"{"deviceId":"p","metrics":{"jobsPrinted":0,"tempC":40,"errors":2},"ts":"2024-05-01T12:00:00.000Z"}"#;
        assert!(matches!(
            TelemetrySnapshot::from_payload(payload),
            Err(SnapshotError::Decode(_))
        ));
    }

    #[test]
    fn temp_range_check() {
        assert!(Metrics::new(0, 35, ErrorFlag::Clear).temp_in_range());
        assert!(Metrics::new(0, 49, ErrorFlag::Clear).temp_in_range());
        assert!(!Metrics::new(0, 50, ErrorFlag::Clear).temp_in_range());
        assert!(!Metrics::new(0, 34, ErrorFlag::Clear).temp_in_range());
    }
}
