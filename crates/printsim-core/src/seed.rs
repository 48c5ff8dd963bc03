//! Seed document: the template the first snapshot is built from.

use crate::{DeviceId, Metrics, TelemetrySnapshot};
use chrono::{DateTime, SubsecRound, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

/// Device identity plus initial metrics, read once at startup.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedDocument {
    pub device_id: DeviceId,
    pub metrics: Metrics,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SeedDocument {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, SeedError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| SeedError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw).map_err(|source| SeedError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// The initial snapshot. Any `ts` in the document is replaced by `now`.
    pub fn into_snapshot(mut self, now: DateTime<Utc>) -> TelemetrySnapshot {
        self.extra.remove("ts");
        TelemetrySnapshot {
            device_id: self.device_id,
            metrics: self.metrics,
            ts: now.trunc_subsecs(3),
            extra: self.extra,
        }
    }
}

/// Error loading a seed document.
#[derive(Debug, thiserror::Error)]
pub enum SeedError {
    #[error("failed to read seed document {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid seed document {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorFlag;
    use chrono::TimeZone;
    use std::io::Write;

    const SEED: &str = r#"{
        "deviceId": "printer-01",
        "location": "floor-2",
        "metrics": { "jobsPrinted": 120, "tempC": 40, "errors": 0, "paperLevel": "ok" },
        "ts": "2020-01-01T00:00:00Z"
    }"#;

    #[test]
    fn builds_initial_snapshot() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let snapshot = SeedDocument::from_json(SEED).unwrap().into_snapshot(now);
        assert_eq!(snapshot.device_id.as_str(), "printer-01");
        assert_eq!(snapshot.metrics.jobs_printed, 120);
        assert_eq!(snapshot.metrics.errors, ErrorFlag::Clear);
        assert_eq!(snapshot.metrics.extra["paperLevel"], "ok");
        assert_eq!(snapshot.extra["location"], "floor-2");
        assert!(!snapshot.extra.contains_key("ts"));
        assert_eq!(snapshot.ts, now);
    }

    #[test]
    fn reads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SEED.as_bytes()).unwrap();
        let seed = SeedDocument::from_path(file.path()).unwrap();
        assert_eq!(seed.metrics.temp_c, 40);
    }

    #[test]
    fn missing_file_names_path() {
        let err = SeedDocument::from_path("/nonexistent/printer.json").unwrap_err();
        assert!(matches!(err, SeedError::Read { .. }));
        assert!(err.to_string().contains("/nonexistent/printer.json"));
    }

    #[test]
    fn missing_metrics_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"{"deviceId":"printer-01"}"#).unwrap();
        assert!(matches!(
            SeedDocument::from_path(file.path()),
            Err(SeedError::Parse { .. })
        ));
    }
}
