//! Core types for printsim.
//!
//! This crate models the simulated printer: its identity, the telemetry
//! snapshot it publishes, the seed document it starts from, and the
//! generator that evolves one snapshot into the next. It has no I/O beyond
//! reading the seed file; transport lives in `printsim-client`.

mod device;
mod generator;
mod seed;
mod snapshot;

pub use device::{DeviceId, DeviceIdError};
pub use generator::{ERROR_THRESHOLD, JOB_THRESHOLD, TelemetryGenerator, next_snapshot};
pub use seed::{SeedDocument, SeedError};
pub use snapshot::{ErrorFlag, Metrics, SnapshotError, TEMP_RANGE_C, TelemetrySnapshot};
