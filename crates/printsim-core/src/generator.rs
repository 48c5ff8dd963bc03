//! Telemetry generator.
//!
//! Each step takes three uniform draws in `[0, 1)`, in this order: job
//! completion, temperature, error. The order is part of the contract, since
//! a scripted randomness source relies on it.

use crate::snapshot::{ErrorFlag, TEMP_RANGE_C, TelemetrySnapshot};
use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// A job completes when the draw exceeds this (p = 0.4).
pub const JOB_THRESHOLD: f64 = 0.6;
/// The error flag is raised when the draw exceeds this (p = 0.05).
pub const ERROR_THRESHOLD: f64 = 0.95;

/// Produce the snapshot that follows `previous`.
///
/// `now` is truncated to milliseconds. If it does not come after
/// `previous.ts`, the new timestamp is `previous.ts + 1ms`, so timestamps
/// strictly increase along any generated sequence.
pub fn next_snapshot<R: Rng>(
    previous: &TelemetrySnapshot,
    rng: &mut R,
    now: DateTime<Utc>,
) -> TelemetrySnapshot {
    let job_roll: f64 = rng.random();
    let temp_roll: f64 = rng.random();
    let error_roll: f64 = rng.random();

    let mut metrics = previous.metrics.clone();
    if job_roll > JOB_THRESHOLD {
        metrics.jobs_printed = metrics.jobs_printed.saturating_add(1);
    }
    metrics.temp_c = temperature(temp_roll);
    metrics.errors = if error_roll > ERROR_THRESHOLD {
        ErrorFlag::Raised
    } else {
        ErrorFlag::Clear
    };

    TelemetrySnapshot {
        device_id: previous.device_id.clone(),
        metrics,
        ts: next_timestamp(previous.ts, now),
        extra: previous.extra.clone(),
    }
}

fn temperature(roll: f64) -> i32 {
    let low = *TEMP_RANGE_C.start();
    let high = *TEMP_RANGE_C.end();
    let span = f64::from(high - low + 1);
    (low + (roll * span).floor() as i32).clamp(low, high)
}

fn next_timestamp(previous: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    now.trunc_subsecs(3).max(previous + TimeDelta::milliseconds(1))
}

/// Stateful wrapper pairing a randomness source with the wall clock.
#[derive(Debug)]
pub struct TelemetryGenerator<R> {
    rng: R,
}

impl<R: Rng> TelemetryGenerator<R> {
    pub fn new(rng: R) -> Self {
        Self { rng }
    }

    /// Generate the next snapshot, stamped with the current time.
    pub fn next(&mut self, previous: &TelemetrySnapshot) -> TelemetrySnapshot {
        next_snapshot(previous, &mut self.rng, Utc::now())
    }
}

impl TelemetryGenerator<StdRng> {
    /// A generator seeded from the operating system.
    pub fn from_os_rng() -> Self {
        Self::new(StdRng::from_os_rng())
    }

    /// A reproducible generator.
    pub fn seeded(seed: u64) -> Self {
        Self::new(StdRng::seed_from_u64(seed))
    }
}
