//! Replays recorded observations from a JSON array file.

use printsim_client::{Publisher, QoS};
use serde_json::Value;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("failed to read observations {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid JSON in {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("expected a JSON array in {}", path.display())]
    NotArray { path: PathBuf },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub published: usize,
    pub failed: usize,
    /// Observations left unsent because shutdown was requested.
    pub skipped: usize,
}

pub fn load_observations(path: &Path) -> Result<Vec<Value>, ReplayError> {
    let text = std::fs::read_to_string(path).map_err(|source| ReplayError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    match serde_json::from_str(&text) {
        Ok(Value::Array(observations)) => Ok(observations),
        Ok(_) => Err(ReplayError::NotArray {
            path: path.to_path_buf(),
        }),
        Err(source) => Err(ReplayError::Parse {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Publish each observation in order at QoS 1, pausing `spacing` between
/// them. A failed publish is logged and the replay moves on.
pub async fn replay<P: Publisher>(
    publisher: &P,
    topic: &str,
    observations: &[Value],
    spacing: Duration,
    shutdown: impl Future<Output = ()>,
) -> ReplayReport {
    let mut report = ReplayReport::default();
    tokio::pin!(shutdown);

    for (index, observation) in observations.iter().enumerate() {
        if index > 0 && !spacing.is_zero() {
            tokio::select! {
                () = &mut shutdown => {
                    report.skipped = observations.len() - index;
                    tracing::info!(skipped = report.skipped, "Replay interrupted");
                    break;
                }
                () = tokio::time::sleep(spacing) => {}
            }
        }

        let payload = observation.to_string();
        match publisher
            .publish(topic, payload.as_bytes(), QoS::AtLeastOnce)
            .await
        {
            Ok(_) => {
                report.published += 1;
                tracing::info!(topic, "Emitted observation: {}", payload);
            }
            Err(err) => {
                report.failed += 1;
                tracing::warn!(topic, index, "Observation not emitted: {}", err);
            }
        }
    }
    report
}
