//! Simulated 3D printer publishing telemetry to AWS IoT Core.
//!
//! Run against a real broker (credentials come from the standard AWS
//! environment variables or the shared `~/.aws/credentials` profile):
//!   printsim --endpoint a1b2c3-ats.iot.us-east-1.amazonaws.com
//!
//! Log payloads without touching the network:
//!   printsim --endpoint example.invalid --dry-run
//!
//! Replay recorded observations:
//!   printsim --endpoint ... --topic anom/detect replay observations.json

mod config;
mod dry_run;
mod publish_loop;
mod replay;

use anyhow::Context;
use clap::Parser;
use config::{Cli, Command, Config, ReplayArgs};
use dry_run::DryRunPublisher;
use printsim_client::{ConnectionManager, DefaultCredentials, Publisher};
use printsim_core::{SeedDocument, TelemetryGenerator, TelemetrySnapshot};
use publish_loop::PublishLoop;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Work that is fully loaded before any connection is attempted.
enum Job {
    Simulate(TelemetrySnapshot),
    Replay {
        observations: Vec<Value>,
        spacing: Duration,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env().add_directive("printsim=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = Config::resolve(&cli)?;
    let job = prepare(&cli, &config)?;

    if config.dry_run {
        tracing::info!(topic = %config.publish.topic, "Dry run; nothing will be sent");
        return execute(Arc::new(DryRunPublisher), &config, job).await;
    }

    let manager = Arc::new(ConnectionManager::new(&config.broker, DefaultCredentials::new()));
    manager
        .connect()
        .await
        .with_context(|| format!("could not connect to {}", config.broker.url()))?;

    let outcome = execute(Arc::clone(&manager), &config, job).await;
    manager.disconnect().await;
    outcome
}

fn prepare(cli: &Cli, config: &Config) -> anyhow::Result<Job> {
    match &cli.command {
        None | Some(Command::Simulate) => {
            let seed = SeedDocument::from_path(&config.seed)?;
            let initial = seed.into_snapshot(chrono::Utc::now());
            tracing::info!(device_id = %initial.device_id, "Loaded seed {}", config.seed.display());
            Ok(Job::Simulate(initial))
        }
        Some(Command::Replay(ReplayArgs { file, spacing_ms })) => {
            let observations = replay::load_observations(file)?;
            tracing::info!(count = observations.len(), "Loaded observations from {}", file.display());
            Ok(Job::Replay {
                observations,
                spacing: Duration::from_millis(*spacing_ms),
            })
        }
    }
}

async fn execute<P>(publisher: Arc<P>, config: &Config, job: Job) -> anyhow::Result<()>
where
    P: Publisher + 'static,
{
    match job {
        Job::Simulate(initial) => {
            let mut publish_loop = PublishLoop::new(
                publisher,
                &config.publish,
                TelemetryGenerator::from_os_rng(),
                initial,
            );
            publish_loop.run(shutdown_signal()).await;
            let last = publish_loop.current();
            tracing::info!(
                jobs_printed = last.metrics.jobs_printed,
                ts = %last.ts,
                "Final snapshot"
            );
        }
        Job::Replay {
            observations,
            spacing,
        } => {
            let report = replay::replay(
                publisher.as_ref(),
                &config.publish.topic,
                &observations,
                spacing,
                shutdown_signal(),
            )
            .await;
            tracing::info!(
                published = report.published,
                failed = report.failed,
                skipped = report.skipped,
                "Replay finished"
            );
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!("Ctrl-C handler unavailable: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!("SIGTERM handler unavailable: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    tracing::info!("Shutdown requested");
}
