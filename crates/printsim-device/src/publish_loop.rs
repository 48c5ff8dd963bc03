//! The periodic publish loop.

use crate::config::PublishSettings;
use printsim_client::{Ack, PublishError, Publisher};
use printsim_core::{TelemetryGenerator, TelemetrySnapshot};
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};

/// Totals for one run of the loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopReport {
    pub ticks: u64,
    pub published: u64,
    pub failed: u64,
}

type Attempt = (String, Result<Ack, PublishError>);

/// Advances the snapshot every tick and publishes it without waiting for
/// earlier publishes to finish.
pub struct PublishLoop<P, R> {
    publisher: Arc<P>,
    settings: PublishSettings,
    generator: TelemetryGenerator<R>,
    current: TelemetrySnapshot,
}

impl<P, R> PublishLoop<P, R>
where
    P: Publisher + 'static,
    R: Rng,
{
    pub fn new(
        publisher: Arc<P>,
        settings: &PublishSettings,
        generator: TelemetryGenerator<R>,
        initial: TelemetrySnapshot,
    ) -> Self {
        Self {
            publisher,
            settings: settings.clone(),
            generator,
            current: initial,
        }
    }

    /// The most recently generated snapshot.
    pub fn current(&self) -> &TelemetrySnapshot {
        &self.current
    }

    /// Tick until `shutdown` resolves, then wait for in-flight publishes.
    ///
    /// The first tick fires one interval after the call.
    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) -> LoopReport {
        let period = self.settings.interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut in_flight: JoinSet<Attempt> = JoinSet::new();
        let mut report = LoopReport::default();
        let mut streak = FailureStreak::new(self.settings.failure_alert_threshold);
        tokio::pin!(shutdown);

        tracing::info!(
            topic = %self.settings.topic,
            interval_ms = period.as_millis() as u64,
            "Publish loop started"
        );

        loop {
            tokio::select! {
                () = &mut shutdown => break,

                _ = ticker.tick() => {
                    report.ticks += 1;
                    self.current = self.generator.next(&self.current);
                    let payload = match self.current.to_payload() {
                        Ok(payload) => payload,
                        Err(err) => {
                            tracing::warn!("Snapshot could not be serialized: {}", err);
                            report.failed += 1;
                            streak.failure();
                            continue;
                        }
                    };

                    let publisher = Arc::clone(&self.publisher);
                    let topic = self.settings.topic.clone();
                    let qos = self.settings.qos;
                    in_flight.spawn(async move {
                        let result = publisher.publish(&topic, payload.as_bytes(), qos).await;
                        (payload, result)
                    });
                }

                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    record(&self.settings.topic, joined, &mut report, &mut streak);
                }
            }
        }

        if !in_flight.is_empty() {
            tracing::info!(pending = in_flight.len(), "Waiting for in-flight publishes");
        }
        while let Some(joined) = in_flight.join_next().await {
            record(&self.settings.topic, joined, &mut report, &mut streak);
        }

        tracing::info!(
            ticks = report.ticks,
            published = report.published,
            failed = report.failed,
            "Publish loop stopped"
        );
        report
    }
}

fn record(
    topic: &str,
    joined: Result<Attempt, JoinError>,
    report: &mut LoopReport,
    streak: &mut FailureStreak,
) {
    match joined {
        Ok((payload, Ok(ack))) => {
            report.published += 1;
            streak.success();
            tracing::info!(topic, packet_id = ?ack.packet_id, "Published {}", payload);
        }
        Ok((_, Err(err))) => {
            report.failed += 1;
            streak.failure();
            tracing::warn!(topic, "Publish failed: {}", err);
        }
        Err(err) => {
            report.failed += 1;
            streak.failure();
            tracing::warn!(topic, "Publish task aborted: {}", err);
        }
    }
}

/// Counts consecutive failures and raises one alert per streak.
#[derive(Debug)]
struct FailureStreak {
    threshold: u32,
    count: u32,
}

impl FailureStreak {
    /// A zero threshold never alerts.
    fn new(threshold: u32) -> Self {
        Self {
            threshold,
            count: 0,
        }
    }

    /// Returns true when this failure crossed the threshold.
    fn failure(&mut self) -> bool {
        self.count = self.count.saturating_add(1);
        let alert = self.threshold > 0 && self.count == self.threshold;
        if alert {
            tracing::error!(
                "{} consecutive publishes failed; the broker session may be gone",
                self.count
            );
        }
        alert
    }

    fn success(&mut self) {
        if self.threshold > 0 && self.count >= self.threshold {
            tracing::info!("Publishing recovered after {} failures", self.count);
        }
        self.count = 0;
    }
}
