//! Periodic detection loop
//!
//! Runs one cycle per tick until a shutdown signal arrives and mirrors each
//! cycle's outcome into the health registry.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

use super::{CycleOrchestrator, CycleStage, CycleSummary};
use crate::error::Result;
use crate::health::{components, CycleDigest, HealthRegistry};

/// Cadence of detection cycles, one bucket width
pub const DETECTION_INTERVAL: Duration = Duration::from_secs(15 * 60);

pub struct DetectionLoop {
    orchestrator: Arc<CycleOrchestrator>,
    health: HealthRegistry,
    interval: Duration,
}

impl DetectionLoop {
    pub fn new(orchestrator: Arc<CycleOrchestrator>, health: HealthRegistry) -> Self {
        Self {
            orchestrator,
            health,
            interval: DETECTION_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Tick until shutdown; a cycle that overruns swallows the missed ticks
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.interval.as_secs(),
            jobs = self.orchestrator.catalog().jobs().len(),
            "Starting detection loop"
        );

        for name in components::ALL {
            self.health.register(name).await;
        }
        self.health.set_ready(true).await;

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let _ = self.run_once().await;
                }
                _ = shutdown.recv() => {
                    info!("Shutting down detection loop");
                    break;
                }
            }
        }

        self.health
            .set_unhealthy(components::SCHEDULER, "detection loop stopped")
            .await;
    }

    /// Run a single cycle and record its outcome in the health registry
    pub async fn run_once(&self) -> Result<CycleSummary> {
        match self.orchestrator.run_cycle().await {
            Ok(summary) => {
                self.report(&summary).await;
                Ok(summary)
            }
            Err(e) => {
                error!(error = %e, "Could not resolve the current bucket, cycle skipped");
                self.health
                    .set_unhealthy(components::QUERY_STORE, e.to_string())
                    .await;
                self.health
                    .set_degraded(components::SCHEDULER, "last cycle did not run")
                    .await;
                Err(e)
            }
        }
    }

    async fn report(&self, summary: &CycleSummary) {
        self.health
            .record_cycle(CycleDigest {
                bucket: summary.bucket.to_string(),
                completed_at: chrono::Utc::now(),
                jobs_failed: summary.jobs_failed,
                anomalies: summary.anomalies,
            })
            .await;

        let stages = [
            (components::QUERY_STORE, CycleStage::Query),
            (components::ANOMALY_LOG, CycleStage::Log),
            (components::NOTIFIER, CycleStage::Notify),
        ];
        for (component, stage) in stages {
            let failed = summary.failures_at(stage).count();
            if failed == 0 {
                self.health.set_healthy(component).await;
            } else {
                self.health
                    .set_degraded(
                        component,
                        format!("{} {} failures in last cycle", failed, stage.as_str()),
                    )
                    .await;
            }
        }

        if summary.jobs_failed == 0 {
            self.health.set_healthy(components::SCHEDULER).await;
        } else {
            self.health
                .set_degraded(
                    components::SCHEDULER,
                    format!("{} jobs failed in last cycle", summary.jobs_failed),
                )
                .await;
        }
    }
}
