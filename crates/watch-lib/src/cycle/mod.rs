//! Detection cycles
//!
//! A cycle resolves the current bucket from the freshest ingested data, runs
//! every configured job concurrently and reports a tally of what happened.
//! [`DetectionLoop`] repeats cycles on a fixed cadence.

mod r#loop;
mod orchestrator;

#[cfg(test)]
mod tests;

pub use orchestrator::{CycleOrchestrator, CycleOrchestratorBuilder};
pub use r#loop::{DetectionLoop, DETECTION_INTERVAL};

use std::time::Duration;

use chrono::NaiveTime;

use crate::anomaly::{DEFAULT_COOLDOWN_MINUTES, DEFAULT_THRESHOLD};
use crate::error::{DetectorError, FailureKind};
use crate::models::{MetricId, TimeBucket};
use crate::query::QuerySettings;

/// Tunables of the detection model
#[derive(Debug, Clone)]
pub struct DetectionConfig {
    /// Minimum relative deviation against both references
    pub threshold: f64,
    /// Minimum spacing between alerts of one stream
    pub cooldown: chrono::Duration,
    /// Buckets in the D-1 and D-7 reference windows
    pub n_time_periods: u32,
    /// Events before this time of day are excluded
    pub earliest_time_of_day: NaiveTime,
    pub time_column: String,
    /// Upper bound on jobs running at once
    pub max_concurrent_jobs: usize,
    /// Table whose freshest event defines the current bucket
    pub primary_table: String,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        let query = QuerySettings::default();
        Self {
            threshold: DEFAULT_THRESHOLD,
            cooldown: chrono::Duration::minutes(DEFAULT_COOLDOWN_MINUTES),
            n_time_periods: query.n_time_periods,
            earliest_time_of_day: query.earliest_time_of_day,
            time_column: query.time_column,
            max_concurrent_jobs: 4,
            primary_table: "feed_actions".to_string(),
        }
    }
}

impl DetectionConfig {
    pub fn query_settings(&self) -> QuerySettings {
        QuerySettings {
            n_time_periods: self.n_time_periods,
            earliest_time_of_day: self.earliest_time_of_day,
            time_column: self.time_column.clone(),
        }
    }
}

/// Step of the per-job state machine where a failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleStage {
    Build,
    Query,
    Evaluate,
    /// Suppression lookup or record append
    Log,
    Notify,
}

impl CycleStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleStage::Build => "build",
            CycleStage::Query => "query",
            CycleStage::Evaluate => "evaluate",
            CycleStage::Log => "log",
            CycleStage::Notify => "notify",
        }
    }
}

/// One failure reported in a cycle summary
#[derive(Debug, Clone)]
pub struct CycleFailure {
    pub job: String,
    pub metric: Option<MetricId>,
    pub group_level: Option<String>,
    pub stage: CycleStage,
    pub kind: FailureKind,
    pub message: String,
}

impl CycleFailure {
    pub(crate) fn new(job: &str, stage: CycleStage, error: &DetectorError) -> Self {
        Self {
            job: job.to_string(),
            metric: None,
            group_level: None,
            stage,
            kind: error.kind(),
            message: error.to_string(),
        }
    }

    pub(crate) fn for_stream(mut self, metric: &MetricId, group_level: &str) -> Self {
        self.metric = Some(metric.clone());
        self.group_level = Some(group_level.to_string());
        self
    }
}

/// End-of-cycle tally
#[derive(Debug, Clone)]
pub struct CycleSummary {
    pub bucket: TimeBucket,
    pub jobs_succeeded: usize,
    pub jobs_failed: usize,
    pub evaluated: usize,
    pub skipped: usize,
    pub anomalies: usize,
    pub notified: usize,
    pub failures: Vec<CycleFailure>,
    pub duration: Duration,
}

impl CycleSummary {
    pub(crate) fn new(bucket: TimeBucket) -> Self {
        Self {
            bucket,
            jobs_succeeded: 0,
            jobs_failed: 0,
            evaluated: 0,
            skipped: 0,
            anomalies: 0,
            notified: 0,
            failures: Vec::new(),
            duration: Duration::ZERO,
        }
    }

    /// Failures recorded at the given stage
    pub fn failures_at(&self, stage: CycleStage) -> impl Iterator<Item = &CycleFailure> {
        self.failures.iter().filter(move |failure| failure.stage == stage)
    }

    pub fn is_clean(&self) -> bool {
        self.jobs_failed == 0 && self.failures.is_empty()
    }
}
