//! Observability infrastructure for the metric watcher
//!
//! Provides:
//! - Prometheus metrics (cycle and query latency, evaluation and delivery counters)
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

use crate::error::FailureKind;

/// Query round trips are network bound; cycles span several of them
const QUERY_LATENCY_BUCKETS: &[f64] = &[0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];
const CYCLE_LATENCY_BUCKETS: &[f64] = &[0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 900.0];

static GLOBAL_METRICS: OnceLock<DetectorMetricsInner> = OnceLock::new();

struct DetectorMetricsInner {
    cycle_latency_seconds: Histogram,
    query_latency_seconds: Histogram,
    cycles: IntCounter,
    jobs_failed: IntCounterVec,
    metrics_evaluated: IntCounter,
    metrics_skipped: IntCounter,
    anomalies_detected: IntCounter,
    records_persisted: IntCounter,
    notifications_sent: IntCounter,
    notifications_failed: IntCounter,
    last_bucket_timestamp: IntGauge,
}

impl DetectorMetricsInner {
    fn new() -> Self {
        Self {
            cycle_latency_seconds: register_histogram!(
                "watcher_cycle_latency_seconds",
                "Wall time of one detection cycle",
                CYCLE_LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register cycle_latency_seconds"),

            query_latency_seconds: register_histogram!(
                "watcher_query_latency_seconds",
                "Round trip time of store queries",
                QUERY_LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register query_latency_seconds"),

            cycles: register_int_counter!(
                "watcher_cycles_total",
                "Total number of detection cycles run"
            )
            .expect("Failed to register cycles"),

            jobs_failed: register_int_counter_vec!(
                "watcher_jobs_failed_total",
                "Jobs aborted within a cycle, by failure kind",
                &["kind"]
            )
            .expect("Failed to register jobs_failed"),

            metrics_evaluated: register_int_counter!(
                "watcher_metrics_evaluated_total",
                "Metric and slice value combinations evaluated"
            )
            .expect("Failed to register metrics_evaluated"),

            metrics_skipped: register_int_counter!(
                "watcher_metrics_skipped_total",
                "Metric evaluations skipped for missing or degenerate data"
            )
            .expect("Failed to register metrics_skipped"),

            anomalies_detected: register_int_counter!(
                "watcher_anomalies_detected_total",
                "Total number of anomalies detected"
            )
            .expect("Failed to register anomalies_detected"),

            records_persisted: register_int_counter!(
                "watcher_records_persisted_total",
                "Rows appended to the anomaly log"
            )
            .expect("Failed to register records_persisted"),

            notifications_sent: register_int_counter!(
                "watcher_notifications_sent_total",
                "Alerts delivered to the notification channel"
            )
            .expect("Failed to register notifications_sent"),

            notifications_failed: register_int_counter!(
                "watcher_notifications_failed_total",
                "Alerts the notification channel rejected"
            )
            .expect("Failed to register notifications_failed"),

            last_bucket_timestamp: register_int_gauge!(
                "watcher_last_bucket_timestamp_seconds",
                "Start of the most recently evaluated bucket, unix seconds"
            )
            .expect("Failed to register last_bucket_timestamp"),
        }
    }
}

/// Watcher metrics for Prometheus exposition
///
/// A lightweight handle to the global metrics instance; clones share the
/// same underlying metrics.
#[derive(Clone)]
pub struct DetectorMetrics {
    _private: (),
}

impl Default for DetectorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DetectorMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DetectorMetrics")
    }
}

impl DetectorMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(DetectorMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &DetectorMetricsInner {
        GLOBAL_METRICS.get_or_init(DetectorMetricsInner::new)
    }

    pub fn observe_cycle_latency(&self, duration_secs: f64) {
        self.inner().cycle_latency_seconds.observe(duration_secs);
    }

    pub fn observe_query_latency(&self, duration_secs: f64) {
        self.inner().query_latency_seconds.observe(duration_secs);
    }

    pub fn inc_cycles(&self) {
        self.inner().cycles.inc();
    }

    pub fn inc_jobs_failed(&self, kind: FailureKind) {
        self.inner()
            .jobs_failed
            .with_label_values(&[kind.as_str()])
            .inc();
    }

    pub fn inc_metrics_evaluated(&self) {
        self.inner().metrics_evaluated.inc();
    }

    pub fn inc_metrics_skipped(&self) {
        self.inner().metrics_skipped.inc();
    }

    pub fn inc_anomalies_detected(&self) {
        self.inner().anomalies_detected.inc();
    }

    pub fn inc_records_persisted(&self) {
        self.inner().records_persisted.inc();
    }

    pub fn inc_notifications_sent(&self) {
        self.inner().notifications_sent.inc();
    }

    pub fn inc_notifications_failed(&self) {
        self.inner().notifications_failed.inc();
    }

    pub fn set_last_bucket(&self, bucket_start: chrono::NaiveDateTime) {
        self.inner()
            .last_bucket_timestamp
            .set(bucket_start.and_utc().timestamp());
    }
}

/// Structured logger for watcher events
///
/// Every record carries an `event` tag so log pipelines can filter
/// evaluations, anomalies and failures without parsing messages.
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    pub fn log_startup(&self, version: &str, jobs: usize, metrics: usize) {
        info!(
            event = "watcher_started",
            instance = %self.instance,
            version = %version,
            jobs = jobs,
            metrics = metrics,
            "Metric watcher started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "watcher_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Metric watcher shutting down"
        );
    }

    #[allow(clippy::too_many_arguments)]
    pub fn log_evaluation(
        &self,
        metric: &str,
        slice: &str,
        group_level: &str,
        day_0: f64,
        day_1_diff: f64,
        day_7_diff: f64,
        verdict: &str,
    ) {
        info!(
            event = "metric_evaluated",
            instance = %self.instance,
            metric = %metric,
            slice = %slice,
            group_level = %group_level,
            day_0_value = day_0,
            day_1_diff = day_1_diff,
            day_7_diff = day_7_diff,
            verdict = %verdict,
            "Metric evaluated"
        );
    }

    pub fn log_anomaly(
        &self,
        metric: &str,
        slice: &str,
        group_level: &str,
        bucket: &str,
        day_1_diff: f64,
        day_7_diff: f64,
    ) {
        warn!(
            event = "anomaly_detected",
            instance = %self.instance,
            metric = %metric,
            slice = %slice,
            group_level = %group_level,
            bucket = %bucket,
            day_1_diff = day_1_diff,
            day_7_diff = day_7_diff,
            "Anomaly detected"
        );
    }

    pub fn log_job_failure(&self, job: &str, kind: FailureKind, error: &str) {
        warn!(
            event = "job_failed",
            instance = %self.instance,
            job = %job,
            kind = %kind,
            error = %error,
            "Detection job failed"
        );
    }

    pub fn log_notification_failure(&self, metric: &str, group_level: &str, error: &str) {
        warn!(
            event = "notification_failed",
            instance = %self.instance,
            metric = %metric,
            group_level = %group_level,
            error = %error,
            "Alert delivery failed"
        );
    }

    #[allow(clippy::too_many_arguments)]
    pub fn log_cycle(
        &self,
        bucket: &str,
        jobs_succeeded: usize,
        jobs_failed: usize,
        evaluated: usize,
        skipped: usize,
        anomalies: usize,
        duration_ms: u128,
    ) {
        if jobs_failed == 0 {
            info!(
                event = "cycle_completed",
                instance = %self.instance,
                bucket = %bucket,
                jobs_succeeded = jobs_succeeded,
                jobs_failed = jobs_failed,
                evaluated = evaluated,
                skipped = skipped,
                anomalies = anomalies,
                duration_ms = duration_ms as u64,
                "Detection cycle completed"
            );
        } else {
            warn!(
                event = "cycle_completed",
                instance = %self.instance,
                bucket = %bucket,
                jobs_succeeded = jobs_succeeded,
                jobs_failed = jobs_failed,
                evaluated = evaluated,
                skipped = skipped,
                anomalies = anomalies,
                duration_ms = duration_ms as u64,
                "Detection cycle completed with failures"
            );
        }
    }
}
