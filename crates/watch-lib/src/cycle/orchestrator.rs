//! One detection pass over every configured job

use std::sync::Arc;
use std::time::Instant;

use chrono::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use super::{CycleFailure, CycleStage, CycleSummary, DetectionConfig};
use crate::anomaly::{AnomalyEvaluator, Evaluation, EvaluationSubject, SuppressionTracker};
use crate::catalog::Catalog;
use crate::clock::{Clock, SystemClock};
use crate::error::{DetectorError, FailureKind, Result};
use crate::models::{
    JobSpec, MetricDefinition, ReferenceDay, ReferenceTriple, Row, SliceDefinition,
    SuppressionKey, TimeBucket, TOTAL,
};
use crate::notify::{Notifier, TrendSeries};
use crate::observability::{DetectorMetrics, StructuredLogger};
use crate::query::{QueryBuilder, QuerySettings, WindowMode, DATE_COLUMN};
use crate::store::{AnomalyLog, MetricStore};

/// Error tagged with the stage it surfaced in
struct StageError {
    stage: CycleStage,
    error: DetectorError,
}

trait AtStage<T> {
    fn at(self, stage: CycleStage) -> std::result::Result<T, StageError>;
}

impl<T> AtStage<T> for Result<T> {
    fn at(self, stage: CycleStage) -> std::result::Result<T, StageError> {
        self.map_err(|error| StageError { stage, error })
    }
}

/// Counters gathered by one job
#[derive(Debug, Default)]
struct JobReport {
    evaluated: usize,
    skipped: usize,
    anomalies: usize,
    notified: usize,
    failures: Vec<CycleFailure>,
}

/// Rows of one slice value
struct Group<'r> {
    level: String,
    rows: Vec<&'r Row>,
}

/// Drives detection cycles against injected collaborators
pub struct CycleOrchestrator {
    catalog: Arc<Catalog>,
    store: Arc<dyn MetricStore>,
    log: Arc<dyn AnomalyLog>,
    notifier: Arc<Notifier>,
    clock: Arc<dyn Clock>,
    evaluator: AnomalyEvaluator,
    config: DetectionConfig,
    query_settings: QuerySettings,
    metrics: DetectorMetrics,
    logger: StructuredLogger,
}

impl CycleOrchestrator {
    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Latest complete bucket, one width behind the freshest ingested event
    pub async fn resolve_bucket(&self) -> Result<TimeBucket> {
        let since = self.clock.now().date_naive() - Duration::days(1);
        let freshest = self
            .store
            .freshest_timestamp(&self.config.primary_table, &self.config.time_column, since)
            .await?
            .ok_or_else(|| {
                DetectorError::data_unavailable(format!(
                    "no events in {} since {}",
                    self.config.primary_table, since
                ))
            })?;
        Ok(TimeBucket::latest_complete(freshest))
    }

    /// Run every job once against the current bucket
    ///
    /// Only a failure to resolve the bucket fails the cycle; job and metric
    /// failures are collected in the summary.
    pub async fn run_cycle(self: &Arc<Self>) -> Result<CycleSummary> {
        let start = Instant::now();
        self.metrics.inc_cycles();

        let bucket = self.resolve_bucket().await?;
        self.metrics.set_last_bucket(bucket.start());
        debug!(bucket = %bucket, jobs = self.catalog.jobs().len(), "Starting detection cycle");

        // Fresh per cycle; the anomaly log stays authoritative
        let tracker = Arc::new(SuppressionTracker::new(Arc::clone(&self.log)));
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_jobs.max(1)));
        let mut jobs = JoinSet::new();

        for job in self.catalog.jobs().iter().cloned() {
            let this = Arc::clone(self);
            let tracker = Arc::clone(&tracker);
            let permits = Arc::clone(&permits);
            jobs.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                let mut report = JobReport::default();
                let result = this.run_job(&job, bucket, &tracker, &mut report).await;
                (job.label(), report, result)
            });
        }

        let mut summary = CycleSummary::new(bucket);
        while let Some(joined) = jobs.join_next().await {
            let (label, report, result) = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(error = %e, "Detection job task aborted");
                    summary.jobs_failed += 1;
                    continue;
                }
            };

            summary.evaluated += report.evaluated;
            summary.skipped += report.skipped;
            summary.anomalies += report.anomalies;
            summary.notified += report.notified;
            summary.failures.extend(report.failures);

            match result {
                Ok(()) => summary.jobs_succeeded += 1,
                Err(StageError { stage, error }) => {
                    summary.jobs_failed += 1;
                    self.metrics.inc_jobs_failed(error.kind());
                    self.logger
                        .log_job_failure(&label, error.kind(), &error.to_string());
                    summary
                        .failures
                        .push(CycleFailure::new(&label, stage, &error));
                }
            }
        }

        summary.duration = start.elapsed();
        self.metrics
            .observe_cycle_latency(summary.duration.as_secs_f64());
        self.logger.log_cycle(
            &bucket.to_string(),
            summary.jobs_succeeded,
            summary.jobs_failed,
            summary.evaluated,
            summary.skipped,
            summary.anomalies,
            summary.duration.as_millis(),
        );
        Ok(summary)
    }

    async fn run_job(
        &self,
        job: &JobSpec,
        bucket: TimeBucket,
        tracker: &SuppressionTracker,
        report: &mut JobReport,
    ) -> std::result::Result<(), StageError> {
        let label = job.label();
        let builder = QueryBuilder::new(&self.catalog, &self.query_settings);
        let query = builder
            .build(&job.metrics, &job.slice, WindowMode::Aggregate, bucket)
            .at(CycleStage::Build)?;
        let definitions = job
            .metrics
            .iter()
            .map(|id| self.catalog.metric(id))
            .collect::<Result<Vec<_>>>()
            .at(CycleStage::Build)?;
        let slice = self.catalog.selector(&job.slice).at(CycleStage::Build)?;

        let rows = self.store.fetch(&query).await.at(CycleStage::Query)?;
        debug!(job = %label, rows = rows.len(), "Fetched reference rows");

        // TIMESERIES rows are fetched at most once per job, on the first alert
        let mut trend_rows: Option<Vec<Row>> = None;

        for group in split_by_group(&rows, slice) {
            for metric in &definitions {
                let evaluation = match self.evaluate(metric, job, &group, bucket, tracker).await {
                    Ok(evaluation) => evaluation,
                    Err(StageError { stage, error }) if error.kind() == FailureKind::DataUnavailable => {
                        report.skipped += 1;
                        self.metrics.inc_metrics_skipped();
                        warn!(
                            job = %label,
                            metric = %metric.id,
                            group_level = %group.level,
                            error = %error,
                            "Metric skipped"
                        );
                        report.failures.push(
                            CycleFailure::new(&label, stage, &error)
                                .for_stream(&metric.id, &group.level),
                        );
                        continue;
                    }
                    Err(e) => return Err(e),
                };

                report.evaluated += 1;
                self.metrics.inc_metrics_evaluated();
                let record = &evaluation.record;
                self.logger.log_evaluation(
                    record.metric.as_str(),
                    &record.slice,
                    &record.group_level,
                    record.day_0_value,
                    record.day_1_diff,
                    record.day_7_diff,
                    evaluation.verdict.as_str(),
                );

                // Persist before notifying so suppression reflects every sent alert
                self.log.persist(record).await.at(CycleStage::Log)?;
                self.metrics.inc_records_persisted();
                tracker.observe(record);

                if !evaluation.verdict.is_alert() {
                    continue;
                }

                report.anomalies += 1;
                self.metrics.inc_anomalies_detected();
                self.logger.log_anomaly(
                    record.metric.as_str(),
                    &record.slice,
                    &record.group_level,
                    &bucket.to_string(),
                    record.day_1_diff,
                    record.day_7_diff,
                );

                if trend_rows.is_none() {
                    trend_rows = Some(self.fetch_trend_rows(job, bucket).await);
                }
                let trend = TrendSeries::from_rows(
                    trend_rows.as_deref().unwrap_or_default(),
                    &metric.id,
                    slice.map(|def| (def.id.as_str(), group.level.as_str())),
                    bucket,
                );

                match self.notifier.notify(record, &trend).await {
                    Ok(()) => {
                        report.notified += 1;
                        self.metrics.inc_notifications_sent();
                    }
                    Err(error) => {
                        self.metrics.inc_notifications_failed();
                        self.logger.log_notification_failure(
                            record.metric.as_str(),
                            &record.group_level,
                            &error.to_string(),
                        );
                        report.failures.push(
                            CycleFailure::new(&label, CycleStage::Notify, &error)
                                .for_stream(&metric.id, &group.level),
                        );
                    }
                }
            }
        }

        Ok(())
    }

    async fn evaluate(
        &self,
        metric: &MetricDefinition,
        job: &JobSpec,
        group: &Group<'_>,
        bucket: TimeBucket,
        tracker: &SuppressionTracker,
    ) -> std::result::Result<Evaluation, StageError> {
        let triple = reference_triple(&group.rows, metric, bucket)
            .at(CycleStage::Evaluate)?
            .normalized(metric.kind, self.config.n_time_periods);

        let slice_label = job.slice.label();
        let key = SuppressionKey::new(metric.id.clone(), slice_label, group.level.as_str());
        let last_alert = tracker.last_alert(&key).await.at(CycleStage::Log)?;

        let subject = EvaluationSubject {
            metric,
            slice: slice_label,
            group_level: &group.level,
            bucket_time: bucket.start(),
        };
        self.evaluator
            .evaluate(triple, subject, last_alert)
            .at(CycleStage::Evaluate)
    }

    /// Rows for the alert chart; a failed fetch degrades to a text-only alert
    async fn fetch_trend_rows(&self, job: &JobSpec, bucket: TimeBucket) -> Vec<Row> {
        let builder = QueryBuilder::new(&self.catalog, &self.query_settings);
        let result = match builder.build(&job.metrics, &job.slice, WindowMode::Timeseries, bucket) {
            Ok(query) => self.store.fetch(&query).await,
            Err(e) => Err(e),
        };
        result.unwrap_or_else(|e| {
            warn!(job = %job.label(), error = %e, "Trend query failed");
            Vec::new()
        })
    }
}

/// Split aggregate rows per slice value; the total slice is one synthetic group
fn split_by_group<'r>(rows: &'r [Row], slice: Option<&SliceDefinition>) -> Vec<Group<'r>> {
    match slice {
        None => vec![Group {
            level: TOTAL.to_string(),
            rows: rows.iter().collect(),
        }],
        Some(def) => def
            .group_levels
            .iter()
            .map(|level| Group {
                level: level.clone(),
                rows: rows
                    .iter()
                    .filter(|row| row.matches(def.id.as_str(), level))
                    .collect(),
            })
            .collect(),
    }
}

/// Raw (not yet normalized) observations on the three reference dates
fn reference_triple(
    rows: &[&Row],
    metric: &MetricDefinition,
    bucket: TimeBucket,
) -> Result<ReferenceTriple> {
    let value = |day: ReferenceDay| -> Result<f64> {
        let date = bucket.reference_date(day);
        let row = rows
            .iter()
            .find(|row| row.date(DATE_COLUMN) == Some(date))
            .ok_or_else(|| {
                DetectorError::data_unavailable(format!("no row for {} on {}", metric.id, date))
            })?;
        row.number(metric.id.as_str()).ok_or_else(|| {
            DetectorError::data_unavailable(format!("no value for {} on {}", metric.id, date))
        })
    };

    Ok(ReferenceTriple::new(
        value(ReferenceDay::Today)?,
        value(ReferenceDay::OneDayAgo)?,
        value(ReferenceDay::SevenDaysAgo)?,
    ))
}

/// Builder for the cycle orchestrator
pub struct CycleOrchestratorBuilder {
    catalog: Option<Arc<Catalog>>,
    store: Option<Arc<dyn MetricStore>>,
    log: Option<Arc<dyn AnomalyLog>>,
    notifier: Option<Arc<Notifier>>,
    clock: Arc<dyn Clock>,
    config: DetectionConfig,
    instance: String,
}

impl CycleOrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            catalog: None,
            store: None,
            log: None,
            notifier: None,
            clock: Arc::new(SystemClock),
            config: DetectionConfig::default(),
            instance: "metric-watcher".to_string(),
        }
    }

    pub fn catalog(mut self, catalog: Arc<Catalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn store(mut self, store: Arc<dyn MetricStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn anomaly_log(mut self, log: Arc<dyn AnomalyLog>) -> Self {
        self.log = Some(log);
        self
    }

    pub fn notifier(mut self, notifier: Arc<Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(mut self, config: DetectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Instance name attached to structured log events
    pub fn instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = instance.into();
        self
    }

    pub fn build(self) -> anyhow::Result<CycleOrchestrator> {
        let catalog = self
            .catalog
            .ok_or_else(|| anyhow::anyhow!("Catalog is required"))?;
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("Metric store is required"))?;
        let log = self
            .log
            .ok_or_else(|| anyhow::anyhow!("Anomaly log is required"))?;
        let notifier = self
            .notifier
            .ok_or_else(|| anyhow::anyhow!("Notifier is required"))?;

        if !(self.config.threshold > 0.0 && self.config.threshold.is_finite()) {
            anyhow::bail!("threshold must be a positive number, got {}", self.config.threshold);
        }
        if self.config.cooldown < Duration::zero() {
            anyhow::bail!(
                "cooldown must not be negative, got {} minutes",
                self.config.cooldown.num_minutes()
            );
        }
        if self.config.n_time_periods == 0 {
            anyhow::bail!("n_time_periods must be at least 1");
        }
        if self.config.max_concurrent_jobs == 0 {
            anyhow::bail!("max_concurrent_jobs must be at least 1");
        }

        Ok(CycleOrchestrator {
            catalog,
            store,
            log,
            notifier,
            clock: self.clock,
            evaluator: AnomalyEvaluator::new(self.config.threshold, self.config.cooldown),
            query_settings: self.config.query_settings(),
            config: self.config,
            metrics: DetectorMetrics::new(),
            logger: StructuredLogger::new(self.instance),
        })
    }
}

impl Default for CycleOrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
