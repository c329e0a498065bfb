//! Orchestrator and loop tests against in-process collaborators

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, TimeZone, Utc};
use tokio::sync::broadcast;

use super::*;
use crate::catalog::{Catalog, CatalogSpec};
use crate::clock::FixedClock;
use crate::error::{DetectorError, FailureKind, Result};
use crate::health::{components, ComponentStatus, HealthRegistry};
use crate::models::{JobSpec, MetricId, Row, SliceId, SliceSelector, DATETIME_FORMAT};
use crate::notify::{ChartImage, ChartRenderer, NotificationChannel, Notifier, TrendSeries};
use crate::query::{QueryDescription, BUCKET_COLUMN, DATE_COLUMN, LABEL_COLUMN};
use crate::store::{AnomalyLog, InMemoryAnomalyLog, MetricStore};

const FEED: &str = "db.feed_actions";
const MESSAGES: &str = "db.message_actions";

fn ts(s: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(s, DATETIME_FORMAT).unwrap()
}

/// Store serving canned rows per table; aggregate and timeseries queries
/// are told apart by the presence of bucket range clauses
#[derive(Default)]
struct MockStore {
    freshest: Mutex<Option<NaiveDateTime>>,
    aggregate: HashMap<String, Vec<Row>>,
    timeseries: HashMap<String, Vec<Row>>,
    failing: HashSet<String>,
    queries: Mutex<Vec<QueryDescription>>,
    latency: Option<Duration>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MockStore {
    fn new(freshest: &str) -> Self {
        Self {
            freshest: Mutex::new(Some(ts(freshest))),
            ..Default::default()
        }
    }

    fn with_aggregate(mut self, table: &str, rows: Vec<Row>) -> Self {
        self.aggregate.insert(table.to_string(), rows);
        self
    }

    fn with_timeseries(mut self, table: &str, rows: Vec<Row>) -> Self {
        self.timeseries.insert(table.to_string(), rows);
        self
    }

    fn failing(mut self, table: &str) -> Self {
        self.failing.insert(table.to_string());
        self
    }

    fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn set_freshest(&self, freshest: Option<NaiveDateTime>) {
        *self.freshest.lock().unwrap() = freshest;
    }

    fn timeseries_queries(&self) -> usize {
        self.queries
            .lock()
            .unwrap()
            .iter()
            .filter(|query| query.time_ranges().is_empty())
            .count()
    }
}

#[async_trait]
impl MetricStore for MockStore {
    async fn fetch(&self, query: &QueryDescription) -> Result<Vec<Row>> {
        self.queries.lock().unwrap().push(query.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing.contains(&query.table) {
            return Err(DetectorError::data_access("connection refused"));
        }
        let source = if query.time_ranges().is_empty() {
            &self.timeseries
        } else {
            &self.aggregate
        };
        Ok(source.get(&query.table).cloned().unwrap_or_default())
    }

    async fn freshest_timestamp(
        &self,
        _table: &str,
        _time_column: &str,
        _since: NaiveDate,
    ) -> Result<Option<NaiveDateTime>> {
        Ok(*self.freshest.lock().unwrap())
    }
}

#[derive(Default)]
struct RecordingChannel {
    fail: bool,
    sent: tokio::sync::Mutex<Vec<(String, Option<ChartImage>)>>,
}

#[async_trait]
impl NotificationChannel for RecordingChannel {
    async fn send(&self, _target: &str, text: &str, image: Option<ChartImage>) -> Result<()> {
        if self.fail {
            return Err(DetectorError::delivery("Forbidden: bot was blocked"));
        }
        self.sent.lock().await.push((text.to_string(), image));
        Ok(())
    }
}

/// Renders a fixed payload when the trend has points
struct StubRenderer;

impl ChartRenderer for StubRenderer {
    fn render(
        &self,
        _group: &str,
        _metric_name: &str,
        trend: &TrendSeries,
    ) -> std::result::Result<Vec<u8>, String> {
        if trend.is_empty() {
            Err("empty trend".to_string())
        } else {
            Ok(vec![0x89, 0x50, 0x4e, 0x47])
        }
    }
}

struct Harness {
    orchestrator: Arc<CycleOrchestrator>,
    store: Arc<MockStore>,
    log: Arc<InMemoryAnomalyLog>,
    channel: Arc<RecordingChannel>,
}

fn harness(store: MockStore, channel: RecordingChannel, jobs: Vec<JobSpec>) -> Harness {
    let catalog = Catalog::builtin("db").unwrap().with_jobs(jobs);
    harness_with(store, channel, catalog, DetectionConfig::default())
}

fn harness_with(
    store: MockStore,
    channel: RecordingChannel,
    catalog: Catalog,
    config: DetectionConfig,
) -> Harness {
    let store = Arc::new(store);
    let log = Arc::new(InMemoryAnomalyLog::new());
    let channel = Arc::new(channel);
    let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 3, 10, 12, 50, 0).unwrap());

    let orchestrator = CycleOrchestratorBuilder::new()
        .catalog(Arc::new(catalog))
        .store(store.clone())
        .anomaly_log(log.clone())
        .notifier(Arc::new(Notifier::new(
            channel.clone(),
            Arc::new(StubRenderer),
            "-100200",
        )))
        .clock(Arc::new(clock))
        .config(config)
        .instance("test")
        .build()
        .unwrap();

    Harness {
        orchestrator: Arc::new(orchestrator),
        store,
        log,
        channel,
    }
}

fn job(metrics: &[&str], slice: SliceSelector) -> JobSpec {
    JobSpec::new(metrics.iter().map(|id| MetricId::from(*id)).collect(), slice)
}

fn os() -> SliceSelector {
    SliceSelector::Slice(SliceId::from("os"))
}

fn day(date: &str, metric: &str, value: f64) -> Row {
    Row::new().with(DATE_COLUMN, date).with(metric, value)
}

fn point(bucket: &str, metric: &str, value: f64) -> Row {
    Row::new()
        .with(DATE_COLUMN, &bucket[..10])
        .with(BUCKET_COLUMN, bucket)
        .with(LABEL_COLUMN, &bucket[11..16])
        .with(metric, value)
}

/// Views collapsing to 20 against 100 and 110 per bucket
fn collapsed_views() -> Vec<Row> {
    vec![
        day("2024-03-10", "views", 20.0),
        day("2024-03-09", "views", 300.0),
        day("2024-03-03", "views", 330.0),
    ]
}

fn views_trend() -> Vec<Row> {
    vec![
        point("2024-03-10 12:15:00", "views", 95.0),
        point("2024-03-10 12:30:00", "views", 20.0),
        point("2024-03-09 12:15:00", "views", 98.0),
        point("2024-03-09 12:30:00", "views", 100.0),
        point("2024-03-03 12:30:00", "views", 110.0),
    ]
}

#[tokio::test]
async fn test_views_below_threshold_is_logged_not_notified() {
    let store = MockStore::new("2024-03-10 12:47:00").with_aggregate(
        FEED,
        vec![
            day("2024-03-10", "views", 120.0),
            day("2024-03-09", "views", 270.0),
            day("2024-03-03", "views", 330.0),
        ],
    );
    let h = harness(
        store,
        RecordingChannel::default(),
        vec![job(&["views"], SliceSelector::Total)],
    );

    let summary = h.orchestrator.run_cycle().await.unwrap();

    assert_eq!(summary.bucket.start(), ts("2024-03-10 12:30:00"));
    assert_eq!(summary.evaluated, 1);
    assert_eq!(summary.anomalies, 0);
    assert!(summary.is_clean());

    let records = h.log.records().await;
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert!(!record.is_alert);
    assert_eq!(record.day_1_value, 90.0);
    assert_eq!(record.day_7_value, 110.0);
    assert!((record.day_1_diff - 0.25).abs() < 1e-9);
    assert!((record.day_7_diff - 1.0 / 12.0).abs() < 1e-9);
    assert_eq!(record.slice, "total");
    assert_eq!(record.group_level, "total");

    assert!(h.channel.sent.lock().await.is_empty());
    assert_eq!(h.store.timeseries_queries(), 0);
}

#[tokio::test]
async fn test_alert_is_persisted_then_notified_with_chart() {
    let store = MockStore::new("2024-03-10 12:47:00")
        .with_aggregate(FEED, collapsed_views())
        .with_timeseries(FEED, views_trend());
    let h = harness(
        store,
        RecordingChannel::default(),
        vec![job(&["views"], SliceSelector::Total)],
    );

    let summary = h.orchestrator.run_cycle().await.unwrap();

    assert_eq!(summary.anomalies, 1);
    assert_eq!(summary.notified, 1);
    assert!(h.log.records().await[0].is_alert);

    let sent = h.channel.sent.lock().await;
    assert_eq!(sent.len(), 1);
    assert!(sent[0].0.starts_with("Metric Views deviates strongly"));
    assert_eq!(sent[0].1.as_ref().unwrap().file_name, "Views.png");
    assert_eq!(h.store.timeseries_queries(), 1);
}

#[tokio::test]
async fn test_slice_values_are_evaluated_separately() {
    let ios = |date: &str, views: f64| day(date, "views", views).with("os", "iOS");
    let android = |date: &str, views: f64| day(date, "views", views).with("os", "Android");
    let store = MockStore::new("2024-03-10 12:47:00").with_aggregate(
        FEED,
        vec![
            ios("2024-03-10", 20.0),
            ios("2024-03-09", 300.0),
            ios("2024-03-03", 330.0),
            // Android has no row for today
            android("2024-03-09", 300.0),
            android("2024-03-03", 300.0),
        ],
    );
    let h = harness(store, RecordingChannel::default(), vec![job(&["views"], os())]);

    let summary = h.orchestrator.run_cycle().await.unwrap();

    assert_eq!(summary.jobs_succeeded, 1);
    assert_eq!(summary.evaluated, 1);
    assert_eq!(summary.skipped, 1);
    let skipped = &summary.failures[0];
    assert_eq!(skipped.kind, FailureKind::DataUnavailable);
    assert_eq!(skipped.group_level.as_deref(), Some("Android"));

    let records = h.log.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].slice, "os");
    assert_eq!(records[0].group_level, "iOS");

    // No trend rows: the alert goes out as text only
    let sent = h.channel.sent.lock().await;
    assert!(sent[0].0.contains("slice os - iOS"));
    assert!(sent[0].1.is_none());
}

#[tokio::test]
async fn test_missing_metric_skips_only_that_metric() {
    let store = MockStore::new("2024-03-10 12:47:00").with_aggregate(
        FEED,
        vec![
            day("2024-03-10", "views", 100.0).with("ctr", 0.2),
            day("2024-03-09", "views", 300.0),
            day("2024-03-03", "views", 300.0).with("ctr", 0.2),
        ],
    );
    let h = harness(
        store,
        RecordingChannel::default(),
        vec![job(&["views", "ctr"], SliceSelector::Total)],
    );

    let summary = h.orchestrator.run_cycle().await.unwrap();

    assert_eq!(summary.evaluated, 1);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.failures[0].metric, Some(MetricId::from("ctr")));
    assert_eq!(h.log.records().await[0].metric, MetricId::from("views"));
}

#[tokio::test]
async fn test_failing_job_does_not_abort_cycle() {
    let store = MockStore::new("2024-03-10 12:47:00")
        .with_aggregate(FEED, collapsed_views())
        .failing(MESSAGES);
    let h = harness(
        store,
        RecordingChannel::default(),
        vec![
            job(&["messages"], SliceSelector::Total),
            job(&["views"], SliceSelector::Total),
        ],
    );

    let summary = h.orchestrator.run_cycle().await.unwrap();

    assert_eq!(summary.jobs_succeeded, 1);
    assert_eq!(summary.jobs_failed, 1);
    let failure = summary.failures_at(CycleStage::Query).next().unwrap();
    assert_eq!(failure.kind, FailureKind::DataAccess);
    assert_eq!(failure.job, "messages@total");
    assert_eq!(h.log.len().await, 1);
}

#[tokio::test]
async fn test_misconfigured_job_fails_at_build() {
    let store = MockStore::new("2024-03-10 12:47:00").with_aggregate(FEED, collapsed_views());
    let h = harness(
        store,
        RecordingChannel::default(),
        vec![
            job(&["views", "messages"], SliceSelector::Total),
            job(&["views"], SliceSelector::Slice(SliceId::from("country"))),
            job(&["views"], SliceSelector::Total),
        ],
    );

    let summary = h.orchestrator.run_cycle().await.unwrap();

    assert_eq!(summary.jobs_failed, 2);
    assert_eq!(summary.jobs_succeeded, 1);
    assert_eq!(summary.failures_at(CycleStage::Build).count(), 2);
    assert!(summary
        .failures
        .iter()
        .all(|failure| failure.kind == FailureKind::Configuration));
}

#[tokio::test]
async fn test_cooldown_suppresses_across_cycles() {
    let store = MockStore::new("2024-03-10 12:47:00").with_aggregate(FEED, collapsed_views());
    let h = harness(
        store,
        RecordingChannel::default(),
        vec![job(&["views"], SliceSelector::Total)],
    );

    h.orchestrator.run_cycle().await.unwrap();

    // One hour later the same deviation is suppressed but still logged
    h.store.set_freshest(Some(ts("2024-03-10 13:47:00")));
    let summary = h.orchestrator.run_cycle().await.unwrap();
    assert_eq!(summary.anomalies, 0);

    // Exactly three hours after the alert bucket the cooldown has elapsed
    h.store.set_freshest(Some(ts("2024-03-10 15:47:00")));
    let summary = h.orchestrator.run_cycle().await.unwrap();
    assert_eq!(summary.anomalies, 1);

    let records = h.log.records().await;
    let alerts: Vec<bool> = records.iter().map(|record| record.is_alert).collect();
    assert_eq!(alerts, vec![true, false, true]);
    assert_eq!(h.channel.sent.lock().await.len(), 2);
}

#[tokio::test]
async fn test_persisted_history_suppresses_after_restart() {
    let store = MockStore::new("2024-03-10 12:47:00").with_aggregate(FEED, collapsed_views());
    let h = harness(
        store,
        RecordingChannel::default(),
        vec![job(&["views"], SliceSelector::Total)],
    );

    // An alert written by a previous process one bucket earlier
    h.log
        .persist(&crate::models::AnomalyRecord {
            bucket_time: ts("2024-03-10 12:15:00"),
            day_0_value: 25.0,
            day_1_value: 100.0,
            day_7_value: 110.0,
            day_1_diff: 0.75,
            day_7_diff: 0.77,
            slice: "total".to_string(),
            group_level: "total".to_string(),
            metric: MetricId::from("views"),
            metric_name: "Views".to_string(),
            is_alert: true,
        })
        .await
        .unwrap();

    let summary = h.orchestrator.run_cycle().await.unwrap();

    assert_eq!(summary.anomalies, 0);
    assert!(h.channel.sent.lock().await.is_empty());
    assert!(!h.log.records().await[1].is_alert);
}

#[tokio::test]
async fn test_delivery_failure_keeps_record() {
    let store = MockStore::new("2024-03-10 12:47:00").with_aggregate(FEED, collapsed_views());
    let h = harness(
        store,
        RecordingChannel {
            fail: true,
            ..Default::default()
        },
        vec![job(&["views"], SliceSelector::Total)],
    );

    let summary = h.orchestrator.run_cycle().await.unwrap();

    assert_eq!(summary.jobs_succeeded, 1);
    assert_eq!(summary.notified, 0);
    let failure = summary.failures_at(CycleStage::Notify).next().unwrap();
    assert_eq!(failure.kind, FailureKind::NotificationDelivery);
    assert!(h.log.records().await[0].is_alert);
}

#[tokio::test]
async fn test_unresolvable_bucket_fails_cycle() {
    let store = MockStore::new("2024-03-10 12:47:00");
    store.set_freshest(None);
    let h = harness(
        store,
        RecordingChannel::default(),
        vec![job(&["views"], SliceSelector::Total)],
    );

    let err = h.orchestrator.run_cycle().await.unwrap_err();
    assert!(matches!(err, DetectorError::DataUnavailable(_)));
    assert!(h.log.is_empty().await);
}

#[tokio::test]
async fn test_run_once_reports_health() {
    let store = MockStore::new("2024-03-10 12:47:00").with_aggregate(FEED, collapsed_views());
    let h = harness(
        store,
        RecordingChannel {
            fail: true,
            ..Default::default()
        },
        vec![job(&["views"], SliceSelector::Total)],
    );
    let health = HealthRegistry::new();
    let detection = DetectionLoop::new(h.orchestrator.clone(), health.clone());

    detection.run_once().await.unwrap();
    let report = health.health().await;
    assert_eq!(
        report.components[components::NOTIFIER].status,
        ComponentStatus::Degraded
    );
    assert_eq!(
        report.components[components::QUERY_STORE].status,
        ComponentStatus::Healthy
    );
    let last_cycle = report.last_cycle.unwrap();
    assert_eq!(last_cycle.bucket, "2024-03-10 12:30:00");
    assert_eq!(last_cycle.anomalies, 1);

    h.store.set_freshest(None);
    assert!(detection.run_once().await.is_err());
    let report = health.health().await;
    assert_eq!(report.status, ComponentStatus::Unhealthy);
}

#[tokio::test]
async fn test_loop_stops_on_shutdown() {
    let store = MockStore::new("2024-03-10 12:47:00").with_aggregate(FEED, collapsed_views());
    let h = harness(
        store,
        RecordingChannel::default(),
        vec![job(&["views"], SliceSelector::Total)],
    );
    let health = HealthRegistry::new();
    let detection = DetectionLoop::new(h.orchestrator.clone(), health.clone())
        .with_interval(Duration::from_secs(3600));

    let (tx, rx) = broadcast::channel(1);
    tx.send(()).unwrap();

    tokio::time::timeout(Duration::from_secs(5), detection.run(rx))
        .await
        .unwrap();

    assert!(!health.readiness().await.ready);
    let report = health.health().await;
    assert_eq!(
        report.components[components::SCHEDULER].status,
        ComponentStatus::Unhealthy
    );
}

/// Views under an integer slice column, which the store returns unquoted
fn exp_group_catalog() -> Catalog {
    let spec: CatalogSpec = serde_json::from_value(serde_json::json!({
        "metrics": {
            "views": {
                "name": "Views",
                "formula": "countIf(user_id, action='view')",
                "table": FEED,
                "kind": "count"
            }
        },
        "slices": {
            "exp_group": { "expression": "exp_group", "group_levels": ["1", "2"] }
        },
        "jobs": [{ "metrics": ["views"], "slice": "exp_group" }]
    }))
    .unwrap();
    Catalog::from_spec(spec).unwrap()
}

#[tokio::test]
async fn test_numeric_slice_values_are_matched() {
    let in_group = |row: Row, group: u8| row.with("exp_group", group);
    let store = MockStore::new("2024-03-10 12:47:00")
        .with_aggregate(
            FEED,
            vec![
                in_group(day("2024-03-10", "views", 20.0), 1),
                in_group(day("2024-03-09", "views", 300.0), 1),
                in_group(day("2024-03-03", "views", 330.0), 1),
                in_group(day("2024-03-10", "views", 120.0), 2),
                in_group(day("2024-03-09", "views", 270.0), 2),
                in_group(day("2024-03-03", "views", 330.0), 2),
            ],
        )
        .with_timeseries(
            FEED,
            views_trend()
                .into_iter()
                .map(|row| in_group(row, 1))
                .collect(),
        );
    let h = harness_with(
        store,
        RecordingChannel::default(),
        exp_group_catalog(),
        DetectionConfig::default(),
    );

    let summary = h.orchestrator.run_cycle().await.unwrap();

    assert_eq!(summary.evaluated, 2);
    assert_eq!(summary.anomalies, 1);
    assert!(summary.is_clean());

    let records = h.log.records().await;
    assert_eq!(records.len(), 2);
    let alert = records.iter().find(|record| record.is_alert).unwrap();
    assert_eq!(alert.slice, "exp_group");
    assert_eq!(alert.group_level, "1");

    // The chart only renders when the trend rows matched the group
    let sent = h.channel.sent.lock().await;
    assert_eq!(sent.len(), 1);
    assert!(sent[0].0.contains("slice exp_group - 1"));
    assert!(sent[0].1.is_some());
}

async fn peak_fetches(max_concurrent_jobs: usize) -> usize {
    let store = MockStore::new("2024-03-10 12:47:00")
        .with_aggregate(
            FEED,
            vec![
                day("2024-03-10", "views", 120.0),
                day("2024-03-09", "views", 270.0),
                day("2024-03-03", "views", 330.0),
            ],
        )
        .with_latency(Duration::from_millis(50));
    let jobs = (0..6)
        .map(|_| job(&["views"], SliceSelector::Total))
        .collect();
    let catalog = Catalog::builtin("db").unwrap().with_jobs(jobs);
    let config = DetectionConfig {
        max_concurrent_jobs,
        ..DetectionConfig::default()
    };
    let h = harness_with(store, RecordingChannel::default(), catalog, config);

    let summary = h.orchestrator.run_cycle().await.unwrap();
    assert_eq!(summary.evaluated, 6);
    assert!(summary.is_clean());

    h.store.peak_in_flight()
}

#[tokio::test]
async fn test_jobs_run_concurrently_up_to_the_limit() {
    assert_eq!(peak_fetches(2).await, 2);
    assert_eq!(peak_fetches(1).await, 1);
}

fn builder_with(config: DetectionConfig) -> CycleOrchestratorBuilder {
    CycleOrchestratorBuilder::new()
        .catalog(Arc::new(Catalog::builtin("db").unwrap()))
        .store(Arc::new(MockStore::default()))
        .anomaly_log(Arc::new(InMemoryAnomalyLog::new()))
        .notifier(Arc::new(Notifier::new(
            Arc::new(RecordingChannel::default()),
            Arc::new(StubRenderer),
            "-100200",
        )))
        .config(config)
}

#[test]
fn test_builder_rejects_invalid_tunables() {
    let defaults = DetectionConfig::default;

    assert!(builder_with(defaults()).build().is_ok());
    assert!(builder_with(DetectionConfig {
        cooldown: chrono::Duration::minutes(-5),
        ..defaults()
    })
    .build()
    .is_err());
    assert!(builder_with(DetectionConfig {
        threshold: 0.0,
        ..defaults()
    })
    .build()
    .is_err());
    assert!(builder_with(DetectionConfig {
        max_concurrent_jobs: 0,
        ..defaults()
    })
    .build()
    .is_err());

    // A zero cooldown disables suppression but is still valid
    assert!(builder_with(DetectionConfig {
        cooldown: chrono::Duration::zero(),
        ..defaults()
    })
    .build()
    .is_ok());
}

#[test]
fn test_detection_config_defaults() {
    let config = DetectionConfig::default();
    assert_eq!(config.threshold, 0.5);
    assert_eq!(config.cooldown, chrono::Duration::hours(3));
    assert_eq!(config.n_time_periods, 3);
    assert_eq!(config.max_concurrent_jobs, 4);
    assert_eq!(config.query_settings().time_column, "time");
    assert_eq!(DETECTION_INTERVAL, Duration::from_secs(900));
}
