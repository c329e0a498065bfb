//! Core data models for the metric watcher

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

/// Width of one aggregation bucket (15 minutes)
pub const BUCKET_WIDTH_MINUTES: i64 = 15;

/// Sentinel used for the ungrouped "total" slice and its single group level
pub const TOTAL: &str = "total";

/// Datetime layout used by the store and the anomaly log
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Date layout used by the store for `toDate` columns
pub const DATE_FORMAT: &str = "%Y-%m-%d";

pub fn bucket_width() -> Duration {
    Duration::minutes(BUCKET_WIDTH_MINUTES)
}

/// Metric identifier, also used as the column alias in queries
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricId(String);

impl MetricId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for MetricId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl std::fmt::Display for MetricId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Slice identifier, also used as the column alias of the grouping expression
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SliceId(String);

impl SliceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SliceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl std::fmt::Display for SliceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a metric accumulates over a window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Accumulates with window length; multi-bucket references are averaged per bucket
    Count,
    /// Rates and per-user values; never normalized
    Ratio,
}

/// A monitored metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDefinition {
    pub id: MetricId,
    /// Display name used in alerts and charts
    pub name: String,
    /// Aggregate expression evaluated by the store
    pub formula: String,
    /// Fully qualified source table
    pub table: String,
    pub kind: MetricKind,
}

impl MetricDefinition {
    pub fn is_count(&self) -> bool {
        self.kind == MetricKind::Count
    }
}

/// A dimensional breakdown with its allowed values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliceDefinition {
    pub id: SliceId,
    /// Grouping column or expression
    pub expression: String,
    pub group_levels: Vec<String>,
}

/// Either the ungrouped total or one configured slice
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SliceSelector {
    Total,
    Slice(SliceId),
}

impl SliceSelector {
    pub fn label(&self) -> &str {
        match self {
            SliceSelector::Total => TOTAL,
            SliceSelector::Slice(id) => id.as_str(),
        }
    }

    pub fn is_total(&self) -> bool {
        matches!(self, SliceSelector::Total)
    }
}

impl From<String> for SliceSelector {
    fn from(value: String) -> Self {
        if value == TOTAL {
            SliceSelector::Total
        } else {
            SliceSelector::Slice(SliceId(value))
        }
    }
}

impl From<SliceSelector> for String {
    fn from(value: SliceSelector) -> Self {
        value.label().to_string()
    }
}

impl std::fmt::Display for SliceSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// One detection unit: a metric group evaluated under one slice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub metrics: Vec<MetricId>,
    pub slice: SliceSelector,
}

impl JobSpec {
    pub fn new(metrics: Vec<MetricId>, slice: SliceSelector) -> Self {
        Self { metrics, slice }
    }

    /// Short label for logs, e.g. `users_feed,likes@os`
    pub fn label(&self) -> String {
        let ids: Vec<&str> = self.metrics.iter().map(MetricId::as_str).collect();
        format!("{}@{}", ids.join(","), self.slice)
    }
}

/// The comparison points of the fixed model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceDay {
    Today,
    OneDayAgo,
    SevenDaysAgo,
}

impl ReferenceDay {
    pub const ALL: [ReferenceDay; 3] = [
        ReferenceDay::Today,
        ReferenceDay::OneDayAgo,
        ReferenceDay::SevenDaysAgo,
    ];

    pub fn offset_days(&self) -> i64 {
        match self {
            ReferenceDay::Today => 0,
            ReferenceDay::OneDayAgo => 1,
            ReferenceDay::SevenDaysAgo => 7,
        }
    }
}

/// A 15-minute aligned interval identified by its start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimeBucket {
    start: NaiveDateTime,
}

impl TimeBucket {
    /// Bucket containing the given instant
    pub fn containing(ts: NaiveDateTime) -> Self {
        let minute = ts.minute() as i64;
        let aligned_minute = minute - minute % BUCKET_WIDTH_MINUTES;
        let time = NaiveTime::from_hms_opt(ts.hour(), aligned_minute as u32, 0)
            .unwrap_or(NaiveTime::MIN);
        Self {
            start: ts.date().and_time(time),
        }
    }

    /// Latest bucket guaranteed complete given the freshest ingested timestamp
    pub fn latest_complete(freshest: NaiveDateTime) -> Self {
        Self::containing(freshest).previous()
    }

    pub fn previous(&self) -> Self {
        Self {
            start: self.start - bucket_width(),
        }
    }

    pub fn start(&self) -> NaiveDateTime {
        self.start
    }

    pub fn end(&self) -> NaiveDateTime {
        self.start + bucket_width()
    }

    pub fn date(&self) -> NaiveDate {
        self.start.date()
    }

    /// Same clock time on the given reference day
    pub fn on(&self, day: ReferenceDay) -> NaiveDateTime {
        self.start - Duration::days(day.offset_days())
    }

    /// Calendar date of the given reference day
    pub fn reference_date(&self, day: ReferenceDay) -> NaiveDate {
        self.on(day).date()
    }
}

impl std::fmt::Display for TimeBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.start.format(DATETIME_FORMAT))
    }
}

/// Observations for one metric and slice value on the three reference days
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReferenceTriple {
    pub day_0: f64,
    pub day_1: f64,
    pub day_7: f64,
}

impl ReferenceTriple {
    pub fn new(day_0: f64, day_1: f64, day_7: f64) -> Self {
        Self {
            day_0,
            day_1,
            day_7,
        }
    }

    /// Convert multi-bucket reference sums into per-bucket values for count metrics
    pub fn normalized(self, kind: MetricKind, n_time_periods: u32) -> Self {
        match kind {
            MetricKind::Count if n_time_periods > 1 => Self {
                day_0: self.day_0,
                day_1: self.day_1 / n_time_periods as f64,
                day_7: self.day_7 / n_time_periods as f64,
            },
            _ => self,
        }
    }
}

/// Identity of a suppression stream: metric + slice + slice value
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SuppressionKey {
    pub metric: MetricId,
    pub slice: String,
    pub group_level: String,
}

impl SuppressionKey {
    pub fn new(metric: MetricId, slice: impl Into<String>, group_level: impl Into<String>) -> Self {
        Self {
            metric,
            slice: slice.into(),
            group_level: group_level.into(),
        }
    }
}

impl std::fmt::Display for SuppressionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.metric, self.slice, self.group_level)
    }
}

/// One evaluation outcome, persisted to the anomaly log on every cycle
#[derive(Debug, Clone, PartialEq)]
pub struct AnomalyRecord {
    pub bucket_time: NaiveDateTime,
    pub day_0_value: f64,
    pub day_1_value: f64,
    pub day_7_value: f64,
    pub day_1_diff: f64,
    pub day_7_diff: f64,
    pub slice: String,
    pub group_level: String,
    pub metric: MetricId,
    pub metric_name: String,
    pub is_alert: bool,
}

impl AnomalyRecord {
    pub fn key(&self) -> SuppressionKey {
        SuppressionKey::new(self.metric.clone(), &self.slice, &self.group_level)
    }
}

/// Column layout of the anomaly log table
#[derive(Serialize)]
struct LogRow<'a> {
    bucket_time: String,
    day_0_value: f64,
    day_1_value: f64,
    day_7_value: f64,
    day_1_diff: f64,
    day_7_diff: f64,
    slice: &'a str,
    group_level: &'a str,
    metric: &'a str,
    metric_name: &'a str,
    is_alert: u8,
}

impl Serialize for AnomalyRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        LogRow {
            bucket_time: self.bucket_time.format(DATETIME_FORMAT).to_string(),
            day_0_value: self.day_0_value,
            day_1_value: self.day_1_value,
            day_7_value: self.day_7_value,
            day_1_diff: self.day_1_diff,
            day_7_diff: self.day_7_diff,
            slice: &self.slice,
            group_level: &self.group_level,
            metric: self.metric.as_str(),
            metric_name: &self.metric_name,
            is_alert: u8::from(self.is_alert),
        }
        .serialize(serializer)
    }
}

/// One result row returned by the store, keyed by column alias
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row(Map<String, Value>);

impl Row {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn with(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.0.insert(column.to_string(), value.into());
        self
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    /// Numeric value; 64-bit integers may arrive quoted
    pub fn number(&self, column: &str) -> Option<f64> {
        match self.0.get(column)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn text(&self, column: &str) -> Option<&str> {
        self.0.get(column)?.as_str()
    }

    /// Whether `column` holds `level`; narrow integer columns arrive unquoted
    pub fn matches(&self, column: &str, level: &str) -> bool {
        match self.0.get(column) {
            Some(Value::String(s)) => s == level,
            Some(Value::Number(n)) => n.to_string() == level,
            Some(Value::Bool(b)) => b.to_string() == level,
            _ => false,
        }
    }

    pub fn date(&self, column: &str) -> Option<NaiveDate> {
        NaiveDate::parse_from_str(self.text(column)?, DATE_FORMAT).ok()
    }

    pub fn datetime(&self, column: &str) -> Option<NaiveDateTime> {
        NaiveDateTime::parse_from_str(self.text(column)?, DATETIME_FORMAT).ok()
    }
}

impl From<Map<String, Value>> for Row {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}
