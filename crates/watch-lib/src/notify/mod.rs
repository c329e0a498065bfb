//! Alert formatting and delivery
//!
//! The notifier turns an alerting [`AnomalyRecord`] into a message, asks a
//! [`ChartRenderer`] for a trend chart overlaying the three reference dates
//! and hands both to a [`NotificationChannel`]. Delivery is attempted once;
//! retries belong to the next cycle.

mod chart;
mod telegram;

pub use chart::PlottersChartRenderer;
pub use telegram::{TelegramChannel, TelegramConfig};

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, Timelike};
use tracing::{info, warn};

use crate::error::Result;
use crate::models::{AnomalyRecord, MetricId, ReferenceDay, Row, TimeBucket, TOTAL};
use crate::query::{BUCKET_COLUMN, DATE_COLUMN, LABEL_COLUMN};

/// Rendered chart attached to an alert
#[derive(Debug, Clone, PartialEq)]
pub struct ChartImage {
    pub bytes: Vec<u8>,
    pub file_name: String,
}

/// Delivery target for alerts
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn send(&self, target: &str, text: &str, image: Option<ChartImage>) -> Result<()>;
}

/// Produces a PNG for a trend series
pub trait ChartRenderer: Send + Sync {
    fn render(
        &self,
        group: &str,
        metric_name: &str,
        trend: &TrendSeries,
    ) -> std::result::Result<Vec<u8>, String>;
}

/// One point of a day's trend line
#[derive(Debug, Clone, PartialEq)]
pub struct TrendPoint {
    pub bucket: NaiveDateTime,
    /// `HH:MM` label of the bucket
    pub label: String,
    pub value: f64,
}

impl TrendPoint {
    /// Minutes since midnight, the shared x axis of all reference days
    pub fn minute_of_day(&self) -> u32 {
        self.bucket.hour() * 60 + self.bucket.minute()
    }
}

/// Trend line for one reference date
#[derive(Debug, Clone, PartialEq)]
pub struct DaySeries {
    pub day: ReferenceDay,
    pub date: NaiveDate,
    pub points: Vec<TrendPoint>,
}

/// Per-bucket values of one metric on the three reference dates
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrendSeries {
    pub days: Vec<DaySeries>,
}

impl TrendSeries {
    /// Build from `TIMESERIES` rows for one metric and slice value.
    ///
    /// Rows after the current bucket are dropped so today's line stops at
    /// the evaluated bucket. `group` filters rows by slice column and value;
    /// `None` keeps every row. Rows without a parsable date, bucket or value
    /// are ignored.
    pub fn from_rows(
        rows: &[Row],
        metric: &MetricId,
        group: Option<(&str, &str)>,
        bucket: TimeBucket,
    ) -> Self {
        let mut days: Vec<DaySeries> = ReferenceDay::ALL
            .iter()
            .map(|&day| DaySeries {
                day,
                date: bucket.reference_date(day),
                points: Vec::new(),
            })
            .collect();

        for row in rows {
            if let Some((column, value)) = group {
                if !row.matches(column, value) {
                    continue;
                }
            }
            let (Some(date), Some(at), Some(value)) = (
                row.date(DATE_COLUMN),
                row.datetime(BUCKET_COLUMN),
                row.number(metric.as_str()),
            ) else {
                continue;
            };
            if at > bucket.start() {
                continue;
            }
            let Some(series) = days.iter_mut().find(|series| series.date == date) else {
                continue;
            };
            let label = row
                .text(LABEL_COLUMN)
                .map(str::to_string)
                .unwrap_or_else(|| at.format("%H:%M").to_string());
            series.points.push(TrendPoint {
                bucket: at,
                label,
                value,
            });
        }

        for series in &mut days {
            series.points.sort_by_key(|point| point.bucket);
        }
        Self { days }
    }

    pub fn point_count(&self) -> usize {
        self.days.iter().map(|series| series.points.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.point_count() == 0
    }

    /// Largest value across all days
    pub fn max_value(&self) -> Option<f64> {
        self.days
            .iter()
            .flat_map(|series| series.points.iter().map(|point| point.value))
            .fold(None, |max, value| Some(max.map_or(value, |m: f64| m.max(value))))
    }
}

/// Human-readable alert text for a record
pub fn format_alert(record: &AnomalyRecord, with_chart: bool) -> String {
    let mut text = format!(
        "Metric {} deviates strongly from yesterday / a week ago!",
        record.metric_name
    );
    if record.slice != TOTAL {
        text.push_str(&format!("\nslice {} - {}", record.slice, record.group_level));
    }
    text.push_str(&format!(
        "\ncurrent: {:.2}\nyesterday: {:.2} ({:.0}%)\na week ago: {:.2} ({:.0}%)",
        record.day_0_value,
        record.day_1_value,
        record.day_1_diff * 100.0,
        record.day_7_value,
        record.day_7_diff * 100.0,
    ));
    if with_chart {
        text.push_str("\nAlert chart:");
    }
    text
}

/// Formats alerts and delivers them through one channel to one target
pub struct Notifier {
    channel: Arc<dyn NotificationChannel>,
    renderer: Arc<dyn ChartRenderer>,
    target: String,
}

impl Notifier {
    pub fn new(
        channel: Arc<dyn NotificationChannel>,
        renderer: Arc<dyn ChartRenderer>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            channel,
            renderer,
            target: target.into(),
        }
    }

    /// Send one alert; a chart that fails to render degrades to a text-only alert
    pub async fn notify(&self, record: &AnomalyRecord, trend: &TrendSeries) -> Result<()> {
        let image = match self
            .renderer
            .render(&record.group_level, &record.metric_name, trend)
        {
            Ok(bytes) => Some(ChartImage {
                bytes,
                file_name: format!("{}.png", record.metric_name),
            }),
            Err(e) => {
                warn!(
                    metric = %record.metric,
                    group_level = %record.group_level,
                    error = %e,
                    "Chart rendering failed, sending text only"
                );
                None
            }
        };

        let text = format_alert(record, image.is_some());
        self.channel.send(&self.target, &text, image).await
    }
}

/// Channel that only writes alerts to the log
#[derive(Debug, Default)]
pub struct LogOnlyChannel;

#[async_trait]
impl NotificationChannel for LogOnlyChannel {
    async fn send(&self, target: &str, text: &str, image: Option<ChartImage>) -> Result<()> {
        info!(
            target_chat = %target,
            chart = image.as_ref().map(|image| image.file_name.as_str()),
            chart_bytes = image.as_ref().map_or(0, |image| image.bytes.len()),
            "{}",
            text
        );
        Ok(())
    }
}
