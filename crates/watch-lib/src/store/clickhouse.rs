//! ClickHouse HTTP interface binding
//!
//! Queries are posted as the request body with `FORMAT JSONEachRow` and the
//! response is decoded one JSON object per line.

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, NaiveDateTime};
use reqwest::Client;
use std::time::{Duration, Instant};
use tracing::debug;
use url::Url;

use super::{AnomalyLog, MetricStore};
use crate::error::{DetectorError, Result};
use crate::models::{AnomalyRecord, Row, SuppressionKey, DATE_FORMAT};
use crate::observability::DetectorMetrics;
use crate::query::{quote_literal, QueryDescription};

/// Connection settings for the ClickHouse HTTP interface
#[derive(Debug, Clone)]
pub struct ClickHouseConfig {
    /// HTTP endpoint, e.g. `https://clickhouse:8443`
    pub url: String,
    /// Default database for unqualified table names
    pub database: String,
    pub user: String,
    pub password: Option<String>,
    /// Anomaly log table
    pub log_table: String,
    /// Request timeout
    pub timeout: Duration,
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8123".to_string(),
            database: "default".to_string(),
            user: "default".to_string(),
            password: None,
            log_table: "alerts_log".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// ClickHouse client implementing both the metric store and the anomaly log
pub struct ClickHouseClient {
    client: Client,
    base_url: Url,
    config: ClickHouseConfig,
    metrics: Option<DetectorMetrics>,
}

impl ClickHouseClient {
    pub fn new(config: ClickHouseConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| DetectorError::data_access(format!("failed to create HTTP client: {}", e)))?;

        let base_url = Url::parse(&config.url).map_err(|e| {
            DetectorError::configuration(format!("invalid ClickHouse URL '{}': {}", config.url, e))
        })?;

        Ok(Self {
            client,
            base_url,
            config,
            metrics: None,
        })
    }

    /// Record query latency into the given metrics handle
    pub fn with_metrics(mut self, metrics: DetectorMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Post a statement and return the raw response body
    async fn execute(&self, statement: String) -> Result<String> {
        let start = Instant::now();

        let mut request = self
            .client
            .post(self.base_url.clone())
            .header("X-ClickHouse-User", self.config.user.as_str())
            .header("X-ClickHouse-Database", self.config.database.as_str())
            .body(statement);
        if let Some(ref password) = self.config.password {
            request = request.header("X-ClickHouse-Key", password.as_str());
        }

        let response = request.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(DetectorError::data_access(format!(
                "ClickHouse error ({}): {}",
                status,
                body.trim()
            )));
        }

        let body = response.text().await?;
        if let Some(ref metrics) = self.metrics {
            metrics.observe_query_latency(start.elapsed().as_secs_f64());
        }
        Ok(body)
    }

    async fn select(&self, sql: String) -> Result<Vec<Row>> {
        debug!(sql = %sql, "Executing query");
        let body = self.execute(format!("{} FORMAT JSONEachRow", sql)).await?;
        parse_json_each_row(&body)
    }

    /// Single nullable timestamp from a `max(...)` aggregate
    async fn select_max_time(&self, sql: String, column: &str) -> Result<Option<NaiveDateTime>> {
        let rows = self.select(sql).await?;
        let Some(row) = rows.first() else {
            return Ok(None);
        };
        match row.get(column) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(_) => {
                let ts = row.datetime(column).ok_or_else(|| {
                    DetectorError::data_access(format!("malformed timestamp in column '{}'", column))
                })?;
                // max() over no rows yields the DateTime default, the epoch
                Ok((ts.year() > 1970).then_some(ts))
            }
        }
    }
}

/// Decode a `JSONEachRow` response body
fn parse_json_each_row(body: &str) -> Result<Vec<Row>> {
    body.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str::<Row>(line).map_err(DetectorError::from))
        .collect()
}

#[async_trait]
impl MetricStore for ClickHouseClient {
    async fn fetch(&self, query: &QueryDescription) -> Result<Vec<Row>> {
        self.select(query.to_clickhouse_sql()).await
    }

    async fn freshest_timestamp(
        &self,
        table: &str,
        time_column: &str,
        since: NaiveDate,
    ) -> Result<Option<NaiveDateTime>> {
        let sql = format!(
            "SELECT max({time}) AS max_time FROM {} WHERE toDate({time}) >= {}",
            table,
            quote_literal(&since.format(DATE_FORMAT).to_string()),
            time = time_column,
        );
        self.select_max_time(sql, "max_time").await
    }
}

#[async_trait]
impl AnomalyLog for ClickHouseClient {
    async fn persist(&self, record: &AnomalyRecord) -> Result<()> {
        let row = serde_json::to_string(record)?;
        self.execute(format!(
            "INSERT INTO {} FORMAT JSONEachRow\n{}",
            self.config.log_table, row
        ))
        .await?;
        Ok(())
    }

    async fn last_alert(&self, key: &SuppressionKey) -> Result<Option<NaiveDateTime>> {
        let sql = format!(
            "SELECT max(bucket_time) AS last_time FROM {} \
             WHERE is_alert = 1 AND slice = {} AND metric = {} AND group_level = {}",
            self.config.log_table,
            quote_literal(&key.slice),
            quote_literal(key.metric.as_str()),
            quote_literal(&key.group_level),
        );
        self.select_max_time(sql, "last_time").await
    }
}
