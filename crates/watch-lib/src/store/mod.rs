//! Data access for the time-series store and the anomaly log
//!
//! The orchestrator depends only on the traits below; the ClickHouse HTTP
//! binding is the reference implementation and the in-memory log serves dry
//! runs and tests.

mod clickhouse;
mod memory;

pub use clickhouse::{ClickHouseClient, ClickHouseConfig};
pub use memory::InMemoryAnomalyLog;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};

use crate::error::Result;
use crate::models::{AnomalyRecord, Row, SuppressionKey};
use crate::query::QueryDescription;

/// Query executor for the time-series store
#[async_trait]
pub trait MetricStore: Send + Sync {
    /// Execute a query description and return its rows
    async fn fetch(&self, query: &QueryDescription) -> Result<Vec<Row>>;

    /// Latest event timestamp in `table` at or after `since`; `None` when empty
    async fn freshest_timestamp(
        &self,
        table: &str,
        time_column: &str,
        since: NaiveDate,
    ) -> Result<Option<NaiveDateTime>>;
}

/// Append-only anomaly log, also the source of suppression state
#[async_trait]
pub trait AnomalyLog: Send + Sync {
    /// Append one evaluation record
    async fn persist(&self, record: &AnomalyRecord) -> Result<()>;

    /// Bucket time of the most recent alerting record for the key
    async fn last_alert(&self, key: &SuppressionKey) -> Result<Option<NaiveDateTime>>;
}
