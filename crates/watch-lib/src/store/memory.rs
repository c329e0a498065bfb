//! In-memory anomaly log

use async_trait::async_trait;
use chrono::NaiveDateTime;
use tokio::sync::RwLock;

use super::AnomalyLog;
use crate::error::Result;
use crate::models::{AnomalyRecord, SuppressionKey};

/// Anomaly log kept in process memory; state is lost on restart
#[derive(Debug, Default)]
pub struct InMemoryAnomalyLog {
    records: RwLock<Vec<AnomalyRecord>>,
}

impl InMemoryAnomalyLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every persisted record in insertion order
    pub async fn records(&self) -> Vec<AnomalyRecord> {
        self.records.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl AnomalyLog for InMemoryAnomalyLog {
    async fn persist(&self, record: &AnomalyRecord) -> Result<()> {
        self.records.write().await.push(record.clone());
        Ok(())
    }

    async fn last_alert(&self, key: &SuppressionKey) -> Result<Option<NaiveDateTime>> {
        let records = self.records.read().await;
        Ok(records
            .iter()
            .filter(|record| record.is_alert && record.key() == *key)
            .map(|record| record.bucket_time)
            .max())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MetricId, DATETIME_FORMAT, TOTAL};

    fn record(time: &str, group_level: &str, is_alert: bool) -> AnomalyRecord {
        AnomalyRecord {
            bucket_time: NaiveDateTime::parse_from_str(time, DATETIME_FORMAT).unwrap(),
            day_0_value: 1.0,
            day_1_value: 1.0,
            day_7_value: 1.0,
            day_1_diff: 0.0,
            day_7_diff: 0.0,
            slice: "os".to_string(),
            group_level: group_level.to_string(),
            metric: MetricId::from("views"),
            metric_name: "Views".to_string(),
            is_alert,
        }
    }

    #[tokio::test]
    async fn test_last_alert_only_counts_alerting_records_for_key() {
        let log = InMemoryAnomalyLog::new();
        log.persist(&record("2024-03-10 10:00:00", "iOS", true)).await.unwrap();
        log.persist(&record("2024-03-10 11:00:00", "iOS", false)).await.unwrap();
        log.persist(&record("2024-03-10 12:00:00", "Android", true)).await.unwrap();

        let key = SuppressionKey::new(MetricId::from("views"), "os", "iOS");
        let last = log.last_alert(&key).await.unwrap();
        assert_eq!(
            last,
            NaiveDateTime::parse_from_str("2024-03-10 10:00:00", DATETIME_FORMAT).ok()
        );

        let total = SuppressionKey::new(MetricId::from("views"), TOTAL, TOTAL);
        assert!(log.last_alert(&total).await.unwrap().is_none());
        assert_eq!(log.len().await, 3);
    }
}
