//! Cooldown suppression backed by the anomaly log
//!
//! The log is the only durable suppression state. A tracker caches lookups
//! for the duration of one cycle and is discarded afterwards, so a restart
//! never loses or desynchronizes cooldowns.

use std::sync::Arc;

use chrono::NaiveDateTime;
use dashmap::DashMap;

use crate::error::Result;
use crate::models::{AnomalyRecord, SuppressionKey};
use crate::store::AnomalyLog;

/// Per-cycle view of "last alert time" per stream
pub struct SuppressionTracker {
    log: Arc<dyn AnomalyLog>,
    cache: DashMap<SuppressionKey, Option<NaiveDateTime>>,
}

impl SuppressionTracker {
    pub fn new(log: Arc<dyn AnomalyLog>) -> Self {
        Self {
            log,
            cache: DashMap::new(),
        }
    }

    /// Bucket time of the last alert for the key, consulting the log once per cycle
    pub async fn last_alert(&self, key: &SuppressionKey) -> Result<Option<NaiveDateTime>> {
        if let Some(cached) = self.cache.get(key) {
            return Ok(*cached);
        }

        let last = self.log.last_alert(key).await?;
        self.cache.insert(key.clone(), last);
        Ok(last)
    }

    /// Reflect a record that was just persisted
    pub fn observe(&self, record: &AnomalyRecord) {
        if !record.is_alert {
            return;
        }
        let mut entry = self.cache.entry(record.key()).or_insert(None);
        if entry.map_or(true, |last| last < record.bucket_time) {
            *entry = Some(record.bucket_time);
        }
    }

    /// Number of streams looked up in this cycle
    pub fn tracked_streams(&self) -> usize {
        self.cache.len()
    }
}
