//! Metric and slice catalog
//!
//! Definitions are keyed by typed identifiers and validated once at load
//! time. Job references are resolved lazily so that a broken job only
//! aborts itself, never the whole cycle.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{DetectorError, Result};
use crate::models::{
    JobSpec, MetricDefinition, MetricId, MetricKind, SliceDefinition, SliceId, SliceSelector,
    TOTAL,
};

/// Raw metric entry as written in a catalog file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricEntry {
    pub name: String,
    pub formula: String,
    pub table: String,
    pub kind: MetricKind,
}

/// Raw slice entry as written in a catalog file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SliceEntry {
    pub expression: String,
    pub group_levels: Vec<String>,
}

/// Catalog file layout
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogSpec {
    #[serde(default)]
    pub metrics: BTreeMap<String, MetricEntry>,
    #[serde(default)]
    pub slices: BTreeMap<String, SliceEntry>,
    #[serde(default)]
    pub jobs: Vec<JobSpec>,
}

/// Validated, immutable set of metric and slice definitions plus the jobs to run
#[derive(Debug, Clone)]
pub struct Catalog {
    metrics: BTreeMap<MetricId, MetricDefinition>,
    slices: BTreeMap<SliceId, SliceDefinition>,
    jobs: Vec<JobSpec>,
}

impl Catalog {
    /// Validate definitions and build the catalog
    pub fn from_spec(spec: CatalogSpec) -> Result<Self> {
        let mut metrics = BTreeMap::new();
        for (id, entry) in spec.metrics {
            if entry.formula.trim().is_empty() {
                return Err(DetectorError::configuration(format!(
                    "metric '{}' has an empty formula",
                    id
                )));
            }
            if entry.table.trim().is_empty() {
                return Err(DetectorError::configuration(format!(
                    "metric '{}' has no source table",
                    id
                )));
            }
            let id = MetricId::new(id);
            metrics.insert(
                id.clone(),
                MetricDefinition {
                    id,
                    name: entry.name,
                    formula: entry.formula,
                    table: entry.table,
                    kind: entry.kind,
                },
            );
        }

        let mut slices = BTreeMap::new();
        for (id, entry) in spec.slices {
            if id == TOTAL {
                return Err(DetectorError::configuration(
                    "'total' is reserved and cannot name a slice",
                ));
            }
            if entry.group_levels.is_empty() {
                return Err(DetectorError::configuration(format!(
                    "slice '{}' has no group levels",
                    id
                )));
            }
            let mut seen = HashSet::new();
            if let Some(dup) = entry.group_levels.iter().find(|level| !seen.insert(*level)) {
                return Err(DetectorError::configuration(format!(
                    "slice '{}' lists group level '{}' twice",
                    id, dup
                )));
            }
            let id = SliceId::new(id);
            slices.insert(
                id.clone(),
                SliceDefinition {
                    id,
                    expression: entry.expression,
                    group_levels: entry.group_levels,
                },
            );
        }

        Ok(Self {
            metrics,
            slices,
            jobs: spec.jobs,
        })
    }

    /// The feed and messenger catalog the watcher ships with
    pub fn builtin(database: &str) -> Result<Self> {
        let feed = format!("{}.feed_actions", database);
        let messages = format!("{}.message_actions", database);

        let metric = |name: &str, formula: &str, table: &str, kind: MetricKind| MetricEntry {
            name: name.to_string(),
            formula: formula.to_string(),
            table: table.to_string(),
            kind,
        };

        let mut spec = CatalogSpec::default();
        spec.metrics.insert(
            "users_feed".into(),
            metric("Users from feed", "uniqExact(user_id)", &feed, MetricKind::Count),
        );
        spec.metrics.insert(
            "likes".into(),
            metric("Likes", "countIf(user_id, action='like')", &feed, MetricKind::Count),
        );
        spec.metrics.insert(
            "views".into(),
            metric("Views", "countIf(user_id, action='view')", &feed, MetricKind::Count),
        );
        spec.metrics.insert(
            "ctr".into(),
            metric(
                "CTR",
                "countIf(user_id, action='like') / countIf(user_id, action='view')",
                &feed,
                MetricKind::Ratio,
            ),
        );
        spec.metrics.insert(
            "lpu".into(),
            metric(
                "Likes per user",
                "countIf(user_id, action='like') / uniqExact(user_id)",
                &feed,
                MetricKind::Ratio,
            ),
        );
        spec.metrics.insert(
            "vpu".into(),
            metric(
                "Views per user",
                "countIf(user_id, action='view') / uniqExact(user_id)",
                &feed,
                MetricKind::Ratio,
            ),
        );
        spec.metrics.insert(
            "users_msg".into(),
            metric("Users from messenger", "uniqExact(user_id)", &messages, MetricKind::Count),
        );
        spec.metrics.insert(
            "messages".into(),
            metric("Messages", "count(user_id)", &messages, MetricKind::Count),
        );
        spec.metrics.insert(
            "mpu".into(),
            metric(
                "Messages per user",
                "count(user_id) / uniqExact(user_id)",
                &messages,
                MetricKind::Ratio,
            ),
        );

        spec.slices.insert(
            "os".into(),
            SliceEntry {
                expression: "os".to_string(),
                group_levels: vec!["iOS".to_string(), "Android".to_string()],
            },
        );

        let ids = |ids: &[&str]| ids.iter().map(|id| MetricId::from(*id)).collect::<Vec<_>>();
        let feed_metrics = ids(&["users_feed", "likes", "views", "ctr", "lpu", "vpu"]);
        let message_metrics = ids(&["users_msg", "messages", "mpu"]);
        let os = SliceSelector::Slice(SliceId::from("os"));
        spec.jobs = vec![
            JobSpec::new(feed_metrics.clone(), SliceSelector::Total),
            JobSpec::new(feed_metrics, os.clone()),
            JobSpec::new(message_metrics.clone(), SliceSelector::Total),
            JobSpec::new(message_metrics, os),
        ];

        Self::from_spec(spec)
    }

    pub fn metric(&self, id: &MetricId) -> Result<&MetricDefinition> {
        self.metrics
            .get(id)
            .ok_or_else(|| DetectorError::configuration(format!("unknown metric '{}'", id)))
    }

    pub fn slice(&self, id: &SliceId) -> Result<&SliceDefinition> {
        self.slices
            .get(id)
            .ok_or_else(|| DetectorError::configuration(format!("unknown slice '{}'", id)))
    }

    /// Slice definition for a selector; `None` for the total pseudo-slice
    pub fn selector(&self, selector: &SliceSelector) -> Result<Option<&SliceDefinition>> {
        match selector {
            SliceSelector::Total => Ok(None),
            SliceSelector::Slice(id) => self.slice(id).map(Some),
        }
    }

    pub fn jobs(&self) -> &[JobSpec] {
        &self.jobs
    }

    pub fn with_jobs(mut self, jobs: Vec<JobSpec>) -> Self {
        self.jobs = jobs;
        self
    }

    pub fn metric_count(&self) -> usize {
        self.metrics.len()
    }
}
