//! Declarative query building
//!
//! Turns a (metric set, slice, window mode) triple into a backend-agnostic
//! [`QueryDescription`]. Rendering to a concrete query language lives in
//! [`render`].

mod render;

pub use render::quote_literal;

use std::collections::BTreeSet;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

use crate::catalog::Catalog;
use crate::error::{DetectorError, Result};
use crate::models::{bucket_width, MetricId, ReferenceDay, SliceSelector, TimeBucket};

/// Alias of the calendar date column
pub const DATE_COLUMN: &str = "date";
/// Alias of the bucket start column (timeseries mode)
pub const BUCKET_COLUMN: &str = "bucket";
/// Alias of the `HH:MM` bucket label column (timeseries mode)
pub const LABEL_COLUMN: &str = "ts";

/// Time windowing applied to a query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowMode {
    /// One row per (date, slice value) restricted to the three reference windows
    Aggregate,
    /// One row per (date, bucket, slice value) over the three full dates
    Timeseries,
}

/// Selected expression
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Calendar date of the event time
    Date,
    /// Start of the 15-minute bucket of the event time
    Bucket,
    /// `HH:MM` label of the bucket start
    BucketLabel,
    /// Plain grouping column or expression
    Column(String),
    /// Opaque aggregate formula
    Formula(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    pub expr: Expr,
    pub alias: String,
}

impl Projection {
    fn new(expr: Expr, alias: impl Into<String>) -> Self {
        Self {
            expr,
            alias: alias.into(),
        }
    }
}

/// Filter predicate tree
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    All(Vec<Predicate>),
    Any(Vec<Predicate>),
    /// Event date is one of the given dates
    DateIn(Vec<NaiveDate>),
    /// Event time of day is at or after the given time
    TimeOfDayFrom(NaiveTime),
    /// Half-open event time range `[from, until)`
    TimeRange {
        from: NaiveDateTime,
        until: NaiveDateTime,
    },
    /// Expression value is one of the given values
    ValueIn {
        expression: String,
        values: Vec<String>,
    },
}

/// Grouping key
#[derive(Debug, Clone, PartialEq)]
pub enum GroupKey {
    Date,
    Bucket,
    BucketLabel,
    /// Group by a projected alias
    Alias(String),
}

/// Backend-agnostic description of one query
#[derive(Debug, Clone, PartialEq)]
pub struct QueryDescription {
    pub table: String,
    pub time_column: String,
    pub select: Vec<Projection>,
    pub filter: Predicate,
    pub group_by: Vec<GroupKey>,
}

impl QueryDescription {
    /// Values of a membership clause on the given expression, if present
    pub fn membership(&self, expression: &str) -> Option<&[String]> {
        fn find<'a>(predicate: &'a Predicate, expression: &str) -> Option<&'a [String]> {
            match predicate {
                Predicate::ValueIn {
                    expression: e,
                    values,
                } if e == expression => Some(values.as_slice()),
                Predicate::All(children) | Predicate::Any(children) => {
                    children.iter().find_map(|child| find(child, expression))
                }
                _ => None,
            }
        }
        find(&self.filter, expression)
    }

    /// Every time range clause in the filter
    pub fn time_ranges(&self) -> Vec<(NaiveDateTime, NaiveDateTime)> {
        fn collect(predicate: &Predicate, out: &mut Vec<(NaiveDateTime, NaiveDateTime)>) {
            match predicate {
                Predicate::TimeRange { from, until } => out.push((*from, *until)),
                Predicate::All(children) | Predicate::Any(children) => {
                    children.iter().for_each(|child| collect(child, out))
                }
                _ => {}
            }
        }
        let mut ranges = Vec::new();
        collect(&self.filter, &mut ranges);
        ranges
    }
}

/// Settings shared by every query the builder produces
#[derive(Debug, Clone)]
pub struct QuerySettings {
    /// Number of buckets in the D-1 and D-7 reference windows
    pub n_time_periods: u32,
    /// Events earlier in the day than this are excluded (known ingestion gap)
    pub earliest_time_of_day: NaiveTime,
    /// Event timestamp column of the source tables
    pub time_column: String,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            n_time_periods: 3,
            earliest_time_of_day: NaiveTime::from_hms_opt(1, 0, 0).unwrap_or(NaiveTime::MIN),
            time_column: "time".to_string(),
        }
    }
}

/// Builds query descriptions against a catalog
pub struct QueryBuilder<'a> {
    catalog: &'a Catalog,
    settings: &'a QuerySettings,
}

impl<'a> QueryBuilder<'a> {
    pub fn new(catalog: &'a Catalog, settings: &'a QuerySettings) -> Self {
        Self { catalog, settings }
    }

    /// Build the query for one job in the given window mode
    pub fn build(
        &self,
        metrics: &[MetricId],
        slice: &SliceSelector,
        mode: WindowMode,
        bucket: TimeBucket,
    ) -> Result<QueryDescription> {
        if metrics.is_empty() {
            return Err(DetectorError::configuration("job has no metrics"));
        }

        let definitions = metrics
            .iter()
            .map(|id| self.catalog.metric(id))
            .collect::<Result<Vec<_>>>()?;

        let tables: BTreeSet<&str> = definitions.iter().map(|m| m.table.as_str()).collect();
        if tables.len() > 1 {
            return Err(DetectorError::configuration(format!(
                "metrics span multiple tables: {}",
                tables.into_iter().collect::<Vec<_>>().join(", ")
            )));
        }
        let table = definitions[0].table.clone();
        let slice_def = self.catalog.selector(slice)?;

        let mut select = vec![Projection::new(Expr::Date, DATE_COLUMN)];
        let mut group_by = vec![GroupKey::Date];
        if mode == WindowMode::Timeseries {
            select.push(Projection::new(Expr::Bucket, BUCKET_COLUMN));
            select.push(Projection::new(Expr::BucketLabel, LABEL_COLUMN));
            group_by.push(GroupKey::Bucket);
            group_by.push(GroupKey::BucketLabel);
        }
        select.extend(
            definitions
                .iter()
                .map(|m| Projection::new(Expr::Formula(m.formula.clone()), m.id.as_str())),
        );

        let mut clauses = vec![
            Predicate::DateIn(
                ReferenceDay::ALL
                    .iter()
                    .map(|day| bucket.reference_date(*day))
                    .collect(),
            ),
            Predicate::TimeOfDayFrom(self.settings.earliest_time_of_day),
        ];
        if mode == WindowMode::Aggregate {
            clauses.push(Predicate::Any(
                ReferenceDay::ALL
                    .iter()
                    .map(|day| {
                        let (from, until) = self.reference_window(bucket, *day);
                        Predicate::TimeRange { from, until }
                    })
                    .collect(),
            ));
        }

        if let Some(def) = slice_def {
            select.push(Projection::new(
                Expr::Column(def.expression.clone()),
                def.id.as_str(),
            ));
            group_by.push(GroupKey::Alias(def.id.as_str().to_string()));
            clauses.push(Predicate::ValueIn {
                expression: def.expression.clone(),
                values: def.group_levels.clone(),
            });
        }

        Ok(QueryDescription {
            table,
            time_column: self.settings.time_column.clone(),
            select,
            filter: Predicate::All(clauses),
            group_by,
        })
    }

    /// Event time window compared for one reference day
    ///
    /// Today is the single current bucket. D-1 and D-7 span `n_time_periods`
    /// buckets starting one bucket before the same clock time.
    pub fn reference_window(
        &self,
        bucket: TimeBucket,
        day: ReferenceDay,
    ) -> (NaiveDateTime, NaiveDateTime) {
        match day {
            ReferenceDay::Today => (bucket.start(), bucket.end()),
            _ => {
                let at = bucket.on(day);
                let trailing = self.settings.n_time_periods.saturating_sub(1) as i32;
                (at - bucket_width(), at + bucket_width() * trailing)
            }
        }
    }
}
