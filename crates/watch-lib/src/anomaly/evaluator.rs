//! Dual-reference anomaly evaluation
//!
//! A bucket is anomalous only when it deviates by at least the threshold
//! from both the same clock time yesterday and seven days ago, is not
//! between those two references, and no alert for the same stream was
//! raised within the cooldown.

use chrono::{Duration, NaiveDateTime};

use crate::error::{DetectorError, Result};
use crate::models::{AnomalyRecord, MetricDefinition, ReferenceTriple};

/// Default minimum relative deviation (50%)
pub const DEFAULT_THRESHOLD: f64 = 0.5;

/// Default cooldown between alerts of one stream (3 hours)
pub const DEFAULT_COOLDOWN_MINUTES: i64 = 180;

/// Symmetric relative deviation `|min/max - 1|`, in `[0, 1]`
///
/// Fails when either value is negative or non-finite, or when both are
/// zero and the ratio is undefined.
pub fn relative_deviation(current: f64, reference: f64) -> Result<f64> {
    for value in [current, reference] {
        if !value.is_finite() || value < 0.0 {
            return Err(DetectorError::data_unavailable(format!(
                "reference value {} is not a finite non-negative magnitude",
                value
            )));
        }
    }

    let (low, high) = if current <= reference {
        (current, reference)
    } else {
        (reference, current)
    };
    if high == 0.0 {
        return Err(DetectorError::data_unavailable(
            "relative deviation undefined for zero values",
        ));
    }

    Ok((low / high - 1.0).abs())
}

/// Why a record was or was not flagged
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    /// Both references exceeded the threshold
    Alert,
    /// An alert for this stream was raised within the cooldown
    Suppressed { last_alert: NaiveDateTime },
    /// Today lies between yesterday and last week
    BetweenReferences,
    /// At least one reference deviation is below the threshold
    BelowThreshold,
}

impl Verdict {
    pub fn is_alert(&self) -> bool {
        matches!(self, Verdict::Alert)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Alert => "alert",
            Verdict::Suppressed { .. } => "suppressed",
            Verdict::BetweenReferences => "between_references",
            Verdict::BelowThreshold => "below_threshold",
        }
    }
}

/// The stream being evaluated
#[derive(Debug, Clone, Copy)]
pub struct EvaluationSubject<'a> {
    pub metric: &'a MetricDefinition,
    pub slice: &'a str,
    pub group_level: &'a str,
    pub bucket_time: NaiveDateTime,
}

/// Record plus the reason behind its verdict
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub record: AnomalyRecord,
    pub verdict: Verdict,
}

/// Scores reference triples against the threshold and cooldown
#[derive(Debug, Clone)]
pub struct AnomalyEvaluator {
    threshold: f64,
    cooldown: Duration,
}

impl Default for AnomalyEvaluator {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD, Duration::minutes(DEFAULT_COOLDOWN_MINUTES))
    }
}

impl AnomalyEvaluator {
    pub fn new(threshold: f64, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Whether a previous alert still blocks new alerts at `now`
    pub fn within_cooldown(&self, last_alert: NaiveDateTime, now: NaiveDateTime) -> bool {
        now - last_alert < self.cooldown
    }

    /// Evaluate one (normalized) triple for one stream
    ///
    /// `last_alert` is the bucket time of the most recent alerting record
    /// for the same metric, slice and slice value.
    pub fn evaluate(
        &self,
        triple: ReferenceTriple,
        subject: EvaluationSubject<'_>,
        last_alert: Option<NaiveDateTime>,
    ) -> Result<Evaluation> {
        let ReferenceTriple {
            day_0,
            day_1,
            day_7,
        } = triple;

        let day_7_diff = relative_deviation(day_0, day_7)?;
        let day_1_diff = relative_deviation(day_0, day_1)?;

        let verdict = match last_alert {
            Some(last) if self.within_cooldown(last, subject.bucket_time) => {
                Verdict::Suppressed { last_alert: last }
            }
            _ if (day_1 <= day_0 && day_0 <= day_7) || (day_7 <= day_0 && day_0 <= day_1) => {
                Verdict::BetweenReferences
            }
            _ if day_7_diff >= self.threshold && day_1_diff >= self.threshold => Verdict::Alert,
            _ => Verdict::BelowThreshold,
        };

        Ok(Evaluation {
            record: AnomalyRecord {
                bucket_time: subject.bucket_time,
                day_0_value: day_0,
                day_1_value: day_1,
                day_7_value: day_7,
                day_1_diff,
                day_7_diff,
                slice: subject.slice.to_string(),
                group_level: subject.group_level.to_string(),
                metric: subject.metric.id.clone(),
                metric_name: subject.metric.name.clone(),
                is_alert: verdict.is_alert(),
            },
            verdict,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MetricId, MetricKind, DATETIME_FORMAT, TOTAL};

    fn views() -> MetricDefinition {
        MetricDefinition {
            id: MetricId::from("views"),
            name: "Views".to_string(),
            formula: "countIf(user_id, action='view')".to_string(),
            table: "db.feed_actions".to_string(),
            kind: MetricKind::Count,
        }
    }

    fn at(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, DATETIME_FORMAT).unwrap()
    }

    fn subject(metric: &MetricDefinition) -> EvaluationSubject<'_> {
        EvaluationSubject {
            metric,
            slice: TOTAL,
            group_level: TOTAL,
            bucket_time: at("2024-03-10 12:30:00"),
        }
    }

    #[test]
    fn test_relative_deviation_is_symmetric() {
        let pairs = [(100.0, 50.0), (3.0, 7.5), (0.2, 0.9), (10.0, 10.0)];
        for (a, b) in pairs {
            let forward = relative_deviation(a, b).unwrap();
            let backward = relative_deviation(b, a).unwrap();
            assert!((forward - backward).abs() < 1e-12);
            assert!(forward >= 0.0);
        }
        assert!((relative_deviation(100.0, 50.0).unwrap() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_relative_deviation_rejects_degenerate_values() {
        assert!(matches!(
            relative_deviation(0.0, 0.0),
            Err(DetectorError::DataUnavailable(_))
        ));
        assert!(relative_deviation(f64::NAN, 1.0).is_err());
        assert!(relative_deviation(-1.0, 1.0).is_err());
        assert_eq!(relative_deviation(0.0, 5.0).unwrap(), 1.0);
    }

    #[test]
    fn test_between_references_never_alerts() {
        let metric = views();
        // Huge gaps on both sides, but today sits between the references
        let triples = [
            ReferenceTriple::new(100.0, 10.0, 1000.0),
            ReferenceTriple::new(100.0, 1000.0, 10.0),
            ReferenceTriple::new(10.0, 10.0, 1000.0),
        ];
        for threshold in [0.0, 0.1, 0.5, 0.9] {
            let evaluator = AnomalyEvaluator::new(threshold, Duration::hours(3));
            for triple in triples {
                let evaluation = evaluator.evaluate(triple, subject(&metric), None).unwrap();
                assert_eq!(evaluation.verdict, Verdict::BetweenReferences);
                assert!(!evaluation.record.is_alert);
            }
        }
    }

    #[test]
    fn test_both_references_must_exceed_threshold() {
        let metric = views();
        let evaluator = AnomalyEvaluator::default();

        // day_7_diff = 0.9, day_1_diff = 0.1
        let triple = ReferenceTriple::new(10.0, 11.111_111_111, 100.0);
        let evaluation = evaluator.evaluate(triple, subject(&metric), None);
        let evaluation = evaluation.unwrap();
        assert!((evaluation.record.day_7_diff - 0.9).abs() < 1e-9);
        assert!((evaluation.record.day_1_diff - 0.1).abs() < 1e-6);
        assert!(!evaluation.record.is_alert);

        // A drop far below both references alerts
        let triple = ReferenceTriple::new(10.0, 100.0, 120.0);
        let evaluation = evaluator.evaluate(triple, subject(&metric), None).unwrap();
        assert_eq!(evaluation.verdict, Verdict::Alert);
        assert!(evaluation.record.is_alert);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let metric = views();
        let evaluator = AnomalyEvaluator::default();
        let triple = ReferenceTriple::new(50.0, 100.0, 100.0);
        let evaluation = evaluator.evaluate(triple, subject(&metric), None).unwrap();
        assert!(evaluation.record.is_alert);
    }

    #[test]
    fn test_cooldown_suppresses_then_expires() {
        let metric = views();
        let evaluator = AnomalyEvaluator::default();
        let triple = ReferenceTriple::new(10.0, 100.0, 120.0);

        let recent = at("2024-03-10 09:45:00"); // 2h45m before the bucket
        let evaluation = evaluator
            .evaluate(triple, subject(&metric), Some(recent))
            .unwrap();
        assert_eq!(evaluation.verdict, Verdict::Suppressed { last_alert: recent });
        assert!(!evaluation.record.is_alert);

        let expired = at("2024-03-10 09:30:00"); // exactly 3h before
        let evaluation = evaluator
            .evaluate(triple, subject(&metric), Some(expired))
            .unwrap();
        assert_eq!(evaluation.verdict, Verdict::Alert);
    }

    #[test]
    fn test_suppression_short_circuits_before_deviation_test() {
        let metric = views();
        let evaluator = AnomalyEvaluator::default();
        let triple = ReferenceTriple::new(100.0, 10.0, 1000.0);
        let last = at("2024-03-10 12:00:00");

        let evaluation = evaluator
            .evaluate(triple, subject(&metric), Some(last))
            .unwrap();
        assert!(matches!(evaluation.verdict, Verdict::Suppressed { .. }));
    }

    #[test]
    fn test_views_end_to_end_example_does_not_alert() {
        let metric = views();
        let evaluator = AnomalyEvaluator::default();
        let triple = ReferenceTriple::new(120.0, 270.0, 330.0).normalized(MetricKind::Count, 3);

        let evaluation = evaluator.evaluate(triple, subject(&metric), None).unwrap();
        let record = evaluation.record;

        assert_eq!(record.day_1_value, 90.0);
        assert_eq!(record.day_7_value, 110.0);
        assert!((record.day_1_diff - 0.25).abs() < 1e-9);
        assert!((record.day_7_diff - (1.0 - 110.0 / 120.0)).abs() < 1e-9);
        assert!(!record.is_alert);
        assert_eq!(evaluation.verdict, Verdict::BelowThreshold);
    }

    #[test]
    fn test_zero_references_are_data_unavailable() {
        let metric = views();
        let evaluator = AnomalyEvaluator::default();
        let result = evaluator.evaluate(
            ReferenceTriple::new(0.0, 0.0, 5.0),
            subject(&metric),
            None,
        );
        assert!(matches!(result, Err(DetectorError::DataUnavailable(_))));
    }
}
