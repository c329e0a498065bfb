//! Anomaly detection for metric buckets
//!
//! This module provides:
//! - The dual-reference relative-threshold evaluator (today vs D-1 vs D-7)
//! - Cooldown suppression read from the persisted anomaly log

mod evaluator;
mod suppression;

pub use evaluator::{
    relative_deviation, AnomalyEvaluator, Evaluation, EvaluationSubject, Verdict,
    DEFAULT_COOLDOWN_MINUTES, DEFAULT_THRESHOLD,
};
pub use suppression::SuppressionTracker;
