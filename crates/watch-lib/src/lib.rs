//! Metric anomaly watcher library
//!
//! This crate provides the core functionality for:
//! - Metric and slice catalogs loaded from configuration
//! - Declarative query building for the time-series store
//! - Dual-reference anomaly evaluation (today vs D-1 vs D-7)
//! - Cooldown-based suppression backed by the anomaly log
//! - Periodic detection cycles and alert notification
//! - Health checks and observability

pub mod anomaly;
pub mod catalog;
pub mod clock;
pub mod cycle;
pub mod error;
pub mod health;
pub mod models;
pub mod notify;
pub mod observability;
pub mod query;
pub mod store;

pub use error::{DetectorError, FailureKind, Result};
pub use health::{
    ComponentHealth, ComponentStatus, CycleDigest, HealthRegistry, HealthResponse,
    ReadinessResponse,
};
pub use models::*;
pub use observability::{DetectorMetrics, StructuredLogger};
