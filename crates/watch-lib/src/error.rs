//! Error taxonomy for detection cycles

use serde::Serialize;
use thiserror::Error;

pub type Result<T, E = DetectorError> = std::result::Result<T, E>;

/// Errors raised while building, running or reporting a detection job
#[derive(Debug, Clone, Error)]
pub enum DetectorError {
    /// Invalid catalog or job definition; aborts the affected job
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Query execution, persistence or connectivity failure
    #[error("data access error: {0}")]
    DataAccess(String),

    /// A reference observation is missing or cannot be compared
    #[error("data unavailable: {0}")]
    DataUnavailable(String),

    /// The notification channel rejected or failed to deliver an alert
    #[error("notification delivery error: {0}")]
    NotificationDelivery(String),
}

impl DetectorError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn data_access(message: impl Into<String>) -> Self {
        Self::DataAccess(message.into())
    }

    pub fn data_unavailable(message: impl Into<String>) -> Self {
        Self::DataUnavailable(message.into())
    }

    pub fn delivery(message: impl Into<String>) -> Self {
        Self::NotificationDelivery(message.into())
    }

    /// Classification used for cycle summaries and metric labels
    pub fn kind(&self) -> FailureKind {
        match self {
            DetectorError::Configuration(_) => FailureKind::Configuration,
            DetectorError::DataAccess(_) => FailureKind::DataAccess,
            DetectorError::DataUnavailable(_) => FailureKind::DataUnavailable,
            DetectorError::NotificationDelivery(_) => FailureKind::NotificationDelivery,
        }
    }
}

impl From<reqwest::Error> for DetectorError {
    fn from(error: reqwest::Error) -> Self {
        DetectorError::DataAccess(error.to_string())
    }
}

impl From<serde_json::Error> for DetectorError {
    fn from(error: serde_json::Error) -> Self {
        DetectorError::DataAccess(format!("malformed result: {}", error))
    }
}

/// Failure classes reported at the end of a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Configuration,
    DataAccess,
    DataUnavailable,
    NotificationDelivery,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Configuration => "configuration",
            FailureKind::DataAccess => "data_access",
            FailureKind::DataUnavailable => "data_unavailable",
            FailureKind::NotificationDelivery => "notification_delivery",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
