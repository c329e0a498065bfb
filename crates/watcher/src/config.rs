//! Watcher configuration

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveTime;
use serde::Deserialize;
use watch_lib::catalog::{Catalog, CatalogSpec};
use watch_lib::cycle::{DetectionConfig, DETECTION_INTERVAL};
use watch_lib::notify::TelegramConfig;
use watch_lib::store::ClickHouseConfig;

const CONFIG_PATH_VAR: &str = "WATCHER_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "metric-watcher.toml";

/// Top-level configuration, read from an optional file and `WATCHER_*` env vars
#[derive(Debug, Clone, Deserialize)]
pub struct WatcherConfig {
    /// Instance name attached to structured log events
    #[serde(default = "default_instance")]
    pub instance: String,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Keep anomaly records in memory instead of the ClickHouse log table
    #[serde(default)]
    pub dry_run: bool,

    /// Optional catalog file; the built-in catalog is used otherwise
    #[serde(default)]
    pub catalog_file: Option<String>,

    #[serde(default)]
    pub clickhouse: ClickHouseSettings,

    #[serde(default)]
    pub telegram: TelegramSettings,

    #[serde(default)]
    pub detection: DetectionSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClickHouseSettings {
    #[serde(default = "default_clickhouse_url")]
    pub url: String,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_user")]
    pub user: String,
    /// Usually supplied as `WATCHER_CLICKHOUSE__PASSWORD`
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_log_table")]
    pub log_table: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelegramSettings {
    /// Usually supplied as `WATCHER_TELEGRAM__TOKEN`; alerts are only logged without it
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub chat_id: String,
    #[serde(default)]
    pub api_base: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectionSettings {
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default = "default_cooldown_minutes")]
    pub cooldown_minutes: i64,
    #[serde(default = "default_n_time_periods")]
    pub n_time_periods: u32,
    /// `HH:MM`
    #[serde(default = "default_earliest_time_of_day")]
    pub earliest_time_of_day: String,
    #[serde(default = "default_time_column")]
    pub time_column: String,
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    /// Defaults to `<database>.feed_actions`
    #[serde(default)]
    pub primary_table: Option<String>,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

fn default_instance() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "metric-watcher".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_clickhouse_url() -> String {
    ClickHouseConfig::default().url
}

fn default_database() -> String {
    "simulator".to_string()
}

fn default_user() -> String {
    ClickHouseConfig::default().user
}

fn default_log_table() -> String {
    ClickHouseConfig::default().log_table
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_threshold() -> f64 {
    DetectionConfig::default().threshold
}

fn default_cooldown_minutes() -> i64 {
    DetectionConfig::default().cooldown.num_minutes()
}

fn default_n_time_periods() -> u32 {
    DetectionConfig::default().n_time_periods
}

fn default_earliest_time_of_day() -> String {
    DetectionConfig::default()
        .earliest_time_of_day
        .format("%H:%M")
        .to_string()
}

fn default_time_column() -> String {
    DetectionConfig::default().time_column
}

fn default_max_concurrent_jobs() -> usize {
    DetectionConfig::default().max_concurrent_jobs
}

fn default_interval_secs() -> u64 {
    DETECTION_INTERVAL.as_secs()
}

impl Default for ClickHouseSettings {
    fn default() -> Self {
        Self {
            url: default_clickhouse_url(),
            database: default_database(),
            user: default_user(),
            password: None,
            log_table: default_log_table(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            cooldown_minutes: default_cooldown_minutes(),
            n_time_periods: default_n_time_periods(),
            earliest_time_of_day: default_earliest_time_of_day(),
            time_column: default_time_column(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
            primary_table: None,
            interval_secs: default_interval_secs(),
        }
    }
}

impl WatcherConfig {
    /// Load configuration from the config file (if present) and environment
    pub fn load() -> Result<Self> {
        let path =
            std::env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

        let config = config::Config::builder()
            .add_source(config::File::with_name(&path).required(false))
            .add_source(
                config::Environment::with_prefix("WATCHER")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("failed to read configuration from {}", path))?;

        config
            .try_deserialize()
            .context("invalid watcher configuration")
    }

    /// Catalog from `catalog_file`, or the built-in catalog for the configured database
    pub fn catalog(&self) -> Result<Catalog> {
        match &self.catalog_file {
            Some(path) => {
                let spec: CatalogSpec = config::Config::builder()
                    .add_source(config::File::from(Path::new(path)))
                    .build()
                    .and_then(|raw| raw.try_deserialize())
                    .with_context(|| format!("failed to read catalog file {}", path))?;
                Catalog::from_spec(spec).with_context(|| format!("invalid catalog in {}", path))
            }
            None => Catalog::builtin(&self.clickhouse.database).context("invalid built-in catalog"),
        }
    }

    pub fn clickhouse_config(&self) -> ClickHouseConfig {
        ClickHouseConfig {
            url: self.clickhouse.url.clone(),
            database: self.clickhouse.database.clone(),
            user: self.clickhouse.user.clone(),
            password: self.clickhouse.password.clone(),
            log_table: self.clickhouse.log_table.clone(),
            timeout: Duration::from_secs(self.clickhouse.timeout_secs),
        }
    }

    /// `None` when no bot token is configured
    pub fn telegram_config(&self) -> Option<TelegramConfig> {
        let token = self.telegram.token.as_deref()?.trim();
        if token.is_empty() {
            return None;
        }

        let mut config = TelegramConfig {
            token: token.to_string(),
            ..Default::default()
        };
        if let Some(api_base) = &self.telegram.api_base {
            config.api_base = api_base.clone();
        }
        Some(config)
    }

    pub fn detection_config(&self) -> Result<DetectionConfig> {
        let settings = &self.detection;
        let earliest_time_of_day = NaiveTime::parse_from_str(&settings.earliest_time_of_day, "%H:%M")
            .with_context(|| {
                format!(
                    "invalid detection.earliest_time_of_day '{}', expected HH:MM",
                    settings.earliest_time_of_day
                )
            })?;

        Ok(DetectionConfig {
            threshold: settings.threshold,
            cooldown: chrono::Duration::minutes(settings.cooldown_minutes),
            n_time_periods: settings.n_time_periods,
            earliest_time_of_day,
            time_column: settings.time_column.clone(),
            max_concurrent_jobs: settings.max_concurrent_jobs,
            primary_table: settings
                .primary_table
                .clone()
                .unwrap_or_else(|| format!("{}.feed_actions", self.clickhouse.database)),
        })
    }

    pub fn detection_interval(&self) -> Duration {
        Duration::from_secs(self.detection.interval_secs.max(1))
    }
}
