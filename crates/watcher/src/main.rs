//! Metric Watcher - periodic anomaly detection over product metrics
//!
//! Every 15 minutes the latest complete bucket of each configured metric is
//! compared with the same bucket one day and one week earlier; anomalies are
//! logged to ClickHouse and sent to a Telegram chat.

use anyhow::{Context, Result};
use metric_watcher::{api, config};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use watch_lib::{
    cycle::{CycleOrchestratorBuilder, DetectionLoop},
    health::HealthRegistry,
    notify::{LogOnlyChannel, NotificationChannel, Notifier, PlottersChartRenderer, TelegramChannel},
    observability::{DetectorMetrics, StructuredLogger},
    store::{AnomalyLog, ClickHouseClient, InMemoryAnomalyLog},
};

const WATCHER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting metric-watcher");

    let config = config::WatcherConfig::load()?;
    let catalog = Arc::new(config.catalog()?);
    let detection = config.detection_config()?;
    info!(
        instance = %config.instance,
        database = %config.clickhouse.database,
        dry_run = config.dry_run,
        "Watcher configured"
    );

    let metrics = DetectorMetrics::new();
    let health_registry = HealthRegistry::new();

    let clickhouse = Arc::new(
        ClickHouseClient::new(config.clickhouse_config())
            .context("failed to create ClickHouse client")?
            .with_metrics(metrics),
    );
    let anomaly_log: Arc<dyn AnomalyLog> = if config.dry_run {
        warn!("Dry run: anomaly records are kept in memory only");
        Arc::new(InMemoryAnomalyLog::new())
    } else {
        clickhouse.clone()
    };

    let channel: Arc<dyn NotificationChannel> = match config.telegram_config() {
        Some(telegram) => {
            Arc::new(TelegramChannel::new(telegram).context("failed to create Telegram channel")?)
        }
        None => {
            warn!("No Telegram token configured, alerts are only logged");
            Arc::new(LogOnlyChannel)
        }
    };
    let notifier = Arc::new(Notifier::new(
        channel,
        Arc::new(PlottersChartRenderer),
        config.telegram.chat_id.clone(),
    ));

    let orchestrator = CycleOrchestratorBuilder::new()
        .catalog(catalog.clone())
        .store(clickhouse)
        .anomaly_log(anomaly_log)
        .notifier(notifier)
        .config(detection)
        .instance(config.instance.clone())
        .build()?;

    let logger = StructuredLogger::new(&config.instance);
    logger.log_startup(WATCHER_VERSION, catalog.jobs().len(), catalog.metric_count());

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    // Start health and metrics server
    let mut api_shutdown = shutdown_tx.subscribe();
    let api_handle = tokio::spawn(api::serve(
        config.api_port,
        health_registry.clone(),
        async move {
            let _ = api_shutdown.recv().await;
        },
    ));

    let detection_loop = DetectionLoop::new(Arc::new(orchestrator), health_registry)
        .with_interval(config.detection_interval());
    let loop_handle = tokio::spawn(detection_loop.run(shutdown_rx));

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    info!("Shutting down");

    let _ = shutdown_tx.send(());
    if let Err(e) = loop_handle.await {
        error!(error = %e, "Detection loop terminated abnormally");
    }
    match api_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "API server failed"),
        Err(e) => error!(error = %e, "API server terminated abnormally"),
    }

    Ok(())
}
