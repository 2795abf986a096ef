//! Closed-loop service health control plane.
//!
//! Polls service health endpoints, decides on remediation, raises alerts,
//! and persists rolled-up metrics behind a small HTTP query API.

mod alerts;
mod config;
mod db;
mod events;
mod healing;
mod metrics;
mod monitor;
mod web;

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use alerts::sink::{ConsoleNotifier, FileNotifier, Notifier};
use alerts::AlertEngine;
use config::{Config, ServerConfig};
use db::Store;
use healing::{Engine, LogExecutor};
use metrics::Collector;
use monitor::Monitor;
use web::{AppState, Server};

const EVENT_CHANNEL_CAPACITY: usize = 512;
const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// How long shutdown waits for background loops to finish their final work.
const GRACE_PERIOD: std::time::Duration = std::time::Duration::from_secs(5);

#[tokio::main]
async fn main() {
    let server_config = ServerConfig::load();
    let _log_guard = init_tracing(&server_config.event_log_dir);

    let config = match Config::load(&server_config.config_path) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(path = %server_config.config_path, "invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let store = match Store::new(&server_config.db_path) {
        Ok(store) => store,
        Err(e) => {
            tracing::error!(path = %server_config.db_path, "failed to open database: {}", e);
            std::process::exit(1);
        }
    };

    let (shutdown_tx, _) = broadcast::channel(1);
    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);

    let monitor = Monitor::new(config.targets.clone(), shutdown_tx.clone());
    let board = monitor.board();

    let engine = Engine::new(
        config.targets.clone(),
        config.healing.clone(),
        Arc::new(LogExecutor),
        event_tx,
    );
    let healing_stats = engine.stats();

    let notifiers: Vec<Arc<dyn Notifier>> = vec![
        Arc::new(ConsoleNotifier),
        Arc::new(FileNotifier::new(
            std::path::Path::new(&server_config.event_log_dir).join("alerts.jsonl"),
        )),
    ];
    let alert_engine = match AlertEngine::new(
        &config.alerts.rules,
        board.clone(),
        notifiers,
        cmd_tx.clone(),
        config.healing.critical_escalates,
    ) {
        Ok(engine) => engine,
        Err(e) => {
            tracing::error!("invalid alert rules: {}", e);
            std::process::exit(1);
        }
    };
    let alert_store = alert_engine.store();

    let collector = Collector::new(
        store.clone(),
        board.clone(),
        monitor.stats(),
        healing_stats,
        config.metrics.tick_seconds,
    );

    monitor.start();
    let tasks = vec![
        tokio::spawn(engine.run(monitor.subscribe(), cmd_rx, shutdown_tx.subscribe())),
        tokio::spawn(alert_engine.run(monitor.subscribe(), event_rx, shutdown_tx.subscribe())),
        tokio::spawn(collector.run(shutdown_tx.subscribe())),
        tokio::spawn(metrics::retention::run_retention_loop(
            store.clone(),
            config.metrics.retention_days,
            shutdown_tx.subscribe(),
        )),
    ];

    let server = Server::new(
        server_config.http_port,
        AppState {
            board,
            store,
            alerts: alert_store,
            heal_cmd_tx: cmd_tx,
        },
    );

    let mut server_failed = false;
    tokio::select! {
        result = server.start(shutdown_tx.subscribe()) => {
            if let Err(e) = result {
                tracing::error!("HTTP server failed: {}", e);
                server_failed = true;
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    // Let every loop observe the signal and finish its final work (the
    // collector flushes its in-flight windows here) before the runtime is
    // torn down.
    let _ = shutdown_tx.send(());
    for task in tasks {
        if tokio::time::timeout(GRACE_PERIOD, task).await.is_err() {
            tracing::warn!("task did not stop within the grace period");
        }
    }

    if server_failed {
        std::process::exit(1);
    }
}

/// Console logging plus a daily-rotated JSON event log.
///
/// The returned guard must stay alive for the life of the process or
/// buffered event lines are lost.
fn init_tracing(event_log_dir: &str) -> tracing_appender::non_blocking::WorkerGuard {
    let appender = tracing_appender::rolling::daily(event_log_dir, "events.jsonl");
    let (event_writer, guard) = tracing_appender::non_blocking(appender);

    let console_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warden=info")),
    );

    // The event log carries only the structured event lines, written as-is.
    let event_layer = tracing_subscriber::fmt::layer()
        .with_writer(event_writer)
        .with_target(false)
        .with_ansi(false)
        .with_filter(tracing_subscriber::filter::filter_fn(|metadata| {
            metadata.target() == events::EVENT_TARGET
        }));

    tracing_subscriber::registry()
        .with(console_layer)
        .with(event_layer)
        .init();

    guard
}
