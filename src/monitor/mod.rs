//! Health check monitor.
//!
//! One polling loop per target. Each tick issues an HTTP probe with up to
//! `max_retries` attempts (no backoff inside a tick), classifies the result,
//! and publishes it on a broadcast channel consumed by the decision engine
//! and the alert engine. Publication never blocks: a lagging consumer loses
//! the oldest results, never the monitor's time.

pub mod probe;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::config::ServiceTarget;
use crate::events::{self, Event};
use probe::{build_client, probe_once};

/// Results kept per service for trend display.
const RECENT_RESULTS: usize = 20;

/// Broadcast buffer for health results. Overflow drops the oldest entries
/// for the lagging consumer only.
const RESULT_CHANNEL_CAPACITY: usize = 256;

/// Classified outcome of one health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// 2xx response, body healthy or absent.
    Healthy,
    /// HTTP- or application-level failure (bad status code, degraded body).
    Unhealthy,
    /// Transport-level failure (timeout, DNS, connection refused).
    Error,
}

impl HealthStatus {
    pub fn is_healthy(self) -> bool {
        self == HealthStatus::Healthy
    }
}

/// One health check result, published per poll tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub service_id: String,
    pub timestamp: DateTime<Utc>,
    pub status: HealthStatus,
    pub latency_ms: f64,
    /// Running counter owned by the monitor; resets to 0 on any Healthy
    /// result.
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

/// Monitor-wide counters sampled by the metrics collector.
#[derive(Debug, Default)]
pub struct MonitorStats {
    pub checks_total: AtomicU64,
    pub failures_total: AtomicU64,
}

impl MonitorStats {
    fn record(&self, status: HealthStatus) {
        self.checks_total.fetch_add(1, Ordering::Relaxed);
        if !status.is_healthy() {
            self.failures_total.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Shared view of recent results per service. Each polling loop is the
/// single writer for its own service; everyone else reads snapshots.
#[derive(Clone, Default)]
pub struct StatusBoard {
    inner: Arc<RwLock<HashMap<String, VecDeque<HealthCheckResult>>>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, result: HealthCheckResult) {
        let mut board = self.inner.write().unwrap();
        let history = board.entry(result.service_id.clone()).or_default();
        history.push_back(result);
        while history.len() > RECENT_RESULTS {
            history.pop_front();
        }
    }

    /// Latest result per service, sorted by service id.
    pub fn latest_all(&self) -> Vec<HealthCheckResult> {
        let board = self.inner.read().unwrap();
        let mut results: Vec<_> = board
            .values()
            .filter_map(|h| h.back().cloned())
            .collect();
        results.sort_by(|a, b| a.service_id.cmp(&b.service_id));
        results
    }

    pub fn latest(&self, service_id: &str) -> Option<HealthCheckResult> {
        let board = self.inner.read().unwrap();
        board.get(service_id).and_then(|h| h.back().cloned())
    }

    pub fn history(&self, service_id: &str) -> Vec<HealthCheckResult> {
        let board = self.inner.read().unwrap();
        board
            .get(service_id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Failure percentage over the retained history for a service.
    pub fn error_rate(&self, service_id: &str) -> Option<f64> {
        let history = self.history(service_id);
        if history.is_empty() {
            return None;
        }
        let failures = history.iter().filter(|r| !r.status.is_healthy()).count();
        Some(failures as f64 / history.len() as f64 * 100.0)
    }

    /// p95 latency over the retained history for a service.
    pub fn latency_p95(&self, service_id: &str) -> Option<f64> {
        let mut latencies: Vec<f64> = self
            .history(service_id)
            .iter()
            .map(|r| r.latency_ms)
            .collect();
        if latencies.is_empty() {
            return None;
        }
        latencies.sort_by(|a, b| a.total_cmp(b));
        let rank = ((latencies.len() as f64) * 0.95).ceil() as usize;
        Some(latencies[rank.saturating_sub(1).min(latencies.len() - 1)])
    }

    pub fn service_ids(&self) -> Vec<String> {
        let board = self.inner.read().unwrap();
        let mut ids: Vec<_> = board.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// The health check monitor. Owns one polling loop per registered target.
pub struct Monitor {
    targets: Vec<ServiceTarget>,
    result_tx: broadcast::Sender<HealthCheckResult>,
    board: StatusBoard,
    stats: Arc<MonitorStats>,
    shutdown: broadcast::Sender<()>,
}

impl Monitor {
    pub fn new(targets: Vec<ServiceTarget>, shutdown: broadcast::Sender<()>) -> Self {
        let (result_tx, _) = broadcast::channel(RESULT_CHANNEL_CAPACITY);
        Self {
            targets,
            result_tx,
            board: StatusBoard::new(),
            stats: Arc::new(MonitorStats::default()),
            shutdown,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealthCheckResult> {
        self.result_tx.subscribe()
    }

    pub fn board(&self) -> StatusBoard {
        self.board.clone()
    }

    pub fn stats(&self) -> Arc<MonitorStats> {
        self.stats.clone()
    }

    /// Spawn the polling loop for every target.
    pub fn start(&self) {
        tracing::info!("starting monitor with {} targets", self.targets.len());
        for target in &self.targets {
            let target = target.clone();
            let tx = self.result_tx.clone();
            let board = self.board.clone();
            let stats = self.stats.clone();
            let shutdown_rx = self.shutdown.subscribe();
            tokio::spawn(run_check_loop(target, tx, board, stats, shutdown_rx));
        }
    }
}

/// The polling loop for a single target.
async fn run_check_loop(
    target: ServiceTarget,
    tx: broadcast::Sender<HealthCheckResult>,
    board: StatusBoard,
    stats: Arc<MonitorStats>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let client = match build_client(target.timeout()) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(service = %target.id, "cannot build probe client: {}", e);
            return;
        }
    };

    // Spread loop starts to avoid a thundering herd at boot.
    let jitter = rand::random::<u64>() % 500;
    tokio::time::sleep(std::time::Duration::from_millis(jitter)).await;

    let mut interval = tokio::time::interval(target.check_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut consecutive_failures: u32 = 0;
    let mut prev_status: Option<HealthStatus> = None;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                tracing::debug!(service = %target.id, "check loop stopping");
                break;
            }
            _ = interval.tick() => {
                let result = check_once(&client, &target, &mut consecutive_failures).await;
                stats.record(result.status);

                if prev_status != Some(result.status) {
                    if let Some(from) = prev_status {
                        events::emit("monitor", &Event::HealthChanged {
                            service_id: target.id.clone(),
                            from,
                            to: result.status,
                        });
                    }
                    prev_status = Some(result.status);
                }

                board.record(result.clone());
                // No receivers is fine; consumers may not have started yet.
                let _ = tx.send(result);
            }
        }
    }
}

/// Run one check: up to `max_retries` probe attempts within the tick, no
/// backoff between attempts. The counter resets to 0 on any Healthy result.
pub async fn check_once(
    client: &reqwest::Client,
    target: &ServiceTarget,
    consecutive_failures: &mut u32,
) -> HealthCheckResult {
    let timestamp = Utc::now();
    let mut latency_ms = 0.0;
    let mut last_error = None;
    let mut status = HealthStatus::Error;

    for attempt in 1..=target.max_retries {
        let started = Instant::now();
        match probe_once(client, &target.health_url, target.timeout()).await {
            Ok(success) => {
                status = HealthStatus::Healthy;
                latency_ms = success.latency_ms;
                last_error = None;
                break;
            }
            Err(e) => {
                latency_ms = started.elapsed().as_secs_f64() * 1000.0;
                status = if e.is_transport() {
                    HealthStatus::Error
                } else {
                    HealthStatus::Unhealthy
                };
                tracing::debug!(
                    service = %target.id,
                    attempt,
                    "probe attempt failed: {}", e
                );
                last_error = Some(e.to_string());
            }
        }
    }

    if status.is_healthy() {
        *consecutive_failures = 0;
    } else {
        *consecutive_failures += 1;
    }

    HealthCheckResult {
        service_id: target.id.clone(),
        timestamp,
        status,
        latency_ms,
        consecutive_failures: *consecutive_failures,
        last_error,
    }
}
