//! Metrics collection.
//!
//! A single collector loop samples process resources, check/remediation
//! counters, and per-service health on a fixed tick, folds samples into
//! hourly windows, and flushes sealed windows to the store. Daily windows
//! are re-folded from the stored hourly windows of the affected day.

pub mod retention;
pub mod window;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;

use crate::db::{DbError, Store};
use crate::healing::HealingStats;
use crate::monitor::{MonitorStats, StatusBoard};
use window::{
    series_name, truncate_to_window, ActiveWindow, MetricWindow, DAILY_SECONDS, HOURLY_SECONDS,
};

/// Ceiling on sealed windows held while the store is unavailable. Beyond
/// this the oldest windows are dropped rather than growing without bound.
const MAX_PENDING_WINDOWS: usize = 1024;

pub struct Collector {
    store: Store,
    board: StatusBoard,
    monitor_stats: Arc<MonitorStats>,
    healing_stats: Arc<HealingStats>,
    tick_seconds: u64,
    windows: HashMap<String, ActiveWindow>,
    /// Sealed windows awaiting a successful flush. Kept across ticks when
    /// the store is unavailable.
    flush_queue: Vec<MetricWindow>,
    system: System,
    pid: Option<Pid>,
    last_checks: u64,
    last_check_failures: u64,
    last_attempts: u64,
    last_attempt_failures: u64,
}

impl Collector {
    pub fn new(
        store: Store,
        board: StatusBoard,
        monitor_stats: Arc<MonitorStats>,
        healing_stats: Arc<HealingStats>,
        tick_seconds: u64,
    ) -> Self {
        Self {
            store,
            board,
            monitor_stats,
            healing_stats,
            tick_seconds,
            windows: HashMap::new(),
            flush_queue: Vec::new(),
            system: System::new(),
            pid: sysinfo::get_current_pid().ok(),
            last_checks: 0,
            last_check_failures: 0,
            last_attempts: 0,
            last_attempt_failures: 0,
        }
    }

    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(self.tick_seconds.max(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(tick_seconds = self.tick_seconds, "metrics collector started");

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    // Seal and flush whatever is in flight before exit.
                    self.seal_all();
                    self.flush();
                    tracing::info!("metrics collector stopping");
                    return;
                }
                _ = interval.tick() => {
                    self.tick(Utc::now());
                }
            }
        }
    }

    /// One collection pass: sample everything, then flush sealed windows.
    fn tick(&mut self, now: DateTime<Utc>) {
        for (name, value) in self.sample() {
            self.observe(name, value, now);
        }
        self.flush();
    }

    fn sample(&mut self) -> Vec<(String, f64)> {
        let mut samples = Vec::new();

        if let Some(pid) = self.pid {
            self.system
                .refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
            if let Some(process) = self.system.process(pid) {
                samples.push(("process_cpu_percent".to_string(), process.cpu_usage() as f64));
                samples.push(("process_memory_bytes".to_string(), process.memory() as f64));
            }
        }

        let checks = self.monitor_stats.checks_total.load(Ordering::Relaxed);
        let check_failures = self.monitor_stats.failures_total.load(Ordering::Relaxed);
        let attempts = self.healing_stats.attempts_total.load(Ordering::Relaxed);
        let attempt_failures = self.healing_stats.failures_total.load(Ordering::Relaxed);

        // Counters are recorded as per-tick deltas so a window's sum is the
        // activity within that window.
        samples.push((
            "health_checks".to_string(),
            checks.saturating_sub(self.last_checks) as f64,
        ));
        samples.push((
            "health_check_failures".to_string(),
            check_failures.saturating_sub(self.last_check_failures) as f64,
        ));
        samples.push((
            "remediation_attempts".to_string(),
            attempts.saturating_sub(self.last_attempts) as f64,
        ));
        samples.push((
            "remediation_failures".to_string(),
            attempt_failures.saturating_sub(self.last_attempt_failures) as f64,
        ));
        self.last_checks = checks;
        self.last_check_failures = check_failures;
        self.last_attempts = attempts;
        self.last_attempt_failures = attempt_failures;

        for result in self.board.latest_all() {
            let labels = [("service", result.service_id.as_str())];
            samples.push((
                series_name("health_latency_ms", &labels),
                result.latency_ms,
            ));
            samples.push((
                series_name("health_up", &labels),
                if result.status.is_healthy() { 1.0 } else { 0.0 },
            ));
        }

        samples
    }

    /// Fold one sample into its series' active hourly window, sealing the
    /// previous window when the hour boundary is crossed.
    fn observe(&mut self, name: String, value: f64, now: DateTime<Utc>) {
        let window_start = truncate_to_window(now, HOURLY_SECONDS);
        let active = self
            .windows
            .entry(name.clone())
            .or_insert_with(|| ActiveWindow::new(name.clone(), window_start));

        if active.start != window_start {
            let sealed = std::mem::replace(active, ActiveWindow::new(name, window_start)).seal();
            self.flush_queue.push(sealed);
        }
        active.observe(value);
    }

    fn seal_all(&mut self) {
        for (_, active) in self.windows.drain() {
            if active.count() > 0 {
                self.flush_queue.push(active.seal());
            }
        }
    }

    /// Flush sealed hourly windows, then re-fold the daily window of each
    /// affected (series, day). On a storage error the queue is kept and the
    /// whole batch retried on the next tick.
    fn flush(&mut self) {
        if self.flush_queue.is_empty() {
            return;
        }

        if let Err(e) = self.store.upsert_windows(&self.flush_queue) {
            tracing::error!(
                pending = self.flush_queue.len(),
                "window flush failed, will retry: {}",
                e
            );
            self.enforce_queue_cap();
            return;
        }

        let days: HashSet<(String, DateTime<Utc>)> = self
            .flush_queue
            .iter()
            .map(|w| (w.name.clone(), truncate_to_window(w.start, DAILY_SECONDS)))
            .collect();
        self.flush_queue.clear();

        for (name, day) in days {
            if let Err(e) = self.fold_daily(&name, day) {
                tracing::error!(%name, %day, "daily fold failed: {}", e);
            }
        }
    }

    fn enforce_queue_cap(&mut self) {
        if self.flush_queue.len() > MAX_PENDING_WINDOWS {
            let dropped = self.flush_queue.len() - MAX_PENDING_WINDOWS;
            self.flush_queue.drain(..dropped);
            tracing::warn!(dropped, "pending window queue full, dropped oldest windows");
        }
    }

    fn fold_daily(&self, name: &str, day: DateTime<Utc>) -> Result<(), DbError> {
        let hourlies = self.store.get_windows(
            name,
            HOURLY_SECONDS,
            day,
            day + chrono::Duration::seconds(DAILY_SECONDS),
        )?;
        if hourlies.is_empty() {
            return Ok(());
        }
        let daily = MetricWindow::merge(name, day, DAILY_SECONDS, &hourlies);
        self.store.upsert_windows(std::slice::from_ref(&daily))
    }
}
