//! Self-healing decision engine.
//!
//! A single consumer loop reads health results off the monitor broadcast and
//! drives one state machine per service:
//!
//! `Stable -> Degrading -> Healing -> Verifying -> Stable | Escalated`
//!
//! Entering Healing requires the failure threshold, no active cooldown, and
//! headroom under the restart ceiling. Every executed action starts a
//! cooldown during which no new attempt is started; this is the invariant
//! that prevents restart storms. Escalated is a latch: automation halts for
//! that service until an operator resets it.

pub mod strategy;

pub use strategy::{select_strategy, ErrorKind, SelectionContext, Strategy};

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::config::{HealingConfig, ServiceTarget};
use crate::events::{self, Event};
use crate::monitor::HealthCheckResult;

/// Outcome of a remediation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Pending,
    Success,
    Failed,
}

/// Phase of a service's healing state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServicePhase {
    Stable,
    Degrading,
    Healing,
    Verifying,
    Escalated,
}

/// One remediation attempt record.
#[derive(Debug, Clone, Serialize)]
pub struct RemediationAttempt {
    pub service_id: String,
    pub strategy: Strategy,
    pub attempt_number: u32,
    pub started_at: DateTime<Utc>,
    pub outcome: Outcome,
    pub cooldown_until: DateTime<Utc>,
}

#[derive(Error, Debug)]
pub enum HealError {
    #[error("remediation action failed: {0}")]
    ExecutionFailed(String),
}

/// Executes the selected strategy against the outside world.
///
/// The real restart/scale plumbing is an external collaborator; the default
/// executor records the requested action. Tests inject scripted executors.
#[async_trait]
pub trait RemediationExecutor: Send + Sync {
    async fn execute(
        &self,
        target: &ServiceTarget,
        strategy: Strategy,
        attempt: u32,
    ) -> Result<(), HealError>;
}

/// Default executor: logs the requested action and reports success.
pub struct LogExecutor;

#[async_trait]
impl RemediationExecutor for LogExecutor {
    async fn execute(
        &self,
        target: &ServiceTarget,
        strategy: Strategy,
        attempt: u32,
    ) -> Result<(), HealError> {
        tracing::info!(
            service = %target.id,
            %strategy,
            attempt,
            "executing remediation action"
        );
        Ok(())
    }
}

/// Commands accepted by the engine from the API and the alert engine.
#[derive(Debug, Clone)]
pub enum EngineCommand {
    /// Operator reset of an escalated service.
    Reset { service_id: String },
    /// A Critical alert asked for immediate healing, bypassing the
    /// consecutive-failures threshold.
    ForceHeal { service_id: String },
}

/// Engine-wide counters sampled by the metrics collector.
#[derive(Debug, Default)]
pub struct HealingStats {
    pub attempts_total: AtomicU64,
    pub failures_total: AtomicU64,
}

#[derive(Debug)]
struct ServiceState {
    phase: ServicePhase,
    /// Number of attempts executed in the current degradation episode.
    attempt_number: u32,
    cooldown_until: Option<DateTime<Utc>>,
    /// Failures seen alongside latency near the timeout budget.
    high_latency: bool,
    last_attempt: Option<RemediationAttempt>,
}

impl Default for ServiceState {
    fn default() -> Self {
        Self {
            phase: ServicePhase::Stable,
            attempt_number: 0,
            cooldown_until: None,
            high_latency: false,
            last_attempt: None,
        }
    }
}

impl ServiceState {
    fn cooldown_active(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }
}

/// The self-healing decision engine. Owns all per-service healing state;
/// state transitions are serialized through its single consumer loop.
pub struct Engine {
    targets: HashMap<String, ServiceTarget>,
    config: HealingConfig,
    executor: Arc<dyn RemediationExecutor>,
    states: HashMap<String, ServiceState>,
    event_tx: mpsc::Sender<Event>,
    stats: Arc<HealingStats>,
}

impl Engine {
    pub fn new(
        targets: Vec<ServiceTarget>,
        config: HealingConfig,
        executor: Arc<dyn RemediationExecutor>,
        event_tx: mpsc::Sender<Event>,
    ) -> Self {
        Self {
            targets: targets.into_iter().map(|t| (t.id.clone(), t)).collect(),
            config,
            executor,
            states: HashMap::new(),
            event_tx,
            stats: Arc::new(HealingStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<HealingStats> {
        self.stats.clone()
    }

    /// The engine consumer loop. Consumes the monitor broadcast and the
    /// command channel until shutdown.
    pub async fn run(
        mut self,
        mut results_rx: broadcast::Receiver<HealthCheckResult>,
        mut cmd_rx: mpsc::Receiver<EngineCommand>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        tracing::info!("healing engine started");
        loop {
            tokio::select! {
                result = results_rx.recv() => match result {
                    Ok(r) => self.handle_result(&r).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        // Only the latest status matters; dropped results are
                        // superseded by the ones we will receive.
                        tracing::warn!("healing engine lagged, skipped {} results", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                Some(cmd) = cmd_rx.recv() => self.handle_command(cmd).await,
                _ = shutdown_rx.recv() => break,
            }
        }
        tracing::info!("healing engine stopped");
    }

    async fn handle_result(&mut self, result: &HealthCheckResult) {
        let Some(target) = self.targets.get(&result.service_id).cloned() else {
            return;
        };
        let now = Utc::now();
        let mut pending_events: Vec<Event> = Vec::new();
        let mut next_attempt: Option<ErrorKind> = None;

        {
            let state = self.states.entry(result.service_id.clone()).or_default();

            if result.status.is_healthy() {
                state.high_latency = false;
                match state.phase {
                    ServicePhase::Escalated => {}
                    ServicePhase::Verifying if !state.cooldown_active(now) => {
                        if let Some(attempt) = state.last_attempt.as_mut() {
                            if attempt.outcome == Outcome::Pending {
                                attempt.outcome = Outcome::Success;
                                pending_events.push(Event::RemediationOutcome {
                                    service_id: result.service_id.clone(),
                                    strategy: attempt.strategy,
                                    attempt: attempt.attempt_number,
                                    outcome: Outcome::Success,
                                });
                            }
                        }
                        state.phase = ServicePhase::Stable;
                        state.attempt_number = 0;
                        state.cooldown_until = None;
                    }
                    ServicePhase::Verifying => {
                        // Healthy inside the cooldown window; wait it out.
                    }
                    _ => state.phase = ServicePhase::Stable,
                }
            } else {
                if result.latency_ms >= target.timeout_ms as f64 * 0.8 {
                    state.high_latency = true;
                }
                match state.phase {
                    ServicePhase::Escalated => {}
                    _ if state.cooldown_active(now) => {
                        // Key invariant: nothing starts during cooldown.
                    }
                    ServicePhase::Verifying => {
                        // Post-cooldown failure resolves the pending attempt.
                        if let Some(attempt) = state.last_attempt.as_mut() {
                            if attempt.outcome == Outcome::Pending {
                                attempt.outcome = Outcome::Failed;
                                pending_events.push(Event::RemediationOutcome {
                                    service_id: result.service_id.clone(),
                                    strategy: attempt.strategy,
                                    attempt: attempt.attempt_number,
                                    outcome: Outcome::Failed,
                                });
                            }
                        }
                        if state.attempt_number >= self.config.max_restarts {
                            state.phase = ServicePhase::Escalated;
                            pending_events.push(Event::Escalated {
                                service_id: result.service_id.clone(),
                                attempts: state.attempt_number,
                            });
                        } else {
                            next_attempt = Some(ErrorKind::from(result.status));
                        }
                    }
                    _ => {
                        if result.consecutive_failures >= target.max_retries {
                            if state.attempt_number >= self.config.max_restarts {
                                state.phase = ServicePhase::Escalated;
                                pending_events.push(Event::Escalated {
                                    service_id: result.service_id.clone(),
                                    attempts: state.attempt_number,
                                });
                            } else {
                                next_attempt = Some(ErrorKind::from(result.status));
                            }
                        } else {
                            state.phase = ServicePhase::Degrading;
                        }
                    }
                }
            }
        }

        for event in pending_events {
            self.emit(event).await;
        }
        if let Some(error_kind) = next_attempt {
            self.start_attempt(&target, error_kind).await;
        }
    }

    async fn handle_command(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::Reset { service_id } => {
                if self.states.remove(&service_id).is_some() {
                    tracing::info!(service = %service_id, "healing state reset by operator");
                    self.emit(Event::EscalationReset { service_id }).await;
                }
            }
            EngineCommand::ForceHeal { service_id } => {
                let Some(target) = self.targets.get(&service_id).cloned() else {
                    return;
                };
                let now = Utc::now();
                let state = self.states.entry(service_id.clone()).or_default();
                // Verifying still has a Pending attempt awaiting its
                // post-cooldown health check; the normal result path owns
                // that resolution.
                if state.phase == ServicePhase::Escalated
                    || state.phase == ServicePhase::Healing
                    || state.phase == ServicePhase::Verifying
                    || state.cooldown_active(now)
                    || state.attempt_number >= self.config.max_restarts
                {
                    return;
                }
                tracing::warn!(service = %service_id, "critical alert forced immediate healing");
                self.start_attempt(&target, ErrorKind::Http).await;
            }
        }
    }

    /// Execute the next strategy for a target and enter Verifying under a
    /// fresh cooldown. An execution error advances the attempt counter
    /// immediately instead of waiting for the next failed check.
    async fn start_attempt(&mut self, target: &ServiceTarget, error_kind: ErrorKind) {
        let now = Utc::now();
        let cooldown_until = now + ChronoDuration::seconds(self.config.cooldown_seconds as i64);

        let (attempt, strategy) = {
            let state = self.states.entry(target.id.clone()).or_default();
            let attempt = state.attempt_number + 1;
            let strategy = select_strategy(&SelectionContext {
                criticality: target.criticality,
                error_kind,
                attempt,
                max_restarts: self.config.max_restarts,
                high_latency: state.high_latency,
                has_prior_version: target.last_known_good_version.is_some(),
            });
            state.phase = ServicePhase::Healing;
            state.attempt_number = attempt;
            state.last_attempt = Some(RemediationAttempt {
                service_id: target.id.clone(),
                strategy,
                attempt_number: attempt,
                started_at: now,
                outcome: Outcome::Pending,
                cooldown_until,
            });
            (attempt, strategy)
        };

        self.stats
            .attempts_total
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.emit(Event::RemediationStarted {
            service_id: target.id.clone(),
            strategy,
            attempt,
        })
        .await;

        let outcome = self.executor.execute(target, strategy, attempt).await;

        let mut escalated = false;
        {
            let state = self.states.entry(target.id.clone()).or_default();
            state.cooldown_until = Some(cooldown_until);
            match outcome {
                Ok(()) => {
                    // Outcome stays Pending until the post-cooldown health
                    // check verifies it.
                    state.phase = ServicePhase::Verifying;
                }
                Err(ref e) => {
                    tracing::error!(service = %target.id, %strategy, "remediation failed: {}", e);
                    if let Some(record) = state.last_attempt.as_mut() {
                        record.outcome = Outcome::Failed;
                    }
                    if attempt >= self.config.max_restarts {
                        state.phase = ServicePhase::Escalated;
                        escalated = true;
                    } else {
                        state.phase = ServicePhase::Verifying;
                    }
                }
            }
        }

        if outcome.is_err() {
            self.stats
                .failures_total
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            self.emit(Event::RemediationOutcome {
                service_id: target.id.clone(),
                strategy,
                attempt,
                outcome: Outcome::Failed,
            })
            .await;
            if escalated {
                self.emit(Event::Escalated {
                    service_id: target.id.clone(),
                    attempts: attempt,
                })
                .await;
            }
        }
    }

    async fn emit(&self, event: Event) {
        events::emit("healing", &event);
        // Remediation and escalation events must never be dropped.
        if let Err(e) = self.event_tx.send(event).await {
            tracing::error!("event channel closed: {}", e);
        }
    }

    #[cfg(test)]
    fn phase(&self, service_id: &str) -> Option<ServicePhase> {
        self.states.get(service_id).map(|s| s.phase)
    }

    #[cfg(test)]
    fn set_cooldown(&mut self, service_id: &str, until: Option<DateTime<Utc>>) {
        if let Some(state) = self.states.get_mut(service_id) {
            state.cooldown_until = until;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Criticality;
    use crate::monitor::HealthStatus;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;

    struct ScriptedExecutor {
        calls: Mutex<Vec<(String, Strategy, u32)>>,
        fail: std::sync::atomic::AtomicBool,
    }

    impl ScriptedExecutor {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                fail: std::sync::atomic::AtomicBool::new(false),
            })
        }

        fn calls(&self) -> Vec<(String, Strategy, u32)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RemediationExecutor for ScriptedExecutor {
        async fn execute(
            &self,
            target: &ServiceTarget,
            strategy: Strategy,
            attempt: u32,
        ) -> Result<(), HealError> {
            self.calls
                .lock()
                .unwrap()
                .push((target.id.clone(), strategy, attempt));
            if self.fail.load(Ordering::SeqCst) {
                Err(HealError::ExecutionFailed("restart command failed".into()))
            } else {
                Ok(())
            }
        }
    }

    fn target(id: &str) -> ServiceTarget {
        ServiceTarget {
            id: id.to_string(),
            health_url: format!("http://localhost/{id}"),
            check_interval_ms: 1000,
            timeout_ms: 2000,
            max_retries: 3,
            criticality: Criticality::Low,
            last_known_good_version: None,
        }
    }

    fn failing(service: &str, failures: u32) -> HealthCheckResult {
        HealthCheckResult {
            service_id: service.to_string(),
            timestamp: Utc::now(),
            status: HealthStatus::Unhealthy,
            latency_ms: 10.0,
            consecutive_failures: failures,
            last_error: Some("503".to_string()),
        }
    }

    fn healthy(service: &str) -> HealthCheckResult {
        HealthCheckResult {
            service_id: service.to_string(),
            timestamp: Utc::now(),
            status: HealthStatus::Healthy,
            latency_ms: 10.0,
            consecutive_failures: 0,
            last_error: None,
        }
    }

    fn engine(
        executor: Arc<ScriptedExecutor>,
        max_restarts: u32,
    ) -> (Engine, mpsc::Receiver<Event>) {
        let (event_tx, event_rx) = mpsc::channel(64);
        let config = HealingConfig {
            max_restarts,
            cooldown_seconds: 60,
            critical_escalates: true,
        };
        let engine = Engine::new(vec![target("svc-a")], config, executor, event_tx);
        (engine, event_rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Event>) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        events
    }

    #[tokio::test]
    async fn test_threshold_triggers_first_restart() {
        let executor = ScriptedExecutor::new();
        let (mut engine, mut rx) = engine(executor.clone(), 5);

        engine.handle_result(&failing("svc-a", 1)).await;
        engine.handle_result(&failing("svc-a", 2)).await;
        assert_eq!(engine.phase("svc-a"), Some(ServicePhase::Degrading));
        assert!(executor.calls().is_empty());

        engine.handle_result(&failing("svc-a", 3)).await;
        assert_eq!(engine.phase("svc-a"), Some(ServicePhase::Verifying));
        assert_eq!(
            executor.calls(),
            vec![("svc-a".to_string(), Strategy::ServiceRestart, 1)]
        );

        let events = drain(&mut rx);
        assert!(matches!(
            events[0],
            Event::RemediationStarted {
                strategy: Strategy::ServiceRestart,
                attempt: 1,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_cooldown_blocks_new_attempts() {
        let executor = ScriptedExecutor::new();
        let (mut engine, _rx) = engine(executor.clone(), 5);

        engine.handle_result(&failing("svc-a", 3)).await;
        assert_eq!(executor.calls().len(), 1);

        // Continuous failures inside the cooldown start nothing new.
        for n in 4..10 {
            engine.handle_result(&failing("svc-a", n)).await;
        }
        assert_eq!(executor.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_healthy_verification_resets() {
        let executor = ScriptedExecutor::new();
        let (mut engine, mut rx) = engine(executor.clone(), 5);

        engine.handle_result(&failing("svc-a", 3)).await;
        drain(&mut rx);

        // Cooldown elapsed, next result is healthy.
        engine.set_cooldown("svc-a", Some(Utc::now() - ChronoDuration::seconds(1)));
        engine.handle_result(&healthy("svc-a")).await;

        assert_eq!(engine.phase("svc-a"), Some(ServicePhase::Stable));
        let events = drain(&mut rx);
        assert!(matches!(
            events[0],
            Event::RemediationOutcome {
                outcome: Outcome::Success,
                attempt: 1,
                ..
            }
        ));

        // A fresh degradation starts from attempt 1 again.
        engine.handle_result(&failing("svc-a", 3)).await;
        assert_eq!(executor.calls().last().unwrap().2, 1);
    }

    #[tokio::test]
    async fn test_verification_failure_escalates_strategy() {
        let executor = ScriptedExecutor::new();
        let (mut engine, _rx) = engine(executor.clone(), 5);

        engine.handle_result(&failing("svc-a", 3)).await;
        engine.set_cooldown("svc-a", Some(Utc::now() - ChronoDuration::seconds(1)));
        engine.handle_result(&failing("svc-a", 4)).await;

        let calls = executor.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].1, Strategy::GracefulRestart);
        assert_eq!(calls[1].2, 2);
    }

    #[tokio::test]
    async fn test_escalation_after_max_restarts() {
        let executor = ScriptedExecutor::new();
        let (mut engine, mut rx) = engine(executor.clone(), 2);

        engine.handle_result(&failing("svc-a", 3)).await;
        engine.set_cooldown("svc-a", Some(Utc::now() - ChronoDuration::seconds(1)));
        engine.handle_result(&failing("svc-a", 4)).await;
        engine.set_cooldown("svc-a", Some(Utc::now() - ChronoDuration::seconds(1)));
        engine.handle_result(&failing("svc-a", 5)).await;

        assert_eq!(engine.phase("svc-a"), Some(ServicePhase::Escalated));
        assert_eq!(executor.calls().len(), 2);

        let events = drain(&mut rx);
        let escalations: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, Event::Escalated { .. }))
            .collect();
        assert_eq!(escalations.len(), 1);

        // Escalated halts automation entirely.
        engine.set_cooldown("svc-a", Some(Utc::now() - ChronoDuration::seconds(1)));
        engine.handle_result(&failing("svc-a", 6)).await;
        assert_eq!(executor.calls().len(), 2);
        assert_eq!(engine.phase("svc-a"), Some(ServicePhase::Escalated));
    }

    #[tokio::test]
    async fn test_executor_failure_advances_attempt() {
        let executor = ScriptedExecutor::new();
        executor.fail.store(true, Ordering::SeqCst);
        let (mut engine, mut rx) = engine(executor.clone(), 5);

        engine.handle_result(&failing("svc-a", 3)).await;
        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            Event::RemediationOutcome {
                outcome: Outcome::Failed,
                attempt: 1,
                ..
            }
        )));

        // Next post-cooldown failure runs attempt 2 without waiting for a
        // verification cycle on attempt 1.
        engine.set_cooldown("svc-a", Some(Utc::now() - ChronoDuration::seconds(1)));
        engine.handle_result(&failing("svc-a", 4)).await;
        assert_eq!(executor.calls().last().unwrap().2, 2);
    }

    #[tokio::test]
    async fn test_reset_command_clears_escalation() {
        let executor = ScriptedExecutor::new();
        let (mut engine, mut rx) = engine(executor.clone(), 1);

        engine.handle_result(&failing("svc-a", 3)).await;
        engine.set_cooldown("svc-a", Some(Utc::now() - ChronoDuration::seconds(1)));
        engine.handle_result(&failing("svc-a", 4)).await;
        assert_eq!(engine.phase("svc-a"), Some(ServicePhase::Escalated));
        drain(&mut rx);

        engine
            .handle_command(EngineCommand::Reset {
                service_id: "svc-a".to_string(),
            })
            .await;
        assert_eq!(engine.phase("svc-a"), None);
        assert!(matches!(
            drain(&mut rx)[0],
            Event::EscalationReset { .. }
        ));

        // Automation resumes from a clean slate.
        engine.handle_result(&failing("svc-a", 5)).await;
        assert_eq!(executor.calls().last().unwrap().2, 1);
    }

    #[tokio::test]
    async fn test_force_heal_bypasses_threshold() {
        let executor = ScriptedExecutor::new();
        let (mut engine, _rx) = engine(executor.clone(), 5);

        // Only one failure so far, below the threshold of 3.
        engine.handle_result(&failing("svc-a", 1)).await;
        assert!(executor.calls().is_empty());

        engine
            .handle_command(EngineCommand::ForceHeal {
                service_id: "svc-a".to_string(),
            })
            .await;
        assert_eq!(executor.calls().len(), 1);

        // But not during a cooldown.
        engine
            .handle_command(EngineCommand::ForceHeal {
                service_id: "svc-a".to_string(),
            })
            .await;
        assert_eq!(executor.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_force_heal_defers_to_pending_verification() {
        let executor = ScriptedExecutor::new();
        let (mut engine, mut rx) = engine(executor.clone(), 5);

        engine.handle_result(&failing("svc-a", 3)).await;
        assert_eq!(engine.phase("svc-a"), Some(ServicePhase::Verifying));
        drain(&mut rx);

        // Even past the cooldown, a force heal must not replace the attempt
        // still awaiting verification.
        engine.set_cooldown("svc-a", Some(Utc::now() - ChronoDuration::seconds(1)));
        engine
            .handle_command(EngineCommand::ForceHeal {
                service_id: "svc-a".to_string(),
            })
            .await;
        assert_eq!(executor.calls().len(), 1);
        assert!(drain(&mut rx).is_empty());

        // The verification result still resolves attempt 1.
        engine.handle_result(&healthy("svc-a")).await;
        assert!(matches!(
            drain(&mut rx)[0],
            Event::RemediationOutcome {
                outcome: Outcome::Success,
                attempt: 1,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_transport_failures_check_dependencies() {
        let executor = ScriptedExecutor::new();
        let (mut engine, _rx) = engine(executor.clone(), 5);

        let mut result = failing("svc-a", 3);
        result.status = HealthStatus::Error;
        engine.handle_result(&result).await;

        assert_eq!(executor.calls()[0].1, Strategy::DependencyCheck);
    }
}
