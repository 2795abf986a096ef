//! Alert engine.
//!
//! A single consumer loop evaluates the rule set against monitor results,
//! decision-engine events, and periodic snapshots of recent health history.
//! Alerts are deduplicated by `(rule, service)` with a per-rule cooldown;
//! re-firing inside the cooldown refreshes the alert without notifying
//! again. Critical alerts can additionally signal the decision engine to
//! heal immediately.

pub mod rules;
pub mod sink;

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use crate::events::{self, Event};
use crate::healing::{EngineCommand, Outcome};
use crate::monitor::{HealthCheckResult, StatusBoard};
use rules::{builtin_rules, Rule, RuleError, RuleExpr};
use sink::Notifier;

/// How often sampled rules (error rate, latency) are re-evaluated.
const EVAL_INTERVAL: Duration = Duration::from_secs(10);

/// Alert severity tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Error,
    Warning,
    Info,
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(Severity::Critical),
            "error" => Ok(Severity::Error),
            "warning" => Ok(Severity::Warning),
            "info" => Ok(Severity::Info),
            other => Err(format!("unknown severity {other:?}")),
        }
    }
}

/// Deduplication key: rule plus optional service.
pub type AlertKey = (String, Option<String>);

/// One alert, active until resolved and cleared.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub rule_id: String,
    pub service_id: Option<String>,
    pub severity: Severity,
    pub message: String,
    pub fired_at: DateTime<Utc>,
    pub last_notified_at: DateTime<Utc>,
    pub cooldown_seconds: u64,
    pub resolved: bool,
}

/// Shared view of active alerts, written only by the alert engine loop.
#[derive(Clone, Default)]
pub struct AlertStore {
    inner: Arc<RwLock<HashMap<AlertKey, Alert>>>,
}

impl AlertStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Active alerts, optionally filtered by severity, newest first.
    pub fn active(&self, severity: Option<Severity>) -> Vec<Alert> {
        let alerts = self.inner.read().unwrap();
        let mut list: Vec<_> = alerts
            .values()
            .filter(|a| severity.map_or(true, |s| a.severity == s))
            .cloned()
            .collect();
        list.sort_by(|a, b| b.fired_at.cmp(&a.fired_at));
        list
    }

    /// Drop resolved alerts; returns how many were cleared.
    pub fn clear_resolved(&self) -> usize {
        let mut alerts = self.inner.write().unwrap();
        let before = alerts.len();
        alerts.retain(|_, a| !a.resolved);
        before - alerts.len()
    }

    fn get(&self, key: &AlertKey) -> Option<Alert> {
        self.inner.read().unwrap().get(key).cloned()
    }
}

/// The alert engine. Owns rule evaluation state and the active-alert map.
pub struct AlertEngine {
    rules: Vec<Rule>,
    board: StatusBoard,
    store: AlertStore,
    /// When each (rule, service) condition started holding.
    pending: HashMap<AlertKey, DateTime<Utc>>,
    notifiers: Vec<Arc<dyn Notifier>>,
    heal_cmd_tx: mpsc::Sender<EngineCommand>,
    critical_escalates: bool,
}

impl AlertEngine {
    pub fn new(
        configured: &[crate::config::RuleConfig],
        board: StatusBoard,
        notifiers: Vec<Arc<dyn Notifier>>,
        heal_cmd_tx: mpsc::Sender<EngineCommand>,
        critical_escalates: bool,
    ) -> Result<Self, RuleError> {
        let mut rules = configured
            .iter()
            .map(Rule::from_config)
            .collect::<Result<Vec<_>, _>>()?;
        for builtin in builtin_rules() {
            if !rules.iter().any(|r| r.id == builtin.id) {
                rules.push(builtin);
            }
        }
        Ok(Self {
            rules,
            board,
            store: AlertStore::new(),
            pending: HashMap::new(),
            notifiers,
            heal_cmd_tx,
            critical_escalates,
        })
    }

    pub fn store(&self) -> AlertStore {
        self.store.clone()
    }

    /// The alert consumer loop.
    pub async fn run(
        mut self,
        mut health_rx: broadcast::Receiver<HealthCheckResult>,
        mut events_rx: mpsc::Receiver<Event>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        tracing::info!("alert engine started with {} rules", self.rules.len());
        let mut eval = tokio::time::interval(EVAL_INTERVAL);
        eval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                result = health_rx.recv() => match result {
                    Ok(r) => self.handle_result(&r).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("alert engine lagged, skipped {} results", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                Some(event) = events_rx.recv() => self.handle_event(&event).await,
                _ = eval.tick() => self.handle_tick().await,
                _ = shutdown_rx.recv() => break,
            }
        }
        tracing::info!("alert engine stopped");
    }

    async fn handle_result(&mut self, result: &HealthCheckResult) {
        let now = Utc::now();
        let rules = self.rules.clone();
        for rule in &rules {
            let value = match rule.expr {
                RuleExpr::StatusUnhealthy => {
                    if result.status.is_healthy() {
                        0.0
                    } else {
                        1.0
                    }
                }
                RuleExpr::ConsecutiveFailures => result.consecutive_failures as f64,
                _ => continue,
            };
            self.evaluate(rule, Some(&result.service_id), value, now)
                .await;
        }
    }

    /// Periodic evaluation of rate/latency conditions from recent history.
    async fn handle_tick(&mut self) {
        let now = Utc::now();
        let rules = self.rules.clone();
        for service_id in self.board.service_ids() {
            for rule in &rules {
                let value = match rule.expr {
                    RuleExpr::ErrorRate => self.board.error_rate(&service_id),
                    RuleExpr::LatencyP95 => self.board.latency_p95(&service_id),
                    _ => continue,
                };
                if let Some(value) = value {
                    self.evaluate(rule, Some(&service_id), value, now).await;
                }
            }
        }
    }

    async fn handle_event(&mut self, event: &Event) {
        let rules = self.rules.clone();
        match event {
            Event::RemediationOutcome {
                service_id,
                strategy,
                attempt,
                outcome: Outcome::Failed,
            } => {
                for rule in rules.iter().filter(|r| r.expr == RuleExpr::HealingFailed) {
                    let message = format!(
                        "remediation {strategy} (attempt {attempt}) failed for {service_id}"
                    );
                    self.fire(rule, Some(service_id.clone()), message).await;
                }
            }
            Event::RemediationOutcome {
                service_id,
                outcome: Outcome::Success,
                ..
            } => {
                for rule in rules.iter().filter(|r| r.expr == RuleExpr::HealingFailed) {
                    self.resolve(&(rule.id.clone(), Some(service_id.clone())))
                        .await;
                }
            }
            Event::Escalated {
                service_id,
                attempts,
            } => {
                for rule in rules.iter().filter(|r| r.expr == RuleExpr::Escalated) {
                    let message = format!(
                        "{service_id} exhausted {attempts} remediation attempts; manual intervention required"
                    );
                    self.fire(rule, Some(service_id.clone()), message).await;
                }
            }
            Event::EscalationReset { service_id } => {
                for rule in rules.iter().filter(|r| r.expr == RuleExpr::Escalated) {
                    self.resolve(&(rule.id.clone(), Some(service_id.clone())))
                        .await;
                }
            }
            _ => {}
        }
    }

    /// Track a sampled condition; fire once it has held for the rule's full
    /// duration, resolve when it clears.
    async fn evaluate(
        &mut self,
        rule: &Rule,
        service_id: Option<&str>,
        value: f64,
        now: DateTime<Utc>,
    ) {
        if !rule.expr.is_sampled() {
            return;
        }
        let key: AlertKey = (rule.id.clone(), service_id.map(str::to_string));
        if value > rule.threshold {
            let since = *self.pending.entry(key.clone()).or_insert(now);
            let held = (now - since).to_std().unwrap_or_default();
            if held >= rule.duration {
                let message = format!(
                    "{}: {:?} = {:.2} over threshold {:.2}",
                    service_id.unwrap_or("global"),
                    rule.expr,
                    value,
                    rule.threshold
                );
                self.fire(rule, key.1.clone(), message).await;
            }
        } else {
            self.pending.remove(&key);
            self.resolve(&key).await;
        }
    }

    async fn fire(&mut self, rule: &Rule, service_id: Option<String>, message: String) {
        let now = Utc::now();
        let key: AlertKey = (rule.id.clone(), service_id.clone());

        let should_notify = {
            let mut alerts = self.store.inner.write().unwrap();
            match alerts.get_mut(&key) {
                Some(existing) => {
                    let cooldown = ChronoDuration::seconds(existing.cooldown_seconds as i64);
                    if now < existing.last_notified_at + cooldown {
                        // Deduplicated: refresh without a new notification.
                        existing.last_notified_at = now;
                        existing.resolved = false;
                        false
                    } else {
                        existing.fired_at = now;
                        existing.last_notified_at = now;
                        existing.message = message;
                        existing.resolved = false;
                        true
                    }
                }
                None => {
                    alerts.insert(
                        key.clone(),
                        Alert {
                            rule_id: rule.id.clone(),
                            service_id: service_id.clone(),
                            severity: rule.severity,
                            message,
                            fired_at: now,
                            last_notified_at: now,
                            cooldown_seconds: rule.cooldown_seconds,
                            resolved: false,
                        },
                    );
                    true
                }
            }
        };

        if !should_notify {
            return;
        }

        let Some(alert) = self.store.get(&key) else {
            return;
        };
        for notifier in &self.notifiers {
            notifier.notify(&alert).await;
        }
        events::emit(
            "alerts",
            &Event::AlertFired {
                rule_id: alert.rule_id.clone(),
                service_id: alert.service_id.clone(),
                severity: alert.severity,
                message: alert.message.clone(),
            },
        );

        if rule.severity == Severity::Critical && self.critical_escalates {
            if let Some(service_id) = service_id {
                if let Err(e) = self
                    .heal_cmd_tx
                    .send(EngineCommand::ForceHeal { service_id })
                    .await
                {
                    tracing::error!("healing command channel closed: {}", e);
                }
            }
        }
    }

    async fn resolve(&mut self, key: &AlertKey) {
        let cleared = {
            let mut alerts = self.store.inner.write().unwrap();
            match alerts.get_mut(key) {
                Some(alert) if !alert.resolved => {
                    alert.resolved = true;
                    true
                }
                _ => false,
            }
        };
        if cleared {
            events::emit(
                "alerts",
                &Event::AlertCleared {
                    rule_id: key.0.clone(),
                    service_id: key.1.clone(),
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuleConfig;
    use crate::healing::Strategy;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct TestNotifier {
        delivered: Mutex<Vec<Alert>>,
    }

    impl TestNotifier {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                delivered: Mutex::new(Vec::new()),
            })
        }

        fn count(&self) -> usize {
            self.delivered.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Notifier for TestNotifier {
        fn name(&self) -> &str {
            "test"
        }

        async fn notify(&self, alert: &Alert) {
            self.delivered.lock().unwrap().push(alert.clone());
        }
    }

    fn rule_config(id: &str, expr: &str, threshold: f64, duration: u64) -> RuleConfig {
        RuleConfig {
            id: id.to_string(),
            expr: expr.to_string(),
            threshold,
            duration_seconds: duration,
            severity: Severity::Warning,
            cooldown_seconds: 300,
        }
    }

    fn engine(
        configs: &[RuleConfig],
    ) -> (AlertEngine, Arc<TestNotifier>, mpsc::Receiver<EngineCommand>) {
        let notifier = TestNotifier::new();
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let engine = AlertEngine::new(
            configs,
            StatusBoard::new(),
            vec![notifier.clone()],
            cmd_tx,
            true,
        )
        .unwrap();
        (engine, notifier, cmd_rx)
    }

    fn rule(engine: &AlertEngine, id: &str) -> Rule {
        engine.rules.iter().find(|r| r.id == id).unwrap().clone()
    }

    #[tokio::test]
    async fn test_fires_only_after_full_duration() {
        let configs = [rule_config("err", "error_rate", 5.0, 300)];
        let (mut engine, notifier, _cmd) = engine(&configs);
        let r = rule(&engine, "err");
        let now = Utc::now();

        // Condition starts holding: no fire yet.
        engine.evaluate(&r, Some("svc-a"), 6.0, now).await;
        assert_eq!(notifier.count(), 0);

        // 250 seconds in: still held, still under duration.
        engine
            .evaluate(&r, Some("svc-a"), 6.0, now + ChronoDuration::seconds(250))
            .await;
        assert_eq!(notifier.count(), 0);

        // Clears before the duration elapses: never fires.
        engine
            .evaluate(&r, Some("svc-a"), 2.0, now + ChronoDuration::seconds(260))
            .await;
        engine
            .evaluate(&r, Some("svc-a"), 6.0, now + ChronoDuration::seconds(600))
            .await;
        assert_eq!(notifier.count(), 0);

        // Held for the full duration from the re-start: fires.
        engine
            .evaluate(&r, Some("svc-a"), 6.0, now + ChronoDuration::seconds(901))
            .await;
        assert_eq!(notifier.count(), 1);
    }

    #[tokio::test]
    async fn test_dedup_within_cooldown() {
        let configs = [rule_config("cf", "consecutive_failures", 2.0, 0)];
        let (mut engine, notifier, _cmd) = engine(&configs);
        let r = rule(&engine, "cf");
        let now = Utc::now();

        engine.evaluate(&r, Some("svc-a"), 3.0, now).await;
        assert_eq!(notifier.count(), 1);
        let first_notified = engine
            .store
            .get(&("cf".to_string(), Some("svc-a".to_string())))
            .unwrap()
            .last_notified_at;

        // Re-fires inside the cooldown: refreshed, not re-notified.
        engine.evaluate(&r, Some("svc-a"), 4.0, now).await;
        assert_eq!(notifier.count(), 1);
        let alert = engine
            .store
            .get(&("cf".to_string(), Some("svc-a".to_string())))
            .unwrap();
        assert!(alert.last_notified_at >= first_notified);
    }

    #[tokio::test]
    async fn test_renotifies_after_cooldown() {
        let configs = [rule_config("cf", "consecutive_failures", 2.0, 0)];
        let (mut engine, notifier, _cmd) = engine(&configs);
        let r = rule(&engine, "cf");

        engine.evaluate(&r, Some("svc-a"), 3.0, Utc::now()).await;
        assert_eq!(notifier.count(), 1);

        // Age the stored notification beyond the cooldown.
        {
            let mut alerts = engine.store.inner.write().unwrap();
            let alert = alerts
                .get_mut(&("cf".to_string(), Some("svc-a".to_string())))
                .unwrap();
            alert.last_notified_at = Utc::now() - ChronoDuration::seconds(301);
        }
        engine.evaluate(&r, Some("svc-a"), 3.0, Utc::now()).await;
        assert_eq!(notifier.count(), 2);
    }

    #[tokio::test]
    async fn test_escalation_event_fires_critical_once() {
        let (mut engine, notifier, mut cmd_rx) = engine(&[]);

        let event = Event::Escalated {
            service_id: "svc-b".to_string(),
            attempts: 5,
        };
        engine.handle_event(&event).await;
        engine.handle_event(&event).await;

        assert_eq!(notifier.count(), 1);
        let alert = &notifier.delivered.lock().unwrap()[0];
        assert_eq!(alert.rule_id, "escalation");
        assert_eq!(alert.severity, Severity::Critical);

        // Critical alerts signal the decision engine.
        assert!(matches!(
            cmd_rx.try_recv(),
            Ok(EngineCommand::ForceHeal { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_remediation_alerts_and_resolves() {
        let (mut engine, notifier, _cmd) = engine(&[]);

        engine
            .handle_event(&Event::RemediationOutcome {
                service_id: "svc-a".to_string(),
                strategy: Strategy::ServiceRestart,
                attempt: 1,
                outcome: Outcome::Failed,
            })
            .await;
        assert_eq!(notifier.count(), 1);

        engine
            .handle_event(&Event::RemediationOutcome {
                service_id: "svc-a".to_string(),
                strategy: Strategy::GracefulRestart,
                attempt: 2,
                outcome: Outcome::Success,
            })
            .await;
        let alert = engine
            .store
            .get(&("healing-failed".to_string(), Some("svc-a".to_string())))
            .unwrap();
        assert!(alert.resolved);

        assert_eq!(engine.store.clear_resolved(), 1);
        assert!(engine.store.active(None).is_empty());
    }

    #[tokio::test]
    async fn test_severity_filter() {
        let (mut engine, _notifier, _cmd) = engine(&[]);
        engine
            .handle_event(&Event::Escalated {
                service_id: "svc-a".to_string(),
                attempts: 5,
            })
            .await;
        engine
            .handle_event(&Event::RemediationOutcome {
                service_id: "svc-b".to_string(),
                strategy: Strategy::ServiceRestart,
                attempt: 1,
                outcome: Outcome::Failed,
            })
            .await;

        assert_eq!(engine.store.active(None).len(), 2);
        assert_eq!(engine.store.active(Some(Severity::Critical)).len(), 1);
        assert_eq!(engine.store.active(Some(Severity::Info)).len(), 0);
    }

    #[test]
    fn test_severity_parse() {
        assert_eq!("critical".parse::<Severity>().unwrap(), Severity::Critical);
        assert!("loud".parse::<Severity>().is_err());
    }
}
