//! Alert rule expressions.
//!
//! Rule conditions form a closed set, parsed from the config's `expr`
//! strings. A rule fires only after its condition holds continuously for the
//! configured duration; single-sample spikes are ignored by design.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use super::Severity;
use crate::config::RuleConfig;

#[derive(Error, Debug)]
pub enum RuleError {
    #[error("unknown rule expression {0:?}")]
    UnknownExpr(String),
}

/// The closed set of rule conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleExpr {
    /// Latest health status for a service is not Healthy.
    StatusUnhealthy,
    /// Consecutive failure count for a service exceeds the threshold.
    ConsecutiveFailures,
    /// Failure percentage over recent checks exceeds the threshold.
    ErrorRate,
    /// p95 latency (ms) over recent checks exceeds the threshold.
    LatencyP95,
    /// A remediation attempt reported a Failed outcome.
    HealingFailed,
    /// A service exhausted its restart ceiling.
    Escalated,
}

impl RuleExpr {
    /// Whether the condition is derived from health/metric samples (and so
    /// participates in hold-for-duration tracking) rather than from a
    /// discrete engine event.
    pub fn is_sampled(self) -> bool {
        !matches!(self, RuleExpr::HealingFailed | RuleExpr::Escalated)
    }
}

impl FromStr for RuleExpr {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "status_unhealthy" => Ok(RuleExpr::StatusUnhealthy),
            "consecutive_failures" => Ok(RuleExpr::ConsecutiveFailures),
            "error_rate" => Ok(RuleExpr::ErrorRate),
            "latency_p95" => Ok(RuleExpr::LatencyP95),
            "healing_failed" => Ok(RuleExpr::HealingFailed),
            "escalated" => Ok(RuleExpr::Escalated),
            other => Err(RuleError::UnknownExpr(other.to_string())),
        }
    }
}

/// A compiled alert rule.
#[derive(Debug, Clone)]
pub struct Rule {
    pub id: String,
    pub expr: RuleExpr,
    pub threshold: f64,
    pub duration: Duration,
    pub severity: Severity,
    pub cooldown_seconds: u64,
}

impl Rule {
    pub fn from_config(config: &RuleConfig) -> Result<Self, RuleError> {
        Ok(Self {
            id: config.id.clone(),
            expr: config.expr.parse()?,
            threshold: config.threshold,
            duration: Duration::from_secs(config.duration_seconds),
            severity: config.severity,
            cooldown_seconds: config.cooldown_seconds,
        })
    }
}

/// Rules that exist regardless of configuration: escalations and failed
/// remediations always alert.
pub fn builtin_rules() -> Vec<Rule> {
    vec![
        Rule {
            id: "escalation".to_string(),
            expr: RuleExpr::Escalated,
            threshold: 0.0,
            duration: Duration::ZERO,
            severity: Severity::Critical,
            cooldown_seconds: 3600,
        },
        Rule {
            id: "healing-failed".to_string(),
            expr: RuleExpr::HealingFailed,
            threshold: 0.0,
            duration: Duration::ZERO,
            severity: Severity::Error,
            cooldown_seconds: 600,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_exprs() {
        assert_eq!(
            "error_rate".parse::<RuleExpr>().unwrap(),
            RuleExpr::ErrorRate
        );
        assert_eq!(
            "status_unhealthy".parse::<RuleExpr>().unwrap(),
            RuleExpr::StatusUnhealthy
        );
        assert_eq!(
            "escalated".parse::<RuleExpr>().unwrap(),
            RuleExpr::Escalated
        );
    }

    #[test]
    fn test_parse_unknown_expr() {
        assert!(matches!(
            "cpu_vibes".parse::<RuleExpr>(),
            Err(RuleError::UnknownExpr(_))
        ));
    }

    #[test]
    fn test_sampled_split() {
        assert!(RuleExpr::ErrorRate.is_sampled());
        assert!(RuleExpr::LatencyP95.is_sampled());
        assert!(!RuleExpr::HealingFailed.is_sampled());
        assert!(!RuleExpr::Escalated.is_sampled());
    }

    #[test]
    fn test_from_config() {
        let config = RuleConfig {
            id: "lat".to_string(),
            expr: "latency_p95".to_string(),
            threshold: 250.0,
            duration_seconds: 120,
            severity: Severity::Warning,
            cooldown_seconds: 300,
        };
        let rule = Rule::from_config(&config).unwrap();
        assert_eq!(rule.expr, RuleExpr::LatencyP95);
        assert_eq!(rule.duration, Duration::from_secs(120));
    }

    #[test]
    fn test_builtin_rules_present() {
        let rules = builtin_rules();
        assert!(rules.iter().any(|r| r.id == "escalation" && r.severity == Severity::Critical));
        assert!(rules.iter().any(|r| r.id == "healing-failed"));
    }
}
