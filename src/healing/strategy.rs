//! Remediation strategies and the selection table.
//!
//! The seven strategies are ordered by escalating invasiveness. Selection is
//! a data table evaluated top-down against the service's situation, so the
//! escalation order is directly unit-testable instead of being buried in
//! branching logic.

use serde::{Deserialize, Serialize};

use crate::config::Criticality;
use crate::monitor::HealthStatus;

/// The seven ordered remediation strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Restart the target process/container.
    ServiceRestart,
    /// Drain in-flight requests before restarting.
    SafeRestart,
    /// Verify upstream dependencies before blaming the service.
    DependencyCheck,
    /// Restart with an extended startup grace period.
    GracefulRestart,
    /// Add a replica instead of restarting.
    ScaleUp,
    /// Revert to the last-known-good deployment.
    Rollback,
    /// Shed load / disable non-critical features instead of restarting.
    GracefulDegradation,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Strategy::ServiceRestart => "service_restart",
            Strategy::SafeRestart => "safe_restart",
            Strategy::DependencyCheck => "dependency_check",
            Strategy::GracefulRestart => "graceful_restart",
            Strategy::ScaleUp => "scale_up",
            Strategy::Rollback => "rollback",
            Strategy::GracefulDegradation => "graceful_degradation",
        };
        f.write_str(name)
    }
}

/// Failure class driving strategy choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// HTTP- or application-level failure.
    Http,
    /// Transport-level failure; suggests a dependency or infrastructure
    /// problem rather than the service itself.
    Transport,
}

impl From<HealthStatus> for ErrorKind {
    fn from(status: HealthStatus) -> Self {
        match status {
            HealthStatus::Error => ErrorKind::Transport,
            _ => ErrorKind::Http,
        }
    }
}

/// Everything the selection table matches against.
#[derive(Debug, Clone, Copy)]
pub struct SelectionContext {
    pub criticality: Criticality,
    pub error_kind: ErrorKind,
    /// 1-based number of the attempt about to run.
    pub attempt: u32,
    pub max_restarts: u32,
    /// Failures observed alongside latency at or beyond the timeout budget.
    pub high_latency: bool,
    /// A last-known-good version is recorded for the target.
    pub has_prior_version: bool,
}

/// One row of the selection table. All populated constraints must hold.
#[derive(Debug, Clone, Copy)]
pub struct SelectionRule {
    pub strategy: Strategy,
    /// Only matches the final attempt before escalation.
    pub last_attempt_only: bool,
    pub error_kind: Option<ErrorKind>,
    pub requires_high_latency: bool,
    pub min_attempt: u32,
    pub requires_prior_version: bool,
    pub criticality: Option<Criticality>,
}

impl SelectionRule {
    fn matches(&self, ctx: &SelectionContext) -> bool {
        if self.last_attempt_only && ctx.attempt < ctx.max_restarts {
            return false;
        }
        if let Some(kind) = self.error_kind {
            if ctx.error_kind != kind {
                return false;
            }
        }
        if self.requires_high_latency && !ctx.high_latency {
            return false;
        }
        if ctx.attempt < self.min_attempt {
            return false;
        }
        if self.requires_prior_version && !ctx.has_prior_version {
            return false;
        }
        if let Some(criticality) = self.criticality {
            if ctx.criticality != criticality {
                return false;
            }
        }
        true
    }
}

const ANY: SelectionRule = SelectionRule {
    strategy: Strategy::ServiceRestart,
    last_attempt_only: false,
    error_kind: None,
    requires_high_latency: false,
    min_attempt: 1,
    requires_prior_version: false,
    criticality: None,
};

/// Ordered escalation table; first match wins.
pub const SELECTION_TABLE: &[SelectionRule] = &[
    // Last resort before escalation: shed load rather than restart again.
    SelectionRule {
        strategy: Strategy::GracefulDegradation,
        last_attempt_only: true,
        ..ANY
    },
    // Transport failure points at a dependency, not the service.
    SelectionRule {
        strategy: Strategy::DependencyCheck,
        error_kind: Some(ErrorKind::Transport),
        ..ANY
    },
    // Failures correlated with load: add capacity instead of restarting.
    SelectionRule {
        strategy: Strategy::ScaleUp,
        requires_high_latency: true,
        ..ANY
    },
    // Repeated failures with a recorded good version: roll back.
    SelectionRule {
        strategy: Strategy::Rollback,
        min_attempt: 3,
        requires_prior_version: true,
        ..ANY
    },
    // Second attempt onward: extended startup grace.
    SelectionRule {
        strategy: Strategy::GracefulRestart,
        min_attempt: 2,
        ..ANY
    },
    // High-criticality services drain before restarting.
    SelectionRule {
        strategy: Strategy::SafeRestart,
        criticality: Some(Criticality::High),
        ..ANY
    },
    // Default first response.
    SelectionRule {
        strategy: Strategy::ServiceRestart,
        ..ANY
    },
];

/// Pick the strategy for the next remediation attempt.
pub fn select_strategy(ctx: &SelectionContext) -> Strategy {
    SELECTION_TABLE
        .iter()
        .find(|rule| rule.matches(ctx))
        .map(|rule| rule.strategy)
        .unwrap_or(Strategy::ServiceRestart)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> SelectionContext {
        SelectionContext {
            criticality: Criticality::Low,
            error_kind: ErrorKind::Http,
            attempt: 1,
            max_restarts: 5,
            high_latency: false,
            has_prior_version: false,
        }
    }

    #[test]
    fn test_first_attempt_restart() {
        assert_eq!(select_strategy(&ctx()), Strategy::ServiceRestart);
    }

    #[test]
    fn test_high_criticality_drains_first() {
        let ctx = SelectionContext {
            criticality: Criticality::High,
            ..ctx()
        };
        assert_eq!(select_strategy(&ctx), Strategy::SafeRestart);
    }

    #[test]
    fn test_transport_error_checks_dependencies() {
        let ctx = SelectionContext {
            error_kind: ErrorKind::Transport,
            criticality: Criticality::High,
            ..ctx()
        };
        // Dependency check outranks criticality-driven restarts.
        assert_eq!(select_strategy(&ctx), Strategy::DependencyCheck);
    }

    #[test]
    fn test_second_attempt_graceful() {
        let ctx = SelectionContext {
            attempt: 2,
            ..ctx()
        };
        assert_eq!(select_strategy(&ctx), Strategy::GracefulRestart);
    }

    #[test]
    fn test_rollback_needs_prior_version() {
        let without = SelectionContext {
            attempt: 3,
            ..ctx()
        };
        assert_eq!(select_strategy(&without), Strategy::GracefulRestart);

        let with = SelectionContext {
            attempt: 3,
            has_prior_version: true,
            ..ctx()
        };
        assert_eq!(select_strategy(&with), Strategy::Rollback);
    }

    #[test]
    fn test_load_correlated_scale_up() {
        let ctx = SelectionContext {
            high_latency: true,
            attempt: 2,
            ..ctx()
        };
        assert_eq!(select_strategy(&ctx), Strategy::ScaleUp);
    }

    #[test]
    fn test_last_attempt_degrades_gracefully() {
        let ctx = SelectionContext {
            attempt: 5,
            high_latency: true,
            has_prior_version: true,
            ..ctx()
        };
        assert_eq!(select_strategy(&ctx), Strategy::GracefulDegradation);
    }

    #[test]
    fn test_error_kind_from_status() {
        assert_eq!(ErrorKind::from(HealthStatus::Error), ErrorKind::Transport);
        assert_eq!(ErrorKind::from(HealthStatus::Unhealthy), ErrorKind::Http);
        assert_eq!(ErrorKind::from(HealthStatus::Healthy), ErrorKind::Http);
    }
}
