//! Structured event log.
//!
//! Every state transition in the system (health status change, remediation
//! attempt start/outcome, alert fire/clear, escalation) is emitted as one
//! JSON line under the `warden::event` tracing target. `main` attaches a
//! rotating file layer filtered to that target, which forms the audit trail
//! consumed by external log aggregation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::alerts::Severity;
use crate::healing::{Outcome, Strategy};
use crate::monitor::HealthStatus;

/// Tracing target carrying the event stream.
pub const EVENT_TARGET: &str = "warden::event";

/// One audit-trail event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    HealthChanged {
        service_id: String,
        from: HealthStatus,
        to: HealthStatus,
    },
    RemediationStarted {
        service_id: String,
        strategy: Strategy,
        attempt: u32,
    },
    RemediationOutcome {
        service_id: String,
        strategy: Strategy,
        attempt: u32,
        outcome: Outcome,
    },
    Escalated {
        service_id: String,
        attempts: u32,
    },
    EscalationReset {
        service_id: String,
    },
    AlertFired {
        rule_id: String,
        service_id: Option<String>,
        severity: Severity,
        message: String,
    },
    AlertCleared {
        rule_id: String,
        service_id: Option<String>,
    },
}

impl Event {
    pub fn service_id(&self) -> Option<&str> {
        match self {
            Event::HealthChanged { service_id, .. }
            | Event::RemediationStarted { service_id, .. }
            | Event::RemediationOutcome { service_id, .. }
            | Event::Escalated { service_id, .. }
            | Event::EscalationReset { service_id } => Some(service_id),
            Event::AlertFired { service_id, .. } | Event::AlertCleared { service_id, .. } => {
                service_id.as_deref()
            }
        }
    }
}

/// Envelope written to the event log.
#[derive(Debug, Serialize)]
struct EventLine<'a> {
    timestamp: DateTime<Utc>,
    component: &'a str,
    #[serde(flatten)]
    event: &'a Event,
}

/// Emit an event as a structured log line.
pub fn emit(component: &str, event: &Event) {
    let line = EventLine {
        timestamp: Utc::now(),
        component,
        event,
    };
    match serde_json::to_string(&line) {
        Ok(json) => tracing::info!(target: "warden::event", "{}", json),
        Err(e) => tracing::error!("failed to serialize event: {}", e),
    }
}
