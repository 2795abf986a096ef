//! Configuration for Warden.
//!
//! The target fleet, healing policy, alert rules, and metrics settings come
//! from a JSON file (see `example-config.json`). Server-level settings (HTTP
//! port, database path, config path) come from environment variables with
//! sensible defaults.

use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::alerts::rules::RuleExpr;
use crate::alerts::Severity;

/// Fatal configuration error. Nothing partially starts when one of these is
/// raised at load time.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("malformed config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid target {id:?}: {reason}")]
    InvalidTarget { id: String, reason: String },
    #[error("invalid alert rule {id:?}: {reason}")]
    InvalidRule { id: String, reason: String },
    #[error("invalid {section} setting: {reason}")]
    InvalidSetting {
        section: &'static str,
        reason: String,
    },
}

/// Criticality tier of a monitored service, used for strategy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Criticality {
    Low,
    High,
}

/// A monitored service endpoint. Immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceTarget {
    pub id: String,
    #[serde(rename = "healthURL")]
    pub health_url: String,
    #[serde(rename = "checkIntervalMs")]
    pub check_interval_ms: u64,
    #[serde(rename = "timeoutMs")]
    pub timeout_ms: u64,
    #[serde(rename = "maxRetries")]
    pub max_retries: u32,
    pub criticality: Criticality,
    /// Last deployment known to be good; rollback is only selectable when
    /// this is recorded.
    #[serde(rename = "lastKnownGoodVersion", default)]
    pub last_known_good_version: Option<String>,
}

impl ServiceTarget {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Self-healing policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealingConfig {
    #[serde(rename = "maxRestarts", default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(rename = "cooldownSeconds", default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,
    /// Whether a Critical alert for a service bypasses the normal
    /// consecutive-failures threshold and heals immediately.
    #[serde(rename = "criticalEscalates", default = "default_true")]
    pub critical_escalates: bool,
}

fn default_max_restarts() -> u32 {
    5
}

fn default_cooldown_seconds() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

impl Default for HealingConfig {
    fn default() -> Self {
        Self {
            max_restarts: default_max_restarts(),
            cooldown_seconds: default_cooldown_seconds(),
            critical_escalates: true,
        }
    }
}

/// One configured alert rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    pub id: String,
    pub expr: String,
    pub threshold: f64,
    #[serde(rename = "durationSeconds", default)]
    pub duration_seconds: u64,
    pub severity: Severity,
    #[serde(rename = "cooldownSeconds", default = "default_rule_cooldown")]
    pub cooldown_seconds: u64,
}

fn default_rule_cooldown() -> u64 {
    300
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertsConfig {
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

/// Metrics collection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(rename = "tickSeconds", default = "default_tick_seconds")]
    pub tick_seconds: u64,
    #[serde(rename = "retentionDays", default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_tick_seconds() -> u64 {
    10
}

fn default_retention_days() -> u32 {
    30
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            tick_seconds: default_tick_seconds(),
            retention_days: default_retention_days(),
        }
    }
}

/// Full fleet configuration loaded from JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub targets: Vec<ServiceTarget>,
    #[serde(default)]
    pub healing: HealingConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load and validate a config file. Any violation is fatal.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            source,
        })?;
        let config: Config = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for target in &self.targets {
            let invalid = |reason: &str| ConfigError::InvalidTarget {
                id: target.id.clone(),
                reason: reason.to_string(),
            };
            if target.id.trim().is_empty() {
                return Err(invalid("id must not be empty"));
            }
            if !seen.insert(target.id.clone()) {
                return Err(invalid("duplicate target id"));
            }
            if !target.health_url.starts_with("http://")
                && !target.health_url.starts_with("https://")
            {
                return Err(invalid("healthURL must be an http(s) URL"));
            }
            if target.check_interval_ms == 0 {
                return Err(invalid("checkIntervalMs must be positive"));
            }
            if target.timeout_ms == 0 {
                return Err(invalid("timeoutMs must be positive"));
            }
            if target.max_retries == 0 {
                return Err(invalid("maxRetries must be at least 1"));
            }
        }

        if self.healing.max_restarts == 0 {
            return Err(ConfigError::InvalidSetting {
                section: "healing",
                reason: "maxRestarts must be at least 1".to_string(),
            });
        }

        let mut rule_ids = std::collections::HashSet::new();
        for rule in &self.alerts.rules {
            let invalid = |reason: String| ConfigError::InvalidRule {
                id: rule.id.clone(),
                reason,
            };
            if rule.id.trim().is_empty() {
                return Err(invalid("id must not be empty".to_string()));
            }
            if !rule_ids.insert(rule.id.clone()) {
                return Err(invalid("duplicate rule id".to_string()));
            }
            if let Err(e) = rule.expr.parse::<RuleExpr>() {
                return Err(invalid(e.to_string()));
            }
        }

        if self.metrics.tick_seconds == 0 {
            return Err(ConfigError::InvalidSetting {
                section: "metrics",
                reason: "tickSeconds must be positive".to_string(),
            });
        }
        if self.metrics.retention_days == 0 {
            return Err(ConfigError::InvalidSetting {
                section: "metrics",
                reason: "retentionDays must be positive".to_string(),
            });
        }

        Ok(())
    }
}

/// Server settings loaded from environment variables.
///
/// - `WARDEN_HTTP_PORT`: HTTP port for the query API (default: 8080)
/// - `WARDEN_DB_PATH`: SQLite database file (default: "warden.db")
/// - `WARDEN_CONFIG`: path to the fleet config JSON (default: "warden.json")
/// - `WARDEN_EVENT_LOG_DIR`: directory for rotating event logs (default: "events")
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub http_port: u16,
    pub db_path: String,
    pub config_path: String,
    pub event_log_dir: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "warden.db".to_string(),
            config_path: "warden.json".to_string(),
            event_log_dir: "events".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Ok(port_str) = env::var("WARDEN_HTTP_PORT") {
            if let Ok(port) = port_str.parse() {
                cfg.http_port = port;
            }
        }
        if let Ok(db_path) = env::var("WARDEN_DB_PATH") {
            cfg.db_path = db_path;
        }
        if let Ok(config_path) = env::var("WARDEN_CONFIG") {
            cfg.config_path = config_path;
        }
        if let Ok(dir) = env::var("WARDEN_EVENT_LOG_DIR") {
            cfg.event_log_dir = dir;
        }

        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config_json() -> &'static str {
        r#"{
            "targets": [
                {"id": "svc-a", "healthURL": "http://localhost:9001/health",
                 "checkIntervalMs": 5000, "timeoutMs": 2000, "maxRetries": 3,
                 "criticality": "high"}
            ],
            "healing": {"maxRestarts": 5, "cooldownSeconds": 60},
            "alerts": {"rules": [
                {"id": "err-rate", "expr": "error_rate", "threshold": 5.0,
                 "durationSeconds": 300, "severity": "warning", "cooldownSeconds": 600}
            ]},
            "metrics": {"tickSeconds": 10, "retentionDays": 30}
        }"#
    }

    #[test]
    fn test_parse_valid_config() {
        let config: Config = serde_json::from_str(valid_config_json()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.targets.len(), 1);
        assert_eq!(config.targets[0].id, "svc-a");
        assert_eq!(config.targets[0].criticality, Criticality::High);
        assert_eq!(config.healing.max_restarts, 5);
        assert_eq!(config.alerts.rules[0].severity, Severity::Warning);
    }

    #[test]
    fn test_defaults_applied() {
        let config: Config = serde_json::from_str(r#"{"targets": []}"#).unwrap();
        config.validate().unwrap();
        assert_eq!(config.healing.max_restarts, 5);
        assert_eq!(config.healing.cooldown_seconds, 60);
        assert!(config.healing.critical_escalates);
        assert_eq!(config.metrics.tick_seconds, 10);
        assert_eq!(config.metrics.retention_days, 30);
    }

    #[test]
    fn test_rejects_bad_url() {
        let mut config: Config = serde_json::from_str(valid_config_json()).unwrap();
        config.targets[0].health_url = "ftp://example.com".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidTarget { .. })
        ));
    }

    #[test]
    fn test_rejects_duplicate_ids() {
        let mut config: Config = serde_json::from_str(valid_config_json()).unwrap();
        config.targets.push(config.targets[0].clone());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_interval() {
        let mut config: Config = serde_json::from_str(valid_config_json()).unwrap();
        config.targets[0].check_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_unknown_rule_expr() {
        let mut config: Config = serde_json::from_str(valid_config_json()).unwrap();
        config.alerts.rules[0].expr = "disk_tea_leaves".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidRule { .. })
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load("/nonexistent/warden.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_server_config_defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.db_path, "warden.db");
    }
}
