//! Notification sinks.
//!
//! Console and file sinks are always on; the `Notifier` trait and the
//! serialized `Alert` payload are the stable seam for pluggable sinks
//! (webhook, email, paging) living outside this crate.

use std::io::Write;
use std::path::PathBuf;

use async_trait::async_trait;

use super::{Alert, Severity};

#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;
    async fn notify(&self, alert: &Alert);
}

/// Logs alerts through tracing at a level matching their severity.
pub struct ConsoleNotifier;

#[async_trait]
impl Notifier for ConsoleNotifier {
    fn name(&self) -> &str {
        "console"
    }

    async fn notify(&self, alert: &Alert) {
        let service = alert.service_id.as_deref().unwrap_or("-");
        match alert.severity {
            Severity::Critical | Severity::Error => {
                tracing::error!(rule = %alert.rule_id, %service, "ALERT: {}", alert.message)
            }
            Severity::Warning => {
                tracing::warn!(rule = %alert.rule_id, %service, "ALERT: {}", alert.message)
            }
            Severity::Info => {
                tracing::info!(rule = %alert.rule_id, %service, "ALERT: {}", alert.message)
            }
        }
    }
}

/// Appends alerts as JSON lines to a file.
pub struct FileNotifier {
    path: PathBuf,
}

impl FileNotifier {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Notifier for FileNotifier {
    fn name(&self) -> &str {
        "file"
    }

    async fn notify(&self, alert: &Alert) {
        let line = match serde_json::to_string(alert) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!("failed to serialize alert: {}", e);
                return;
            }
        };
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| writeln!(f, "{}", line));
        if let Err(e) = result {
            tracing::error!(path = %self.path.display(), "failed to write alert: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn alert() -> Alert {
        Alert {
            rule_id: "err-rate".to_string(),
            service_id: Some("svc-a".to_string()),
            severity: Severity::Warning,
            message: "error rate 6.0 over threshold 5.0".to_string(),
            fired_at: Utc::now(),
            last_notified_at: Utc::now(),
            cooldown_seconds: 300,
            resolved: false,
        }
    }

    #[tokio::test]
    async fn test_file_notifier_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alerts.jsonl");
        let notifier = FileNotifier::new(&path);

        notifier.notify(&alert()).await;
        notifier.notify(&alert()).await;

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: Alert = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.rule_id, "err-rate");
    }
}
