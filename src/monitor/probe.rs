//! HTTP health probe.
//!
//! One probe is a GET against the target's health URL with a hard deadline.
//! A 2xx response with no body, or a JSON body reporting `"healthy"`, is a
//! success. Everything else maps onto the error taxonomy: HTTP-level
//! failures (bad status, degraded body) versus transport-level failures
//! (timeout, DNS, connection refused), which route to different remediation
//! strategies downstream.

use std::time::{Duration, Instant};

use serde::Deserialize;
use thiserror::Error;

/// Probe failure taxonomy.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("unexpected status code {0}")]
    Status(u16),
    #[error("service reported status {0:?}")]
    Unhealthy(String),
}

impl ProbeError {
    /// Transport-level failures imply infrastructure rather than
    /// application failure.
    pub fn is_transport(&self) -> bool {
        matches!(self, ProbeError::Timeout(_) | ProbeError::Connection(_))
    }
}

/// Optional JSON body of a health endpoint.
#[derive(Debug, Deserialize)]
struct HealthBody {
    status: Option<String>,
}

/// Result of a successful probe.
#[derive(Debug, Clone, Copy)]
pub struct ProbeSuccess {
    pub latency_ms: f64,
}

/// Build the shared client for a target's probe loop.
pub fn build_client(timeout: Duration) -> Result<reqwest::Client, ProbeError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ProbeError::Connection(e.to_string()))
}

/// Run a single probe attempt against the health URL.
pub async fn probe_once(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> Result<ProbeSuccess, ProbeError> {
    let start = Instant::now();

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            ProbeError::Timeout(timeout)
        } else {
            ProbeError::Connection(e.to_string())
        }
    })?;

    let status = response.status();
    if !status.is_success() {
        return Err(ProbeError::Status(status.as_u16()));
    }

    // Read the full body so latency covers the complete transfer.
    let body = response.bytes().await.map_err(|e| {
        if e.is_timeout() {
            ProbeError::Timeout(timeout)
        } else {
            ProbeError::Connection(e.to_string())
        }
    })?;

    let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

    // The body is optional; only an explicit non-healthy status fails.
    if let Ok(health) = serde_json::from_slice::<HealthBody>(&body) {
        if let Some(status) = health.status {
            match status.as_str() {
                "healthy" => {}
                other => return Err(ProbeError::Unhealthy(other.to_string())),
            }
        }
    }

    Ok(ProbeSuccess { latency_ms })
}
