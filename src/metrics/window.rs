//! Metric windows and rollups.
//!
//! Raw samples are folded into the active hourly window per series and
//! discarded; only sealed windows (count/sum/min/max plus a digest for
//! percentiles) are persisted. Daily windows are derived by folding the
//! sealed hourly windows of a UTC day.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::db::digest;

pub const HOURLY_SECONDS: i64 = 3600;
pub const DAILY_SECONDS: i64 = 86400;

/// Truncate a timestamp to the start of its containing window.
pub fn truncate_to_window(dt: DateTime<Utc>, window_seconds: i64) -> DateTime<Utc> {
    let ts = dt.timestamp();
    let truncated = ts - ts.rem_euclid(window_seconds);
    DateTime::from_timestamp(truncated, 0).unwrap_or(dt)
}

/// Series key for a labeled metric, e.g. `health_latency_ms{service=svc-a}`.
pub fn series_name(name: &str, labels: &[(&str, &str)]) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let rendered: Vec<String> = labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!("{}{{{}}}", name, rendered.join(","))
}

/// A sealed window, as persisted and as served by the query API.
#[derive(Debug, Clone, Serialize)]
pub struct MetricWindow {
    pub name: String,
    pub start: DateTime<Utc>,
    pub window_seconds: i64,
    pub count: i64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    #[serde(skip)]
    pub digest_data: Vec<u8>,
}

impl MetricWindow {
    pub fn mean(&self) -> f64 {
        if self.count > 0 {
            self.sum / self.count as f64
        } else {
            0.0
        }
    }

    pub fn percentile(&self, q: f64) -> Option<f64> {
        digest::quantile(&self.digest_data, q)
    }

    /// Fold several windows (e.g. a day's hourly windows) into one larger
    /// window. Re-folding the same inputs produces the same aggregate.
    pub fn merge(
        name: &str,
        start: DateTime<Utc>,
        window_seconds: i64,
        parts: &[MetricWindow],
    ) -> MetricWindow {
        let mut count = 0i64;
        let mut sum = 0.0f64;
        let mut min = f64::MAX;
        let mut max = f64::MIN;

        for part in parts {
            if part.count == 0 {
                continue;
            }
            count += part.count;
            sum += part.sum;
            min = min.min(part.min);
            max = max.max(part.max);
        }

        if count == 0 {
            min = 0.0;
            max = 0.0;
        }

        let digest_data = digest::merge_digests(parts.iter().map(|p| p.digest_data.as_slice()))
            .map(|d| digest::serialize_digest(&d))
            .unwrap_or_default();

        MetricWindow {
            name: name.to_string(),
            start,
            window_seconds,
            count,
            sum,
            min,
            max,
            digest_data,
        }
    }
}

/// The in-memory hourly window a series is currently folding into.
#[derive(Debug)]
pub struct ActiveWindow {
    pub name: String,
    pub start: DateTime<Utc>,
    count: i64,
    sum: f64,
    min: f64,
    max: f64,
    /// Raw values buffered until seal; bounded by the tick rate within one
    /// hour.
    values: Vec<f64>,
}

impl ActiveWindow {
    pub fn new(name: String, start: DateTime<Utc>) -> Self {
        Self {
            name,
            start,
            count: 0,
            sum: 0.0,
            min: f64::MAX,
            max: f64::MIN,
            values: Vec::new(),
        }
    }

    pub fn observe(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.values.push(value);
    }

    pub fn count(&self) -> i64 {
        self.count
    }

    /// Seal into a persistable window; the raw samples are dropped here.
    pub fn seal(self) -> MetricWindow {
        let digest_data = digest::digest_from_values(&self.values)
            .map(|d| digest::serialize_digest(&d))
            .unwrap_or_default();
        MetricWindow {
            name: self.name,
            start: self.start,
            window_seconds: HOURLY_SECONDS,
            count: self.count,
            sum: self.sum,
            min: if self.count > 0 { self.min } else { 0.0 },
            max: if self.count > 0 { self.max } else { 0.0 },
            digest_data,
        }
    }
}
