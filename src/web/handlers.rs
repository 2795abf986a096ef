//! API handlers.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use crate::alerts::{Alert, Severity};
use crate::db::DbError;
use crate::healing::EngineCommand;
use crate::metrics::window::{MetricWindow, DAILY_SECONDS, HOURLY_SECONDS};
use crate::monitor::HealthCheckResult;

use super::AppState;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl From<DbError> for ApiError {
    fn from(e: DbError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Internal(m) => {
                tracing::error!("API error: {}", m);
                (StatusCode::INTERNAL_SERVER_ERROR, m)
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

/// GET /api/health: latest result for every monitored service.
pub async fn health(State(state): State<AppState>) -> Json<Vec<HealthCheckResult>> {
    Json(state.board.latest_all())
}

#[derive(Serialize)]
pub struct ServiceHealth {
    latest: HealthCheckResult,
    history: Vec<HealthCheckResult>,
    error_rate: Option<f64>,
    latency_p95: Option<f64>,
}

/// GET /api/health/{service}: latest result plus retained history.
pub async fn health_service(
    State(state): State<AppState>,
    Path(service): Path<String>,
) -> Result<Json<ServiceHealth>, ApiError> {
    let latest = state
        .board
        .latest(&service)
        .ok_or_else(|| ApiError::NotFound(format!("unknown service {service:?}")))?;
    Ok(Json(ServiceHealth {
        latest,
        history: state.board.history(&service),
        error_rate: state.board.error_rate(&service),
        latency_p95: state.board.latency_p95(&service),
    }))
}

#[derive(Deserialize)]
pub struct MetricsQuery {
    metric: Option<String>,
    range: Option<String>,
    granularity: Option<String>,
}

#[derive(Serialize)]
pub struct ApiWindow {
    time: DateTime<Utc>,
    count: i64,
    sum: f64,
    min: f64,
    max: f64,
    avg: f64,
    p50: Option<f64>,
    p95: Option<f64>,
    p99: Option<f64>,
}

impl From<MetricWindow> for ApiWindow {
    fn from(w: MetricWindow) -> Self {
        ApiWindow {
            time: w.start,
            count: w.count,
            sum: w.sum,
            min: w.min,
            max: w.max,
            avg: w.mean(),
            p50: w.percentile(0.5),
            p95: w.percentile(0.95),
            p99: w.percentile(0.99),
        }
    }
}

#[derive(Serialize)]
#[serde(untagged)]
pub enum MetricsResponse {
    Names { metrics: Vec<String> },
    Windows { metric: String, windows: Vec<ApiWindow> },
}

fn parse_range(s: &str) -> Option<ChronoDuration> {
    if !s.is_ascii() {
        return None;
    }
    let (value, unit) = s.split_at(s.len().checked_sub(1)?);
    let value: i64 = value.parse().ok()?;
    if value <= 0 {
        return None;
    }
    match unit {
        "m" => Some(ChronoDuration::minutes(value)),
        "h" => Some(ChronoDuration::hours(value)),
        "d" => Some(ChronoDuration::days(value)),
        _ => None,
    }
}

/// GET /api/metrics: series names, or windows for one series.
///
/// `?metric=` selects the series, `?range=` the lookback (`30m`, `24h`,
/// `7d`; default `24h`), `?granularity=` hourly or daily.
pub async fn metrics(
    State(state): State<AppState>,
    Query(query): Query<MetricsQuery>,
) -> Result<Json<MetricsResponse>, ApiError> {
    let Some(metric) = query.metric else {
        return Ok(Json(MetricsResponse::Names {
            metrics: state.store.metric_names()?,
        }));
    };

    let range = match query.range.as_deref() {
        None => ChronoDuration::hours(24),
        Some(s) => {
            parse_range(s).ok_or_else(|| ApiError::BadRequest(format!("invalid range {s:?}")))?
        }
    };

    let window_seconds = match query.granularity.as_deref() {
        None | Some("hourly") => HOURLY_SECONDS,
        Some("daily") => DAILY_SECONDS,
        Some(other) => {
            return Err(ApiError::BadRequest(format!(
                "invalid granularity {other:?}, expected hourly or daily"
            )))
        }
    };

    let end = Utc::now();
    let windows = state
        .store
        .get_windows(&metric, window_seconds, end - range, end)?
        .into_iter()
        .map(ApiWindow::from)
        .collect();

    Ok(Json(MetricsResponse::Windows { metric, windows }))
}

#[derive(Deserialize)]
pub struct AlertsQuery {
    severity: Option<String>,
}

/// GET /api/alerts: active alerts, optionally filtered by severity.
pub async fn alerts(
    State(state): State<AppState>,
    Query(query): Query<AlertsQuery>,
) -> Result<Json<Vec<Alert>>, ApiError> {
    let severity = match query.severity.as_deref() {
        None => None,
        Some(s) => Some(s.parse::<Severity>().map_err(ApiError::BadRequest)?),
    };
    Ok(Json(state.alerts.active(severity)))
}

#[derive(Serialize)]
pub struct ClearedResponse {
    cleared: usize,
}

/// DELETE /api/alerts: drop resolved alerts from the active set.
pub async fn clear_alerts(State(state): State<AppState>) -> Json<ClearedResponse> {
    Json(ClearedResponse {
        cleared: state.alerts.clear_resolved(),
    })
}

/// POST /api/healing/{service}/reset: operator reset of an escalated
/// service. Accepted, the engine applies it asynchronously.
pub async fn reset_healing(
    State(state): State<AppState>,
    Path(service): Path<String>,
) -> Result<StatusCode, ApiError> {
    state
        .heal_cmd_tx
        .send(EngineCommand::Reset {
            service_id: service,
        })
        .await
        .map_err(|_| ApiError::Internal("healing engine unavailable".to_string()))?;
    Ok(StatusCode::ACCEPTED)
}
