use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{MatchedPath, Request, State},
    middleware::Next,
    response::Response,
};
use metrics::{counter, gauge, histogram};

use super::AppState;
use crate::error::{ErrorDetail, GatewayError};

pub const API_KEY_HEADER: &str = "x-api-key";

/// Rejects requests without a configured `X-API-Key`.
pub async fn require_api_key(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, GatewayError> {
    let provided = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok());

    match provided {
        None => Err(GatewayError::Unauthorized(
            "Missing API Key. Include 'X-API-Key' header in your request.".to_string(),
        )),
        Some(key) if state.is_valid_key(key) => Ok(next.run(request).await),
        Some(_) => {
            tracing::warn!(path = %request.uri().path(), "Rejected request with invalid API key");
            Err(GatewayError::Unauthorized("Invalid API Key".to_string()))
        }
    }
}

/// Records every request except `/metrics` into the in-memory store and the
/// Prometheus recorder.
pub async fn track_requests(
    State(state): State<Arc<AppState>>,
    matched_path: Option<MatchedPath>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    if path == "/metrics" || !state.settings.monitoring_enabled {
        return next.run(request).await;
    }

    let start = Instant::now();
    let method = request.method().to_string();
    let route = matched_path
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let in_progress = gauge!(
        "gateway_requests_in_progress",
        "method" => method.clone(),
        "path" => route.clone()
    );
    in_progress.increment(1.0);
    let response = next.run(request).await;
    in_progress.decrement(1.0);

    let elapsed = start.elapsed();
    let status = response.status();
    let error = response
        .extensions()
        .get::<ErrorDetail>()
        .map(|detail| detail.0.clone());

    state
        .metrics
        .record(&method, &route, &path, status.as_u16(), elapsed, error);

    counter!(
        "gateway_requests_total",
        "method" => method.clone(),
        "path" => route.clone(),
        "status" => status.as_u16().to_string()
    )
    .increment(1);
    histogram!(
        "gateway_request_duration_seconds",
        "method" => method.clone(),
        "path" => route.clone()
    )
    .record(elapsed.as_secs_f64());
    if status.is_client_error() || status.is_server_error() {
        counter!(
            "gateway_errors_total",
            "method" => method,
            "path" => route,
            "status" => status.as_u16().to_string()
        )
        .increment(1);
    }

    response
}
