use std::sync::Arc;

use axum::{
    extract::{Query, State},
    Json,
};
use serde_json::{json, Value};

use super::AppState;
use crate::models::{CacheClearQuery, ErrorsQuery, StatsQuery};

pub async fn stats(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatsQuery>,
) -> Json<Value> {
    let snapshot = state.metrics.stats(query.since_minutes);
    let period = match query.since_minutes {
        Some(minutes) => format!("last {} minutes", minutes),
        None => "all time".to_string(),
    };
    Json(json!({
        "status": "success",
        "metrics": snapshot,
        "period": period,
    }))
}

pub async fn recent_errors(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ErrorsQuery>,
) -> Json<Value> {
    let errors = state.metrics.recent_errors(query.limit);
    Json(json!({
        "status": "success",
        "count": errors.len(),
        "errors": errors,
    }))
}

pub async fn alerts(State(state): State<Arc<AppState>>) -> Json<Value> {
    let settings = &state.settings;
    let alerts = state.metrics.check_alerts(
        settings.alert_error_rate_threshold,
        settings.alert_response_time_threshold,
    );
    let status = if alerts.is_empty() { "success" } else { "warning" };
    Json(json!({
        "status": status,
        "alert_count": alerts.len(),
        "alerts": alerts,
        "thresholds": {
            "error_rate": settings.alert_error_rate_threshold,
            "response_time": settings.alert_response_time_threshold,
        },
    }))
}

pub async fn cache_stats(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "success",
        "cache": state.cache.stats().await,
    }))
}

/// Clears entries under `prefix`, or the whole cache when none is given.
pub async fn clear_cache(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CacheClearQuery>,
) -> Json<Value> {
    match query.prefix.filter(|p| !p.is_empty()) {
        Some(prefix) => {
            let deleted = state.cache.clear_prefix(&prefix).await;
            Json(json!({
                "status": "success",
                "message": format!("Cleared cache entries with prefix: {}", prefix),
                "deleted": deleted,
            }))
        }
        None => {
            let (status, message) = if state.cache.clear_all().await {
                ("success", "Cleared all cache entries")
            } else {
                ("error", "Failed to clear cache")
            };
            Json(json!({ "status": status, "message": message }))
        }
    }
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let recent = state.metrics.stats(Some(1));
    let monitoring_status = if state.settings.monitoring_enabled {
        "healthy"
    } else {
        "disabled"
    };
    let monitoring = json!({
        "status": monitoring_status,
        "recent_requests": recent.total_requests,
    });

    let cache = state.cache.stats().await;
    let cache_status = match (&cache.error, cache.enabled) {
        (Some(_), _) => "unhealthy",
        (None, true) => "healthy",
        (None, false) => "disabled",
    };
    let overall = if cache.error.is_some() { "degraded" } else { "healthy" };

    Json(json!({
        "status": overall,
        "components": {
            "monitoring": monitoring,
            "cache": {
                "status": cache_status,
                "enabled": cache.enabled,
                "error": cache.error,
            },
        },
    }))
}
