//! In-memory request metrics: a bounded rolling window of recent requests
//! and errors plus per-endpoint aggregates.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;

const MAX_REQUESTS: usize = 10_000;
const MAX_ERRORS: usize = 1_000;
const ALERT_WINDOW_MINUTES: i64 = 5;
/// Fewer requests than this in the alert window never raise an error-rate alert.
pub const MIN_REQUESTS_FOR_ERROR_ALERT: u64 = 10;

#[derive(Debug, Clone)]
struct RequestRecord {
    timestamp: DateTime<Utc>,
    method: String,
    path: String,
    status: u16,
    duration: f64,
    error: Option<String>,
}

impl RequestRecord {
    fn is_error(&self) -> bool {
        self.status >= 400 || self.error.is_some()
    }
}

/// `now - span`, or `None` when the span is out of range and everything
/// retained counts as inside the window.
fn window_start(now: DateTime<Utc>, span: Option<TimeDelta>) -> Option<DateTime<Utc>> {
    span.and_then(|span| now.checked_sub_signed(span))
}

#[derive(Debug, Clone, Copy)]
struct EndpointStats {
    count: u64,
    total_time: f64,
    min_time: f64,
    max_time: f64,
    errors: u64,
}

impl Default for EndpointStats {
    fn default() -> Self {
        Self {
            count: 0,
            total_time: 0.0,
            min_time: f64::INFINITY,
            max_time: 0.0,
            errors: 0,
        }
    }
}

struct MetricsState {
    requests: VecDeque<RequestRecord>,
    errors: VecDeque<RequestRecord>,
    endpoints: HashMap<String, EndpointStats>,
    minute_start: DateTime<Utc>,
    minute_requests: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EndpointSummary {
    pub requests: u64,
    pub avg_time: f64,
    pub min_time: f64,
    pub max_time: f64,
    pub errors: u64,
    pub error_rate: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub total_errors: u64,
    /// Percentage, 0 to 100.
    pub error_rate: f64,
    /// Seconds.
    pub avg_response_time: f64,
    pub requests_per_minute: u64,
    pub status_distribution: BTreeMap<String, u64>,
    pub endpoint_breakdown: BTreeMap<String, EndpointSummary>,
    pub retention_hours: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ErrorEntry {
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub error: String,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    HighErrorRate,
    HighResponseTime,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Alert {
    #[serde(rename = "type")]
    pub kind: AlertKind,
    pub severity: &'static str,
    pub message: String,
    pub value: f64,
    pub threshold: f64,
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

/// Shared request recorder. Never fails: a poisoned lock is recovered.
pub struct RequestMetrics {
    state: Mutex<MetricsState>,
    retention_hours: i64,
}

impl RequestMetrics {
    pub fn new(retention_hours: i64) -> Self {
        tracing::info!("Initialized metrics store with {}h retention", retention_hours);
        Self {
            state: Mutex::new(MetricsState {
                requests: VecDeque::new(),
                errors: VecDeque::new(),
                endpoints: HashMap::new(),
                minute_start: Utc::now(),
                minute_requests: 0,
            }),
            retention_hours,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MetricsState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Records one request. `route` keys the per-endpoint aggregates and
    /// must come from a bounded set (a route template, not a raw path).
    pub fn record(
        &self,
        method: &str,
        route: &str,
        path: &str,
        status: u16,
        duration: Duration,
        error: Option<String>,
    ) {
        self.record_at(Utc::now(), method, route, path, status, duration.as_secs_f64(), error);
    }

    #[allow(clippy::too_many_arguments)]
    fn record_at(
        &self,
        now: DateTime<Utc>,
        method: &str,
        route: &str,
        path: &str,
        status: u16,
        duration: f64,
        error: Option<String>,
    ) {
        let record = RequestRecord {
            timestamp: now,
            method: method.to_string(),
            path: path.to_string(),
            status,
            duration,
            error,
        };
        let is_error = record.is_error();

        let mut state = self.lock();

        let stats = state
            .endpoints
            .entry(format!("{} {}", method, route))
            .or_default();
        stats.count += 1;
        stats.total_time += duration;
        stats.min_time = stats.min_time.min(duration);
        stats.max_time = stats.max_time.max(duration);
        if is_error {
            stats.errors += 1;
        }

        if (now - state.minute_start).num_seconds() >= 60 {
            state.minute_start = now;
            state.minute_requests = 1;
        } else {
            state.minute_requests += 1;
        }

        if is_error {
            if state.errors.len() == MAX_ERRORS {
                state.errors.pop_front();
            }
            state.errors.push_back(record.clone());
        }
        if state.requests.len() == MAX_REQUESTS {
            state.requests.pop_front();
        }
        state.requests.push_back(record);

        // Oldest first; both queues are in arrival order.
        if let Some(cutoff) = window_start(now, TimeDelta::try_hours(self.retention_hours)) {
            while state.requests.front().is_some_and(|r| r.timestamp < cutoff) {
                state.requests.pop_front();
            }
            while state.errors.front().is_some_and(|r| r.timestamp < cutoff) {
                state.errors.pop_front();
            }
        }
    }

    /// Aggregates over the last `since_minutes`, or everything retained.
    pub fn stats(&self, since_minutes: Option<i64>) -> MetricsSnapshot {
        self.stats_at(Utc::now(), since_minutes)
    }

    fn stats_at(&self, now: DateTime<Utc>, since_minutes: Option<i64>) -> MetricsSnapshot {
        let state = self.lock();
        let cutoff = since_minutes
            .filter(|&m| m > 0)
            .and_then(|m| window_start(now, TimeDelta::try_minutes(m)));

        let requests: Vec<&RequestRecord> = state
            .requests
            .iter()
            .filter(|r| cutoff.map_or(true, |c| r.timestamp >= c))
            .collect();
        let total_requests = requests.len() as u64;
        let total_errors = requests.iter().filter(|r| r.is_error()).count() as u64;

        let (avg_response_time, error_rate) = if total_requests > 0 {
            let total_time: f64 = requests.iter().map(|r| r.duration).sum();
            (
                total_time / total_requests as f64,
                total_errors as f64 / total_requests as f64 * 100.0,
            )
        } else {
            (0.0, 0.0)
        };

        let mut status_distribution = BTreeMap::new();
        for record in &requests {
            *status_distribution
                .entry(format!("{}xx", record.status / 100))
                .or_insert(0) += 1;
        }

        let endpoint_breakdown = state
            .endpoints
            .iter()
            .filter(|(_, stats)| stats.count > 0)
            .map(|(endpoint, stats)| {
                let count = stats.count as f64;
                (
                    endpoint.clone(),
                    EndpointSummary {
                        requests: stats.count,
                        avg_time: round_to(stats.total_time / count, 3),
                        min_time: round_to(stats.min_time, 3),
                        max_time: round_to(stats.max_time, 3),
                        errors: stats.errors,
                        error_rate: round_to(stats.errors as f64 / count * 100.0, 2),
                    },
                )
            })
            .collect();

        MetricsSnapshot {
            total_requests,
            total_errors,
            error_rate: round_to(error_rate, 2),
            avg_response_time: round_to(avg_response_time, 3),
            requests_per_minute: state.minute_requests,
            status_distribution,
            endpoint_breakdown,
            retention_hours: self.retention_hours,
        }
    }

    /// Most recent first.
    pub fn recent_errors(&self, limit: usize) -> Vec<ErrorEntry> {
        self.lock()
            .errors
            .iter()
            .rev()
            .take(limit)
            .map(|r| ErrorEntry {
                timestamp: r.timestamp,
                method: r.method.clone(),
                path: r.path.clone(),
                status: r.status,
                error: r.error.clone().unwrap_or_else(|| "Unknown".to_string()),
            })
            .collect()
    }

    /// Threshold checks over the trailing five minutes.
    ///
    /// `error_rate_threshold` is a fraction (0.1 means 10%), the response time
    /// threshold is in seconds.
    pub fn check_alerts(&self, error_rate_threshold: f64, response_time_threshold: f64) -> Vec<Alert> {
        self.check_alerts_at(Utc::now(), error_rate_threshold, response_time_threshold)
    }

    fn check_alerts_at(
        &self,
        now: DateTime<Utc>,
        error_rate_threshold: f64,
        response_time_threshold: f64,
    ) -> Vec<Alert> {
        let stats = self.stats_at(now, Some(ALERT_WINDOW_MINUTES));
        let mut alerts = Vec::new();

        if stats.total_requests >= MIN_REQUESTS_FOR_ERROR_ALERT
            && stats.error_rate / 100.0 > error_rate_threshold
        {
            alerts.push(Alert {
                kind: AlertKind::HighErrorRate,
                severity: "warning",
                message: format!(
                    "Error rate is {:.1}% (threshold: {:.1}%)",
                    stats.error_rate,
                    error_rate_threshold * 100.0
                ),
                value: stats.error_rate,
                threshold: error_rate_threshold * 100.0,
            });
        }

        if stats.avg_response_time > response_time_threshold {
            alerts.push(Alert {
                kind: AlertKind::HighResponseTime,
                severity: "warning",
                message: format!(
                    "Average response time is {:.2}s (threshold: {}s)",
                    stats.avg_response_time, response_time_threshold
                ),
                value: stats.avg_response_time,
                threshold: response_time_threshold,
            });
        }

        alerts
    }
}

/// Periodically evaluates alerts and logs each one at `warn`.
pub fn spawn_alert_monitor(
    store: Arc<RequestMetrics>,
    every: Duration,
    error_rate_threshold: f64,
    response_time_threshold: f64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // The first tick fires immediately; there is nothing to check yet.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let alerts = store.check_alerts(error_rate_threshold, response_time_threshold);
            metrics::gauge!("gateway_active_alerts").set(alerts.len() as f64);
            for alert in &alerts {
                tracing::warn!(
                    alert_type = ?alert.kind,
                    value = alert.value,
                    threshold = alert.threshold,
                    "{}",
                    alert.message
                );
            }
        }
    })
}
