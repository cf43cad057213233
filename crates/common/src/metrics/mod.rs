//! Request pipeline metrics
//!
//! Counters and histograms for tenant resolution, schema sessions,
//! authorization decisions and realtime delivery. Tenant ids are never
//! used as labels.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use std::time::Instant;

/// Metrics prefix for all CareHub metrics
pub const METRICS_PREFIX: &str = "carehub";

/// SLO-aligned histogram buckets for request latency (in seconds)
/// Targets: P50 < 50ms, P99 < 150ms
pub const LATENCY_BUCKETS: &[f64] = &[
    0.001,  // 1ms
    0.005,  // 5ms
    0.010,  // 10ms
    0.025,  // 25ms
    0.050,  // 50ms - P50 target
    0.075,  // 75ms
    0.100,  // 100ms
    0.150,  // 150ms - P99 target
    0.250,  // 250ms
    0.500,  // 500ms
    1.000,  // 1s
    2.500,  // 2.5s
    5.000,  // 5s
    10.00,  // 10s
];

/// Register all metric descriptions
pub fn register_metrics() {
    // Request metrics
    describe_counter!(
        format!("{}_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total number of HTTP requests"
    );

    describe_histogram!(
        format!("{}_request_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "HTTP request latency in seconds"
    );

    // Tenancy metrics
    describe_counter!(
        format!("{}_tenant_resolutions_total", METRICS_PREFIX),
        Unit::Count,
        "Tenant resolution attempts by source and outcome"
    );

    // Session metrics
    describe_histogram!(
        format!("{}_session_acquire_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Time to acquire and bind a tenant session"
    );

    describe_counter!(
        format!("{}_session_acquire_failures_total", METRICS_PREFIX),
        Unit::Count,
        "Tenant session acquisitions that failed"
    );

    describe_counter!(
        format!("{}_session_releases_total", METRICS_PREFIX),
        Unit::Count,
        "Session releases by outcome (reset or discarded)"
    );

    // Authorization metrics
    describe_counter!(
        format!("{}_authorization_decisions_total", METRICS_PREFIX),
        Unit::Count,
        "Permission checks by resource, action and decision"
    );

    // Realtime metrics
    describe_gauge!(
        format!("{}_realtime_connections", METRICS_PREFIX),
        Unit::Count,
        "Registered realtime connections"
    );

    describe_counter!(
        format!("{}_events_delivered_total", METRICS_PREFIX),
        Unit::Count,
        "Events handed to realtime connections"
    );

    tracing::info!("Metrics registered");
}

/// Helper to record request metrics
pub struct RequestMetrics {
    start: Instant,
    endpoint: String,
    method: String,
}

impl RequestMetrics {
    /// Start tracking a request
    pub fn start(method: &str, endpoint: &str) -> Self {
        Self {
            start: Instant::now(),
            endpoint: endpoint.to_string(),
            method: method.to_string(),
        }
    }

    /// Record request completion
    pub fn finish(self, status: u16) {
        let duration = self.start.elapsed().as_secs_f64();

        counter!(
            format!("{}_requests_total", METRICS_PREFIX),
            "method" => self.method.clone(),
            "endpoint" => self.endpoint.clone(),
            "status" => status.to_string()
        )
        .increment(1);

        histogram!(
            format!("{}_request_duration_seconds", METRICS_PREFIX),
            "method" => self.method,
            "endpoint" => self.endpoint
        )
        .record(duration);
    }
}

pub fn record_tenant_resolution(source: &str, outcome: &str) {
    counter!(
        format!("{}_tenant_resolutions_total", METRICS_PREFIX),
        "source" => source.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub fn record_session_acquire(duration_secs: f64, success: bool) {
    if success {
        histogram!(format!("{}_session_acquire_seconds", METRICS_PREFIX)).record(duration_secs);
    } else {
        counter!(format!("{}_session_acquire_failures_total", METRICS_PREFIX)).increment(1);
    }
}

pub fn record_session_release(outcome: &str) {
    counter!(
        format!("{}_session_releases_total", METRICS_PREFIX),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub fn record_authorization(resource: &str, action: &str, allowed: bool) {
    let decision = if allowed { "allow" } else { "deny" };

    counter!(
        format!("{}_authorization_decisions_total", METRICS_PREFIX),
        "resource" => resource.to_string(),
        "action" => action.to_string(),
        "decision" => decision
    )
    .increment(1);
}

pub fn set_realtime_connections(count: usize) {
    gauge!(format!("{}_realtime_connections", METRICS_PREFIX)).set(count as f64);
}

/// `scope` is `tenant` or `all`
pub fn record_events_delivered(scope: &str, delivered: usize) {
    counter!(
        format!("{}_events_delivered_total", METRICS_PREFIX),
        "scope" => scope.to_string()
    )
    .increment(delivered as u64);
}
