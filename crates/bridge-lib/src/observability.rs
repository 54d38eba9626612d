//! Observability infrastructure for the LRP bridge
//!
//! Provides:
//! - Prometheus metrics (request counts, translation latency, crash and route publishing)
//! - Structured JSON logging with tracing

use crate::models::{CrashReport, RouteMessage};
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, HistogramVec,
    IntCounter, IntCounterVec,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for platform round trips (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

static GLOBAL_METRICS: OnceLock<BridgeMetricsInner> = OnceLock::new();

struct BridgeMetricsInner {
    http_requests: IntCounterVec,
    bifrost_latency_seconds: HistogramVec,
    crash_reports: IntCounter,
    route_publishes: IntCounterVec,
    route_publish_errors: IntCounter,
    informer_events: IntCounterVec,
}

impl BridgeMetricsInner {
    fn new() -> Self {
        Self {
            http_requests: register_int_counter_vec!(
                "lrp_bridge_http_requests_total",
                "App handler requests by endpoint and response status",
                &["endpoint", "status"]
            )
            .expect("Failed to register http_requests_total"),

            bifrost_latency_seconds: register_histogram_vec!(
                "lrp_bridge_bifrost_latency_seconds",
                "Time spent in translation engine operations",
                &["operation"],
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register bifrost_latency_seconds"),

            crash_reports: register_int_counter!(
                "lrp_bridge_crash_reports_total",
                "Crash reports delivered to the controller"
            )
            .expect("Failed to register crash_reports_total"),

            route_publishes: register_int_counter_vec!(
                "lrp_bridge_route_publishes_total",
                "Route messages published by kind",
                &["kind"]
            )
            .expect("Failed to register route_publishes_total"),

            route_publish_errors: register_int_counter!(
                "lrp_bridge_route_publish_errors_total",
                "Route messages that could not be published"
            )
            .expect("Failed to register route_publish_errors_total"),

            informer_events: register_int_counter_vec!(
                "lrp_bridge_informer_events_total",
                "Pod change notifications by kind",
                &["kind"]
            )
            .expect("Failed to register informer_events_total"),
        }
    }
}

/// Bridge metrics for Prometheus exposition
///
/// A lightweight handle to the global metrics instance; clones share it.
#[derive(Clone)]
pub struct BridgeMetrics {
    _private: (),
}

impl Default for BridgeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl BridgeMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(BridgeMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &BridgeMetricsInner {
        GLOBAL_METRICS.get_or_init(BridgeMetricsInner::new)
    }

    /// Count one handled API request
    pub fn inc_http_request(&self, endpoint: &str, status: u16) {
        self.inner()
            .http_requests
            .with_label_values(&[endpoint, &status.to_string()])
            .inc();
    }

    pub fn observe_bifrost_latency(&self, operation: &str, duration_secs: f64) {
        self.inner()
            .bifrost_latency_seconds
            .with_label_values(&[operation])
            .observe(duration_secs);
    }

    pub fn inc_crash_reports(&self) {
        self.inner().crash_reports.inc();
    }

    pub fn inc_route_publishes(&self, kind: &str) {
        self.inner().route_publishes.with_label_values(&[kind]).inc();
    }

    pub fn inc_route_publish_errors(&self) {
        self.inner().route_publish_errors.inc();
    }

    pub fn inc_informer_events(&self, kind: &str) {
        self.inner().informer_events.with_label_values(&[kind]).inc();
    }
}

/// Structured logger for process lifecycle events
#[derive(Clone)]
pub struct StructuredLogger {
    namespace: String,
}

impl StructuredLogger {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// Log bridge startup
    pub fn log_startup(&self, version: &str, api_port: u16, informer_enabled: bool) {
        info!(
            event = "bridge_started",
            namespace = %self.namespace,
            bridge_version = %version,
            api_port = api_port,
            informer_enabled = informer_enabled,
            "LRP bridge started"
        );
    }

    /// Log bridge shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "bridge_shutdown",
            namespace = %self.namespace,
            reason = %reason,
            "LRP bridge shutting down"
        );
    }

    /// Log a crash report handed to the controller
    pub fn log_crash_report(&self, report: &CrashReport) {
        info!(
            event = "crash_reported",
            namespace = %self.namespace,
            guid = %report.process_guid,
            pod_name = %report.instance,
            index = report.index,
            reason = %report.reason,
            exit_status = report.exit_status,
            crash_count = report.crash_count,
            "App instance crashed"
        );
    }

    /// Log a route message that could not be published
    pub fn log_route_publish_failure(&self, message: &RouteMessage, error: &str) {
        warn!(
            event = "route_publish_failed",
            namespace = %self.namespace,
            subject = message.action.subject(),
            pod_name = %message.private_instance_id,
            uris = ?message.uris,
            error = %error,
            "Failed to publish route message"
        );
    }

    /// Log the state of the route emitter connection
    pub fn log_route_emitter_status(&self, connected: bool, registered_routes: usize) {
        if connected {
            info!(
                event = "route_sync",
                namespace = %self.namespace,
                connected = true,
                registered_routes = registered_routes,
                "Routes refreshed"
            );
        } else {
            warn!(
                event = "route_sync",
                namespace = %self.namespace,
                connected = false,
                registered_routes = registered_routes,
                "Route emitter unreachable, will retry on next refresh"
            );
        }
    }
}
