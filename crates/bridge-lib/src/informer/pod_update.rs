//! Reaction to pod changes
//!
//! Handles:
//! - Forwarding crash reports to the controller, suppressing redeliveries
//! - Registering routes of ready pods and unregistering them when pods
//!   stop being ready or disappear

use super::routes::{is_routable, route_messages, RoutePublisher};
use super::{CrashReportGenerator, PodChange, PodEventHandler};
use crate::emitter::CrashReportSink;
use crate::models::{CrashReport, RouteAction, RouteMessage};
use crate::observability::BridgeMetrics;
use crate::workload::{pod_identifier, pod_name, WorkloadClient};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Default window within which an identical crash is reported once
const DEFAULT_DEDUP_WINDOW_SECS: u64 = 5 * 60;

/// Identity of one crash observation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CrashKey {
    instance: String,
    crash_count: u32,
    crash_timestamp: i64,
}

impl From<&CrashReport> for CrashKey {
    fn from(report: &CrashReport) -> Self {
        Self {
            instance: report.instance.clone(),
            crash_count: report.crash_count,
            crash_timestamp: report.crash_timestamp,
        }
    }
}

fn same_route(a: &RouteMessage, b: &RouteMessage) -> bool {
    a.host == b.host && a.port == b.port && a.uris == b.uris
}

/// Pod update handler driving crash reports and route publishes
pub struct PodUpdateHandler {
    workloads: Arc<dyn WorkloadClient>,
    crashes: CrashReportGenerator,
    crash_sink: Arc<dyn CrashReportSink>,
    routes: RoutePublisher,
    dedup_window: Duration,
    /// Routes last registered per pod name
    registered: Mutex<HashMap<String, Vec<RouteMessage>>>,
    /// Recently reported crashes (key -> report time)
    recent_crashes: Mutex<HashMap<CrashKey, Instant>>,
    metrics: BridgeMetrics,
}

impl PodUpdateHandler {
    pub fn new(
        workloads: Arc<dyn WorkloadClient>,
        crashes: CrashReportGenerator,
        crash_sink: Arc<dyn CrashReportSink>,
        routes: RoutePublisher,
    ) -> Self {
        Self {
            workloads,
            crashes,
            crash_sink,
            routes,
            dedup_window: Duration::from_secs(DEFAULT_DEDUP_WINDOW_SECS),
            registered: Mutex::new(HashMap::new()),
            recent_crashes: Mutex::new(HashMap::new()),
            metrics: BridgeMetrics::new(),
        }
    }

    pub fn with_dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window = window;
        self
    }

    fn crash_reported_recently(&self, key: &CrashKey) -> bool {
        let recent = self
            .recent_crashes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        recent
            .get(key)
            .map(|reported| reported.elapsed() < self.dedup_window)
            .unwrap_or(false)
    }

    fn record_crash(&self, key: CrashKey) {
        let mut recent = self
            .recent_crashes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        recent.insert(key, Instant::now());
        recent.retain(|_, reported| reported.elapsed() < self.dedup_window);
    }

    async fn report_crash(&self, pod: &Pod) {
        let Some(report) = self.crashes.generate(pod).await else {
            return;
        };

        let key = CrashKey::from(&report);
        if self.crash_reported_recently(&key) {
            debug!(pod_name = %report.instance, crash_count = report.crash_count, "Crash already reported");
            return;
        }

        match self.crash_sink.notify(&report).await {
            Ok(()) => {
                self.metrics.inc_crash_reports();
                self.routes.logger().log_crash_report(&report);
                self.record_crash(key);
            }
            Err(e) => {
                error!(
                    event = "failed-to-report-crash",
                    guid = %report.process_guid,
                    pod_name = %report.instance,
                    error = %e,
                    "Cannot deliver crash report"
                );
            }
        }
    }

    /// Current route messages for the pod, looked up through its workload
    async fn current_routes(&self, pod: &Pod) -> Option<Vec<RouteMessage>> {
        let identifier = pod_identifier(pod)?;
        match self.workloads.get(&identifier).await {
            Ok(Some(workload)) => Some(route_messages(pod, &workload.lrp)),
            Ok(None) => Some(Vec::new()),
            Err(e) => {
                warn!(
                    event = "failed-to-get-workload",
                    guid = %identifier.guid,
                    pod_name = %pod_name(pod),
                    error = %e,
                    "Cannot look up routes for pod"
                );
                None
            }
        }
    }

    fn remember(&self, pod: &Pod, messages: Vec<RouteMessage>) -> Vec<RouteMessage> {
        let mut registered = self
            .registered
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        registered
            .insert(pod_name(pod).to_string(), messages)
            .unwrap_or_default()
    }

    fn forget(&self, pod: &Pod) -> Option<Vec<RouteMessage>> {
        self.registered
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(pod_name(pod))
    }

    async fn register_routes(&self, pod: &Pod) {
        let Some(messages) = self.current_routes(pod).await else {
            return;
        };

        self.routes.publish_all(&messages, RouteAction::Register).await;

        let previous = self.remember(pod, messages.clone());
        let stale: Vec<_> = previous
            .into_iter()
            .filter(|old| !messages.iter().any(|new| same_route(old, new)))
            .collect();
        self.routes.publish_all(&stale, RouteAction::Unregister).await;
    }

    /// Withdraw the routes last registered for a pod that stopped being ready
    async fn unregister_routes(&self, pod: &Pod) {
        if let Some(messages) = self.forget(pod) {
            self.routes.publish_all(&messages, RouteAction::Unregister).await;
        }
    }

    /// Withdraw a deleted pod's routes, falling back to its workload when
    /// nothing was registered through this handler
    async fn unregister_deleted(&self, pod: &Pod) {
        let messages = match self.forget(pod) {
            Some(messages) => messages,
            None => self.current_routes(pod).await.unwrap_or_default(),
        };
        self.routes.publish_all(&messages, RouteAction::Unregister).await;
    }
}

#[async_trait]
impl PodEventHandler for PodUpdateHandler {
    async fn handle(&self, change: PodChange) {
        match change {
            PodChange::Added(pod) | PodChange::Updated { new: pod, .. } => {
                self.report_crash(&pod).await;
                if is_routable(&pod) {
                    self.register_routes(&pod).await;
                } else {
                    self.unregister_routes(&pod).await;
                }
            }
            PodChange::Deleted(pod) => self.unregister_deleted(&pod).await,
        }
    }
}
