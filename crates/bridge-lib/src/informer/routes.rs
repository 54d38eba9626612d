//! Route messages derived from pods

use crate::emitter::RouteEmitter;
use crate::health::{components, HealthRegistry};
use crate::models::{Lrp, RouteAction, RouteMessage};
use crate::observability::{BridgeMetrics, StructuredLogger};
use crate::workload::{is_ready, parse_app_index, pod_name};
use k8s_openapi::api::core::v1::Pod;
use std::sync::Arc;

fn pod_ip(pod: &Pod) -> Option<&str> {
    pod.status
        .as_ref()
        .and_then(|status| status.pod_ip.as_deref())
        .filter(|ip| !ip.is_empty())
}

/// Whether the pod should receive traffic: ready and addressed
pub fn is_routable(pod: &Pod) -> bool {
    is_ready(pod) && pod_ip(pod).is_some()
}

/// Registration messages for every route of the pod's application
///
/// Empty when the pod has no address or no instance index.
pub fn route_messages(pod: &Pod, lrp: &Lrp) -> Vec<RouteMessage> {
    let (Some(host), Ok(index)) = (pod_ip(pod), parse_app_index(pod_name(pod))) else {
        return Vec::new();
    };
    let app = if lrp.app_guid.is_empty() {
        lrp.process_guid.clone()
    } else {
        lrp.app_guid.clone()
    };

    lrp.routes
        .cf_router
        .iter()
        .map(|route| RouteMessage {
            action: RouteAction::Register,
            host: host.to_string(),
            port: route.port,
            uris: route.hostnames.clone(),
            app: app.clone(),
            private_instance_id: pod_name(pod).to_string(),
            private_instance_index: index.to_string(),
        })
        .collect()
}

/// Publishes route messages, accounting for failures instead of returning them
#[derive(Clone)]
pub struct RoutePublisher {
    emitter: Arc<dyn RouteEmitter>,
    health: HealthRegistry,
    metrics: BridgeMetrics,
    logger: StructuredLogger,
}

impl RoutePublisher {
    pub fn new(emitter: Arc<dyn RouteEmitter>, health: HealthRegistry, logger: StructuredLogger) -> Self {
        Self {
            emitter,
            health,
            metrics: BridgeMetrics::new(),
            logger,
        }
    }

    pub fn logger(&self) -> &StructuredLogger {
        &self.logger
    }

    /// Publish one message with the given action; true on success
    pub async fn publish(&self, message: &RouteMessage, action: RouteAction) -> bool {
        let message = RouteMessage {
            action,
            ..message.clone()
        };

        match self.emitter.publish(&message).await {
            Ok(()) => {
                self.metrics.inc_route_publishes(&action.to_string());
                self.health.set_healthy(components::ROUTE_EMITTER).await;
                true
            }
            Err(e) => {
                self.metrics.inc_route_publish_errors();
                self.logger
                    .log_route_publish_failure(&message, &e.to_string());
                self.health
                    .set_degraded(components::ROUTE_EMITTER, e.to_string())
                    .await;
                false
            }
        }
    }

    /// Publish a batch; true when every message went out
    pub async fn publish_all(&self, messages: &[RouteMessage], action: RouteAction) -> bool {
        let mut all_published = true;
        for message in messages {
            all_published &= self.publish(message, action).await;
        }
        all_published
    }
}
