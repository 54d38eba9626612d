//! Periodic route re-registration
//!
//! Route tables on the message bus expire entries that are not refreshed,
//! so every ready pod's routes are re-published on a fixed interval.

use super::routes::{is_routable, route_messages, RoutePublisher};
use crate::models::{Identifier, Lrp, RouteAction};
use crate::workload::{pod_identifier, WorkloadClient};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

pub struct RouteCollector {
    workloads: Arc<dyn WorkloadClient>,
    routes: RoutePublisher,
    interval: Duration,
}

impl RouteCollector {
    pub fn new(workloads: Arc<dyn WorkloadClient>, routes: RoutePublisher, interval: Duration) -> Self {
        Self {
            workloads,
            routes,
            interval,
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting route collector"
        );

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.collect().await;
                }
                _ = shutdown.recv() => {
                    info!("Shutting down route collector");
                    break;
                }
            }
        }
    }

    /// Re-register routes of every ready pod; returns the number published
    pub async fn collect(&self) -> usize {
        let pods = match self.workloads.app_pods().await {
            Ok(pods) => pods,
            Err(e) => {
                warn!(error = %e, "Failed to list app pods for route refresh");
                return 0;
            }
        };

        // One workload lookup per app per pass
        let mut lrps: HashMap<Identifier, Option<Lrp>> = HashMap::new();
        let mut published = 0;
        let mut all_published = true;

        for pod in pods.iter().filter(|pod| is_routable(pod)) {
            let Some(identifier) = pod_identifier(pod) else {
                continue;
            };

            if !lrps.contains_key(&identifier) {
                let lrp = match self.workloads.get(&identifier).await {
                    Ok(workload) => workload.map(|workload| workload.lrp),
                    Err(e) => {
                        debug!(guid = %identifier.guid, error = %e, "Skipping routes of app");
                        None
                    }
                };
                lrps.insert(identifier.clone(), lrp);
            }

            let Some(Some(lrp)) = lrps.get(&identifier) else {
                continue;
            };
            let messages = route_messages(pod, lrp);
            for message in &messages {
                if self.routes.publish(message, RouteAction::Register).await {
                    published += 1;
                } else {
                    all_published = false;
                }
            }
        }

        self.routes
            .logger()
            .log_route_emitter_status(all_published, published);
        published
    }
}
