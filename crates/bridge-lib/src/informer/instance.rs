//! Watch loop over application pods

use super::{PodChange, PodEventHandler};
use crate::health::{components, HealthRegistry};
use crate::observability::BridgeMetrics;
use crate::workload::{pod_name, pod_namespace};
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, info, warn};

fn pod_key(pod: &Pod) -> String {
    format!("{}/{}", pod_namespace(pod), pod_name(pod))
}

/// Turns pod watch events into changes for a [`PodEventHandler`]
///
/// The informer remembers the last observed version of every pod so that
/// updates carry both the old and the new snapshot, and a relist can be
/// diffed into additions, updates and deletions.
pub struct InstanceChangeInformer {
    handler: Arc<dyn PodEventHandler>,
    health: HealthRegistry,
    metrics: BridgeMetrics,
    pods: HashMap<String, Pod>,
}

impl InstanceChangeInformer {
    pub fn new(handler: Arc<dyn PodEventHandler>, health: HealthRegistry) -> Self {
        Self {
            handler,
            health,
            metrics: BridgeMetrics::new(),
            pods: HashMap::new(),
        }
    }

    /// Consume watch events until shutdown or the end of the stream
    pub async fn run<S>(mut self, events: S, mut shutdown: broadcast::Receiver<()>)
    where
        S: Stream<Item = Result<watcher::Event<Pod>, watcher::Error>> + Send,
    {
        info!("Starting instance change informer");
        tokio::pin!(events);
        self.health.set_healthy(components::INFORMER).await;

        loop {
            tokio::select! {
                next = events.next() => match next {
                    Some(Ok(event)) => {
                        for change in self.changes(event) {
                            self.metrics.inc_informer_events(change.kind());
                            self.handler.handle(change).await;
                        }
                        self.health.set_healthy(components::INFORMER).await;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Pod watch failed, waiting for the watcher to recover");
                        self.health
                            .set_degraded(components::INFORMER, e.to_string())
                            .await;
                    }
                    None => {
                        warn!("Pod watch stream ended");
                        self.health
                            .set_unhealthy(components::INFORMER, "watch stream ended")
                            .await;
                        break;
                    }
                },
                _ = shutdown.recv() => {
                    info!("Shutting down instance change informer");
                    break;
                }
            }
        }
    }

    /// Changes implied by one watch event, updating the memo
    fn changes(&mut self, event: watcher::Event<Pod>) -> Vec<PodChange> {
        match event {
            watcher::Event::Applied(pod) => vec![self.applied(pod)],
            watcher::Event::Deleted(pod) => {
                self.pods.remove(&pod_key(&pod));
                vec![PodChange::Deleted(pod)]
            }
            watcher::Event::Restarted(pods) => {
                debug!(pods = pods.len(), "Pod watch relisted");
                let listed: HashSet<String> = pods.iter().map(pod_key).collect();

                let mut gone: Vec<String> = self
                    .pods
                    .keys()
                    .filter(|key| !listed.contains(*key))
                    .cloned()
                    .collect();
                gone.sort();

                let mut changes: Vec<PodChange> = gone
                    .into_iter()
                    .filter_map(|key| self.pods.remove(&key))
                    .map(PodChange::Deleted)
                    .collect();
                changes.extend(pods.into_iter().map(|pod| self.applied(pod)));
                changes
            }
        }
    }

    fn applied(&mut self, pod: Pod) -> PodChange {
        match self.pods.insert(pod_key(&pod), pod.clone()) {
            Some(old) => PodChange::Updated { old, new: pod },
            None => PodChange::Added(pod),
        }
    }
}
