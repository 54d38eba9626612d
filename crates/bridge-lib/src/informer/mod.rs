//! Event path: pod observation, crash reporting and route publishing
//!
//! This module provides:
//! - The instance change informer turning watch events into pod changes
//! - The pod update handler reacting to each change
//! - Crash classification of pods
//! - Periodic route re-registration

mod collector;
mod crash;
mod instance;
mod pod_update;
mod routes;

pub use collector::RouteCollector;
pub use crash::CrashReportGenerator;
pub use instance::InstanceChangeInformer;
pub use pod_update::PodUpdateHandler;
pub use routes::{is_routable, route_messages, RoutePublisher};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;

/// One observed change of an application pod
#[derive(Debug, Clone, PartialEq)]
pub enum PodChange {
    Added(Pod),
    Updated { old: Pod, new: Pod },
    Deleted(Pod),
}

impl PodChange {
    pub fn kind(&self) -> &'static str {
        match self {
            PodChange::Added(_) => "added",
            PodChange::Updated { .. } => "updated",
            PodChange::Deleted(_) => "deleted",
        }
    }
}

/// Receiver of pod changes; must tolerate redelivery
#[async_trait]
pub trait PodEventHandler: Send + Sync {
    async fn handle(&self, change: PodChange);
}
