//! Access to orchestration-platform workloads
//!
//! The bridge realizes every desired LRP as one StatefulSet. This module
//! defines the narrow client seams the translation engine and the informer
//! depend on, plus helpers for reading pod state.

mod kube_client;
mod statefulset;

pub use kube_client::{KubeEventLog, KubeWorkloadClient};
pub use statefulset::{from_statefulset, to_statefulset, workload_name};

use crate::error::WorkloadError;
use crate::models::{Identifier, Lrp, Routes};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Event, Pod};

/// Label carrying the application GUID
pub const LABEL_GUID: &str = "cloudfoundry.org/guid";
/// Label carrying the application version
pub const LABEL_VERSION: &str = "cloudfoundry.org/version";
/// Label marking pods and workloads owned by the bridge
pub const LABEL_SOURCE_TYPE: &str = "cloudfoundry.org/source_type";
pub const SOURCE_TYPE_APP: &str = "APP";

pub const ANNOTATION_PROCESS_GUID: &str = "cloudfoundry.org/process_guid";
pub const ANNOTATION_PROCESS_TYPE: &str = "cloudfoundry.org/process_type";
pub const ANNOTATION_APP_GUID: &str = "cloudfoundry.org/application_id";
pub const ANNOTATION_APP_NAME: &str = "cloudfoundry.org/application_name";
pub const ANNOTATION_SPACE_GUID: &str = "cloudfoundry.org/space_guid";
pub const ANNOTATION_SPACE_NAME: &str = "cloudfoundry.org/space_name";
pub const ANNOTATION_ORG_GUID: &str = "cloudfoundry.org/org_guid";
pub const ANNOTATION_ORG_NAME: &str = "cloudfoundry.org/org_name";
pub const ANNOTATION_LAST_UPDATED: &str = "cloudfoundry.org/last_updated";
pub const ANNOTATION_ROUTES: &str = "cloudfoundry.org/routes";
pub const ANNOTATION_PLACEMENT_TAGS: &str = "cloudfoundry.org/placement_tags";
pub const ANNOTATION_START_TIMEOUT: &str = "cloudfoundry.org/start_timeout_ms";
pub const ANNOTATION_CPU_WEIGHT: &str = "cloudfoundry.org/cpu_weight";
pub const ANNOTATION_HEALTH_CHECK_TYPE: &str = "cloudfoundry.org/health_check_type";
pub const ANNOTATION_SPEC_HASH: &str = "cloudfoundry.org/spec-hash";

/// Name of the application container inside every pod
pub const APP_CONTAINER: &str = "opi";

/// Event reason the platform records when it stops a container on purpose
pub const KILLING_REASON: &str = "Killing";

/// Waiting reason of a container the kubelet keeps restarting
pub const CRASH_LOOP_BACK_OFF: &str = "CrashLoopBackOff";

/// A workload as currently stored on the platform
#[derive(Debug, Clone, PartialEq)]
pub struct Workload {
    /// Platform object name
    pub name: String,
    /// Spec translated back from the platform object
    pub lrp: Lrp,
    /// Fingerprint of the spec that created it; empty once mutated in place
    pub fingerprint: String,
}

/// In-place change to an existing workload
#[derive(Debug, Clone, PartialEq)]
pub struct LrpUpdate {
    pub instances: u32,
    pub routes: Option<Routes>,
    pub last_updated: Option<String>,
}

/// Read/write access to workload resources
#[async_trait]
pub trait WorkloadClient: Send + Sync {
    /// Create the workload for a new LRP
    async fn create(&self, lrp: &Lrp) -> Result<(), WorkloadError>;

    /// Replace the whole spec of an existing workload
    async fn replace(&self, lrp: &Lrp) -> Result<(), WorkloadError>;

    /// Look up the workload for an identifier
    async fn get(&self, identifier: &Identifier) -> Result<Option<Workload>, WorkloadError>;

    /// List every workload managed by the bridge
    async fn list(&self) -> Result<Vec<Workload>, WorkloadError>;

    /// Change instance count and metadata in place
    async fn update(&self, identifier: &Identifier, update: &LrpUpdate) -> Result<(), WorkloadError>;

    /// Remove the workload and its pods
    async fn delete(&self, identifier: &Identifier) -> Result<(), WorkloadError>;

    /// Terminate one replica by ordinal
    async fn delete_instance(&self, identifier: &Identifier, index: u32) -> Result<(), WorkloadError>;

    /// Pods currently owned by the workload for an identifier
    async fn pods(&self, identifier: &Identifier) -> Result<Vec<Pod>, WorkloadError>;

    /// Every application pod in the namespace
    async fn app_pods(&self) -> Result<Vec<Pod>, WorkloadError>;
}

/// Query access to the platform's resource-event log
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Events recorded against a pod
    async fn pod_events(&self, pod: &Pod) -> Result<Vec<Event>, WorkloadError>;
}

/// Error returned when a pod name lacks a trailing ordinal
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("pod name {0:?} does not end with an instance index")]
pub struct AppIndexError(pub String);

/// Parse the replica ordinal from a `<name>-<index>` pod name
pub fn parse_app_index(pod_name: &str) -> Result<u32, AppIndexError> {
    pod_name
        .rsplit_once('-')
        .and_then(|(_, suffix)| suffix.parse::<u32>().ok())
        .ok_or_else(|| AppIndexError(pod_name.to_string()))
}

pub fn pod_name(pod: &Pod) -> &str {
    pod.metadata.name.as_deref().unwrap_or_default()
}

pub fn pod_namespace(pod: &Pod) -> &str {
    pod.metadata.namespace.as_deref().unwrap_or_default()
}

/// Process GUID recorded on the pod, empty when missing
pub fn pod_process_guid(pod: &Pod) -> String {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(ANNOTATION_PROCESS_GUID))
        .cloned()
        .unwrap_or_default()
}

/// Identifier of the application owning a pod, from its labels
pub fn pod_identifier(pod: &Pod) -> Option<Identifier> {
    let labels = pod.metadata.labels.as_ref()?;
    let guid = labels.get(LABEL_GUID)?;
    let version = labels.get(LABEL_VERSION)?;
    Some(Identifier::new(guid, version))
}

/// Whether the pod reports `Ready=True`
pub fn is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|condition| condition.type_ == "Ready" && condition.status == "True")
        })
        .unwrap_or(false)
}

/// Whether the event log shows the pod was stopped intentionally
pub fn is_stopped(events: &[Event]) -> bool {
    events
        .iter()
        .any(|event| event.reason.as_deref() == Some(KILLING_REASON))
}
