//! Core data models for the LRP bridge
//!
//! Wire types exchanged with the platform controller, plus the translated
//! form of a long-running process that the workload layer understands.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Domain reported for every desired LRP this bridge manages
pub const CF_APPS_DOMAIN: &str = "cf-apps";

/// Default container port when a request carries none
pub const DEFAULT_PORT: i32 = 8080;

/// Names one desired application version
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identifier {
    pub guid: String,
    pub version: String,
}

impl Identifier {
    pub fn new(guid: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            guid: guid.into(),
            version: version.into(),
        }
    }

    /// Process GUID as the controller knows it: `<guid>-<version>`
    pub fn process_guid(&self) -> String {
        format!("{}-{}", self.guid, self.version)
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.guid, self.version)
    }
}

/// Full desired-state specification of an application process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesireLrpRequest {
    pub guid: String,
    pub process_guid: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub process_type: String,
    #[serde(default)]
    pub app_guid: String,
    #[serde(default)]
    pub app_name: String,
    #[serde(default)]
    pub space_guid: String,
    #[serde(default)]
    pub space_name: String,
    #[serde(default)]
    pub organization_guid: String,
    #[serde(default)]
    pub organization_name: String,
    pub lifecycle: Lifecycle,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(rename = "instances", default)]
    pub num_instances: u32,
    #[serde(default)]
    pub memory_mb: i64,
    #[serde(default)]
    pub disk_mb: i64,
    #[serde(default)]
    pub cpu_weight: u32,
    #[serde(default)]
    pub health_check_type: String,
    #[serde(default)]
    pub health_check_http_endpoint: String,
    #[serde(default)]
    pub health_check_timeout_ms: u64,
    #[serde(default)]
    pub start_timeout_ms: u64,
    /// Opaque to the bridge; kept in arrival order
    #[serde(default)]
    pub egress_rules: Vec<serde_json::Value>,
    #[serde(default)]
    pub placement_tags: Vec<String>,
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMount>,
    #[serde(default)]
    pub ports: Vec<i32>,
    #[serde(default)]
    pub routes: Routes,
    #[serde(default)]
    pub last_updated: String,
    /// Raw request body, filled in by the HTTP layer
    #[serde(skip)]
    pub lrp: String,
}

/// How the application image is produced
///
/// On the wire this is an object with exactly one of `buildpack_lifecycle`
/// or `docker_lifecycle` set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "LifecycleEnvelope", into = "LifecycleEnvelope")]
pub enum Lifecycle {
    Buildpack(BuildpackLifecycle),
    Docker(DockerLifecycle),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildpackLifecycle {
    #[serde(default)]
    pub droplet_guid: String,
    #[serde(default)]
    pub droplet_hash: String,
    #[serde(default)]
    pub start_command: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerLifecycle {
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LifecycleEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    buildpack_lifecycle: Option<BuildpackLifecycle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    docker_lifecycle: Option<DockerLifecycle>,
}

impl TryFrom<LifecycleEnvelope> for Lifecycle {
    type Error = String;

    fn try_from(envelope: LifecycleEnvelope) -> Result<Self, Self::Error> {
        match (envelope.buildpack_lifecycle, envelope.docker_lifecycle) {
            (Some(buildpack), None) => Ok(Lifecycle::Buildpack(buildpack)),
            (None, Some(docker)) => Ok(Lifecycle::Docker(docker)),
            (None, None) => Err("lifecycle has no populated variant".to_string()),
            (Some(_), Some(_)) => Err("lifecycle has more than one populated variant".to_string()),
        }
    }
}

impl From<Lifecycle> for LifecycleEnvelope {
    fn from(lifecycle: Lifecycle) -> Self {
        match lifecycle {
            Lifecycle::Buildpack(buildpack) => Self {
                buildpack_lifecycle: Some(buildpack),
                docker_lifecycle: None,
            },
            Lifecycle::Docker(docker) => Self {
                buildpack_lifecycle: None,
                docker_lifecycle: Some(docker),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub mount_dir: String,
    pub volume_id: String,
}

/// Router configuration attached to an application
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Routes {
    #[serde(rename = "cf-router", default)]
    pub cf_router: Vec<CfRoute>,
}

impl Routes {
    pub fn is_empty(&self) -> bool {
        self.cf_router.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CfRoute {
    #[serde(default)]
    pub hostnames: Vec<String>,
    pub port: u32,
}

/// Change request for an existing application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRequest {
    #[serde(default)]
    pub guid: String,
    #[serde(default)]
    pub version: String,
    pub update: DesiredLrpUpdate,
}

impl UpdateRequest {
    pub fn identifier(&self) -> Identifier {
        Identifier::new(&self.guid, &self.version)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredLrpUpdate {
    pub instances: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routes: Option<Routes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation: Option<String>,
}

/// Observed state of one replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstanceState {
    Running,
    Claimed,
    Unclaimed,
    Crashed,
    Unknown,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceState::Running => write!(f, "RUNNING"),
            InstanceState::Claimed => write!(f, "CLAIMED"),
            InstanceState::Unclaimed => write!(f, "UNCLAIMED"),
            InstanceState::Crashed => write!(f, "CRASHED"),
            InstanceState::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub index: u32,
    pub since: i64,
    pub state: InstanceState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placement_error: Option<String>,
}

/// A crash observed on one replica, addressed to the platform controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashReport {
    pub process_guid: String,
    pub reason: String,
    pub instance: String,
    pub index: u32,
    pub exit_status: i32,
    pub exit_description: String,
    pub crash_count: u32,
    pub crash_timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredLrpKey {
    pub process_guid: String,
    pub domain: String,
    pub log_guid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredLrpResource {
    pub memory_mb: i64,
    pub disk_mb: i64,
}

/// Summary record returned by List
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulingInfo {
    pub desired_lrp_key: DesiredLrpKey,
    pub annotation: String,
    pub instances: u32,
    pub desired_lrp_resource: DesiredLrpResource,
    pub routes: Routes,
    #[serde(default)]
    pub placement_tags: Vec<String>,
}

/// Full desired-LRP representation returned by GetApp
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredLrp {
    pub process_guid: String,
    pub domain: String,
    pub log_guid: String,
    pub instances: u32,
    pub annotation: String,
    pub routes: Routes,
    pub memory_mb: i64,
    pub disk_mb: i64,
    pub cpu_weight: u32,
    pub ports: Vec<i32>,
    pub start_timeout_ms: u64,
    pub placement_tags: Vec<String>,
    pub health_check_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthCheckType {
    Http,
    Port,
    Process,
    None,
}

impl HealthCheckType {
    /// Parse the controller's health check type; empty means none
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "http" => Some(HealthCheckType::Http),
            "port" => Some(HealthCheckType::Port),
            "process" => Some(HealthCheckType::Process),
            "" | "none" => Some(HealthCheckType::None),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthCheckType::Http => "http",
            HealthCheckType::Port => "port",
            HealthCheckType::Process => "process",
            HealthCheckType::None => "none",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub kind: HealthCheckType,
    pub endpoint: String,
    pub timeout_ms: u64,
}

/// A desired LRP translated into workload terms
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lrp {
    pub identifier: Identifier,
    pub process_guid: String,
    pub process_type: String,
    pub app_guid: String,
    pub app_name: String,
    pub space_guid: String,
    pub space_name: String,
    pub org_guid: String,
    pub org_name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub target_instances: u32,
    pub memory_mb: i64,
    pub disk_mb: i64,
    pub cpu_weight: u32,
    pub health_check: HealthCheck,
    pub start_timeout_ms: u64,
    pub ports: Vec<i32>,
    pub routes: Routes,
    pub placement_tags: Vec<String>,
    pub volume_mounts: Vec<VolumeMount>,
    pub last_updated: String,
}

impl Lrp {
    /// Stable fingerprint of the whole spec, used to detect re-desires
    pub fn fingerprint(&self) -> String {
        // BTreeMap keeps env ordering stable, so the JSON form is canonical
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&canonical))
    }

    pub fn scheduling_info(&self) -> SchedulingInfo {
        SchedulingInfo {
            desired_lrp_key: DesiredLrpKey {
                process_guid: self.process_guid.clone(),
                domain: CF_APPS_DOMAIN.to_string(),
                log_guid: self.app_guid.clone(),
            },
            annotation: self.last_updated.clone(),
            instances: self.target_instances,
            desired_lrp_resource: DesiredLrpResource {
                memory_mb: self.memory_mb,
                disk_mb: self.disk_mb,
            },
            routes: self.routes.clone(),
            placement_tags: self.placement_tags.clone(),
        }
    }

    pub fn desired_lrp(&self) -> DesiredLrp {
        DesiredLrp {
            process_guid: self.process_guid.clone(),
            domain: CF_APPS_DOMAIN.to_string(),
            log_guid: self.app_guid.clone(),
            instances: self.target_instances,
            annotation: self.last_updated.clone(),
            routes: self.routes.clone(),
            memory_mb: self.memory_mb,
            disk_mb: self.disk_mb,
            cpu_weight: self.cpu_weight,
            ports: self.ports.clone(),
            start_timeout_ms: self.start_timeout_ms,
            placement_tags: self.placement_tags.clone(),
            health_check_type: self.health_check.kind.as_str().to_string(),
        }
    }
}

/// Route announcement kind on the message bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteAction {
    Register,
    Unregister,
}

impl RouteAction {
    /// Message-bus subject for this action
    pub fn subject(&self) -> &'static str {
        match self {
            RouteAction::Register => "router.register",
            RouteAction::Unregister => "router.unregister",
        }
    }
}

impl fmt::Display for RouteAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteAction::Register => write!(f, "register"),
            RouteAction::Unregister => write!(f, "unregister"),
        }
    }
}

/// Declarative route registration for one pod and port
///
/// Only the registration body goes on the wire; the action selects the subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteMessage {
    #[serde(skip)]
    pub action: RouteAction,
    pub host: String,
    pub port: u32,
    pub uris: Vec<String>,
    pub app: String,
    pub private_instance_id: String,
    pub private_instance_index: String,
}
