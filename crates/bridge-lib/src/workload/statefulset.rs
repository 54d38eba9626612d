//! Translation between LRPs and StatefulSets

use super::{
    Workload, ANNOTATION_APP_GUID, ANNOTATION_APP_NAME, ANNOTATION_CPU_WEIGHT,
    ANNOTATION_HEALTH_CHECK_TYPE, ANNOTATION_LAST_UPDATED, ANNOTATION_ORG_GUID,
    ANNOTATION_ORG_NAME, ANNOTATION_PLACEMENT_TAGS, ANNOTATION_PROCESS_GUID,
    ANNOTATION_PROCESS_TYPE, ANNOTATION_ROUTES, ANNOTATION_SPACE_GUID, ANNOTATION_SPACE_NAME,
    ANNOTATION_SPEC_HASH, ANNOTATION_START_TIMEOUT, APP_CONTAINER, LABEL_GUID,
    LABEL_SOURCE_TYPE, LABEL_VERSION, SOURCE_TYPE_APP,
};
use crate::error::WorkloadError;
use crate::models::{
    HealthCheck, HealthCheckType, Identifier, Lrp, Routes, VolumeMount, DEFAULT_PORT,
};
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, HTTPGetAction, ObjectFieldSelector,
    PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec, Probe, ResourceRequirements,
    TCPSocketAction, Volume, VolumeMount as K8sVolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Longest slice of app or space name kept in a workload name
const MAX_NAME_PART: usize = 40;

/// Length of the identifier digest suffix
const NAME_DIGEST_LEN: usize = 10;

/// Environment variables the bridge injects and strips on the way back
const INJECTED_ENV: &[&str] = &["PORT", "CF_INSTANCE_IP"];

/// Platform object name for an LRP: `<app>-<space>-<digest>`
pub fn workload_name(lrp: &Lrp) -> String {
    let digest = hex::encode(Sha256::digest(lrp.identifier.to_string().as_bytes()));
    let mut parts: Vec<String> = [&lrp.app_name, &lrp.space_name]
        .iter()
        .map(|part| sanitize(part))
        .filter(|part| !part.is_empty())
        .collect();
    parts.push(digest.chars().take(NAME_DIGEST_LEN).collect());
    parts.join("-")
}

fn sanitize(part: &str) -> String {
    let cleaned: String = part
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_lowercase() || c.is_ascii_digit() { c } else { '-' })
        .take(MAX_NAME_PART)
        .collect();
    cleaned.trim_matches('-').to_string()
}

/// Labels selecting the pods of one application version
pub(crate) fn selector_labels(identifier: &Identifier) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_GUID.to_string(), identifier.guid.clone()),
        (LABEL_VERSION.to_string(), identifier.version.clone()),
        (LABEL_SOURCE_TYPE.to_string(), SOURCE_TYPE_APP.to_string()),
    ])
}

fn megabytes(value: i64) -> Quantity {
    Quantity(format!("{}M", value))
}

fn parse_megabytes(quantity: Option<&Quantity>) -> i64 {
    quantity
        .and_then(|q| q.0.strip_suffix('M'))
        .and_then(|value| value.parse().ok())
        .unwrap_or(0)
}

fn probe_for(lrp: &Lrp) -> Option<Probe> {
    let port = IntOrString::Int(lrp.ports.first().copied().unwrap_or(DEFAULT_PORT));
    let timeout_seconds = i32::try_from(lrp.health_check.timeout_ms.div_ceil(1000))
        .unwrap_or(i32::MAX)
        .max(1);

    let probe = Probe {
        timeout_seconds: Some(timeout_seconds),
        ..Default::default()
    };

    match lrp.health_check.kind {
        HealthCheckType::Http => Some(Probe {
            http_get: Some(HTTPGetAction {
                path: Some(lrp.health_check.endpoint.clone()),
                port,
                ..Default::default()
            }),
            ..probe
        }),
        HealthCheckType::Port => Some(Probe {
            tcp_socket: Some(TCPSocketAction { host: None, port }),
            ..probe
        }),
        HealthCheckType::Process | HealthCheckType::None => None,
    }
}

fn liveness_probe_for(lrp: &Lrp) -> Option<Probe> {
    let failure_threshold = i32::try_from(lrp.start_timeout_ms / 1000)
        .unwrap_or(i32::MAX)
        .max(1);
    probe_for(lrp).map(|probe| Probe {
        failure_threshold: Some(failure_threshold),
        ..probe
    })
}

fn container_env(lrp: &Lrp) -> Vec<EnvVar> {
    let port = lrp.ports.first().copied().unwrap_or(DEFAULT_PORT);
    let mut env: Vec<EnvVar> = lrp
        .env
        .iter()
        .filter(|(name, _)| !INJECTED_ENV.contains(&name.as_str()))
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            value_from: None,
        })
        .collect();

    env.push(EnvVar {
        name: "PORT".to_string(),
        value: Some(port.to_string()),
        value_from: None,
    });
    env.push(EnvVar {
        name: "CF_INSTANCE_IP".to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                api_version: None,
                field_path: "status.podIP".to_string(),
            }),
            ..Default::default()
        }),
    });
    env
}

fn volume_name(index: usize) -> String {
    format!("volume-{}", index)
}

/// Build the StatefulSet realizing an LRP
pub fn to_statefulset(lrp: &Lrp, namespace: &str) -> StatefulSet {
    let name = workload_name(lrp);
    let labels = selector_labels(&lrp.identifier);

    let routes = serde_json::to_string(&lrp.routes).unwrap_or_default();
    let placement_tags = serde_json::to_string(&lrp.placement_tags).unwrap_or_default();
    let annotations = BTreeMap::from([
        (ANNOTATION_PROCESS_GUID.to_string(), lrp.process_guid.clone()),
        (ANNOTATION_PROCESS_TYPE.to_string(), lrp.process_type.clone()),
        (ANNOTATION_APP_GUID.to_string(), lrp.app_guid.clone()),
        (ANNOTATION_APP_NAME.to_string(), lrp.app_name.clone()),
        (ANNOTATION_SPACE_GUID.to_string(), lrp.space_guid.clone()),
        (ANNOTATION_SPACE_NAME.to_string(), lrp.space_name.clone()),
        (ANNOTATION_ORG_GUID.to_string(), lrp.org_guid.clone()),
        (ANNOTATION_ORG_NAME.to_string(), lrp.org_name.clone()),
        (ANNOTATION_LAST_UPDATED.to_string(), lrp.last_updated.clone()),
        (ANNOTATION_ROUTES.to_string(), routes),
        (ANNOTATION_PLACEMENT_TAGS.to_string(), placement_tags),
        (ANNOTATION_START_TIMEOUT.to_string(), lrp.start_timeout_ms.to_string()),
        (ANNOTATION_CPU_WEIGHT.to_string(), lrp.cpu_weight.to_string()),
        (
            ANNOTATION_HEALTH_CHECK_TYPE.to_string(),
            lrp.health_check.kind.as_str().to_string(),
        ),
        (ANNOTATION_SPEC_HASH.to_string(), lrp.fingerprint()),
    ]);

    let resources = ResourceRequirements {
        limits: Some(BTreeMap::from([
            ("memory".to_string(), megabytes(lrp.memory_mb)),
            ("ephemeral-storage".to_string(), megabytes(lrp.disk_mb)),
        ])),
        requests: Some(BTreeMap::from([
            ("memory".to_string(), megabytes(lrp.memory_mb)),
            ("cpu".to_string(), Quantity(format!("{}m", lrp.cpu_weight))),
        ])),
        ..Default::default()
    };

    let ports = lrp
        .ports
        .iter()
        .map(|port| ContainerPort {
            container_port: *port,
            ..Default::default()
        })
        .collect();

    let volume_mounts: Vec<K8sVolumeMount> = lrp
        .volume_mounts
        .iter()
        .enumerate()
        .map(|(index, mount)| K8sVolumeMount {
            name: volume_name(index),
            mount_path: mount.mount_dir.clone(),
            ..Default::default()
        })
        .collect();

    let volumes: Vec<Volume> = lrp
        .volume_mounts
        .iter()
        .enumerate()
        .map(|(index, mount)| Volume {
            name: volume_name(index),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: mount.volume_id.clone(),
                read_only: None,
            }),
            ..Default::default()
        })
        .collect();

    let container = Container {
        name: APP_CONTAINER.to_string(),
        image: Some(lrp.image.clone()),
        command: (!lrp.command.is_empty()).then(|| lrp.command.clone()),
        env: Some(container_env(lrp)),
        ports: Some(ports),
        resources: Some(resources),
        readiness_probe: probe_for(lrp),
        liveness_probe: liveness_probe_for(lrp),
        volume_mounts: (!volume_mounts.is_empty()).then_some(volume_mounts),
        ..Default::default()
    };

    let pod_annotations = BTreeMap::from([(
        ANNOTATION_PROCESS_GUID.to_string(),
        lrp.process_guid.clone(),
    )]);

    StatefulSet {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(i32::try_from(lrp.target_instances).unwrap_or(i32::MAX)),
            pod_management_policy: Some("Parallel".to_string()),
            service_name: name,
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: Some(pod_annotations),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: (!volumes.is_empty()).then_some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

/// Read an LRP back from the StatefulSet realizing it
pub fn from_statefulset(statefulset: &StatefulSet) -> Result<Workload, WorkloadError> {
    let name = statefulset.metadata.name.clone().unwrap_or_default();
    let conversion_error = |reason: &str| WorkloadError::Conversion {
        name: name.clone(),
        reason: reason.to_string(),
    };

    let labels = statefulset
        .metadata
        .labels
        .as_ref()
        .ok_or_else(|| conversion_error("missing labels"))?;
    let guid = labels
        .get(LABEL_GUID)
        .ok_or_else(|| conversion_error("missing guid label"))?;
    let version = labels
        .get(LABEL_VERSION)
        .ok_or_else(|| conversion_error("missing version label"))?;

    let empty = BTreeMap::new();
    let annotations = statefulset.metadata.annotations.as_ref().unwrap_or(&empty);
    let annotation = |key: &str| annotations.get(key).cloned().unwrap_or_default();

    let spec = statefulset
        .spec
        .as_ref()
        .ok_or_else(|| conversion_error("missing spec"))?;
    let pod_spec = spec
        .template
        .spec
        .as_ref()
        .ok_or_else(|| conversion_error("missing pod spec"))?;
    let container = pod_spec
        .containers
        .iter()
        .find(|c| c.name == APP_CONTAINER)
        .ok_or_else(|| conversion_error("missing application container"))?;

    let routes: Routes = serde_json::from_str(&annotation(ANNOTATION_ROUTES)).unwrap_or_default();
    let placement_tags: Vec<String> =
        serde_json::from_str(&annotation(ANNOTATION_PLACEMENT_TAGS)).unwrap_or_default();

    let env = container
        .env
        .iter()
        .flatten()
        .filter(|var| !INJECTED_ENV.contains(&var.name.as_str()))
        .filter_map(|var| var.value.clone().map(|value| (var.name.clone(), value)))
        .collect();

    let limits = container.resources.as_ref().and_then(|r| r.limits.as_ref());
    let memory_mb = parse_megabytes(limits.and_then(|l| l.get("memory")));
    let disk_mb = parse_megabytes(limits.and_then(|l| l.get("ephemeral-storage")));

    let ports = container
        .ports
        .iter()
        .flatten()
        .map(|port| port.container_port)
        .collect();

    let readiness = container.readiness_probe.as_ref();
    let kind = HealthCheckType::parse(&annotation(ANNOTATION_HEALTH_CHECK_TYPE))
        .unwrap_or(HealthCheckType::None);
    let health_check = HealthCheck {
        kind,
        endpoint: readiness
            .and_then(|probe| probe.http_get.as_ref())
            .and_then(|get| get.path.clone())
            .unwrap_or_default(),
        timeout_ms: readiness
            .and_then(|probe| probe.timeout_seconds)
            .map(|secs| u64::try_from(secs).unwrap_or(0) * 1000)
            .unwrap_or(0),
    };

    let claims: BTreeMap<&str, &str> = pod_spec
        .volumes
        .iter()
        .flatten()
        .filter_map(|volume| {
            volume
                .persistent_volume_claim
                .as_ref()
                .map(|claim| (volume.name.as_str(), claim.claim_name.as_str()))
        })
        .collect();
    let volume_mounts = container
        .volume_mounts
        .iter()
        .flatten()
        .filter_map(|mount| {
            claims.get(mount.name.as_str()).map(|claim| VolumeMount {
                mount_dir: mount.mount_path.clone(),
                volume_id: claim.to_string(),
            })
        })
        .collect();

    let lrp = Lrp {
        identifier: Identifier::new(guid, version),
        process_guid: annotation(ANNOTATION_PROCESS_GUID),
        process_type: annotation(ANNOTATION_PROCESS_TYPE),
        app_guid: annotation(ANNOTATION_APP_GUID),
        app_name: annotation(ANNOTATION_APP_NAME),
        space_guid: annotation(ANNOTATION_SPACE_GUID),
        space_name: annotation(ANNOTATION_SPACE_NAME),
        org_guid: annotation(ANNOTATION_ORG_GUID),
        org_name: annotation(ANNOTATION_ORG_NAME),
        image: container.image.clone().unwrap_or_default(),
        command: container.command.clone().unwrap_or_default(),
        env,
        target_instances: spec
            .replicas
            .and_then(|replicas| u32::try_from(replicas).ok())
            .unwrap_or(0),
        memory_mb,
        disk_mb,
        cpu_weight: annotation(ANNOTATION_CPU_WEIGHT).parse().unwrap_or(0),
        health_check,
        start_timeout_ms: annotation(ANNOTATION_START_TIMEOUT).parse().unwrap_or(0),
        ports,
        routes,
        placement_tags,
        volume_mounts,
        last_updated: annotation(ANNOTATION_LAST_UPDATED),
    };

    Ok(Workload {
        name,
        lrp,
        fingerprint: annotation(ANNOTATION_SPEC_HASH),
    })
}
