//! Pod to instance derivation

use crate::error::WorkloadError;
use crate::models::{Instance, InstanceState};
use crate::workload::{is_ready, parse_app_index, pod_name, EventLog, CRASH_LOOP_BACK_OFF};
use k8s_openapi::api::core::v1::{ContainerStatus, Pod, PodStatus};
use tracing::warn;

const FAILED_SCHEDULING: &str = "FailedScheduling";
const INSUFFICIENT_MEMORY: &str = "Insufficient memory";

/// Placement error reported when the scheduler ran out of memory
pub const INSUFFICIENT_MEMORY_ERROR: &str = "Insufficient resources: memory";

fn has_crashed(status: &ContainerStatus) -> bool {
    let Some(state) = status.state.as_ref() else {
        return false;
    };

    let crash_looping = state
        .waiting
        .as_ref()
        .and_then(|waiting| waiting.reason.as_deref())
        == Some(CRASH_LOOP_BACK_OFF);
    let failed_exit = state
        .terminated
        .as_ref()
        .map(|terminated| terminated.exit_code != 0)
        .unwrap_or(false);

    crash_looping || failed_exit
}

fn unscheduled_message(status: &PodStatus) -> Option<String> {
    status
        .conditions
        .as_ref()?
        .iter()
        .find(|condition| condition.type_ == "PodScheduled" && condition.status == "False")
        .map(|condition| condition.message.clone().unwrap_or_default())
}

/// Lifecycle state of the replica a pod runs
pub fn pod_state(pod: &Pod) -> InstanceState {
    let Some(status) = pod.status.as_ref() else {
        return InstanceState::Unknown;
    };

    let statuses = status.container_statuses.as_deref().unwrap_or_default();
    if statuses.iter().any(has_crashed) {
        return InstanceState::Crashed;
    }

    match status.phase.as_deref() {
        Some("Pending") if unscheduled_message(status).is_some() => InstanceState::Unclaimed,
        Some("Pending") => InstanceState::Claimed,
        Some("Running") if is_ready(pod) => InstanceState::Running,
        Some("Running") => InstanceState::Claimed,
        Some("Failed") => InstanceState::Crashed,
        _ => InstanceState::Unknown,
    }
}

/// Seconds since the epoch at which the pod entered its current state
pub fn pod_since(pod: &Pod) -> i64 {
    let status = pod.status.as_ref();
    let ready_since = status
        .and_then(|status| status.conditions.as_ref())
        .and_then(|conditions| {
            conditions
                .iter()
                .find(|condition| condition.type_ == "Ready" && condition.status == "True")
        })
        .and_then(|condition| condition.last_transition_time.as_ref());

    ready_since
        .or_else(|| status.and_then(|status| status.start_time.as_ref()))
        .or(pod.metadata.creation_timestamp.as_ref())
        .map(|time| time.0.timestamp())
        .unwrap_or_default()
}

async fn placement_error(pod: &Pod, events: &dyn EventLog) -> Result<String, WorkloadError> {
    let message = pod
        .status
        .as_ref()
        .and_then(unscheduled_message)
        .unwrap_or_default();

    let events = events.pod_events(pod).await?;
    let out_of_memory = events.iter().any(|event| {
        event.reason.as_deref() == Some(FAILED_SCHEDULING)
            && event
                .message
                .as_deref()
                .map(|message| message.contains(INSUFFICIENT_MEMORY))
                .unwrap_or(false)
    });

    if out_of_memory {
        Ok(INSUFFICIENT_MEMORY_ERROR.to_string())
    } else {
        Ok(message)
    }
}

/// Derive instances from pods, keeping partial results on event-query failure
///
/// The first event-query error is returned alongside every instance that
/// could be derived. Pods whose names carry no ordinal are skipped.
pub async fn derive_instances(
    pods: &[Pod],
    events: &dyn EventLog,
) -> (Vec<Instance>, Option<WorkloadError>) {
    let mut instances = Vec::with_capacity(pods.len());
    let mut first_error = None;

    for pod in pods {
        let index = match parse_app_index(pod_name(pod)) {
            Ok(index) => index,
            Err(e) => {
                warn!(event = "parsing-instance-index-failed", pod_name = %pod_name(pod), error = %e);
                continue;
            }
        };

        let state = pod_state(pod);
        let placement_error = if state == InstanceState::Unclaimed {
            match placement_error(pod, events).await {
                Ok(message) => Some(message),
                Err(e) => {
                    first_error.get_or_insert(e);
                    pod.status.as_ref().and_then(unscheduled_message)
                }
            }
        } else {
            None
        };

        instances.push(Instance {
            index,
            since: pod_since(pod),
            state,
            placement_error,
        });
    }

    instances.sort_by_key(|instance| instance.index);
    (instances, first_error)
}
