//! Crash classification of observed pods

use crate::models::CrashReport;
use crate::workload::{
    is_stopped, parse_app_index, pod_name, pod_process_guid, EventLog, CRASH_LOOP_BACK_OFF,
};
use k8s_openapi::api::core::v1::{ContainerStateTerminated, ContainerStatus, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use std::sync::Arc;
use tracing::error;

fn started_at(terminated: &ContainerStateTerminated) -> i64 {
    terminated
        .started_at
        .as_ref()
        .map(|Time(time)| time.timestamp())
        .unwrap_or_default()
}

fn restart_count(status: &ContainerStatus) -> u32 {
    u32::try_from(status.restart_count).unwrap_or_default()
}

/// First container that exited with a non-zero code
fn terminated_container(statuses: &[ContainerStatus]) -> Option<(&ContainerStatus, &ContainerStateTerminated)> {
    statuses.iter().find_map(|status| {
        let terminated = status.state.as_ref()?.terminated.as_ref()?;
        (terminated.exit_code != 0).then_some((status, terminated))
    })
}

/// First container waiting in a crash loop
fn crash_looping_container(statuses: &[ContainerStatus]) -> Option<&ContainerStatus> {
    statuses.iter().find(|status| {
        status
            .state
            .as_ref()
            .and_then(|state| state.waiting.as_ref())
            .and_then(|waiting| waiting.reason.as_deref())
            == Some(CRASH_LOOP_BACK_OFF)
    })
}

/// Decides whether a pod snapshot describes an application crash
///
/// Stateless: every call inspects only the pod it is given and, for
/// terminated containers, the pod's event log.
#[derive(Clone)]
pub struct CrashReportGenerator {
    events: Arc<dyn EventLog>,
}

impl CrashReportGenerator {
    pub fn new(events: Arc<dyn EventLog>) -> Self {
        Self { events }
    }

    pub async fn generate(&self, pod: &Pod) -> Option<CrashReport> {
        let statuses = pod
            .status
            .as_ref()
            .and_then(|status| status.container_statuses.as_deref())
            .unwrap_or_default();
        if statuses.is_empty() {
            return None;
        }

        let name = pod_name(pod);
        let guid = pod_process_guid(pod);
        let index = match parse_app_index(name) {
            Ok(index) => index,
            Err(e) => {
                error!(
                    event = "failed-to-parse-app-index",
                    pod_name = %name,
                    guid = %guid,
                    error = %e,
                    "Cannot determine instance index"
                );
                return None;
            }
        };

        let report = |reason: String, exit_status: i32, exit_description: String, crash_timestamp: i64, crash_count: u32| {
            CrashReport {
                process_guid: guid.clone(),
                reason,
                instance: name.to_string(),
                index,
                exit_status,
                exit_description,
                crash_count,
                crash_timestamp,
            }
        };

        if let Some((status, terminated)) = terminated_container(statuses) {
            let events = match self.events.pod_events(pod).await {
                Ok(events) => events,
                Err(e) => {
                    error!(
                        event = "failed-to-get-k8s-events",
                        pod_name = %name,
                        guid = %guid,
                        error = %e,
                        "Cannot read pod events"
                    );
                    return None;
                }
            };
            if is_stopped(&events) {
                return None;
            }

            let reason = terminated.reason.clone().unwrap_or_default();
            return Some(report(
                reason.clone(),
                terminated.exit_code,
                reason,
                started_at(terminated),
                restart_count(status),
            ));
        }

        let status = crash_looping_container(statuses)?;
        let last = status
            .last_state
            .as_ref()
            .and_then(|state| state.terminated.as_ref());

        Some(report(
            CRASH_LOOP_BACK_OFF.to_string(),
            last.map(|terminated| terminated.exit_code).unwrap_or_default(),
            last.and_then(|terminated| terminated.reason.clone())
                .unwrap_or_default(),
            last.map(started_at).unwrap_or_default(),
            restart_count(status),
        ))
    }
}
