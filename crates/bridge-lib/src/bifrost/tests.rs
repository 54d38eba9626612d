use super::*;
use crate::models::{
    CfRoute, DesiredLrpUpdate, DockerLifecycle, InstanceState, Lifecycle, Routes,
};
use crate::test_support::{FakeEvents, FakeWorkloads};
use crate::workload::{LABEL_GUID, LABEL_VERSION};
use k8s_openapi::api::core::v1::{Pod, PodCondition, PodStatus};
use kube::api::ObjectMeta;
use std::collections::BTreeMap;

fn desire_request(guid: &str, version: &str) -> DesireLrpRequest {
    DesireLrpRequest {
        guid: guid.to_string(),
        process_guid: format!("{}-{}", guid, version),
        version: version.to_string(),
        process_type: "web".to_string(),
        app_guid: "app-guid".to_string(),
        app_name: "dora".to_string(),
        space_guid: "space-guid".to_string(),
        space_name: "dev".to_string(),
        organization_guid: "org-guid".to_string(),
        organization_name: "org".to_string(),
        lifecycle: Lifecycle::Docker(DockerLifecycle {
            image: "eirini/dorini".to_string(),
            command: vec![],
        }),
        environment: BTreeMap::new(),
        num_instances: 2,
        memory_mb: 256,
        disk_mb: 512,
        cpu_weight: 0,
        health_check_type: "port".to_string(),
        health_check_http_endpoint: String::new(),
        health_check_timeout_ms: 0,
        start_timeout_ms: 60_000,
        egress_rules: vec![],
        placement_tags: vec![],
        volume_mounts: vec![],
        ports: vec![8080],
        routes: Routes::default(),
        last_updated: "1529073295.9".to_string(),
        lrp: String::new(),
    }
}

fn engine(workloads: Arc<FakeWorkloads>, events: Arc<FakeEvents>) -> BifrostEngine {
    BifrostEngine::new(Converter::new("registry.local"), workloads, events)
}

fn no_events() -> Arc<FakeEvents> {
    Arc::new(FakeEvents::with_events(vec![]))
}

fn converted(request: &DesireLrpRequest) -> crate::models::Lrp {
    Converter::new("registry.local").convert(request).unwrap()
}

fn app_pod(identifier: &Identifier, index: u32, phase: &str, ready: bool) -> Pod {
    let labels = BTreeMap::from([
        (LABEL_GUID.to_string(), identifier.guid.clone()),
        (LABEL_VERSION.to_string(), identifier.version.clone()),
    ]);
    let conditions = if ready {
        vec![PodCondition {
            type_: "Ready".to_string(),
            status: "True".to_string(),
            ..Default::default()
        }]
    } else {
        vec![PodCondition {
            type_: "PodScheduled".to_string(),
            status: "False".to_string(),
            message: Some("0/1 nodes are available".to_string()),
            ..Default::default()
        }]
    };

    Pod {
        metadata: ObjectMeta {
            name: Some(format!("dora-dev-abc-{}", index)),
            labels: Some(labels),
            ..Default::default()
        },
        status: Some(PodStatus {
            phase: Some(phase.to_string()),
            conditions: Some(conditions),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_transfer_creates_missing_workload() {
    let workloads = Arc::new(FakeWorkloads::default());
    let bifrost = engine(workloads.clone(), no_events());

    bifrost.transfer(desire_request("app", "v1")).await.unwrap();

    let stored = workloads.workload(&Identifier::new("app", "v1")).unwrap();
    assert_eq!(stored.lrp.target_instances, 2);
    assert!(workloads.calls().contains(&"create app-v1".to_string()));
}

#[tokio::test]
async fn test_transfer_of_identical_desire_is_a_no_op() {
    let request = desire_request("app", "v1");
    let workloads = Arc::new(FakeWorkloads::with_lrp(&converted(&request)));
    let bifrost = engine(workloads.clone(), no_events());

    bifrost.transfer(request).await.unwrap();

    assert_eq!(workloads.calls(), vec!["get app-v1".to_string()]);
}

#[tokio::test]
async fn test_transfer_of_changed_desire_replaces_spec() {
    let original = desire_request("app", "v1");
    let workloads = Arc::new(FakeWorkloads::with_lrp(&converted(&original)));
    let bifrost = engine(workloads.clone(), no_events());

    let mut changed = original.clone();
    changed.memory_mb = 1024;
    bifrost.transfer(changed).await.unwrap();

    assert!(workloads.calls().contains(&"replace app-v1".to_string()));
    let stored = workloads.workload(&Identifier::new("app", "v1")).unwrap();
    assert_eq!(stored.lrp.memory_mb, 1024);
}

#[tokio::test]
async fn test_transfer_rejects_invalid_request_before_touching_workloads() {
    let workloads = Arc::new(FakeWorkloads::default());
    let bifrost = engine(workloads.clone(), no_events());

    let mut request = desire_request("app", "v1");
    request.health_check_type = "telepathy".to_string();

    let result = bifrost.transfer(request).await;
    assert!(matches!(result, Err(BifrostError::InvalidRequest(_))));
    assert!(workloads.calls().is_empty());
}

#[tokio::test]
async fn test_concurrent_transfers_create_once() {
    let workloads = Arc::new(FakeWorkloads::default());
    let bifrost = Arc::new(engine(workloads.clone(), no_events()));

    let first = tokio::spawn({
        let bifrost = bifrost.clone();
        async move { bifrost.transfer(desire_request("app", "v1")).await }
    });
    let second = tokio::spawn({
        let bifrost = bifrost.clone();
        async move { bifrost.transfer(desire_request("app", "v1")).await }
    });

    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    let creates = workloads
        .calls()
        .iter()
        .filter(|call| call.starts_with("create"))
        .count();
    assert_eq!(creates, 1);
}

#[tokio::test]
async fn test_update_changes_instances_and_routes() {
    let workloads = Arc::new(FakeWorkloads::with_lrp(&converted(&desire_request("app", "v1"))));
    let bifrost = engine(workloads.clone(), no_events());

    let routes = Routes {
        cf_router: vec![CfRoute {
            hostnames: vec!["dora.example.com".to_string()],
            port: 8080,
        }],
    };
    bifrost
        .update(UpdateRequest {
            guid: "app".to_string(),
            version: "v1".to_string(),
            update: DesiredLrpUpdate {
                instances: 5,
                routes: Some(routes.clone()),
                annotation: Some("1529073300.1".to_string()),
            },
        })
        .await
        .unwrap();

    let stored = workloads.workload(&Identifier::new("app", "v1")).unwrap();
    assert_eq!(stored.lrp.target_instances, 5);
    assert_eq!(stored.lrp.routes, routes);
    assert_eq!(stored.lrp.last_updated, "1529073300.1");
    assert!(stored.fingerprint.is_empty());
}

#[tokio::test]
async fn test_update_of_missing_app_is_not_found() {
    let bifrost = engine(Arc::new(FakeWorkloads::default()), no_events());

    let result = bifrost
        .update(UpdateRequest {
            guid: "ghost".to_string(),
            version: "v1".to_string(),
            update: DesiredLrpUpdate {
                instances: 1,
                routes: None,
                annotation: None,
            },
        })
        .await;

    assert!(matches!(result, Err(BifrostError::NotFound(_))));
}

#[tokio::test]
async fn test_redesire_after_update_replaces_spec() {
    let request = desire_request("app", "v1");
    let workloads = Arc::new(FakeWorkloads::with_lrp(&converted(&request)));
    let bifrost = engine(workloads.clone(), no_events());

    bifrost
        .update(UpdateRequest {
            guid: "app".to_string(),
            version: "v1".to_string(),
            update: DesiredLrpUpdate {
                instances: 7,
                routes: None,
                annotation: None,
            },
        })
        .await
        .unwrap();
    bifrost.transfer(request).await.unwrap();

    let stored = workloads.workload(&Identifier::new("app", "v1")).unwrap();
    assert_eq!(stored.lrp.target_instances, 2);
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let workloads = Arc::new(FakeWorkloads::with_lrp(&converted(&desire_request("app", "v1"))));
    let bifrost = engine(workloads.clone(), no_events());
    let identifier = Identifier::new("app", "v1");

    bifrost.stop(&identifier).await.unwrap();
    bifrost.stop(&identifier).await.unwrap();

    assert!(workloads.workload(&identifier).is_none());
}

#[tokio::test]
async fn test_write_locks_are_released_after_stop() {
    let workloads = Arc::new(FakeWorkloads::default());
    let bifrost = engine(workloads.clone(), no_events());

    bifrost.transfer(desire_request("app", "v1")).await.unwrap();
    bifrost.transfer(desire_request("app", "v2")).await.unwrap();
    bifrost.stop(&Identifier::new("app", "v1")).await.unwrap();
    bifrost.stop(&Identifier::new("app", "v2")).await.unwrap();

    assert!(bifrost.locks.is_empty());
}

#[tokio::test]
async fn test_write_locks_are_released_after_failures() {
    let workloads = Arc::new(FakeWorkloads::default());
    workloads.fail_with("cluster unreachable");
    let bifrost = engine(workloads, no_events());

    assert!(bifrost.transfer(desire_request("app", "v1")).await.is_err());
    assert!(bifrost.stop_instance(&Identifier::new("app", "v1"), 0).await.is_err());

    assert!(bifrost.locks.is_empty());
}

#[tokio::test]
async fn test_concurrent_desires_share_one_lock() {
    let workloads = Arc::new(FakeWorkloads::default());
    let bifrost = engine(workloads.clone(), no_events());

    let (first, second) = tokio::join!(
        bifrost.transfer(desire_request("app", "v1")),
        bifrost.transfer(desire_request("app", "v1")),
    );

    first.unwrap();
    second.unwrap();
    let creates = workloads
        .calls()
        .iter()
        .filter(|call| call.starts_with("create"))
        .count();
    assert_eq!(creates, 1);
    assert!(bifrost.locks.is_empty());
}

#[tokio::test]
async fn test_stop_propagates_platform_failures() {
    let workloads = Arc::new(FakeWorkloads::default());
    workloads.fail_with("cluster unreachable");
    let bifrost = engine(workloads, no_events());

    let err = bifrost.stop(&Identifier::new("app", "v1")).await.unwrap_err();
    assert_eq!(err.to_string(), "cluster unreachable");
}

#[tokio::test]
async fn test_stop_instance_checks_index_range() {
    let workloads = Arc::new(FakeWorkloads::with_lrp(&converted(&desire_request("app", "v1"))));
    let bifrost = engine(workloads.clone(), no_events());
    let identifier = Identifier::new("app", "v1");

    bifrost.stop_instance(&identifier, 1).await.unwrap();
    let result = bifrost.stop_instance(&identifier, 2).await;

    assert!(matches!(
        result,
        Err(BifrostError::IndexOutOfRange { index: 2, instances: 2, .. })
    ));
    assert!(workloads.calls().contains(&"delete_instance app-v1 1".to_string()));
    assert!(!workloads.calls().contains(&"delete_instance app-v1 2".to_string()));
}

#[tokio::test]
async fn test_stop_instance_of_missing_app_is_not_found() {
    let bifrost = engine(Arc::new(FakeWorkloads::default()), no_events());
    let result = bifrost.stop_instance(&Identifier::new("app", "v1"), 0).await;
    assert!(matches!(result, Err(BifrostError::NotFound(_))));
}

#[tokio::test]
async fn test_list_returns_scheduling_infos() {
    let workloads = Arc::new(FakeWorkloads::default());
    workloads.insert(&converted(&desire_request("app-a", "v1")));
    workloads.insert(&converted(&desire_request("app-b", "v1")));
    let bifrost = engine(workloads, no_events());

    let infos = bifrost.list().await.unwrap();

    assert_eq!(infos.len(), 2);
    assert!(infos
        .iter()
        .all(|info| info.desired_lrp_key.domain == crate::models::CF_APPS_DOMAIN));
    assert!(infos
        .iter()
        .any(|info| info.desired_lrp_key.process_guid == "app-a-v1"));
}

#[tokio::test]
async fn test_list_of_nothing_is_empty() {
    let bifrost = engine(Arc::new(FakeWorkloads::default()), no_events());
    assert!(bifrost.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_get_app_returns_desired_lrp() {
    let workloads = Arc::new(FakeWorkloads::with_lrp(&converted(&desire_request("app", "v1"))));
    let bifrost = engine(workloads, no_events());

    let desired = bifrost.get_app(&Identifier::new("app", "v1")).await.unwrap();

    assert_eq!(desired.process_guid, "app-v1");
    assert_eq!(desired.instances, 2);
    assert_eq!(desired.annotation, "1529073295.9");
}

#[tokio::test]
async fn test_get_app_of_missing_app_is_not_found() {
    let bifrost = engine(Arc::new(FakeWorkloads::default()), no_events());
    let result = bifrost.get_app(&Identifier::new("app", "v1")).await;
    assert!(matches!(result, Err(BifrostError::NotFound(_))));
}

#[tokio::test]
async fn test_get_instances_derives_states() {
    let identifier = Identifier::new("app", "v1");
    let workloads = Arc::new(FakeWorkloads::with_lrp(&converted(&desire_request("app", "v1"))));
    workloads.pods.lock().unwrap().extend([
        app_pod(&identifier, 1, "Pending", false),
        app_pod(&identifier, 0, "Running", true),
        app_pod(&Identifier::new("other", "v1"), 0, "Running", true),
    ]);
    let bifrost = engine(workloads, no_events());

    let query = bifrost.get_instances(&identifier).await;

    assert!(query.error.is_none());
    assert_eq!(query.instances.len(), 2);
    assert_eq!(query.instances[0].state, InstanceState::Running);
    assert_eq!(query.instances[1].state, InstanceState::Unclaimed);
}

#[tokio::test]
async fn test_get_instances_keeps_partial_results_on_event_failure() {
    let identifier = Identifier::new("app", "v1");
    let workloads = Arc::new(FakeWorkloads::with_lrp(&converted(&desire_request("app", "v1"))));
    workloads.pods.lock().unwrap().extend([
        app_pod(&identifier, 0, "Running", true),
        app_pod(&identifier, 1, "Pending", false),
    ]);
    let bifrost = engine(workloads, Arc::new(FakeEvents::failing("events unavailable")));

    let query = bifrost.get_instances(&identifier).await;

    assert_eq!(query.instances.len(), 2);
    assert_eq!(
        query.error.map(|e| e.to_string()).as_deref(),
        Some("events unavailable")
    );
}

#[tokio::test]
async fn test_get_instances_of_missing_app_is_not_found() {
    let bifrost = engine(Arc::new(FakeWorkloads::default()), no_events());

    let query = bifrost.get_instances(&Identifier::new("app", "v1")).await;

    assert!(query.instances.is_empty());
    assert!(matches!(query.error, Some(BifrostError::NotFound(_))));
}
