//! Kubernetes-backed workload client and event log

use super::statefulset::{from_statefulset, selector_labels, to_statefulset};
use super::{
    pod_name, pod_namespace, EventLog, LrpUpdate, Workload, WorkloadClient,
    ANNOTATION_LAST_UPDATED, ANNOTATION_ROUTES, ANNOTATION_SPEC_HASH, LABEL_SOURCE_TYPE,
    SOURCE_TYPE_APP,
};
use crate::error::WorkloadError;
use crate::models::{Identifier, Lrp};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Event, Pod};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use std::future::Future;
use std::time::Duration;
use tokio_stream::Stream;
use tracing::{debug, warn};

fn label_selector(identifier: &Identifier) -> String {
    selector_labels(identifier)
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join(",")
}

fn app_selector() -> String {
    format!("{}={}", LABEL_SOURCE_TYPE, SOURCE_TYPE_APP)
}

type WatchResult<K> = Result<watcher::Event<K>, watcher::Error>;

fn with_backoff<K, S>(events: S) -> impl Stream<Item = WatchResult<K>> + Send
where
    S: Stream<Item = WatchResult<K>> + Send,
{
    events.default_backoff()
}

/// Bound a platform call by a timeout
async fn bounded<T, F>(timeout: Duration, call: F) -> Result<T, WorkloadError>
where
    F: Future<Output = Result<T, kube::Error>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result.map_err(WorkloadError::from),
        Err(_) => Err(WorkloadError::Timeout(timeout)),
    }
}

/// Workload client realizing LRPs as StatefulSets in one namespace
pub struct KubeWorkloadClient {
    statefulsets: Api<StatefulSet>,
    pods: Api<Pod>,
    namespace: String,
    timeout: Duration,
}

impl KubeWorkloadClient {
    pub fn new(client: Client, namespace: impl Into<String>, timeout: Duration) -> Self {
        let namespace = namespace.into();
        Self {
            statefulsets: Api::namespaced(client.clone(), &namespace),
            pods: Api::namespaced(client, &namespace),
            namespace,
            timeout,
        }
    }

    /// Watch events for every application pod in the namespace
    ///
    /// Failed list or watch calls are retried with exponential backoff.
    pub fn watch_pods(&self) -> impl Stream<Item = WatchResult<Pod>> + Send + 'static {
        with_backoff(watcher(
            self.pods.clone(),
            watcher::Config::default().labels(&app_selector()),
        ))
    }

    async fn find(&self, identifier: &Identifier) -> Result<Option<StatefulSet>, WorkloadError> {
        let params = ListParams::default().labels(&label_selector(identifier));
        let list = bounded(self.timeout, self.statefulsets.list(&params)).await?;
        Ok(list.items.into_iter().next())
    }

    async fn find_existing(&self, identifier: &Identifier) -> Result<StatefulSet, WorkloadError> {
        self.find(identifier)
            .await?
            .ok_or_else(|| WorkloadError::NotFound(identifier.to_string()))
    }

    async fn write_back(&self, statefulset: &StatefulSet) -> Result<(), WorkloadError> {
        let name = statefulset.metadata.name.clone().unwrap_or_default();
        bounded(
            self.timeout,
            self.statefulsets
                .replace(&name, &PostParams::default(), statefulset),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl WorkloadClient for KubeWorkloadClient {
    async fn create(&self, lrp: &Lrp) -> Result<(), WorkloadError> {
        let statefulset = to_statefulset(lrp, &self.namespace);
        debug!(
            name = ?statefulset.metadata.name,
            guid = %lrp.identifier.guid,
            "Creating statefulset"
        );
        bounded(
            self.timeout,
            self.statefulsets.create(&PostParams::default(), &statefulset),
        )
        .await?;
        Ok(())
    }

    async fn replace(&self, lrp: &Lrp) -> Result<(), WorkloadError> {
        let existing = self.find_existing(&lrp.identifier).await?;
        let mut statefulset = to_statefulset(lrp, &self.namespace);

        // Name, service name and resource version come from the stored object;
        // the version makes the write conditional on nothing having changed since.
        statefulset.metadata.name = existing.metadata.name.clone();
        statefulset.metadata.resource_version = existing.metadata.resource_version.clone();
        if let (Some(spec), Some(existing_spec)) = (statefulset.spec.as_mut(), existing.spec) {
            spec.service_name = existing_spec.service_name;
        }

        self.write_back(&statefulset).await
    }

    async fn get(&self, identifier: &Identifier) -> Result<Option<Workload>, WorkloadError> {
        self.find(identifier)
            .await?
            .map(|statefulset| from_statefulset(&statefulset))
            .transpose()
    }

    async fn list(&self) -> Result<Vec<Workload>, WorkloadError> {
        let params = ListParams::default().labels(&app_selector());
        let list = bounded(self.timeout, self.statefulsets.list(&params)).await?;

        let workloads = list
            .items
            .iter()
            .filter_map(|statefulset| match from_statefulset(statefulset) {
                Ok(workload) => Some(workload),
                Err(e) => {
                    warn!(error = %e, "Skipping statefulset that cannot be translated");
                    None
                }
            })
            .collect();

        Ok(workloads)
    }

    async fn update(&self, identifier: &Identifier, update: &LrpUpdate) -> Result<(), WorkloadError> {
        let mut statefulset = self.find_existing(identifier).await?;

        if let Some(spec) = statefulset.spec.as_mut() {
            spec.replicas = Some(i32::try_from(update.instances).unwrap_or(i32::MAX));
        }

        let annotations = statefulset.metadata.annotations.get_or_insert_with(Default::default);
        if let Some(routes) = &update.routes {
            annotations.insert(
                ANNOTATION_ROUTES.to_string(),
                serde_json::to_string(routes).unwrap_or_default(),
            );
        }
        if let Some(last_updated) = &update.last_updated {
            annotations.insert(ANNOTATION_LAST_UPDATED.to_string(), last_updated.clone());
        }
        // The stored spec no longer matches the original desire
        annotations.remove(ANNOTATION_SPEC_HASH);

        self.write_back(&statefulset).await
    }

    async fn delete(&self, identifier: &Identifier) -> Result<(), WorkloadError> {
        let statefulset = self.find_existing(identifier).await?;
        let name = statefulset.metadata.name.unwrap_or_default();
        bounded(
            self.timeout,
            self.statefulsets.delete(&name, &DeleteParams::background()),
        )
        .await?;
        Ok(())
    }

    async fn delete_instance(&self, identifier: &Identifier, index: u32) -> Result<(), WorkloadError> {
        let statefulset = self.find_existing(identifier).await?;
        let name = format!(
            "{}-{}",
            statefulset.metadata.name.unwrap_or_default(),
            index
        );
        bounded(self.timeout, self.pods.delete(&name, &DeleteParams::default())).await?;
        Ok(())
    }

    async fn pods(&self, identifier: &Identifier) -> Result<Vec<Pod>, WorkloadError> {
        let params = ListParams::default().labels(&label_selector(identifier));
        let list = bounded(self.timeout, self.pods.list(&params)).await?;
        Ok(list.items)
    }

    async fn app_pods(&self) -> Result<Vec<Pod>, WorkloadError> {
        let params = ListParams::default().labels(&app_selector());
        let list = bounded(self.timeout, self.pods.list(&params)).await?;
        Ok(list.items)
    }
}

/// Event log reader backed by the core/v1 Events API
pub struct KubeEventLog {
    client: Client,
    default_namespace: String,
    timeout: Duration,
}

impl KubeEventLog {
    pub fn new(client: Client, default_namespace: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            default_namespace: default_namespace.into(),
            timeout,
        }
    }
}

#[async_trait]
impl EventLog for KubeEventLog {
    async fn pod_events(&self, pod: &Pod) -> Result<Vec<Event>, WorkloadError> {
        let namespace = match pod_namespace(pod) {
            "" => self.default_namespace.as_str(),
            namespace => namespace,
        };
        let events: Api<Event> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().fields(&format!(
            "involvedObject.namespace={},involvedObject.name={}",
            namespace,
            pod_name(pod)
        ));

        let list = bounded(self.timeout, events.list(&params)).await?;
        Ok(list.items)
    }
}
