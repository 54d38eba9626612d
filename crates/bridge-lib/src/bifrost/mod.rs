//! Translation engine between controller requests and workloads
//!
//! Bifrost turns desire, update and stop requests into operations on the
//! workload layer, and reads workloads and pods back into the controller's
//! vocabulary. Writes for one application are serialized per identifier.

mod converter;
mod instances;

#[cfg(test)]
mod tests;

pub use converter::{Converter, LAUNCHER, START_COMMAND_ENV};
pub use instances::{derive_instances, pod_since, pod_state, INSUFFICIENT_MEMORY_ERROR};

use crate::error::{BifrostError, WorkloadError};
use crate::models::{
    DesireLrpRequest, DesiredLrp, Identifier, Instance, Lrp, SchedulingInfo, UpdateRequest,
};
use crate::observability::BridgeMetrics;
use crate::workload::{EventLog, WorkloadClient};
use async_trait::async_trait;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Instances of an app, possibly incomplete
///
/// `error` is set when part of the lookup failed; `instances` then holds
/// whatever could still be derived.
#[derive(Debug, Default)]
pub struct InstanceQuery {
    pub instances: Vec<Instance>,
    pub error: Option<BifrostError>,
}

impl InstanceQuery {
    fn failed(error: impl Into<BifrostError>) -> Self {
        Self {
            instances: Vec::new(),
            error: Some(error.into()),
        }
    }
}

/// Operations the app handler delegates to
#[async_trait]
pub trait Bifrost: Send + Sync {
    /// Create or converge the workload for a desire request
    async fn transfer(&self, request: DesireLrpRequest) -> Result<(), BifrostError>;

    /// Change instance count, routes and annotation of an existing app
    async fn update(&self, request: UpdateRequest) -> Result<(), BifrostError>;

    /// Remove an app; stopping an absent app succeeds
    async fn stop(&self, identifier: &Identifier) -> Result<(), BifrostError>;

    /// Terminate one replica so the platform replaces it
    async fn stop_instance(&self, identifier: &Identifier, index: u32) -> Result<(), BifrostError>;

    async fn list(&self) -> Result<Vec<SchedulingInfo>, BifrostError>;

    async fn get_app(&self, identifier: &Identifier) -> Result<DesiredLrp, BifrostError>;

    async fn get_instances(&self, identifier: &Identifier) -> InstanceQuery;
}

/// Bifrost backed by a workload client and an event log
pub struct BifrostEngine {
    converter: Converter,
    workloads: Arc<dyn WorkloadClient>,
    events: Arc<dyn EventLog>,
    locks: DashMap<Identifier, Arc<Mutex<()>>>,
    metrics: BridgeMetrics,
}

impl BifrostEngine {
    pub fn new(
        converter: Converter,
        workloads: Arc<dyn WorkloadClient>,
        events: Arc<dyn EventLog>,
    ) -> Self {
        Self {
            converter,
            workloads,
            events,
            locks: DashMap::new(),
            metrics: BridgeMetrics::new(),
        }
    }

    fn lock_for(&self, identifier: &Identifier) -> Arc<Mutex<()>> {
        self.locks
            .entry(identifier.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run a write while holding the identifier's lock
    ///
    /// The lock entry is dropped once no other write for the identifier holds
    /// or waits on it, so the map only tracks apps with writes in flight.
    async fn serialized<T>(
        &self,
        identifier: &Identifier,
        write: impl Future<Output = Result<T, BifrostError>>,
    ) -> Result<T, BifrostError> {
        let lock = self.lock_for(identifier);
        let result = {
            let _guard = lock.lock().await;
            write.await
        };
        drop(lock);

        self.locks
            .remove_if(identifier, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    fn observe(&self, operation: &str, started: Instant) {
        self.metrics
            .observe_bifrost_latency(operation, started.elapsed().as_secs_f64());
    }

    async fn converge(&self, lrp: &Lrp) -> Result<(), BifrostError> {
        let fingerprint = lrp.fingerprint();

        match self.workloads.get(&lrp.identifier).await? {
            None => {
                info!(guid = %lrp.identifier.guid, version = %lrp.identifier.version, "Creating workload");
                self.workloads.create(lrp).await?;
            }
            Some(existing) if existing.fingerprint == fingerprint => {
                debug!(guid = %lrp.identifier.guid, "Desired state unchanged, skipping");
            }
            Some(_) => {
                info!(guid = %lrp.identifier.guid, version = %lrp.identifier.version, "Replacing workload spec");
                self.workloads.replace(lrp).await?;
            }
        }

        Ok(())
    }

    async fn transfer_locked(&self, request: &DesireLrpRequest) -> Result<(), BifrostError> {
        let lrp = self.converter.convert(request)?;
        self.serialized(&lrp.identifier, self.converge(&lrp)).await
    }

    async fn apply_update(
        &self,
        identifier: &Identifier,
        request: &UpdateRequest,
    ) -> Result<(), BifrostError> {
        if self.workloads.get(identifier).await?.is_none() {
            return Err(BifrostError::NotFound(identifier.clone()));
        }

        let update = self.converter.convert_update(request);
        self.workloads.update(identifier, &update).await?;
        Ok(())
    }

    async fn update_locked(&self, request: &UpdateRequest) -> Result<(), BifrostError> {
        let identifier = request.identifier();
        self.serialized(&identifier, self.apply_update(&identifier, request))
            .await
    }

    async fn delete(&self, identifier: &Identifier) -> Result<(), BifrostError> {
        match self.workloads.delete(identifier).await {
            Ok(()) => Ok(()),
            Err(WorkloadError::NotFound(_)) => {
                debug!(guid = %identifier.guid, "Workload already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn stop_locked(&self, identifier: &Identifier) -> Result<(), BifrostError> {
        self.serialized(identifier, self.delete(identifier)).await
    }

    async fn delete_instance(&self, identifier: &Identifier, index: u32) -> Result<(), BifrostError> {
        let workload = self
            .workloads
            .get(identifier)
            .await?
            .ok_or_else(|| BifrostError::NotFound(identifier.clone()))?;

        let instances = workload.lrp.target_instances;
        if index >= instances {
            return Err(BifrostError::IndexOutOfRange {
                identifier: identifier.clone(),
                index,
                instances,
            });
        }

        self.workloads.delete_instance(identifier, index).await?;
        Ok(())
    }

    async fn stop_instance_locked(
        &self,
        identifier: &Identifier,
        index: u32,
    ) -> Result<(), BifrostError> {
        self.serialized(identifier, self.delete_instance(identifier, index))
            .await
    }

    async fn instances(&self, identifier: &Identifier) -> InstanceQuery {
        match self.workloads.get(identifier).await {
            Ok(Some(_)) => {}
            Ok(None) => return InstanceQuery::failed(BifrostError::NotFound(identifier.clone())),
            Err(e) => return InstanceQuery::failed(e),
        }

        let pods = match self.workloads.pods(identifier).await {
            Ok(pods) => pods,
            Err(e) => return InstanceQuery::failed(e),
        };

        let (instances, error) = derive_instances(&pods, self.events.as_ref()).await;
        InstanceQuery {
            instances,
            error: error.map(BifrostError::from),
        }
    }
}

#[async_trait]
impl Bifrost for BifrostEngine {
    async fn transfer(&self, request: DesireLrpRequest) -> Result<(), BifrostError> {
        let started = Instant::now();
        let result = self.transfer_locked(&request).await;
        self.observe("transfer", started);
        result
    }

    async fn update(&self, request: UpdateRequest) -> Result<(), BifrostError> {
        let started = Instant::now();
        let result = self.update_locked(&request).await;
        self.observe("update", started);
        result
    }

    async fn stop(&self, identifier: &Identifier) -> Result<(), BifrostError> {
        let started = Instant::now();
        let result = self.stop_locked(identifier).await;
        self.observe("stop", started);
        result
    }

    async fn stop_instance(&self, identifier: &Identifier, index: u32) -> Result<(), BifrostError> {
        let started = Instant::now();
        let result = self.stop_instance_locked(identifier, index).await;
        self.observe("stop_instance", started);
        result
    }

    async fn list(&self) -> Result<Vec<SchedulingInfo>, BifrostError> {
        let started = Instant::now();
        let result = self.workloads.list().await;
        self.observe("list", started);

        Ok(result?
            .iter()
            .map(|workload| workload.lrp.scheduling_info())
            .collect())
    }

    async fn get_app(&self, identifier: &Identifier) -> Result<DesiredLrp, BifrostError> {
        let started = Instant::now();
        let result = self.workloads.get(identifier).await;
        self.observe("get_app", started);

        result?
            .map(|workload| workload.lrp.desired_lrp())
            .ok_or_else(|| BifrostError::NotFound(identifier.clone()))
    }

    async fn get_instances(&self, identifier: &Identifier) -> InstanceQuery {
        let started = Instant::now();
        let query = self.instances(identifier).await;
        self.observe("get_instances", started);
        query
    }
}
