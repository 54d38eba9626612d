//! In-memory fakes and log capture for unit tests

use crate::error::WorkloadError;
use crate::models::{HealthCheck, HealthCheckType, Identifier, Lrp, Routes};
use crate::workload::{pod_identifier, workload_name, EventLog, LrpUpdate, Workload, WorkloadClient};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Event, Pod};
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::fmt::MakeWriter;

/// A small docker-based LRP for `<guid>-<version>`
pub fn sample_lrp(guid: &str, version: &str) -> Lrp {
    Lrp {
        identifier: Identifier::new(guid, version),
        process_guid: format!("{}-{}", guid, version),
        process_type: "web".to_string(),
        app_guid: format!("{}-app", guid),
        app_name: "dora".to_string(),
        space_guid: "space-guid".to_string(),
        space_name: "dev".to_string(),
        org_guid: "org-guid".to_string(),
        org_name: "org".to_string(),
        image: "eirini/dorini".to_string(),
        command: vec![],
        env: Default::default(),
        target_instances: 1,
        memory_mb: 256,
        disk_mb: 256,
        cpu_weight: 0,
        health_check: HealthCheck {
            kind: HealthCheckType::Port,
            endpoint: String::new(),
            timeout_ms: 0,
        },
        start_timeout_ms: 0,
        ports: vec![8080],
        routes: Routes::default(),
        placement_tags: vec![],
        volume_mounts: vec![],
        last_updated: String::new(),
    }
}

/// Workload client keeping workloads and pods in memory
#[derive(Default)]
pub struct FakeWorkloads {
    pub workloads: Mutex<HashMap<Identifier, Workload>>,
    pub pods: Mutex<Vec<Pod>>,
    pub calls: Mutex<Vec<String>>,
    /// When set, every call fails with this message
    pub failure: Mutex<Option<String>>,
}

impl FakeWorkloads {
    pub fn with_lrp(lrp: &Lrp) -> Self {
        let fake = Self::default();
        fake.insert(lrp);
        fake
    }

    pub fn insert(&self, lrp: &Lrp) {
        self.workloads.lock().unwrap().insert(
            lrp.identifier.clone(),
            Workload {
                name: workload_name(lrp),
                lrp: lrp.clone(),
                fingerprint: lrp.fingerprint(),
            },
        );
    }

    pub fn fail_with(&self, message: &str) {
        *self.failure.lock().unwrap() = Some(message.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn workload(&self, identifier: &Identifier) -> Option<Workload> {
        self.workloads.lock().unwrap().get(identifier).cloned()
    }

    fn record(&self, call: String) -> Result<(), WorkloadError> {
        self.calls.lock().unwrap().push(call);
        match self.failure.lock().unwrap().as_ref() {
            Some(message) => Err(WorkloadError::Api(message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl WorkloadClient for FakeWorkloads {
    async fn create(&self, lrp: &Lrp) -> Result<(), WorkloadError> {
        self.record(format!("create {}", lrp.identifier))?;
        if self.workload(&lrp.identifier).is_some() {
            return Err(WorkloadError::Api("already exists".to_string()));
        }
        self.insert(lrp);
        Ok(())
    }

    async fn replace(&self, lrp: &Lrp) -> Result<(), WorkloadError> {
        self.record(format!("replace {}", lrp.identifier))?;
        if self.workload(&lrp.identifier).is_none() {
            return Err(WorkloadError::NotFound(lrp.identifier.to_string()));
        }
        self.insert(lrp);
        Ok(())
    }

    async fn get(&self, identifier: &Identifier) -> Result<Option<Workload>, WorkloadError> {
        self.record(format!("get {}", identifier))?;
        Ok(self.workload(identifier))
    }

    async fn list(&self) -> Result<Vec<Workload>, WorkloadError> {
        self.record("list".to_string())?;
        let mut workloads: Vec<_> = self.workloads.lock().unwrap().values().cloned().collect();
        workloads.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(workloads)
    }

    async fn update(&self, identifier: &Identifier, update: &LrpUpdate) -> Result<(), WorkloadError> {
        self.record(format!("update {}", identifier))?;
        let mut workloads = self.workloads.lock().unwrap();
        let workload = workloads
            .get_mut(identifier)
            .ok_or_else(|| WorkloadError::NotFound(identifier.to_string()))?;

        workload.lrp.target_instances = update.instances;
        if let Some(routes) = &update.routes {
            workload.lrp.routes = routes.clone();
        }
        if let Some(last_updated) = &update.last_updated {
            workload.lrp.last_updated = last_updated.clone();
        }
        workload.fingerprint.clear();
        Ok(())
    }

    async fn delete(&self, identifier: &Identifier) -> Result<(), WorkloadError> {
        self.record(format!("delete {}", identifier))?;
        self.workloads
            .lock()
            .unwrap()
            .remove(identifier)
            .map(|_| ())
            .ok_or_else(|| WorkloadError::NotFound(identifier.to_string()))
    }

    async fn delete_instance(&self, identifier: &Identifier, index: u32) -> Result<(), WorkloadError> {
        self.record(format!("delete_instance {} {}", identifier, index))
    }

    async fn pods(&self, identifier: &Identifier) -> Result<Vec<Pod>, WorkloadError> {
        self.record(format!("pods {}", identifier))?;
        Ok(self
            .pods
            .lock()
            .unwrap()
            .iter()
            .filter(|pod| pod_identifier(pod).as_ref() == Some(identifier))
            .cloned()
            .collect())
    }

    async fn app_pods(&self) -> Result<Vec<Pod>, WorkloadError> {
        self.record("app_pods".to_string())?;
        Ok(self.pods.lock().unwrap().clone())
    }
}

/// Event log answering every query the same way
pub struct FakeEvents {
    result: Mutex<Result<Vec<Event>, String>>,
    pub queries: Mutex<usize>,
}

impl FakeEvents {
    pub fn with_events(events: Vec<Event>) -> Self {
        Self {
            result: Mutex::new(Ok(events)),
            queries: Mutex::new(0),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            result: Mutex::new(Err(message.to_string())),
            queries: Mutex::new(0),
        }
    }

    pub fn queries(&self) -> usize {
        *self.queries.lock().unwrap()
    }
}

#[async_trait]
impl EventLog for FakeEvents {
    async fn pod_events(&self, _pod: &Pod) -> Result<Vec<Event>, WorkloadError> {
        *self.queries.lock().unwrap() += 1;
        self.result.lock().unwrap().clone().map_err(WorkloadError::Api)
    }
}

#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = LogBuffer;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// JSON log lines emitted on the current thread while alive
pub struct LogCapture {
    buffer: LogBuffer,
    _guard: DefaultGuard,
}

impl LogCapture {
    pub fn start() -> Self {
        let buffer = LogBuffer::default();
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(buffer.clone())
            .finish();

        Self {
            buffer,
            _guard: tracing::subscriber::set_default(subscriber),
        }
    }

    pub fn entries(&self) -> Vec<serde_json::Value> {
        let bytes = self.buffer.0.lock().unwrap().clone();
        String::from_utf8_lossy(&bytes)
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    /// Entries whose `event` field matches
    pub fn events(&self, name: &str) -> Vec<serde_json::Value> {
        self.entries()
            .into_iter()
            .filter(|entry| entry["fields"]["event"] == name)
            .collect()
    }
}
