//! Bridge between the platform controller's desired state and Kubernetes
//!
//! This crate provides the core functionality for:
//! - The HTTP app handler used by the platform controller
//! - Translation of desired LRPs into StatefulSets (Bifrost)
//! - Observation of application pods for crash reports and routes
//! - Health checks and observability

pub mod api;
pub mod bifrost;
pub mod emitter;
pub mod error;
pub mod health;
pub mod informer;
pub mod models;
pub mod observability;
pub mod workload;

#[cfg(test)]
mod test_support;

pub use bifrost::{Bifrost, BifrostEngine, Converter, InstanceQuery};
pub use error::{BifrostError, EmitError, WorkloadError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{BridgeMetrics, StructuredLogger};
