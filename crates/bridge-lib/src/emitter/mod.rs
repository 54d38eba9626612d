//! Outbound notifications: route messages and crash reports

mod http;

pub use http::{CloudControllerCrashSink, HttpRouteEmitter};

use crate::error::EmitError;
use crate::models::{CrashReport, RouteMessage};
use async_trait::async_trait;

/// Publishes route registrations to the router message bus
#[async_trait]
pub trait RouteEmitter: Send + Sync {
    async fn publish(&self, message: &RouteMessage) -> Result<(), EmitError>;
}

/// Delivers crash reports to the platform controller
#[async_trait]
pub trait CrashReportSink: Send + Sync {
    async fn notify(&self, report: &CrashReport) -> Result<(), EmitError>;
}
