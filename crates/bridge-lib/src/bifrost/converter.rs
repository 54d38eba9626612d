//! Desire and update request translation

use crate::error::BifrostError;
use crate::models::{
    BuildpackLifecycle, DesireLrpRequest, HealthCheck, HealthCheckType, Identifier, Lifecycle,
    Lrp, UpdateRequest, DEFAULT_PORT,
};
use crate::workload::LrpUpdate;

/// Entry point of buildpack-staged droplets
pub const LAUNCHER: &str = "/lifecycle/launch";

/// Environment variable carrying a buildpack app's start command
pub const START_COMMAND_ENV: &str = "START_COMMAND";

/// Converts controller requests into workload terms
#[derive(Debug, Clone)]
pub struct Converter {
    registry_address: String,
}

impl Converter {
    pub fn new(registry_address: impl Into<String>) -> Self {
        Self {
            registry_address: registry_address.into(),
        }
    }

    fn droplet_image(&self, lifecycle: &BuildpackLifecycle) -> String {
        format!(
            "{}/cloudfoundry/{}:{}",
            self.registry_address.trim_end_matches('/'),
            lifecycle.droplet_guid,
            lifecycle.droplet_hash
        )
    }

    /// Translate a desire request into an LRP
    pub fn convert(&self, request: &DesireLrpRequest) -> Result<Lrp, BifrostError> {
        if request.guid.is_empty() {
            return Err(BifrostError::InvalidRequest("guid is empty".to_string()));
        }
        if request.process_guid.is_empty() {
            return Err(BifrostError::InvalidRequest(
                "process_guid is empty".to_string(),
            ));
        }

        let kind = HealthCheckType::parse(&request.health_check_type).ok_or_else(|| {
            BifrostError::InvalidRequest(format!(
                "unsupported health check type {:?}",
                request.health_check_type
            ))
        })?;

        let mut env = request.environment.clone();
        let (image, command) = match &request.lifecycle {
            Lifecycle::Docker(docker) => {
                if docker.image.is_empty() {
                    return Err(BifrostError::InvalidRequest(
                        "docker lifecycle has no image".to_string(),
                    ));
                }
                (docker.image.clone(), docker.command.clone())
            }
            Lifecycle::Buildpack(buildpack) => {
                env.insert(
                    START_COMMAND_ENV.to_string(),
                    buildpack.start_command.clone(),
                );
                (self.droplet_image(buildpack), vec![LAUNCHER.to_string()])
            }
        };

        let ports = if request.ports.is_empty() {
            vec![DEFAULT_PORT]
        } else {
            request.ports.clone()
        };

        Ok(Lrp {
            identifier: Identifier::new(&request.guid, &request.version),
            process_guid: request.process_guid.clone(),
            process_type: request.process_type.clone(),
            app_guid: request.app_guid.clone(),
            app_name: request.app_name.clone(),
            space_guid: request.space_guid.clone(),
            space_name: request.space_name.clone(),
            org_guid: request.organization_guid.clone(),
            org_name: request.organization_name.clone(),
            image,
            command,
            env,
            target_instances: request.num_instances,
            memory_mb: request.memory_mb,
            disk_mb: request.disk_mb,
            cpu_weight: request.cpu_weight,
            health_check: HealthCheck {
                kind,
                endpoint: request.health_check_http_endpoint.clone(),
                timeout_ms: request.health_check_timeout_ms,
            },
            start_timeout_ms: request.start_timeout_ms,
            ports,
            routes: request.routes.clone(),
            placement_tags: request.placement_tags.clone(),
            volume_mounts: request.volume_mounts.clone(),
            last_updated: request.last_updated.clone(),
        })
    }

    /// Translate an update request into an in-place workload change
    pub fn convert_update(&self, request: &UpdateRequest) -> LrpUpdate {
        LrpUpdate {
            instances: request.update.instances,
            routes: request.update.routes.clone(),
            last_updated: request.update.annotation.clone(),
        }
    }
}
