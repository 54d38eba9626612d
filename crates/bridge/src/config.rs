//! Bridge configuration

use anyhow::{bail, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Bridge configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    /// Namespace holding the application workloads
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Port of the app, health and metrics API
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Kubeconfig path; in-cluster or default inference when unset
    #[serde(default)]
    pub kubeconfig: Option<PathBuf>,

    /// Registry serving buildpack droplet images
    #[serde(default = "default_registry_address")]
    pub registry_address: String,

    /// Internal API of the platform controller, receiver of crash reports
    #[serde(default)]
    pub cc_internal_api: Option<String>,

    /// HTTP gateway of the router message bus
    #[serde(default)]
    pub route_emitter_endpoint: Option<String>,

    #[serde(default = "default_informer_enabled")]
    pub informer_enabled: bool,

    #[serde(default = "default_route_refresh_interval")]
    pub route_refresh_interval_secs: u64,

    #[serde(default = "default_crash_dedup_window")]
    pub crash_dedup_window_secs: u64,

    #[serde(default = "default_workload_timeout")]
    pub workload_timeout_secs: u64,

    #[serde(default = "default_emitter_timeout")]
    pub emitter_timeout_secs: u64,
}

fn default_namespace() -> String {
    "eirini".to_string()
}

fn default_api_port() -> u16 {
    8085
}

fn default_registry_address() -> String {
    "registry.local:5000".to_string()
}

fn default_informer_enabled() -> bool {
    true
}

fn default_route_refresh_interval() -> u64 {
    20
}

fn default_crash_dedup_window() -> u64 {
    300
}

fn default_workload_timeout() -> u64 {
    10
}

fn default_emitter_timeout() -> u64 {
    5
}

impl BridgeConfig {
    /// Load configuration from an optional file overlaid by `BRIDGE_*` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::from_sources(
            path,
            config::Environment::with_prefix("BRIDGE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
    }

    fn from_sources(path: Option<&Path>, env: config::Environment) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        let config: BridgeConfig = builder.add_source(env).build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Intervals and timeouts must be positive; the event path needs both outbound endpoints
    fn validate(&self) -> Result<()> {
        for (name, secs) in [
            ("route_refresh_interval_secs", self.route_refresh_interval_secs),
            ("workload_timeout_secs", self.workload_timeout_secs),
            ("emitter_timeout_secs", self.emitter_timeout_secs),
        ] {
            if secs == 0 {
                bail!("{} must be greater than zero", name);
            }
        }

        if self.informer_enabled {
            if self.cc_internal_api.is_none() {
                bail!("cc_internal_api is required when the informer is enabled");
            }
            if self.route_emitter_endpoint.is_none() {
                bail!("route_emitter_endpoint is required when the informer is enabled");
            }
        }
        Ok(())
    }

    pub fn workload_timeout(&self) -> Duration {
        Duration::from_secs(self.workload_timeout_secs)
    }

    pub fn emitter_timeout(&self) -> Duration {
        Duration::from_secs(self.emitter_timeout_secs)
    }

    pub fn route_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.route_refresh_interval_secs)
    }

    pub fn crash_dedup_window(&self) -> Duration {
        Duration::from_secs(self.crash_dedup_window_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(vars: &[(&str, &str)]) -> config::Environment {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        config::Environment::with_prefix("BRIDGE")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .source(Some(vars))
    }

    fn config_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_without_informer() {
        let config =
            BridgeConfig::from_sources(None, env(&[("BRIDGE_INFORMER_ENABLED", "false")])).unwrap();

        assert_eq!(config.namespace, "eirini");
        assert_eq!(config.api_port, 8085);
        assert!(config.kubeconfig.is_none());
        assert_eq!(config.route_refresh_interval(), Duration::from_secs(20));
        assert_eq!(config.crash_dedup_window(), Duration::from_secs(300));
        assert_eq!(config.workload_timeout(), Duration::from_secs(10));
        assert_eq!(config.emitter_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_informer_requires_endpoints() {
        let err = BridgeConfig::from_sources(None, env(&[])).unwrap_err();
        assert!(err.to_string().contains("cc_internal_api"));

        let err = BridgeConfig::from_sources(
            None,
            env(&[("BRIDGE_CC_INTERNAL_API", "https://cc.internal:9023")]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("route_emitter_endpoint"));
    }

    #[test]
    fn test_zero_intervals_are_rejected() {
        for key in [
            "BRIDGE_ROUTE_REFRESH_INTERVAL_SECS",
            "BRIDGE_WORKLOAD_TIMEOUT_SECS",
            "BRIDGE_EMITTER_TIMEOUT_SECS",
        ] {
            let err = BridgeConfig::from_sources(
                None,
                env(&[("BRIDGE_INFORMER_ENABLED", "false"), (key, "0")]),
            )
            .unwrap_err();

            let field = key.trim_start_matches("BRIDGE_").to_lowercase();
            assert_eq!(err.to_string(), format!("{} must be greater than zero", field));
        }
    }

    #[test]
    fn test_file_values() {
        let file = config_file(
            r#"
            namespace = "cf-workloads"
            api_port = 9000
            registry_address = "registry.example.com"
            cc_internal_api = "https://cc.internal:9023"
            route_emitter_endpoint = "http://nats-gateway:8080"
            "#,
        );

        let config = BridgeConfig::from_sources(Some(file.path()), env(&[])).unwrap();

        assert_eq!(config.namespace, "cf-workloads");
        assert_eq!(config.api_port, 9000);
        assert_eq!(config.registry_address, "registry.example.com");
        assert!(config.informer_enabled);
    }

    #[test]
    fn test_environment_overrides_file() {
        let file = config_file(
            r#"
            api_port = 9000
            informer_enabled = false
            "#,
        );

        let config = BridgeConfig::from_sources(
            Some(file.path()),
            env(&[("BRIDGE_API_PORT", "9100"), ("BRIDGE_NAMESPACE", "staging")]),
        )
        .unwrap();

        assert_eq!(config.api_port, 9100);
        assert_eq!(config.namespace, "staging");
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let result = BridgeConfig::from_sources(
            Some(Path::new("/nonexistent/bridge.toml")),
            env(&[("BRIDGE_INFORMER_ENABLED", "false")]),
        );
        assert!(result.is_err());
    }
}
