//! LRP bridge - runs platform-controller applications on Kubernetes
//!
//! This binary serves the app API the platform controller talks to and,
//! when enabled, watches application pods to report crashes and keep the
//! router's route table current.

use anyhow::{Context, Result};
use bridge_lib::{
    api::{self, AppState},
    bifrost::{BifrostEngine, Converter},
    emitter::{CloudControllerCrashSink, HttpRouteEmitter},
    health::{components, HealthRegistry},
    informer::{CrashReportGenerator, InstanceChangeInformer, PodUpdateHandler, RouteCollector, RoutePublisher},
    observability::{BridgeMetrics, StructuredLogger},
    workload::{EventLog, KubeEventLog, KubeWorkloadClient, WorkloadClient},
};
use clap::Parser;
use crate::config::BridgeConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;

const BRIDGE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Parser)]
#[command(name = "lrp-bridge", version, about = "Runs platform-controller apps as Kubernetes StatefulSets")]
struct Args {
    /// Configuration file, overlaid by BRIDGE_* environment variables
    #[arg(short, long, env = "BRIDGE_CONFIG")]
    config: Option<PathBuf>,
}

async fn kube_client(config: &BridgeConfig) -> Result<kube::Client> {
    match &config.kubeconfig {
        Some(path) => {
            let kubeconfig = kube::config::Kubeconfig::read_from(path)
                .with_context(|| format!("reading kubeconfig {}", path.display()))?;
            let client_config = kube::Config::from_custom_kubeconfig(
                kubeconfig,
                &kube::config::KubeConfigOptions::default(),
            )
            .await?;
            Ok(kube::Client::try_from(client_config)?)
        }
        None => Ok(kube::Client::try_default().await?),
    }
}

/// Wire the informer, pod update handler and route collector
fn spawn_event_path(
    config: &BridgeConfig,
    workloads: Arc<KubeWorkloadClient>,
    events: Arc<dyn EventLog>,
    health_registry: &HealthRegistry,
    logger: &StructuredLogger,
    shutdown: &broadcast::Sender<()>,
) -> Result<Vec<JoinHandle<()>>> {
    let cc_internal_api = config
        .cc_internal_api
        .as_deref()
        .context("cc_internal_api is not configured")?;
    let route_emitter_endpoint = config
        .route_emitter_endpoint
        .as_deref()
        .context("route_emitter_endpoint is not configured")?;

    let crash_sink = Arc::new(CloudControllerCrashSink::new(cc_internal_api, config.emitter_timeout())?);
    let route_emitter = Arc::new(HttpRouteEmitter::new(route_emitter_endpoint, config.emitter_timeout())?);
    let routes = RoutePublisher::new(route_emitter, health_registry.clone(), logger.clone());

    let client: Arc<dyn WorkloadClient> = workloads.clone();
    let handler = PodUpdateHandler::new(
        client.clone(),
        CrashReportGenerator::new(events),
        crash_sink,
        routes.clone(),
    )
    .with_dedup_window(config.crash_dedup_window());

    let informer = InstanceChangeInformer::new(Arc::new(handler), health_registry.clone());
    let collector = RouteCollector::new(client, routes, config.route_refresh_interval());

    Ok(vec![
        tokio::spawn(informer.run(workloads.watch_pods(), shutdown.subscribe())),
        tokio::spawn(collector.run(shutdown.subscribe())),
    ])
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let args = Args::parse();
    let config = BridgeConfig::load(args.config.as_deref())?;
    info!(namespace = %config.namespace, "Bridge configured");

    let health_registry = HealthRegistry::new();
    health_registry.register(components::BIFROST).await;

    let metrics = BridgeMetrics::new();
    let logger = StructuredLogger::new(&config.namespace);
    logger.log_startup(BRIDGE_VERSION, config.api_port, config.informer_enabled);

    let client = kube_client(&config).await?;
    let workloads = Arc::new(KubeWorkloadClient::new(
        client.clone(),
        &config.namespace,
        config.workload_timeout(),
    ));
    let events: Arc<dyn EventLog> = Arc::new(KubeEventLog::new(
        client,
        &config.namespace,
        config.workload_timeout(),
    ));

    let bifrost = Arc::new(BifrostEngine::new(
        Converter::new(config.registry_address.clone()),
        workloads.clone(),
        events.clone(),
    ));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let mut tasks = Vec::new();

    if config.informer_enabled {
        health_registry.register(components::INFORMER).await;
        health_registry.register(components::ROUTE_EMITTER).await;
        tasks.extend(spawn_event_path(
            &config,
            workloads,
            events,
            &health_registry,
            &logger,
            &shutdown_tx,
        )?);
    } else {
        info!("Informer disabled, serving the app API only");
    }

    let app_state = Arc::new(AppState::new(bifrost, health_registry.clone(), metrics));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state, shutdown_tx.subscribe()));

    health_registry.set_ready(true).await;

    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    let _ = shutdown_tx.send(());

    match api_handle.await {
        Ok(Err(e)) => warn!(error = %e, "API server failed"),
        Err(e) => warn!(error = %e, "API server task panicked"),
        Ok(Ok(())) => {}
    }
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "Background task panicked");
        }
    }

    info!("Shutdown complete");
    Ok(())
}
