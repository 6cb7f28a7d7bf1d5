//! Drowse Operator - scale-to-zero for idle HTTP services

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures::StreamExt;
use kube::runtime::events::Reporter;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use drowse::config::{polling_interval, ComponentConfig, ResolverConfig};
use drowse::controller::{
    error_policy, reconcile, Context, EndpointRewriter, KubeGovernedServiceClient, ModeController,
};
use drowse::crd::GovernedService;
use drowse::directory::ServiceDirectory;
use drowse::informer::InformerManager;
use drowse::scaling::{run_scale_loop, KedaClient, ScaleHandler};
use drowse::server::{control_router, ControlState, ScaleGate};

/// Drowse - Kubernetes operator for scale-to-zero of idle HTTP services
#[derive(Parser, Debug)]
#[command(name = "drowse", version, about, long_about = None)]
struct Cli {
    /// Generate the CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Namespace whose GovernedServices are governed
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "default")]
    watch_namespace: String,

    /// Address the control RPC server listens on; defaults to the operator
    /// port from the environment
    #[arg(long)]
    listen_addr: Option<std::net::SocketAddr>,

    /// Hold-off after a request-driven scale-up during which further resolver
    /// notifications for the same service are coalesced
    #[arg(long, default_value = "10m", value_parser = humantime::parse_duration)]
    rescale_holdoff: Duration,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&GovernedService::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    let resolver = ResolverConfig::from_env()
        .map_err(|e| anyhow::anyhow!("Failed to read resolver configuration: {}", e))?;
    let operator = ComponentConfig::operator_from_env()
        .map_err(|e| anyhow::anyhow!("Failed to read operator configuration: {}", e))?;
    let interval = polling_interval()
        .map_err(|e| anyhow::anyhow!("Failed to read polling interval: {}", e))?;
    let listen_addr = cli
        .listen_addr
        .unwrap_or_else(|| ([0, 0, 0, 0], operator.port).into());

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let reporter = Reporter {
        controller: "drowse-operator".into(),
        instance: None,
    };
    // Shared state: one directory and one watch registry for the whole
    // process, per-target locking inside the scale handler.
    let directory = Arc::new(ServiceDirectory::new());
    let informers = Arc::new(InformerManager::new());
    let scale_handler = Arc::new(ScaleHandler::with_client(client.clone(), reporter));
    let rewriter = Arc::new(EndpointRewriter::with_client(
        client.clone(),
        resolver.component.service_name.clone(),
        resolver.reverse_proxy_port,
    ));
    let modes = Arc::new(ModeController::new(
        Arc::new(KubeGovernedServiceClient::new(client.clone())),
        rewriter,
        Arc::new(KedaClient::new(client.clone())),
        directory.clone(),
        informers,
    ));
    let ctx = Arc::new(Context {
        modes: modes.clone(),
        client: client.clone(),
        resolver,
    });

    let cancel = CancellationToken::new();

    // Control RPC server for the resolver.
    let control_state = Arc::new(ControlState {
        directory,
        scaler: scale_handler.clone(),
        gate: ScaleGate::new(),
        rescale_holdoff: cli.rescale_holdoff,
    });
    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", listen_addr, e))?;
    tracing::info!(addr = %listen_addr, "control server listening");
    let control_server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, control_router(control_state)).await {
            tracing::error!(error = %e, "control server error");
        }
    });

    // Periodic scale-decision sweep.
    let services: Api<GovernedService> =
        Api::namespaced(client.clone(), &cli.watch_namespace);
    let scale_loop = tokio::spawn(run_scale_loop(
        scale_handler,
        services.clone(),
        interval,
        cancel.clone(),
    ));

    tracing::info!(namespace = %cli.watch_namespace, "starting GovernedService controller");

    Controller::new(services, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => tracing::debug!(?action, "reconciliation completed"),
                Err(e) => tracing::error!(error = ?e, "reconciliation error"),
            }
        })
        .await;

    cancel.cancel();
    let _ = scale_loop.await;
    control_server.abort();

    tracing::info!("drowse operator shutting down");
    Ok(())
}
