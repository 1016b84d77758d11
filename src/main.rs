use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use kube::core::admission::AdmissionReview;
use kube::core::DynamicObject;
use noe::cli::{split_list, Cli};
use noe::controllers::{run_pod_controller, PodReconciler};
use noe::hook::{parse_match_node_labels, Handler};
use noe::httputils::{HyperTransport, SerializedTransport, Transport};
use noe::kubeapi::{ClusterClient, KubeClusterClient};
use noe::registry::auth::{AuthenticatorChain, ChainConfig};
use noe::registry::cached::CachedRegistry;
use noe::registry::{parse_registry_proxies, PlainRegistry, Registry};
use prometheus::{Encoder, TextEncoder};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging to stderr
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let schedulable_archs = split_list(&cli.cluster_schedulable_archs);
    if !cli.preferred_arch.is_empty()
        && !schedulable_archs.is_empty()
        && !schedulable_archs.contains(&cli.preferred_arch)
    {
        anyhow::bail!("preferred architecture is not schedulable in the cluster");
    }

    let prometheus_registry = prometheus::Registry::new();
    let kube_client = kube::Client::try_default()
        .await
        .context("failed to build the cluster client")?;
    let cluster_client: Arc<dyn ClusterClient> =
        Arc::new(KubeClusterClient::new(kube_client.clone()));

    let transport: Arc<dyn Transport> =
        Arc::new(SerializedTransport::new(Arc::new(HyperTransport::new()), 1));
    let authenticator = AuthenticatorChain::standard(ChainConfig {
        credential_provider_bin_dir: cli.credential_provider_bin_dir.clone(),
        credential_provider_config: cli.credential_provider_config.clone(),
        containerd_config_dir: cli.containerd_config_dir.clone(),
        private_registry_patterns: split_list(&cli.private_registries),
    });
    let plain_registry = PlainRegistry::new(transport, Arc::new(authenticator), &prometheus_registry)?
        .with_proxies(parse_registry_proxies(&cli.registry_proxies))
        .with_schedulable_architectures(schedulable_archs.clone());
    let container_registry: Arc<dyn Registry> = Arc::new(CachedRegistry::new(
        Arc::new(plain_registry),
        Duration::from_secs(cli.registry_cache_seconds),
        &prometheus_registry,
    )?);

    info!("setting up pod controller");
    let reconciler = Arc::new(PodReconciler::new(
        cluster_client.clone(),
        container_registry.clone(),
        &prometheus_registry,
    )?);
    let controller = tokio::spawn(run_pod_controller(reconciler, kube_client.clone()));

    info!("setting up webhook server");
    let handler = Arc::new(
        Handler::new(cluster_client, container_registry, &prometheus_registry)?
            .with_architecture(&cli.preferred_arch)
            .with_schedulable_architectures(schedulable_archs)
            .with_os(&cli.system_os)
            .with_match_node_labels(parse_match_node_labels(&cli.match_node_labels)),
    );
    let webhook = Router::new()
        .route("/mutate", post(mutate))
        .with_state(handler);
    let metrics = Router::new()
        .route("/metrics", get(serve_metrics))
        .with_state(prometheus_registry);

    let webhook_listener = TcpListener::bind(&cli.webhook_addr)
        .await
        .with_context(|| format!("failed to bind {}", cli.webhook_addr))?;
    let metrics_listener = TcpListener::bind(&cli.metrics_addr)
        .await
        .with_context(|| format!("failed to bind {}", cli.metrics_addr))?;
    info!(
        webhook_addr = cli.webhook_addr.as_str(),
        metrics_addr = cli.metrics_addr.as_str(),
        "starting"
    );
    let webhook_server = tokio::spawn(async move { axum::serve(webhook_listener, webhook).await });
    let metrics_server = tokio::spawn(async move { axum::serve(metrics_listener, metrics).await });
    tokio::select! {
        served = webhook_server => served??,
        served = metrics_server => served??,
        _ = controller => {},
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
    }
    Ok(())
}

async fn mutate(
    State(handler): State<Arc<Handler>>,
    Json(review): Json<serde_json::Value>,
) -> Json<AdmissionReview<DynamicObject>> {
    Json(handler.handle(review).await)
}

async fn serve_metrics(State(registry): State<prometheus::Registry>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    match encoder.encode(&registry.gather(), &mut buffer) {
        Ok(()) => (StatusCode::OK, buffer).into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}
