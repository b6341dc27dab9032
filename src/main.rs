//! Doppel impersonation proxy controller binary.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use clap::Parser;
use kube::Client;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use doppel::controller::{self, ControllerOptions};
use doppel::server::HandlerFactory;

/// Doppel - impersonation proxy control loop for Kubernetes clusters.
#[derive(Parser, Debug)]
#[command(name = "doppel", version, about, long_about = None)]
struct Cli {
    /// Namespace the controller is installed into.
    #[arg(long, env = "DOPPEL_NAMESPACE", default_value = "doppel-system")]
    namespace: String,

    /// Name of the ConfigMap holding the impersonation proxy configuration.
    #[arg(long, default_value = "impersonation-proxy-config")]
    config_map_name: String,

    /// Name of the owned load balancer Service.
    #[arg(long, default_value = "impersonation-proxy-load-balancer")]
    load_balancer_name: String,

    /// Name of the owned TLS Secret.
    #[arg(long, default_value = "impersonation-proxy-tls")]
    tls_secret_name: String,

    /// Value of the `app` label, also used as the workload selector.
    #[arg(long, default_value = "doppel-impersonation-proxy")]
    app_label: String,

    /// Extra labels applied to owned objects, as key=value pairs.
    #[arg(long = "label", value_parser = parse_label)]
    labels: Vec<(String, String)>,

    /// Listen address for the impersonation proxy.
    #[arg(long, default_value = "0.0.0.0:8444")]
    listen_addr: SocketAddr,

    /// Seconds between event-independent resync passes.
    #[arg(long, default_value = "600")]
    resync_interval_secs: u64,
}

fn parse_label(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("label '{raw}' is not in key=value form"))
}

/// Placeholder handler factory.
///
/// The impersonating request handler is supplied by the embedding
/// distribution; the control loop only needs something to serve behind the
/// listener it manages.
fn handler_factory() -> HandlerFactory {
    Arc::new(|| Ok(Router::new().route("/healthz", get(|| async { "ok" }))))
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("failed to install crypto provider");

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let mut labels = BTreeMap::from([("app".to_string(), cli.app_label.clone())]);
    labels.extend(cli.labels.iter().cloned());

    let options = ControllerOptions {
        namespace: cli.namespace.clone(),
        config_map_name: cli.config_map_name,
        load_balancer_name: cli.load_balancer_name,
        tls_secret_name: cli.tls_secret_name,
        labels,
        listen_addr: cli.listen_addr,
        resync_interval: Duration::from_secs(cli.resync_interval_secs),
    };

    info!(
        namespace = %cli.namespace,
        listen_addr = %cli.listen_addr,
        "starting doppel impersonation proxy controller"
    );

    let client = Client::try_default().await?;
    controller::run(client, options, handler_factory(), shutdown_signal()).await?;

    info!("doppel impersonation proxy controller exited");
    Ok(())
}
