//! Rampart agent
//!
//! Node-local Kubernetes NetworkPolicy enforcement: watches Namespaces,
//! Pods, and NetworkPolicies and reconciles kernel ipsets and iptables
//! chains through the rampart-npc engine.

mod health;
mod metrics;
mod watch;

use anyhow::Result;
use clap::Parser;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use kube::{Api, Client};
use rampart_ipset::{ExecIpset, Ipset};
use rampart_iptables::{ExecIptables, Iptables};
use rampart_npc::{bootstrap, NetworkPolicyController};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rampart-agent")]
#[command(about = "Node-local Kubernetes NetworkPolicy controller", long_about = None)]
struct Cli {
    /// Address for the metrics and health endpoints
    #[arg(long, default_value = "0.0.0.0:6781")]
    metrics_addr: SocketAddr,

    /// Leave new connections that no policy accepted to fall through
    /// instead of dropping them
    #[arg(long)]
    no_default_drop: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting rampart agent {}", env!("CARGO_PKG_VERSION"));

    let ipt: Arc<dyn Iptables> = Arc::new(ExecIptables::new());
    let ips: Arc<dyn Ipset> = Arc::new(ExecIpset::new());

    // A clean slate before the first event: the kernel state is rebuilt from
    // the full re-list the watchers deliver on startup.
    bootstrap::reset_iptables(ipt.as_ref(), !cli.no_default_drop)?;
    bootstrap::reset_ipsets(ips.as_ref())?;

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let npc = Arc::new(NetworkPolicyController::new(ipt, ips));

    let status = health::HealthStatus::new();
    let server = health::MetricsServer::new(cli.metrics_addr, status.clone());
    tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!("Metrics server failed: {}", e);
        }
    });

    let namespaces: Api<Namespace> = Api::all(client.clone());
    let pods: Api<Pod> = Api::all(client.clone());
    let policies: Api<NetworkPolicy> = Api::all(client.clone());

    status.set_ready(true);

    // Any handler error leaves kernel state of unknown shape behind; dying
    // and re-running bootstrap on restart is the recovery path.
    tokio::select! {
        res = watch::watch_resource(namespaces, npc.clone(), watch::NamespaceHandler) => {
            fatal("namespace watch", res);
        }
        res = watch::watch_resource(pods, npc.clone(), watch::PodHandler) => {
            fatal("pod watch", res);
        }
        res = watch::watch_resource(policies, npc.clone(), watch::PolicyHandler) => {
            fatal("networkpolicy watch", res);
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, exiting");
        }
    }

    Ok(())
}

fn fatal(what: &str, res: Result<()>) -> ! {
    match res {
        Ok(()) => error!("{} stopped unexpectedly", what),
        Err(e) => error!("{} failed: {:#}", what, e),
    }
    std::process::exit(1);
}

async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
    Ok(())
}
