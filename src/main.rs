//! podrouter - per-node CNI dataplane and policy-enforcement agent.
//!
//! Owns the kernel-facing address sets, packet-filter chains, and routes
//! that implement Pod-to-Pod routing, egress SNAT, and Service dataplane
//! wiring for one node, and keeps them converged against drift via a
//! periodic reconciliation loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use podrouter::adapters::fake::{FakeFilter, FakeIpset, FakeRoutes};
use podrouter::adapters::ipset::SystemIpset;
use podrouter::adapters::iptables::SystemFilter;
use podrouter::adapters::netlink::SystemRoutes;
use podrouter::adapters::{FilterClient, IpsetClient, RouteClient};
use podrouter::config::AgentConfig;
use podrouter::engine::ForwardingEngine;
use podrouter::interface;
use podrouter::reconcile::Reconciler;

struct Cli {
    config_path: Option<String>,
    dry_run: bool,
}

fn parse_args() -> Cli {
    let mut config_path = None;
    let mut dry_run = false;
    let mut args = std::env::args().skip(1);
    // Accept an optional leading "run" subcommand, the only one this agent
    // currently has.
    let mut peek = args.next();
    if peek.as_deref() == Some("run") {
        peek = args.next();
    }
    let mut current = peek;
    while let Some(arg) = current {
        match arg.as_str() {
            "--config" => config_path = args.next(),
            "--dry-run" => dry_run = true,
            other => warn!(arg = other, "ignoring unrecognized argument"),
        }
        current = args.next();
    }
    Cli { config_path, dry_run }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    info!("podrouter starting");

    let cli = parse_args();

    let config = match &cli.config_path {
        Some(path) => AgentConfig::load_from_file(std::path::Path::new(path))?,
        None => AgentConfig::load()?,
    };
    info!(path = %config.config_path().display(), node = %config.node_name, "configuration loaded");

    let dry_run = cli.dry_run || config.dry_run;

    let (gw_link_index, gw_link_name) = if dry_run {
        (1, config.gw_link_name.clone())
    } else {
        interface::resolve_gateway_link(Some(&config.gw_link_name)).context("resolve host-gateway link")?
    };
    info!(link = %gw_link_name, index = gw_link_index, "host-gateway link resolved");

    if !dry_run {
        apply_forwarding_sysctls(config.ipv4_enabled, config.ipv6_enabled);
    }

    let node_config = config.to_node_config(gw_link_index, gw_link_name);

    let (ipset, filter, routes): (Arc<dyn IpsetClient>, Arc<dyn FilterClient>, Arc<dyn RouteClient>) = if dry_run {
        info!("running against in-memory fake adapters (--dry-run)");
        (Arc::new(FakeIpset::default()), Arc::new(FakeFilter::default()), Arc::new(FakeRoutes::default()))
    } else {
        let filter = SystemFilter::new().context("connect to iptables/ip6tables")?;
        let routes = SystemRoutes::new().context("connect to rtnetlink")?;
        (Arc::new(SystemIpset::new(config.ipset_binary.clone())), Arc::new(filter), Arc::new(routes))
    };

    let (topology_tx, topology_rx) = mpsc::channel(32);
    let engine = Arc::new(ForwardingEngine::new(node_config, ipset, filter, routes, topology_tx));

    engine.initialize().await.context("initialize dataplane")?;
    info!("dataplane initialized");

    let (stop_tx, stop_rx) = watch::channel(false);
    let reconciler = Reconciler::new(
        Arc::clone(&engine),
        Duration::from_secs(config.reconcile_interval_secs),
        topology_rx,
        stop_rx,
    );

    reconciler.wait_for_initial_sync().await.context("initial filter sync")?;
    reconciler.reconcile_orphans().await.context("startup orphan sweep")?;

    let reconcile_handle = tokio::spawn(reconciler.run());

    // Collaborator channels: in a full deployment a control-plane client
    // feeds these. This standalone binary has none, so the senders are
    // held here unused and the task just idles — the wiring itself is
    // what matters.
    let (_peer_tx, peer_rx) = mpsc::channel(1);
    let (_policy_tx, policy_rx) = mpsc::channel(1);
    let (_cidr_tx, cidr_rx) = watch::channel(config.pod_cidr_v4.unwrap_or_else(|| "0.0.0.0/0".parse().unwrap()));
    let (_egress_tx, egress_rx) = mpsc::channel(1);
    tokio::spawn(podrouter::collab::drive(Arc::clone(&engine), peer_rx, policy_rx, cidr_rx, egress_rx));

    info!("agent running, press ctrl-c to stop");
    shutdown_signal().await;

    warn!("shutdown signal received, stopping");
    let _ = stop_tx.send(true);
    if let Err(e) = reconcile_handle.await {
        error!(error = %e, "reconciliation task panicked during shutdown");
    }

    info!("podrouter stopped");
    Ok(())
}

/// Best-effort; a node lacking permission to write these already has them
/// set by some other mechanism, so failures here are logged, not fatal.
fn apply_forwarding_sysctls(ipv4_enabled: bool, ipv6_enabled: bool) {
    if ipv4_enabled {
        write_sysctl("/proc/sys/net/ipv4/ip_forward", "1");
    }
    if ipv6_enabled {
        write_sysctl("/proc/sys/net/ipv6/conf/all/forwarding", "1");
    }
}

fn write_sysctl(path: &str, value: &str) {
    if let Err(e) = std::fs::write(path, value) {
        warn!(path, error = %e, "failed to apply forwarding sysctl");
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry().with(filter).with(tracing_subscriber::fmt::layer()).init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install sigterm handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
