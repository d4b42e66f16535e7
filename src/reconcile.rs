//! C4 — reconciliation loop.
//!
//! Shaped like a `HeartbeatLoop::run`: a `tokio::time::interval` driving
//! periodic work, a `tokio::select!` against an mpsc channel for
//! out-of-band triggers, and a `watch<bool>` stop signal checked every
//! iteration. The startup barrier reuses `backoff` the same way a
//! heartbeat retries its initial registration call, just with a higher
//! floor (2s vs. 1s).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use backoff::ExponentialBackoff;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::adapters::{FilterClient, IpsetClient, RouteClient};
use crate::engine::{ForwardingEngine, TopologyChanged};
use crate::types::{chains, Protocol};

pub struct Reconciler {
    engine: Arc<ForwardingEngine>,
    interval: Duration,
    topology_rx: mpsc::Receiver<TopologyChanged>,
    stop_rx: watch::Receiver<bool>,
}

impl Reconciler {
    pub fn new(
        engine: Arc<ForwardingEngine>,
        interval: Duration,
        topology_rx: mpsc::Receiver<TopologyChanged>,
        stop_rx: watch::Receiver<bool>,
    ) -> Self {
        Self { engine, interval, topology_rx, stop_rx }
    }

    /// Blocks until the first full filter-restore succeeds, retrying with
    /// the startup backoff floor. Fatal conditions still abort the
    /// process; only `KernelTransient`-shaped failures are retried.
    pub async fn wait_for_initial_sync(&self) -> Result<()> {
        let policy = ExponentialBackoff {
            initial_interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(30),
            max_elapsed_time: None,
            ..Default::default()
        };
        backoff::future::retry(policy, || async {
            sync_filter(&self.engine).await.map_err(|e| {
                warn!(error = %e, "initial filter sync failed, retrying");
                backoff::Error::transient(e)
            })
        })
        .await?;
        info!("initial filter sync complete");
        Ok(())
    }

    /// Orphan cleanup driven by the current set of peer Pod CIDRs, run once
    /// at startup outside the periodic loop, not on every pass, to bound
    /// the blast radius of a bad orphan judgment.
    pub async fn reconcile_orphans(&self) -> Result<()> {
        let known: std::collections::HashSet<String> = self.engine.snapshot_peer_routes().keys().cloned().collect();
        let link_index = self.engine.gw_link_index();
        let route_handle = self.engine.route_handle();
        let kernel_routes = route_handle
            .list_routes(Some(link_index), Protocol::Dual)
            .await
            .context("list routes for orphan sweep")?;

        for route in kernel_routes {
            // Only gatewayed, table-less routes on the host-gateway link are
            // candidate peer routes; kernel-auto-generated onlink/link-scope
            // routes are left untouched.
            if route.gateway.is_none() || route.table.is_some() {
                continue;
            }
            if !known.contains(&route.destination.to_string()) {
                warn!(destination = %route.destination, "pruning orphaned peer route at startup");
                route_handle.delete_route(&route).await.context("prune orphaned peer route")?;
            }
        }
        Ok(())
    }

    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.pass("scheduled").await;
                }
                Some(_) = self.topology_rx.recv() => {
                    self.pass("topology-changed").await;
                }
                _ = self.stop_rx.changed() => {
                    if *self.stop_rx.borrow() {
                        info!("reconciliation loop stopping");
                        return;
                    }
                }
            }
        }
    }

    async fn pass(&self, reason: &str) {
        if let Err(e) = sync_sets(&self.engine).await {
            warn!(error = %e, reason, "sync-sets failed");
        }
        if let Err(e) = sync_filter(&self.engine).await {
            warn!(error = %e, reason, "sync-filter failed");
        }
        if let Err(e) = sync_routes(&self.engine).await {
            warn!(error = %e, reason, "sync-routes failed");
        }
        if let Err(e) = sync_neighbors(&self.engine).await {
            warn!(error = %e, reason, "sync-neighbors failed");
        }
    }
}

/// For every set in the desired catalog, create it (idempotent) and push
/// every desired entry. Kernel-only entries are never pruned here — only
/// explicit deletes remove membership.
async fn sync_sets(engine: &ForwardingEngine) -> Result<()> {
    let ipset = engine.ipset_handle();
    ipset.create_set(crate::types::sets::POD_IP, crate::types::SetType::HashNet, Protocol::V4).await.context("ensure pod-ip set")?;
    ipset.create_set(crate::types::sets::POD_IP6, crate::types::SetType::HashNet, Protocol::V6).await.context("ensure pod-ip6 set")?;

    for pod_cidr in engine.snapshot_peer_routes().keys() {
        let set_name = if pod_cidr.contains(':') { crate::types::sets::POD_IP6 } else { crate::types::sets::POD_IP };
        ipset.add_entry(set_name, pod_cidr).await.context("reassert pod-ip entry")?;
    }
    Ok(())
}

/// Rebuilds the text blob for each enabled family from the caches and
/// restores it, then re-asserts the must-precede-kube-proxy jump at
/// position 1 — kube-proxy can reinsert its own jump ahead of ours between
/// passes, so every pass has to win the race back.
async fn sync_filter(engine: &ForwardingEngine) -> Result<()> {
    let filter = engine.filter_handle();
    for protocol in [Protocol::V4, Protocol::V6] {
        let blob = build_restore_blob(engine, protocol);
        filter.restore(&blob, false, protocol).await.context("restore filter blob")?;
        filter
            .insert_rule(protocol, "filter", "FORWARD", &format!("-j {}", chains::FILTER_FORWARD), 1)
            .await
            .context("reassert forward jump")?;
    }
    Ok(())
}

fn build_restore_blob(engine: &ForwardingEngine, protocol: Protocol) -> String {
    let mut blob = String::new();
    let snat_bindings = engine.snapshot_snat_bindings();

    // Every agent-owned chain gets re-declared every pass, not just the
    // ones with entries, so an externally deleted chain comes back even
    // when it would otherwise carry no rules.
    blob.push_str("*raw\n");
    blob.push_str(&format!(":{} -\n", chains::RAW_PREROUTING));
    blob.push_str(&format!(":{} -\n", chains::RAW_OUTPUT));
    blob.push_str("COMMIT\n");

    blob.push_str("*mangle\n");
    blob.push_str(&format!(":{} -\n", chains::MANGLE_MANGLE));
    blob.push_str("COMMIT\n");

    blob.push_str("*nat\n");
    blob.push_str(&format!(":{} -\n", chains::NAT_PREROUTING));
    blob.push_str(&format!(":{} -\n", chains::NAT_OUTPUT));
    blob.push_str(&format!(":{} -\n", chains::NAT_POSTROUTING));
    for (mark, ip) in snat_bindings.iter().filter(|(_, ip)| matches_family(**ip, protocol)) {
        blob.push_str(&format!(
            "-A {} -m mark --mark {:#x}/{:#x} -j SNAT --to {}\n",
            chains::NAT_POSTROUTING, mark, crate::types::SNAT_MARK_MASK, ip
        ));
    }
    blob.push_str("COMMIT\n");

    blob.push_str("*filter\n");
    blob.push_str(&format!(":{} -\n", chains::FILTER_FORWARD));
    blob.push_str(&format!(":{} -\n", chains::FILTER_INPUT));
    blob.push_str(&format!(":{} -\n", chains::FILTER_OUTPUT));
    blob.push_str("COMMIT\n");

    blob
}

fn matches_family(ip: std::net::IpAddr, protocol: Protocol) -> bool {
    match protocol {
        Protocol::V4 => ip.is_ipv4(),
        Protocol::V6 => ip.is_ipv6(),
        Protocol::Dual => true,
    }
}

/// Enumerate kernel routes; for each cached route, replace it if its
/// identity tuple is missing.
async fn sync_routes(engine: &ForwardingEngine) -> Result<()> {
    let route_handle = engine.route_handle();
    let kernel_routes = route_handle.list_routes(None, Protocol::Dual).await.context("list kernel routes")?;
    let kernel_identities: std::collections::HashSet<_> = kernel_routes
        .iter()
        .map(|r| (r.link_index, r.destination, r.gateway, normalize_table(r.table)))
        .collect();

    for (_, desired) in engine.snapshot_peer_routes() {
        for route in desired {
            let identity = (route.link_index, route.destination, route.gateway, normalize_table(route.table));
            if !kernel_identities.contains(&identity) {
                route_handle.replace_route(&route).await.context("heal drifted route")?;
            }
        }
    }
    Ok(())
}

/// `None` and `Some(RT_TABLE_MAIN)` (254) both mean "the main table" to the
/// kernel; without this, every cached route (which carries `table: None`)
/// would be judged missing against the live dump (which always reports a
/// concrete table id) and get replaced on every single pass.
fn normalize_table(table: Option<u32>) -> u32 {
    const RT_TABLE_MAIN: u32 = 254;
    table.unwrap_or(RT_TABLE_MAIN)
}

/// Enumerate permanent neighbors on the host-gateway link and restore any
/// cached neighbor that is missing.
async fn sync_neighbors(engine: &ForwardingEngine) -> Result<()> {
    let route_handle = engine.route_handle();
    let link_index = engine.gw_link_index();
    let kernel_neighbors = route_handle
        .list_neighbors(link_index, Protocol::V6)
        .await
        .context("list kernel neighbors")?;
    let kernel_ips: std::collections::HashSet<_> = kernel_neighbors.iter().map(|n| n.ip).collect();

    for (_, neighbor) in engine.snapshot_peer_neighbors() {
        if !kernel_ips.contains(&neighbor.ip) {
            route_handle.set_neighbor(&neighbor).await.context("heal drifted neighbor")?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::fake::{FakeFilter, FakeIpset, FakeRoutes};
    use crate::types::{EncryptionMode, FeatureGates, NodeConfig, TrafficEncapMode, TunnelType};
    use ipnetwork::IpNetwork;
    use std::str::FromStr;
    use std::sync::Arc as StdArc;

    fn test_engine() -> StdArc<ForwardingEngine> {
        let node_config = NodeConfig {
            node_name: "node-a".into(),
            gw_link_index: 7,
            gw_link_name: "antrea-gw0".into(),
            gw_ipv4: Some("10.0.1.1".parse().unwrap()),
            gw_ipv6: None,
            pod_cidr_v4: Some(IpNetwork::from_str("10.0.1.0/24").unwrap()),
            pod_cidr_v6: None,
            node_transport_ip: "192.168.1.1".parse().unwrap(),
            encap_mode: TrafficEncapMode::Encap,
            tunnel_type: TunnelType::Geneve,
            tunnel_port: 6081,
            encryption_mode: EncryptionMode::None,
            wireguard_port: 0,
            wireguard_link_index: None,
            ipv4_enabled: true,
            ipv6_enabled: false,
            features: FeatureGates::default(),
            transport_subnet_v4: Some(IpNetwork::from_str("192.168.1.0/24").unwrap()),
            transport_subnet_v6: None,
        };
        let (tx, _rx) = mpsc::channel(8);
        StdArc::new(ForwardingEngine::new(
            node_config,
            StdArc::new(FakeIpset::default()),
            StdArc::new(FakeFilter::default()),
            StdArc::new(FakeRoutes::default()),
            tx,
        ))
    }

    #[tokio::test]
    async fn reconcile_heals_externally_deleted_route() {
        let engine = test_engine();
        let pod_cidr = IpNetwork::from_str("10.0.2.0/24").unwrap();
        engine
            .add_routes(pod_cidr, "node-b", "192.168.1.2".parse().unwrap(), "10.0.2.1".parse().unwrap())
            .await
            .unwrap();

        // externally delete the route, bypassing the cache
        let route = engine.snapshot_peer_routes()[&pod_cidr.to_string()][0].clone();
        engine.route_handle().delete_route(&route).await.unwrap();
        assert!(engine.route_handle().list_routes(None, Protocol::V4).await.unwrap().is_empty());

        sync_routes(&engine).await.unwrap();
        let healed = engine.route_handle().list_routes(None, Protocol::V4).await.unwrap();
        assert_eq!(healed.len(), 1);
        assert_eq!(healed[0].destination, pod_cidr);
    }

    #[tokio::test]
    async fn filter_blob_includes_snat_binding_for_matching_family() {
        let engine = test_engine();
        engine.add_snat_rule("198.51.100.7".parse().unwrap(), 0x100).await.unwrap();
        let blob_v4 = build_restore_blob(&engine, Protocol::V4);
        assert!(blob_v4.contains("198.51.100.7"));
        let blob_v6 = build_restore_blob(&engine, Protocol::V6);
        assert!(!blob_v6.contains("198.51.100.7"));
    }

    #[tokio::test]
    async fn restore_blob_redeclares_raw_and_mangle_chains() {
        let engine = test_engine();
        let blob = build_restore_blob(&engine, Protocol::V4);
        assert!(blob.contains("*raw\n"));
        assert!(blob.contains(&format!(":{} -\n", chains::RAW_PREROUTING)));
        assert!(blob.contains(&format!(":{} -\n", chains::RAW_OUTPUT)));
        assert!(blob.contains("*mangle\n"));
        assert!(blob.contains(&format!(":{} -\n", chains::MANGLE_MANGLE)));
    }

    #[test]
    fn normalize_table_folds_none_and_main_to_the_same_key() {
        assert_eq!(normalize_table(None), normalize_table(Some(254)));
        assert_ne!(normalize_table(None), normalize_table(Some(100)));
    }
}
