//! C5 — forwarding engine: the public contract every collaborator calls
//! into, and the cache of record the reconciliation loop replays onto
//! C1/C2/C3.
//!
//! Shaped like `patronus-cni`'s `EbpfDatapath`: one struct holding
//! `Arc<dyn Trait>` adapter handles plus a handful of `RwLock`-guarded
//! `HashMap` caches, with every public method doing kernel work first and
//! committing to the cache only once every kernel call has succeeded — no
//! partial-cache commit on error.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, RwLock};

use anyhow::{bail, Context, Result};
use ipnetwork::IpNetwork;
use tokio::sync::mpsc;
use tracing::info;

use crate::adapters::{FilterClient, IpsetClient, RouteClient};
use crate::error::AgentError;
use crate::types::{
    chains, sets, EncryptionMode, EgressRouteTable, L4Proto, NeighborDescriptor, NodeConfig,
    PeerReachability, PodCidrKey, Protocol, RouteDescriptor, RouteScope, ServicePortKey, SetType,
    GLOBAL_VMAC, SNAT_MARK_MASK,
};

/// Sent to the reconciliation loop whenever a mutator changes desired
/// state, to trigger an out-of-band pass instead of waiting for the timer.
#[derive(Debug, Clone, Copy)]
pub struct TopologyChanged;

#[derive(Default)]
struct Caches {
    peer_routes: HashMap<PodCidrKey, Vec<RouteDescriptor>>,
    peer_neighbors: HashMap<PodCidrKey, NeighborDescriptor>,
    snat_bindings: HashMap<u32, IpAddr>,
    egress_tables: HashMap<u32, EgressRouteTable>,
    egress_rules: HashSet<(u32, u32)>,
    nodeport_members: HashSet<String>,
    external_ip_refs: HashMap<IpAddr, HashSet<ServicePortKey>>,
    service_cidr: Option<IpNetwork>,
    pod_ip_members_v4: HashSet<String>,
    pod_ip_members_v6: HashSet<String>,
}

pub struct ForwardingEngine {
    node_config: RwLock<NodeConfig>,
    ipset: Arc<dyn IpsetClient>,
    filter: Arc<dyn FilterClient>,
    routes: Arc<dyn RouteClient>,
    caches: RwLock<Caches>,
    topology_tx: mpsc::Sender<TopologyChanged>,
}

fn external_ip_set_name(addr: IpAddr) -> &'static str {
    match addr {
        IpAddr::V4(_) => sets::EXTERNAL_IP,
        IpAddr::V6(_) => sets::EXTERNAL_IP6,
    }
}

fn nodeport_set_name(addr: IpAddr) -> &'static str {
    match addr {
        IpAddr::V4(_) => sets::NODEPORT_IP,
        IpAddr::V6(_) => sets::NODEPORT_IP6,
    }
}

fn pod_ip_set_name(protocol: Protocol) -> &'static str {
    match protocol {
        Protocol::V6 => sets::POD_IP6,
        _ => sets::POD_IP,
    }
}

impl ForwardingEngine {
    pub fn new(
        node_config: NodeConfig,
        ipset: Arc<dyn IpsetClient>,
        filter: Arc<dyn FilterClient>,
        routes: Arc<dyn RouteClient>,
        topology_tx: mpsc::Sender<TopologyChanged>,
    ) -> Self {
        Self {
            node_config: RwLock::new(node_config),
            ipset,
            filter,
            routes,
            caches: RwLock::new(Caches::default()),
            topology_tx,
        }
    }

    fn node_config(&self) -> NodeConfig {
        self.node_config.read().unwrap().clone()
    }

    fn signal_topology_changed(&self) {
        // Best-effort: a full channel means a pass is already pending.
        let _ = self.topology_tx.try_send(TopologyChanged);
    }

    /// Startup: prime catalog sets/chains, ensure jump rules, prime caches.
    /// Does not itself drive sysctl writes; see `reconcile::apply_sysctls`,
    /// invoked by `main` alongside this.
    pub async fn initialize(&self) -> Result<()> {
        let protocol = self.node_config().enabled_protocol();
        for p in protocol.families() {
            self.ipset
                .create_set(pod_ip_set_name(*p), SetType::HashNet, *p)
                .await
                .context("create pod-ip set")?;
            self.ipset
                .create_set(nodeport_set_name(family_sentinel(*p)), SetType::HashIpPort, *p)
                .await
                .context("create nodeport set")?;
            self.ipset
                .create_set(external_ip_set_name(family_sentinel(*p)), SetType::HashIp, *p)
                .await
                .context("create external-ip set")?;

            self.filter.ensure_chain(*p, "raw", chains::RAW_PREROUTING).await.context("ensure raw prerouting chain")?;
            self.filter.ensure_chain(*p, "raw", chains::RAW_OUTPUT).await.context("ensure raw output chain")?;
            self.filter.ensure_chain(*p, "mangle", chains::MANGLE_MANGLE).await.context("ensure mangle chain")?;
            self.filter.ensure_chain(*p, "filter", chains::FILTER_FORWARD).await.context("ensure forward chain")?;
            self.filter.ensure_chain(*p, "filter", chains::FILTER_INPUT).await.context("ensure input chain")?;
            self.filter.ensure_chain(*p, "filter", chains::FILTER_OUTPUT).await.context("ensure filter output chain")?;
            self.filter.ensure_chain(*p, "nat", chains::NAT_PREROUTING).await.context("ensure nat prerouting chain")?;
            self.filter.ensure_chain(*p, "nat", chains::NAT_OUTPUT).await.context("ensure nat output chain")?;
            self.filter.ensure_chain(*p, "nat", chains::NAT_POSTROUTING).await.context("ensure nat postrouting chain")?;

            // Must-precede-kube-proxy jump: inserted at position 1, every
            // reconcile pass re-asserts this.
            self.filter
                .insert_rule(*p, "filter", "FORWARD", &format!("-j {}", chains::FILTER_FORWARD), 1)
                .await
                .context("insert forward jump")?;
            self.filter
                .append_rule(*p, "nat", "POSTROUTING", &format!("-j {}", chains::NAT_POSTROUTING))
                .await
                .context("append postrouting jump")?;
        }
        info!("forwarding engine initialized");
        Ok(())
    }

    // ---- Peer membership ----

    fn decide_reachability(&self, node_config: &NodeConfig, peer_gateway_ip: IpAddr, peer_node_ip: IpAddr) -> PeerReachability {
        if node_config.encap_mode.is_network_policy_only() {
            return PeerReachability::NetworkPolicyOnly;
        }
        if node_config.encryption_mode == EncryptionMode::WireGuard {
            return PeerReachability::WireGuard;
        }
        let _ = peer_gateway_ip;
        if node_config.encap_mode.supports_encap() {
            use crate::types::TrafficEncapMode::*;
            match node_config.encap_mode {
                Encap => return PeerReachability::Encap,
                Hybrid if node_config.is_cross_subnet(peer_node_ip) => return PeerReachability::Encap,
                _ => {}
            }
        }
        PeerReachability::Direct
    }

    fn build_peer_routes(
        &self,
        node_config: &NodeConfig,
        reachability: PeerReachability,
        pod_cidr: IpNetwork,
        peer_node_ip: IpAddr,
        peer_gateway_ip: IpAddr,
    ) -> Vec<RouteDescriptor> {
        let gw_link_index = node_config.gw_link_index;
        match reachability {
            PeerReachability::NetworkPolicyOnly => Vec::new(),
            PeerReachability::WireGuard => {
                let link_index = node_config.wireguard_link_index.unwrap_or(gw_link_index);
                let source = match pod_cidr {
                    IpNetwork::V4(_) => node_config.gw_ipv4,
                    IpNetwork::V6(_) => node_config.gw_ipv6,
                };
                vec![RouteDescriptor {
                    destination: pod_cidr,
                    gateway: None,
                    link_index,
                    scope: RouteScope::Link,
                    onlink: false,
                    source,
                    table: None,
                }]
            }
            PeerReachability::Encap => match pod_cidr {
                IpNetwork::V4(_) => vec![RouteDescriptor {
                    destination: pod_cidr,
                    gateway: Some(peer_gateway_ip),
                    link_index: gw_link_index,
                    scope: RouteScope::Universe,
                    onlink: true,
                    source: None,
                    table: None,
                }],
                IpNetwork::V6(_) => {
                    let neighbor_host = IpNetwork::new(peer_gateway_ip, 128).expect("host prefix always valid");
                    vec![
                        RouteDescriptor {
                            destination: neighbor_host,
                            gateway: None,
                            link_index: gw_link_index,
                            scope: RouteScope::Link,
                            onlink: false,
                            source: None,
                            table: None,
                        },
                        RouteDescriptor {
                            destination: pod_cidr,
                            gateway: Some(peer_gateway_ip),
                            link_index: gw_link_index,
                            scope: RouteScope::Universe,
                            onlink: false,
                            source: None,
                            table: None,
                        },
                    ]
                }
            },
            PeerReachability::Direct => vec![RouteDescriptor {
                destination: pod_cidr,
                gateway: Some(peer_node_ip),
                link_index: gw_link_index,
                scope: RouteScope::Universe,
                onlink: false,
                source: None,
                table: None,
            }],
        }
    }

    pub async fn add_routes(
        &self,
        pod_cidr: IpNetwork,
        _node_name: &str,
        peer_node_ip: IpAddr,
        peer_gateway_ip: IpAddr,
    ) -> Result<()> {
        let node_config = self.node_config();
        let reachability = self.decide_reachability(&node_config, peer_gateway_ip, peer_node_ip);
        let route_descriptors = self.build_peer_routes(&node_config, reachability, pod_cidr, peer_node_ip, peer_gateway_ip);

        let set_name = pod_ip_set_name(match pod_cidr {
            IpNetwork::V4(_) => Protocol::V4,
            IpNetwork::V6(_) => Protocol::V6,
        });
        self.ipset
            .add_entry(set_name, &pod_cidr.to_string())
            .await
            .context("add pod cidr to address set")?;

        for route in &route_descriptors {
            self.routes.replace_route(route).await.context("install peer route")?;
        }

        let neighbor = if reachability == PeerReachability::Encap && matches!(pod_cidr, IpNetwork::V6(_)) {
            let neighbor = NeighborDescriptor {
                link_index: node_config.gw_link_index,
                ip: peer_gateway_ip,
                mac: GLOBAL_VMAC,
            };
            self.routes.set_neighbor(&neighbor).await.context("install peer neighbor")?;
            Some(neighbor)
        } else {
            None
        };

        let mut caches = self.caches.write().unwrap();
        let key = pod_cidr.to_string();
        caches.peer_routes.insert(key.clone(), route_descriptors);
        match neighbor {
            Some(n) => {
                caches.peer_neighbors.insert(key, n);
            }
            None => {
                caches.peer_neighbors.remove(&key);
            }
        }
        match pod_cidr {
            IpNetwork::V4(_) => {
                caches.pod_ip_members_v4.insert(pod_cidr.to_string());
            }
            IpNetwork::V6(_) => {
                caches.pod_ip_members_v6.insert(pod_cidr.to_string());
            }
        }
        drop(caches);
        self.signal_topology_changed();
        Ok(())
    }

    pub async fn delete_routes(&self, pod_cidr: IpNetwork) -> Result<()> {
        let key = pod_cidr.to_string();
        let (routes_to_delete, neighbor_to_delete) = {
            let caches = self.caches.read().unwrap();
            match caches.peer_routes.get(&key) {
                Some(routes) => (routes.clone(), caches.peer_neighbors.get(&key).cloned()),
                None => return Ok(()), // cache is the system of record; absent = no-op
            }
        };

        for route in &routes_to_delete {
            self.routes.delete_route(route).await.context("delete peer route")?;
        }
        if let Some(neighbor) = &neighbor_to_delete {
            self.routes.delete_neighbor(neighbor).await.context("delete peer neighbor")?;
        }
        let set_name = pod_ip_set_name(match pod_cidr {
            IpNetwork::V4(_) => Protocol::V4,
            IpNetwork::V6(_) => Protocol::V6,
        });
        self.ipset.delete_entry(set_name, &pod_cidr.to_string()).await.context("remove pod cidr from address set")?;

        let mut caches = self.caches.write().unwrap();
        caches.peer_routes.remove(&key);
        caches.peer_neighbors.remove(&key);
        caches.pod_ip_members_v4.remove(&key);
        caches.pod_ip_members_v6.remove(&key);
        drop(caches);
        self.signal_topology_changed();
        Ok(())
    }

    // ---- Egress SNAT ----

    pub async fn add_snat_rule(&self, snat_ip: IpAddr, mark: u32) -> Result<()> {
        let random_fully = self.node_config().features.egress_snat_random_fully && self.filter.has_random_fully().await;
        let mut rule = format!(
            "-m mark --mark {:#x}/{:#x} -j SNAT --to {}",
            mark, SNAT_MARK_MASK, snat_ip
        );
        if random_fully {
            rule.push_str(" --random-fully");
        }
        let protocol = match snat_ip {
            IpAddr::V4(_) => Protocol::V4,
            IpAddr::V6(_) => Protocol::V6,
        };
        self.filter
            .insert_rule(protocol, "nat", chains::NAT_POSTROUTING, &rule, 1)
            .await
            .context("insert snat rule")?;

        self.caches.write().unwrap().snat_bindings.insert(mark, snat_ip);
        self.signal_topology_changed();
        Ok(())
    }

    pub async fn delete_snat_rule(&self, mark: u32) -> Result<()> {
        let snat_ip = match self.caches.read().unwrap().snat_bindings.get(&mark).copied() {
            Some(ip) => ip,
            None => return Ok(()),
        };
        let protocol = match snat_ip {
            IpAddr::V4(_) => Protocol::V4,
            IpAddr::V6(_) => Protocol::V6,
        };
        // Both random-fully variants are tried; whichever matches the live
        // rule is removed, the other is a CacheInconsistency-style no-op.
        for suffix in ["", " --random-fully"] {
            let rule = format!(
                "-m mark --mark {:#x}/{:#x} -j SNAT --to {}{}",
                mark, SNAT_MARK_MASK, snat_ip, suffix
            );
            self.filter.delete_rule(protocol, "nat", chains::NAT_POSTROUTING, &rule).await.context("delete snat rule")?;
        }
        self.caches.write().unwrap().snat_bindings.remove(&mark);
        self.signal_topology_changed();
        Ok(())
    }

    // ---- Egress policy routing ----

    pub async fn add_egress_routes(&self, table_id: u32, dev_index: u32, gateway: IpAddr, prefix_len: u8) -> Result<()> {
        let subnet_route = RouteDescriptor {
            destination: IpNetwork::new(gateway, prefix_len).context("build egress subnet prefix")?,
            gateway: None,
            link_index: dev_index,
            scope: RouteScope::Link,
            onlink: false,
            source: None,
            table: Some(table_id),
        };
        let default_route = RouteDescriptor {
            destination: IpNetwork::new(zero_addr(gateway), 0).context("build default route")?,
            gateway: Some(gateway),
            link_index: dev_index,
            scope: RouteScope::Universe,
            onlink: false,
            source: None,
            table: Some(table_id),
        };
        self.routes.replace_route(&subnet_route).await.context("install egress subnet route")?;
        self.routes.replace_route(&default_route).await.context("install egress default route")?;

        self.caches.write().unwrap().egress_tables.insert(
            table_id,
            EgressRouteTable { table_id, dev_index, gateway, prefix_len },
        );
        self.signal_topology_changed();
        Ok(())
    }

    pub async fn delete_egress_routes(&self, table_id: u32) -> Result<()> {
        let table = match self.caches.read().unwrap().egress_tables.get(&table_id).copied() {
            Some(t) => t,
            None => return Ok(()),
        };
        let subnet_route = RouteDescriptor {
            destination: IpNetwork::new(table.gateway, table.prefix_len).context("build egress subnet prefix")?,
            gateway: None,
            link_index: table.dev_index,
            scope: RouteScope::Link,
            onlink: false,
            source: None,
            table: Some(table_id),
        };
        let default_route = RouteDescriptor {
            destination: IpNetwork::new(zero_addr(table.gateway), 0).context("build default route")?,
            gateway: Some(table.gateway),
            link_index: table.dev_index,
            scope: RouteScope::Universe,
            onlink: false,
            source: None,
            table: Some(table_id),
        };
        self.routes.delete_route(&subnet_route).await.context("delete egress subnet route")?;
        self.routes.delete_route(&default_route).await.context("delete egress default route")?;
        self.caches.write().unwrap().egress_tables.remove(&table_id);
        self.signal_topology_changed();
        Ok(())
    }

    pub async fn add_egress_rule(&self, table_id: u32, mark: u32) -> Result<()> {
        let protocol = self.node_config().enabled_protocol();
        self.routes.add_rule(mark, SNAT_MARK_MASK, table_id, protocol).await.context("install egress policy rule")?;
        self.caches.write().unwrap().egress_rules.insert((table_id, mark));
        self.signal_topology_changed();
        Ok(())
    }

    pub async fn delete_egress_rule(&self, table_id: u32, mark: u32) -> Result<()> {
        if !self.caches.read().unwrap().egress_rules.contains(&(table_id, mark)) {
            return Ok(());
        }
        let protocol = self.node_config().enabled_protocol();
        self.routes.delete_rule(mark, SNAT_MARK_MASK, table_id, protocol).await.context("delete egress policy rule")?;
        self.caches.write().unwrap().egress_rules.remove(&(table_id, mark));
        self.signal_topology_changed();
        Ok(())
    }

    pub async fn restore_egress_routes_and_rules(&self, min_table: u32, max_table: u32) -> Result<()> {
        let protocol = self.node_config().enabled_protocol();
        for p in protocol.families() {
            let rules = self.routes.list_routes(None, *p).await.context("list routes for egress purge")?;
            for route in rules.into_iter().filter(|r| r.table.map(|t| (min_table..=max_table).contains(&t)).unwrap_or(false)) {
                self.routes.delete_route(&route).await.context("purge egress route")?;
            }
        }
        self.caches.write().unwrap().egress_tables.retain(|id, _| !(min_table..=max_table).contains(id));
        self.caches.write().unwrap().egress_rules.retain(|(id, _)| !(min_table..=max_table).contains(id));
        Ok(())
    }

    // ---- Services ----

    pub async fn add_nodeport_configs(&self, ips: &[IpAddr], port: u16, proto: L4Proto) -> Result<()> {
        for ip in ips {
            let entry = format!("{},{}:{}", ip, proto.as_str(), port);
            self.ipset.add_entry(nodeport_set_name(*ip), &entry).await.context("add nodeport entry")?;
            self.caches.write().unwrap().nodeport_members.insert(entry);
        }
        Ok(())
    }

    pub async fn delete_nodeport_configs(&self, ips: &[IpAddr], port: u16, proto: L4Proto) -> Result<()> {
        for ip in ips {
            let entry = format!("{},{}:{}", ip, proto.as_str(), port);
            self.ipset.delete_entry(nodeport_set_name(*ip), &entry).await.context("delete nodeport entry")?;
            self.caches.write().unwrap().nodeport_members.remove(&entry);
        }
        Ok(())
    }

    pub async fn add_external_ip_configs(&self, service_port_key: &ServicePortKey, ip: IpAddr) -> Result<()> {
        let needs_install = {
            let caches = self.caches.read().unwrap();
            caches.external_ip_refs.get(&ip).map(|refs| refs.is_empty()).unwrap_or(true)
        };

        if needs_install {
            let node_config = self.node_config();
            let gw = match ip {
                IpAddr::V4(_) => node_config.gw_ipv4,
                IpAddr::V6(_) => node_config.gw_ipv6,
            };
            if let Some(gw) = gw {
                let prefix = if ip.is_ipv4() { 32 } else { 128 };
                let route = RouteDescriptor {
                    destination: IpNetwork::new(ip, prefix).context("build external ip route")?,
                    gateway: Some(gw),
                    link_index: node_config.gw_link_index,
                    scope: RouteScope::Universe,
                    onlink: false,
                    source: None,
                    table: None,
                };
                self.routes.replace_route(&route).await.context("install external ip route")?;
            }
            self.ipset.add_entry(external_ip_set_name(ip), &ip.to_string()).await.context("add external ip set entry")?;
        }

        self.caches
            .write()
            .unwrap()
            .external_ip_refs
            .entry(ip)
            .or_default()
            .insert(service_port_key.clone());
        Ok(())
    }

    pub async fn delete_external_ip_configs(&self, service_port_key: &ServicePortKey, ip: IpAddr) -> Result<()> {
        let now_empty = {
            let mut caches = self.caches.write().unwrap();
            if let Some(refs) = caches.external_ip_refs.get_mut(&ip) {
                refs.remove(service_port_key);
                let empty = refs.is_empty();
                if empty {
                    caches.external_ip_refs.remove(&ip);
                }
                empty
            } else {
                return Ok(());
            }
        };

        if now_empty {
            let node_config = self.node_config();
            let gw = match ip {
                IpAddr::V4(_) => node_config.gw_ipv4,
                IpAddr::V6(_) => node_config.gw_ipv6,
            };
            // Route deletion precedes set-entry deletion without
            // resynchronizing the filter blob; a brief window where a rule
            // references a now-empty set entry is tolerated by design.
            if let Some(gw) = gw {
                let prefix = if ip.is_ipv4() { 32 } else { 128 };
                let route = RouteDescriptor {
                    destination: IpNetwork::new(ip, prefix).context("build external ip route")?,
                    gateway: Some(gw),
                    link_index: node_config.gw_link_index,
                    scope: RouteScope::Universe,
                    onlink: false,
                    source: None,
                    table: None,
                };
                self.routes.delete_route(&route).await.context("delete external ip route")?;
            }
            self.ipset.delete_entry(external_ip_set_name(ip), &ip.to_string()).await.context("delete external ip set entry")?;
        }
        Ok(())
    }

    pub async fn add_service_cidr_route(&self, cidr: IpNetwork) -> Result<()> {
        let node_config = self.node_config();
        let gw = match cidr {
            IpNetwork::V4(_) => node_config.gw_ipv4,
            IpNetwork::V6(_) => node_config.gw_ipv6,
        };
        let gw = match gw {
            Some(gw) => gw,
            None => bail!("no host-gateway address configured for service cidr family"),
        };
        let new_route = RouteDescriptor {
            destination: cidr,
            gateway: Some(gw),
            link_index: node_config.gw_link_index,
            scope: RouteScope::Universe,
            onlink: false,
            source: None,
            table: None,
        };
        // New covering route is installed before the old one is torn down,
        // so there is never a window with neither route present (S5).
        self.routes.replace_route(&new_route).await.context("install service cidr route")?;

        let stale = {
            let mut caches = self.caches.write().unwrap();
            let old = caches.service_cidr.replace(cidr);
            old.filter(|old| *old != cidr && covers_or_is_covered(*old, cidr))
        };
        if let Some(stale) = stale {
            let stale_route = RouteDescriptor {
                destination: stale,
                gateway: Some(gw),
                link_index: node_config.gw_link_index,
                scope: RouteScope::Universe,
                onlink: false,
                source: None,
                table: None,
            };
            self.routes.delete_route(&stale_route).await.context("remove stale service cidr route")?;
        }
        Ok(())
    }

    pub fn snapshot_snat_bindings(&self) -> HashMap<u32, IpAddr> {
        self.caches.read().unwrap().snat_bindings.clone()
    }

    pub fn snapshot_peer_routes(&self) -> HashMap<PodCidrKey, Vec<RouteDescriptor>> {
        self.caches.read().unwrap().peer_routes.clone()
    }

    pub fn snapshot_peer_neighbors(&self) -> HashMap<PodCidrKey, NeighborDescriptor> {
        self.caches.read().unwrap().peer_neighbors.clone()
    }

    pub fn ipset_handle(&self) -> Arc<dyn IpsetClient> {
        self.ipset.clone()
    }

    pub fn filter_handle(&self) -> Arc<dyn FilterClient> {
        self.filter.clone()
    }

    pub fn route_handle(&self) -> Arc<dyn RouteClient> {
        self.routes.clone()
    }

    pub fn gw_link_index(&self) -> u32 {
        self.node_config().gw_link_index
    }
}

fn family_sentinel(protocol: Protocol) -> IpAddr {
    match protocol {
        Protocol::V6 => IpAddr::from([0u16; 8]),
        _ => IpAddr::from([0u8; 4]),
    }
}

fn zero_addr(like: IpAddr) -> IpAddr {
    match like {
        IpAddr::V4(_) => IpAddr::from([0u8; 4]),
        IpAddr::V6(_) => IpAddr::from([0u16; 8]),
    }
}

fn covers_or_is_covered(a: IpNetwork, b: IpNetwork) -> bool {
    match (a, b) {
        (IpNetwork::V4(a), IpNetwork::V4(b)) => a.contains(b.ip()) || b.contains(a.ip()),
        (IpNetwork::V6(a), IpNetwork::V6(b)) => a.contains(b.ip()) || b.contains(a.ip()),
        _ => false,
    }
}

/// Surfaces a kernel-adapter failure without swallowing its taxonomy, used
/// where callers want to branch on `AgentError` variants rather than the
/// flattened `anyhow::Error` chain.
pub fn downcast_kernel_error(err: &anyhow::Error) -> Option<&AgentError> {
    err.downcast_ref::<AgentError>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::fake::{FakeFilter, FakeIpset, FakeRoutes};
    use crate::types::{FeatureGates, TrafficEncapMode, TunnelType};
    use std::str::FromStr;

    fn test_node_config() -> NodeConfig {
        NodeConfig {
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
        }
    }

    fn test_engine() -> ForwardingEngine {
        let (tx, _rx) = mpsc::channel(8);
        ForwardingEngine::new(
            test_node_config(),
            Arc::new(FakeIpset::default()),
            Arc::new(FakeFilter::default()),
            Arc::new(FakeRoutes::default()),
            tx,
        )
    }

    // S1 — peer add/remove (encap v4)
    #[tokio::test]
    async fn s1_peer_add_remove_encap_v4() {
        let engine = test_engine();
        let pod_cidr = IpNetwork::from_str("10.0.2.0/24").unwrap();
        engine
            .add_routes(pod_cidr, "node-b", "192.168.1.2".parse().unwrap(), "10.0.2.1".parse().unwrap())
            .await
            .unwrap();

        let routes = engine.snapshot_peer_routes();
        let installed = &routes[&pod_cidr.to_string()];
        assert_eq!(installed.len(), 1);
        assert_eq!(installed[0].link_index, 7);
        assert!(installed[0].onlink);
        assert_eq!(installed[0].gateway, Some("10.0.2.1".parse().unwrap()));

        let members = engine.ipset_handle().list_entries(sets::POD_IP).await.unwrap();
        assert!(members.contains(&"10.0.2.0/24".to_string()));

        engine.delete_routes(pod_cidr).await.unwrap();
        assert!(engine.snapshot_peer_routes().get(&pod_cidr.to_string()).is_none());
        let members = engine.ipset_handle().list_entries(sets::POD_IP).await.unwrap();
        assert!(!members.contains(&"10.0.2.0/24".to_string()));
    }

    // S2 — peer add (wireguard v6)
    #[tokio::test]
    async fn s2_peer_add_wireguard_v6() {
        let mut node_config = test_node_config();
        node_config.encryption_mode = EncryptionMode::WireGuard;
        node_config.wireguard_link_index = Some(9);
        node_config.gw_ipv6 = Some("fe80::1".parse().unwrap());
        node_config.pod_cidr_v6 = Some(IpNetwork::from_str("2001:db8:1::/64").unwrap());
        node_config.ipv6_enabled = true;

        let (tx, _rx) = mpsc::channel(8);
        let engine = ForwardingEngine::new(
            node_config,
            Arc::new(FakeIpset::default()),
            Arc::new(FakeFilter::default()),
            Arc::new(FakeRoutes::default()),
            tx,
        );

        let pod_cidr = IpNetwork::from_str("2001:db8:2::/64").unwrap();
        engine
            .add_routes(pod_cidr, "node-b", "2001:db8:2::2".parse().unwrap(), "2001:db8:2::1".parse().unwrap())
            .await
            .unwrap();

        let routes = engine.snapshot_peer_routes();
        let installed = &routes[&pod_cidr.to_string()];
        assert_eq!(installed.len(), 1);
        assert_eq!(installed[0].link_index, 9);
        assert_eq!(installed[0].scope, RouteScope::Link);
        assert_eq!(installed[0].source, Some("fe80::1".parse().unwrap()));
        assert!(engine.snapshot_peer_neighbors().get(&pod_cidr.to_string()).is_none());
    }

    // S3 — SNAT install
    #[tokio::test]
    async fn s3_snat_install_and_delete() {
        let engine = test_engine();
        engine.add_snat_rule("198.51.100.7".parse().unwrap(), 0x100).await.unwrap();
        let rules = engine.filter_handle().list_rules(Protocol::V4, "nat", chains::NAT_POSTROUTING).await.unwrap();
        assert_eq!(rules.len(), 1);
        assert!(rules[0].contains("198.51.100.7"));
        assert!(rules[0].contains(&format!("{:#x}", 0x100u32)));

        engine.delete_snat_rule(0x100).await.unwrap();
        let rules = engine.filter_handle().list_rules(Protocol::V4, "nat", chains::NAT_POSTROUTING).await.unwrap();
        assert!(rules.is_empty());
    }

    // S4 — NodePort set
    #[tokio::test]
    async fn s4_nodeport_set_members() {
        let engine = test_engine();
        let ips = vec!["10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap()];
        engine.add_nodeport_configs(&ips, 30080, L4Proto::Tcp).await.unwrap();
        let members = engine.ipset_handle().list_entries(sets::NODEPORT_IP).await.unwrap();
        assert!(members.contains(&"10.0.0.1,tcp:30080".to_string()));
        assert!(members.contains(&"10.0.0.2,tcp:30080".to_string()));

        engine.delete_nodeport_configs(&ips, 30080, L4Proto::Tcp).await.unwrap();
        assert!(engine.caches.read().unwrap().nodeport_members.is_empty());
    }

    #[tokio::test]
    async fn external_ip_ref_counting() {
        let engine = test_engine();
        let ip: IpAddr = "203.0.113.5".parse().unwrap();
        for i in 0..3 {
            engine.add_external_ip_configs(&format!("svc-{i}"), ip).await.unwrap();
        }
        let members = engine.ipset_handle().list_entries(sets::EXTERNAL_IP).await.unwrap();
        assert_eq!(members, vec![ip.to_string()]);

        for i in 0..2 {
            engine.delete_external_ip_configs(&format!("svc-{i}"), ip).await.unwrap();
        }
        let members = engine.ipset_handle().list_entries(sets::EXTERNAL_IP).await.unwrap();
        assert_eq!(members, vec![ip.to_string()], "one reference remains, entry must still exist");

        engine.delete_external_ip_configs("svc-2", ip).await.unwrap();
        let members = engine.ipset_handle().list_entries(sets::EXTERNAL_IP).await.unwrap();
        assert!(members.is_empty());
    }

    #[tokio::test]
    async fn idempotent_add_routes_is_stable() {
        let engine = test_engine();
        let pod_cidr = IpNetwork::from_str("10.0.3.0/24").unwrap();
        engine.add_routes(pod_cidr, "node-c", "192.168.1.3".parse().unwrap(), "10.0.3.1".parse().unwrap()).await.unwrap();
        engine.add_routes(pod_cidr, "node-c", "192.168.1.3".parse().unwrap(), "10.0.3.1".parse().unwrap()).await.unwrap();
        let routes = engine.snapshot_peer_routes();
        assert_eq!(routes[&pod_cidr.to_string()].len(), 1);
        let members = engine.ipset_handle().list_entries(sets::POD_IP).await.unwrap();
        assert_eq!(members.iter().filter(|m| *m == "10.0.3.0/24").count(), 1);
    }
}
