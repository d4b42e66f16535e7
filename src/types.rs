//! Node-local data model for kernel-facing caches.
//!
//! Every cache the engine and reconciler touch is a value-typed structure
//! keyed by a stable identifier: nothing in this module holds a reference
//! back into `engine` or the adapters.

use std::net::IpAddr;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

/// How inter-node Pod traffic is encapsulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TrafficEncapMode {
    Encap,
    NoEncap,
    Hybrid,
    NetworkPolicyOnly,
}

impl TrafficEncapMode {
    pub fn supports_encap(self) -> bool {
        matches!(self, TrafficEncapMode::Encap | TrafficEncapMode::Hybrid)
    }

    pub fn is_network_policy_only(self) -> bool {
        matches!(self, TrafficEncapMode::NetworkPolicyOnly)
    }
}

/// Tunnel encapsulation used when `TrafficEncapMode` requires one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelType {
    Geneve,
    Vxlan,
    Stt,
    None,
}

/// Transport encryption applied to inter-node traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionMode {
    None,
    IpSec,
    WireGuard,
}

/// Protocol fan-out selector used throughout the packet-filter manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    V4,
    V6,
    Dual,
}

impl Protocol {
    /// Expand `Dual` into the concrete families it fans out to.
    pub fn families(self) -> &'static [Protocol] {
        match self {
            Protocol::V4 => &[Protocol::V4],
            Protocol::V6 => &[Protocol::V6],
            Protocol::Dual => &[Protocol::V4, Protocol::V6],
        }
    }
}

/// Feature flags that gate optional behavior across the engine.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FeatureGates {
    pub proxy_all: bool,
    pub multicast_enabled: bool,
    pub node_network_policy_enabled: bool,
    pub node_latency_monitor_enabled: bool,
    pub connect_uplink_to_bridge: bool,
    pub is_cloud_eks: bool,
    pub no_snat: bool,
    pub node_snat_random_fully: bool,
    pub egress_snat_random_fully: bool,
}

/// Node topology, constructed once at startup and thereafter read-only.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_name: String,
    pub gw_link_index: u32,
    pub gw_link_name: String,
    pub gw_ipv4: Option<IpAddr>,
    pub gw_ipv6: Option<IpAddr>,
    pub pod_cidr_v4: Option<IpNetwork>,
    pub pod_cidr_v6: Option<IpNetwork>,
    pub node_transport_ip: IpAddr,
    pub encap_mode: TrafficEncapMode,
    pub tunnel_type: TunnelType,
    pub tunnel_port: u16,
    pub encryption_mode: EncryptionMode,
    pub wireguard_port: u16,
    pub wireguard_link_index: Option<u32>,
    pub ipv4_enabled: bool,
    pub ipv6_enabled: bool,
    pub features: FeatureGates,
    /// Local node's transport-address subnets, used by hybrid encap mode
    /// to decide whether a peer is cross-subnet.
    pub transport_subnet_v4: Option<IpNetwork>,
    pub transport_subnet_v6: Option<IpNetwork>,
}

impl NodeConfig {
    /// Families this node actually routes traffic for.
    pub fn enabled_protocol(&self) -> Protocol {
        match (self.ipv4_enabled, self.ipv6_enabled) {
            (true, true) => Protocol::Dual,
            (true, false) => Protocol::V4,
            (false, true) => Protocol::V6,
            (false, false) => Protocol::Dual,
        }
    }

    /// True when `peer_transport_ip` falls outside this node's local
    /// transport subnet for its address family.
    pub fn is_cross_subnet(&self, peer_transport_ip: IpAddr) -> bool {
        let subnet = match peer_transport_ip {
            IpAddr::V4(_) => self.transport_subnet_v4,
            IpAddr::V6(_) => self.transport_subnet_v6,
        };
        match subnet {
            Some(net) => !net.contains(peer_transport_ip),
            None => true,
        }
    }
}

/// L4 protocol for NodePort set entries ("ip,proto:port").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L4Proto {
    Tcp,
    Udp,
    Sctp,
}

impl L4Proto {
    pub fn as_str(self) -> &'static str {
        match self {
            L4Proto::Tcp => "tcp",
            L4Proto::Udp => "udp",
            L4Proto::Sctp => "sctp",
        }
    }
}

/// Key identifying one service-port reference into the external-IP
/// ref-count table.
pub type ServicePortKey = String;

/// A single kernel route descriptor, one of possibly several making up a
/// peer Pod CIDR's route list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDescriptor {
    pub destination: IpNetwork,
    pub gateway: Option<IpAddr>,
    pub link_index: u32,
    pub scope: RouteScope,
    pub onlink: bool,
    pub source: Option<IpAddr>,
    pub table: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteScope {
    Universe,
    Link,
    Host,
}

/// Key for the per-peer-node route cache: the peer's Pod CIDR.
pub type PodCidrKey = String;

/// A permanent IPv6 neighbor entry bound to the host-gateway link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborDescriptor {
    pub link_index: u32,
    pub ip: IpAddr,
    pub mac: [u8; 6],
}

/// How a peer Pod CIDR is reached, decided once per `AddRoutes` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerReachability {
    WireGuard,
    Encap,
    Direct,
    NetworkPolicyOnly,
}

/// Egress SNAT binding: packet mark -> address to masquerade to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnatBinding {
    pub mark: u32,
    pub snat_ip: IpAddr,
}

/// A private policy-routing table reserved for one egress binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EgressRouteTable {
    pub table_id: u32,
    pub dev_index: u32,
    pub gateway: IpAddr,
    pub prefix_len: u8,
}

/// Address-set entry type, mirrored 1:1 from the `ipset` type name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetType {
    HashIp,
    HashNet,
    HashIpPort,
}

impl SetType {
    pub fn ipset_type_name(self, protocol: Protocol) -> &'static str {
        match (self, protocol) {
            (SetType::HashIp, Protocol::V4) => "hash:ip",
            (SetType::HashIp, Protocol::V6) => "hash:ip",
            (SetType::HashNet, _) => "hash:net",
            (SetType::HashIpPort, _) => "hash:ip,port",
            (_, Protocol::Dual) => unreachable!("a concrete set has exactly one family"),
        }
    }
}

/// Fixed catalog names for agent-owned chains.
pub mod chains {
    pub const RAW_PREROUTING: &str = "ANTREA-PREROUTING";
    pub const RAW_OUTPUT: &str = "ANTREA-OUTPUT";
    pub const MANGLE_MANGLE: &str = "ANTREA-MANGLE";
    pub const FILTER_FORWARD: &str = "ANTREA-FORWARD";
    pub const FILTER_INPUT: &str = "ANTREA-INPUT";
    pub const FILTER_OUTPUT: &str = "ANTREA-OUTPUT";
    pub const NAT_PREROUTING: &str = "ANTREA-PREROUTING";
    pub const NAT_OUTPUT: &str = "ANTREA-OUTPUT";
    pub const NAT_POSTROUTING: &str = "ANTREA-POSTROUTING";
    pub const POL_PRE_INGRESS: &str = "ANTREA-POL-PRE-INGRESS-RULES";
    pub const POL_PRE_EGRESS: &str = "ANTREA-POL-PRE-EGRESS-RULES";
}

/// Fixed catalog names for agent-owned address sets.
pub mod sets {
    pub const POD_IP: &str = "ANTREA-POD-IP";
    pub const POD_IP6: &str = "ANTREA-POD-IP6";
    pub const LOCAL_FLEXIBLE_IPAM_POD_IP: &str = "LOCAL-FLEXIBLE-IPAM-POD-IP";
    pub const LOCAL_FLEXIBLE_IPAM_POD_IP6: &str = "LOCAL-FLEXIBLE-IPAM-POD-IP6";
    pub const CLUSTER_NODE_IP: &str = "CLUSTER-NODE-IP";
    pub const CLUSTER_NODE_IP6: &str = "CLUSTER-NODE-IP6";
    pub const NODEPORT_IP: &str = "ANTREA-NODEPORT-IP";
    pub const NODEPORT_IP6: &str = "ANTREA-NODEPORT-IP6";
    pub const EXTERNAL_IP: &str = "ANTREA-EXTERNAL-IP";
    pub const EXTERNAL_IP6: &str = "ANTREA-EXTERNAL-IP6";
}

/// The sentinel MAC bound to permanent IPv6 neighbor entries for peer
/// gateways reached through the host-gateway link.
pub const GLOBAL_VMAC: [u8; 6] = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff];

/// Mask applied to the skb mark to select an egress SNAT binding.
pub const SNAT_MARK_MASK: u32 = 0x0000_00ff;

/// Mark bit that flags a locally-generated packet bound for the pipeline,
/// letting it bypass ingress policies.
pub const HOST_LOCAL_SOURCE_MARK: u32 = 1 << 20;
