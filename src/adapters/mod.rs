//! Kernel-adapter trait boundaries (C1/C2/C3).
//!
//! The engine and reconciler depend only on these traits, never on the
//! concrete `ipset`/`iptables`/`rtnetlink` bindings, so tests can supply
//! the in-memory fakes in [`fake`] instead.

pub mod fake;
pub mod ipset;
pub mod iptables;
pub mod netlink;

use async_trait::async_trait;

use crate::error::AgentError;
use crate::types::{
    NeighborDescriptor, Protocol, RouteDescriptor, SetType,
};

/// C1 — address-set manager contract.
#[async_trait]
pub trait IpsetClient: Send + Sync {
    async fn create_set(&self, name: &str, kind: SetType, protocol: Protocol) -> Result<(), AgentError>;
    async fn destroy_set(&self, name: &str) -> Result<(), AgentError>;
    async fn add_entry(&self, name: &str, entry: &str) -> Result<(), AgentError>;
    async fn delete_entry(&self, name: &str, entry: &str) -> Result<(), AgentError>;
    async fn list_entries(&self, name: &str) -> Result<Vec<String>, AgentError>;
}

/// A single rule line, independent of the numbering `iptables` assigns it.
pub type RuleSpec = String;

/// C2 — packet-filter manager contract.
#[async_trait]
pub trait FilterClient: Send + Sync {
    async fn ensure_chain(&self, protocol: Protocol, table: &str, chain: &str) -> Result<(), AgentError>;
    async fn append_rule(&self, protocol: Protocol, table: &str, chain: &str, rule: &RuleSpec) -> Result<(), AgentError>;
    /// Insert at 1-based `position` (position 1 for must-precede rules).
    async fn insert_rule(&self, protocol: Protocol, table: &str, chain: &str, rule: &RuleSpec, position: usize) -> Result<(), AgentError>;
    async fn delete_rule(&self, protocol: Protocol, table: &str, chain: &str, rule: &RuleSpec) -> Result<(), AgentError>;
    async fn list_rules(&self, protocol: Protocol, table: &str, chain: &str) -> Result<Vec<RuleSpec>, AgentError>;
    /// Bulk-replace every agent-owned chain for one family in one kernel
    /// transaction. `flush_non_agent = false` maps to `--noflush`.
    async fn restore(&self, text: &str, flush_non_agent: bool, family: Protocol) -> Result<(), AgentError>;
    async fn delete_chain(&self, protocol: Protocol, table: &str, chain: &str) -> Result<(), AgentError>;
    async fn has_random_fully(&self) -> bool;
}

/// C3 — kernel route/neighbor manager contract.
#[async_trait]
pub trait RouteClient: Send + Sync {
    async fn list_routes(&self, link_index: Option<u32>, protocol: Protocol) -> Result<Vec<RouteDescriptor>, AgentError>;
    async fn replace_route(&self, route: &RouteDescriptor) -> Result<(), AgentError>;
    async fn delete_route(&self, route: &RouteDescriptor) -> Result<(), AgentError>;
    async fn list_neighbors(&self, link_index: u32, protocol: Protocol) -> Result<Vec<NeighborDescriptor>, AgentError>;
    async fn set_neighbor(&self, neigh: &NeighborDescriptor) -> Result<(), AgentError>;
    async fn delete_neighbor(&self, neigh: &NeighborDescriptor) -> Result<(), AgentError>;
    async fn add_rule(&self, mark: u32, mask: u32, table: u32, protocol: Protocol) -> Result<(), AgentError>;
    async fn delete_rule(&self, mark: u32, mask: u32, table: u32, protocol: Protocol) -> Result<(), AgentError>;
    /// List policy-routing rules as `(mark, mask, table)` tuples.
    async fn list_rules(&self, protocol: Protocol) -> Result<Vec<(u32, u32, u32)>, AgentError>;
    async fn add_address(&self, link_index: u32, addr: std::net::IpAddr, prefix_len: u8) -> Result<(), AgentError>;
    async fn delete_address(&self, link_index: u32, addr: std::net::IpAddr, prefix_len: u8) -> Result<(), AgentError>;
    async fn migrate_routes_to(&self, src_link: u32, dst_link: u32) -> Result<(), AgentError>;
    async fn conntrack_delete(&self, filter_ip: std::net::IpAddr) -> Result<(), AgentError>;
}
