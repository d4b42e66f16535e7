//! In-memory fakes for tests and `--dry-run` mode.
//!
//! Same shape the engine-level tests drive against in lieu of a live
//! kernel: `Arc<Mutex<...>>` state, idempotent mutations, no I/O. Kept in
//! `src/` rather than `tests/` so `main.rs` can also wire these in for
//! `--dry-run`.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{FilterClient, IpsetClient, RouteClient, RuleSpec};
use crate::error::AgentError;
use crate::types::{NeighborDescriptor, Protocol, RouteDescriptor, SetType};

#[derive(Default)]
pub struct FakeIpset {
    sets: Mutex<HashMap<String, (SetType, Protocol, HashSet<String>)>>,
}

#[async_trait]
impl IpsetClient for FakeIpset {
    async fn create_set(&self, name: &str, kind: SetType, protocol: Protocol) -> Result<(), AgentError> {
        self.sets
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_insert_with(|| (kind, protocol, HashSet::new()));
        Ok(())
    }

    async fn destroy_set(&self, name: &str) -> Result<(), AgentError> {
        self.sets.lock().unwrap().remove(name);
        Ok(())
    }

    async fn add_entry(&self, name: &str, entry: &str) -> Result<(), AgentError> {
        let mut sets = self.sets.lock().unwrap();
        let (_, _, members) = sets
            .get_mut(name)
            .ok_or_else(|| AgentError::rejected(name, "set does not exist"))?;
        members.insert(entry.to_string());
        Ok(())
    }

    async fn delete_entry(&self, name: &str, entry: &str) -> Result<(), AgentError> {
        if let Some((_, _, members)) = self.sets.lock().unwrap().get_mut(name) {
            members.remove(entry);
        }
        Ok(())
    }

    async fn list_entries(&self, name: &str) -> Result<Vec<String>, AgentError> {
        Ok(self
            .sets
            .lock()
            .unwrap()
            .get(name)
            .map(|(_, _, members)| members.iter().cloned().collect())
            .unwrap_or_default())
    }
}

/// Family key used to separate v4/v6 state, mirroring `SystemFilter`
/// holding two independent `iptables`/`ip6tables` connections.
fn family_key(protocol: Protocol) -> &'static str {
    match protocol {
        Protocol::V6 => "6",
        _ => "4",
    }
}

#[derive(Default)]
pub struct FakeFilter {
    chains: Mutex<HashMap<(&'static str, String, String), Vec<RuleSpec>>>,
}

fn key(protocol: Protocol, table: &str, chain: &str) -> (&'static str, String, String) {
    (family_key(protocol), table.to_string(), chain.to_string())
}

#[async_trait]
impl FilterClient for FakeFilter {
    async fn ensure_chain(&self, protocol: Protocol, table: &str, chain: &str) -> Result<(), AgentError> {
        self.chains.lock().unwrap().entry(key(protocol, table, chain)).or_default();
        Ok(())
    }

    async fn append_rule(&self, protocol: Protocol, table: &str, chain: &str, rule: &RuleSpec) -> Result<(), AgentError> {
        let mut chains = self.chains.lock().unwrap();
        let rules = chains.entry(key(protocol, table, chain)).or_default();
        if !rules.contains(rule) {
            rules.push(rule.clone());
        }
        Ok(())
    }

    async fn insert_rule(&self, protocol: Protocol, table: &str, chain: &str, rule: &RuleSpec, position: usize) -> Result<(), AgentError> {
        let mut chains = self.chains.lock().unwrap();
        let rules = chains.entry(key(protocol, table, chain)).or_default();
        if let Some(existing) = rules.iter().position(|r| r == rule) {
            rules.remove(existing);
        }
        let index = position.saturating_sub(1).min(rules.len());
        rules.insert(index, rule.clone());
        Ok(())
    }

    async fn delete_rule(&self, protocol: Protocol, table: &str, chain: &str, rule: &RuleSpec) -> Result<(), AgentError> {
        if let Some(rules) = self.chains.lock().unwrap().get_mut(&key(protocol, table, chain)) {
            rules.retain(|r| r != rule);
        }
        Ok(())
    }

    async fn list_rules(&self, protocol: Protocol, table: &str, chain: &str) -> Result<Vec<RuleSpec>, AgentError> {
        Ok(self.chains.lock().unwrap().get(&key(protocol, table, chain)).cloned().unwrap_or_default())
    }

    async fn restore(&self, text: &str, flush_non_agent: bool, family: Protocol) -> Result<(), AgentError> {
        // A minimal restore-blob parser: table headers ("*filter") switch
        // the active table, ":CHAIN -" lines declare chains, "-A CHAIN ..."
        // lines append a rule, "COMMIT" is a no-op. An unrecognized,
        // non-empty, non-comment line is treated as a malformed blob, the
        // same way a real `iptables-restore` would reject it.
        let mut chains = self.chains.lock().unwrap();
        let fam = family_key(family);
        if flush_non_agent {
            chains.retain(|(f, _, _), _| *f != fam);
        }
        let mut table = String::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line == "COMMIT" || line.starts_with('#') {
                continue;
            } else if let Some(t) = line.strip_prefix('*') {
                table = t.to_string();
            } else if let Some(rest) = line.strip_prefix(':') {
                let chain = rest.split_whitespace().next().unwrap_or_default().to_string();
                chains.entry((fam, table.clone(), chain)).or_default();
            } else if let Some(rest) = line.strip_prefix("-A ") {
                let mut parts = rest.splitn(2, ' ');
                let chain = parts.next().unwrap_or_default().to_string();
                let rule = parts.next().unwrap_or_default().to_string();
                chains.entry((fam, table.clone(), chain)).or_default().push(rule);
            } else {
                return Err(AgentError::rejected("filter restore", format!("malformed restore line: {}", line)));
            }
        }
        Ok(())
    }

    async fn delete_chain(&self, protocol: Protocol, table: &str, chain: &str) -> Result<(), AgentError> {
        self.chains.lock().unwrap().remove(&key(protocol, table, chain));
        Ok(())
    }

    async fn has_random_fully(&self) -> bool {
        true
    }
}

#[derive(Default)]
pub struct FakeRoutes {
    routes: Mutex<Vec<RouteDescriptor>>,
    neighbors: Mutex<Vec<NeighborDescriptor>>,
    rules: Mutex<Vec<(u32, u32, u32, Protocol)>>,
    addresses: Mutex<Vec<(u32, IpAddr, u8)>>,
}

#[async_trait]
impl RouteClient for FakeRoutes {
    async fn list_routes(&self, link_index: Option<u32>, _protocol: Protocol) -> Result<Vec<RouteDescriptor>, AgentError> {
        Ok(self
            .routes
            .lock()
            .unwrap()
            .iter()
            .filter(|r| link_index.map(|l| l == r.link_index).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn replace_route(&self, route: &RouteDescriptor) -> Result<(), AgentError> {
        let mut routes = self.routes.lock().unwrap();
        routes.retain(|r| r.destination != route.destination);
        routes.push(route.clone());
        Ok(())
    }

    async fn delete_route(&self, route: &RouteDescriptor) -> Result<(), AgentError> {
        self.routes.lock().unwrap().retain(|r| r.destination != route.destination);
        Ok(())
    }

    async fn list_neighbors(&self, link_index: u32, _protocol: Protocol) -> Result<Vec<NeighborDescriptor>, AgentError> {
        Ok(self
            .neighbors
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.link_index == link_index)
            .cloned()
            .collect())
    }

    async fn set_neighbor(&self, neigh: &NeighborDescriptor) -> Result<(), AgentError> {
        let mut neighbors = self.neighbors.lock().unwrap();
        neighbors.retain(|n| n.ip != neigh.ip);
        neighbors.push(neigh.clone());
        Ok(())
    }

    async fn delete_neighbor(&self, neigh: &NeighborDescriptor) -> Result<(), AgentError> {
        self.neighbors.lock().unwrap().retain(|n| n.ip != neigh.ip);
        Ok(())
    }

    async fn add_rule(&self, mark: u32, mask: u32, table: u32, protocol: Protocol) -> Result<(), AgentError> {
        self.rules.lock().unwrap().push((mark, mask, table, protocol));
        Ok(())
    }

    async fn delete_rule(&self, mark: u32, _mask: u32, table: u32, _protocol: Protocol) -> Result<(), AgentError> {
        self.rules.lock().unwrap().retain(|(m, _, t, _)| !(*m == mark && *t == table));
        Ok(())
    }

    async fn list_rules(&self, protocol: Protocol) -> Result<Vec<(u32, u32, u32)>, AgentError> {
        Ok(self
            .rules
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, _, _, p)| *p == protocol || protocol == Protocol::Dual || *p == Protocol::Dual)
            .map(|(mark, mask, table, _)| (*mark, *mask, *table))
            .collect())
    }

    async fn add_address(&self, link_index: u32, addr: IpAddr, prefix_len: u8) -> Result<(), AgentError> {
        let mut addresses = self.addresses.lock().unwrap();
        if !addresses.iter().any(|(l, a, p)| *l == link_index && *a == addr && *p == prefix_len) {
            addresses.push((link_index, addr, prefix_len));
        }
        Ok(())
    }

    async fn delete_address(&self, link_index: u32, addr: IpAddr, prefix_len: u8) -> Result<(), AgentError> {
        self.addresses
            .lock()
            .unwrap()
            .retain(|(l, a, p)| !(*l == link_index && *a == addr && *p == prefix_len));
        Ok(())
    }

    async fn migrate_routes_to(&self, src_link: u32, dst_link: u32) -> Result<(), AgentError> {
        let mut routes = self.routes.lock().unwrap();
        for route in routes.iter_mut().filter(|r| r.link_index == src_link) {
            route.link_index = dst_link;
        }
        Ok(())
    }

    async fn conntrack_delete(&self, _filter_ip: IpAddr) -> Result<(), AgentError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RouteScope;
    use ipnetwork::IpNetwork;
    use std::str::FromStr;

    #[tokio::test]
    async fn fake_ipset_round_trips_membership() {
        let ipset = FakeIpset::default();
        ipset.create_set("TEST", SetType::HashIp, Protocol::V4).await.unwrap();
        ipset.add_entry("TEST", "10.0.0.1").await.unwrap();
        assert_eq!(ipset.list_entries("TEST").await.unwrap(), vec!["10.0.0.1".to_string()]);
        ipset.delete_entry("TEST", "10.0.0.1").await.unwrap();
        assert!(ipset.list_entries("TEST").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fake_filter_insert_precedes_append() {
        let filter = FakeFilter::default();
        filter
            .append_rule(Protocol::V4, "filter", "FORWARD", &"-j ACCEPT".to_string())
            .await
            .unwrap();
        filter
            .insert_rule(Protocol::V4, "filter", "FORWARD", &"-j ANTREA-FORWARD".to_string(), 1)
            .await
            .unwrap();
        let rules = filter.list_rules(Protocol::V4, "filter", "FORWARD").await.unwrap();
        assert_eq!(rules[0], "-j ANTREA-FORWARD");
    }

    #[tokio::test]
    async fn fake_routes_replace_is_idempotent_on_destination() {
        let routes = FakeRoutes::default();
        let dest = IpNetwork::from_str("10.244.1.0/24").unwrap();
        let mut route = RouteDescriptor {
            destination: dest,
            gateway: None,
            link_index: 3,
            scope: RouteScope::Universe,
            onlink: true,
            source: None,
            table: None,
        };
        routes.replace_route(&route).await.unwrap();
        route.link_index = 7;
        routes.replace_route(&route).await.unwrap();
        let listed = routes.list_routes(None, Protocol::V4).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].link_index, 7);
    }

    #[tokio::test]
    async fn fake_routes_list_rules_reflects_add_and_delete() {
        let routes = FakeRoutes::default();
        routes.add_rule(0x100, 0xffffffff, 200, Protocol::V4).await.unwrap();
        routes.add_rule(0x200, 0xffffffff, 201, Protocol::V6).await.unwrap();

        let v4 = routes.list_rules(Protocol::V4).await.unwrap();
        assert_eq!(v4, vec![(0x100, 0xffffffff, 200)]);

        routes.delete_rule(0x100, 0xffffffff, 200, Protocol::V4).await.unwrap();
        assert!(routes.list_rules(Protocol::V4).await.unwrap().is_empty());
    }
}
