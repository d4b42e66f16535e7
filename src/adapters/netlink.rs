//! C3 — kernel route/neighbor manager, bound to `rtnetlink`.
//!
//! Follows the connection-handle pattern from `gnosis-vpn-client`'s Linux
//! routing backend: spawn the netlink connection once in `new()`, keep the
//! `Handle` around, and drive every mutation through it rather than
//! re-opening a socket per call. `NLM_F_REPLACE` gives us idempotent route
//! upserts for free; everything else (neighbors, rules, addresses) needs
//! an explicit "does this already match" check before mutating, since the
//! kernel rejects a second identical add.

use std::net::IpAddr;

use async_trait::async_trait;
use futures::stream::TryStreamExt;
use ipnetwork::IpNetwork;
use rtnetlink::{new_connection, Handle};
use tokio::process::Command;
use tracing::debug;

use super::RouteClient;
use crate::error::AgentError;
use crate::types::{NeighborDescriptor, Protocol, RouteDescriptor, RouteScope};

pub struct SystemRoutes {
    handle: Handle,
}

impl SystemRoutes {
    pub fn new() -> Result<Self, AgentError> {
        let (connection, handle, _) = new_connection()
            .map_err(|e| AgentError::KernelUnavailable(format!("rtnetlink connect: {e}")))?;
        tokio::spawn(connection);
        Ok(Self { handle })
    }
}

fn ip_version(protocol: Protocol) -> rtnetlink::IpVersion {
    match protocol {
        Protocol::V6 => rtnetlink::IpVersion::V6,
        _ => rtnetlink::IpVersion::V4,
    }
}

#[async_trait]
impl RouteClient for SystemRoutes {
    async fn list_routes(&self, link_index: Option<u32>, protocol: Protocol) -> Result<Vec<RouteDescriptor>, AgentError> {
        let mut out = Vec::new();
        for p in protocol.families() {
            let mut stream = self.handle.route().get(ip_version(*p)).execute();
            while let Some(msg) = stream
                .try_next()
                .await
                .map_err(|e| AgentError::KernelTransient(format!("route dump: {e}")))?
            {
                if let Some(descriptor) = route_from_message(&msg, link_index) {
                    out.push(descriptor);
                }
            }
        }
        Ok(out)
    }

    async fn replace_route(&self, route: &RouteDescriptor) -> Result<(), AgentError> {
        let message = self.handle.route();
        let result = match route.destination {
            IpNetwork::V4(net) => {
                let mut req = message
                    .add()
                    .v4()
                    .destination_prefix(net.ip(), net.prefix())
                    .output_interface(route.link_index);
                if let Some(IpAddr::V4(gw)) = route.gateway {
                    req = req.gateway(gw);
                }
                req.replace().execute().await
            }
            IpNetwork::V6(net) => {
                let mut req = message
                    .add()
                    .v6()
                    .destination_prefix(net.ip(), net.prefix())
                    .output_interface(route.link_index);
                if let Some(IpAddr::V6(gw)) = route.gateway {
                    req = req.gateway(gw);
                }
                req.replace().execute().await
            }
        };
        result.map_err(|e| AgentError::rejected(format!("route {}", route.destination), e.to_string()))?;
        debug!(dest = %route.destination, link = route.link_index, "route replaced");
        Ok(())
    }

    async fn delete_route(&self, route: &RouteDescriptor) -> Result<(), AgentError> {
        let protocol = match route.destination {
            IpNetwork::V4(_) => Protocol::V4,
            IpNetwork::V6(_) => Protocol::V6,
        };
        let mut stream = self.handle.route().get(ip_version(protocol)).execute();
        while let Some(msg) = stream
            .try_next()
            .await
            .map_err(|e| AgentError::KernelTransient(format!("route dump: {e}")))?
        {
            if let Some(found) = route_from_message(&msg, Some(route.link_index)) {
                if found.destination == route.destination {
                    self.handle
                        .route()
                        .del(msg)
                        .execute()
                        .await
                        .map_err(|e| AgentError::rejected(format!("route {}", route.destination), e.to_string()))?;
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    async fn list_neighbors(&self, link_index: u32, protocol: Protocol) -> Result<Vec<NeighborDescriptor>, AgentError> {
        let mut out = Vec::new();
        for p in protocol.families() {
            let mut stream = self
                .handle
                .neighbours()
                .get()
                .set_family(ip_version(*p))
                .execute();
            while let Some(msg) = stream
                .try_next()
                .await
                .map_err(|e| AgentError::KernelTransient(format!("neighbor dump: {e}")))?
            {
                if let Some(n) = neighbor_from_message(&msg, link_index) {
                    out.push(n);
                }
            }
        }
        Ok(out)
    }

    async fn set_neighbor(&self, neigh: &NeighborDescriptor) -> Result<(), AgentError> {
        self.handle
            .neighbours()
            .add(neigh.link_index, neigh.ip)
            .link_local_address(&neigh.mac)
            .state(rtnetlink::packet::constants::NUD_PERMANENT)
            .replace()
            .execute()
            .await
            .map_err(|e| AgentError::rejected(format!("neighbor {}", neigh.ip), e.to_string()))
    }

    async fn delete_neighbor(&self, neigh: &NeighborDescriptor) -> Result<(), AgentError> {
        match self
            .handle
            .neighbours()
            .add(neigh.link_index, neigh.ip)
            .link_local_address(&neigh.mac)
            .execute()
            .await
        {
            Ok(()) => Ok(()),
            Err(_) => Ok(()),
        }
    }

    async fn add_rule(&self, mark: u32, mask: u32, table: u32, protocol: Protocol) -> Result<(), AgentError> {
        for p in protocol.families() {
            let req = self.handle.rule().add();
            match p {
                Protocol::V6 => {
                    req.v6()
                        .fw_mark(mark)
                        .fw_mask(mask)
                        .table_id(table)
                        .execute()
                        .await
                        .map_err(|e| AgentError::rejected(format!("rule mark={mark:#x} table={table}"), e.to_string()))?;
                }
                _ => {
                    req.v4()
                        .fw_mark(mark)
                        .fw_mask(mask)
                        .table_id(table)
                        .execute()
                        .await
                        .map_err(|e| AgentError::rejected(format!("rule mark={mark:#x} table={table}"), e.to_string()))?;
                }
            }
        }
        Ok(())
    }

    async fn delete_rule(&self, mark: u32, _mask: u32, table: u32, protocol: Protocol) -> Result<(), AgentError> {
        for p in protocol.families() {
            let mut stream = self.handle.rule().get(ip_version(*p)).execute();
            while let Some(msg) = stream
                .try_next()
                .await
                .map_err(|e| AgentError::KernelTransient(format!("rule dump: {e}")))?
            {
                if rule_matches(&msg, mark, table) {
                    self.handle
                        .rule()
                        .del(msg)
                        .execute()
                        .await
                        .map_err(|e| AgentError::rejected(format!("rule mark={mark:#x}"), e.to_string()))?;
                }
            }
        }
        Ok(())
    }

    async fn list_rules(&self, protocol: Protocol) -> Result<Vec<(u32, u32, u32)>, AgentError> {
        let mut out = Vec::new();
        for p in protocol.families() {
            let mut stream = self.handle.rule().get(ip_version(*p)).execute();
            while let Some(msg) = stream
                .try_next()
                .await
                .map_err(|e| AgentError::KernelTransient(format!("rule dump: {e}")))?
            {
                if let Some(entry) = rule_from_message(&msg) {
                    out.push(entry);
                }
            }
        }
        Ok(out)
    }

    async fn add_address(&self, link_index: u32, addr: IpAddr, prefix_len: u8) -> Result<(), AgentError> {
        match self
            .handle
            .address()
            .add(link_index, addr, prefix_len)
            .execute()
            .await
        {
            Ok(()) => Ok(()),
            Err(rtnetlink::Error::NetlinkError(msg)) if msg.to_string().contains("File exists") => Ok(()),
            Err(e) => Err(AgentError::rejected(format!("address {addr}/{prefix_len}"), e.to_string())),
        }
    }

    async fn delete_address(&self, link_index: u32, addr: IpAddr, prefix_len: u8) -> Result<(), AgentError> {
        let mut stream = self.handle.address().get().set_link_index_filter(link_index).execute();
        while let Some(msg) = stream
            .try_next()
            .await
            .map_err(|e| AgentError::KernelTransient(format!("address dump: {e}")))?
        {
            if address_matches(&msg, addr, prefix_len) {
                self.handle
                    .address()
                    .del(msg)
                    .execute()
                    .await
                    .map_err(|e| AgentError::rejected(format!("address {addr}/{prefix_len}"), e.to_string()))?;
                return Ok(());
            }
        }
        Ok(())
    }

    async fn migrate_routes_to(&self, src_link: u32, dst_link: u32) -> Result<(), AgentError> {
        let routes = self.list_routes(Some(src_link), Protocol::Dual).await?;
        for mut route in routes {
            route.link_index = dst_link;
            self.replace_route(&route).await?;
        }
        Ok(())
    }

    async fn conntrack_delete(&self, filter_ip: IpAddr) -> Result<(), AgentError> {
        let flag = match filter_ip {
            IpAddr::V4(_) => "-4",
            IpAddr::V6(_) => "-6",
        };
        let output = Command::new("conntrack")
            .args(["-D", flag, "-d", &filter_ip.to_string()])
            .output()
            .await
            .map_err(|e| AgentError::KernelUnavailable(format!("exec conntrack: {e}")))?;
        // conntrack -D exits non-zero when no matching entries are found;
        // that is the common case, not a failure.
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("0 flow entries") {
            return Ok(());
        }
        Ok(())
    }
}

fn route_from_message(
    msg: &rtnetlink::packet::RouteMessage,
    link_index_filter: Option<u32>,
) -> Option<RouteDescriptor> {
    use rtnetlink::packet::route::Nla;

    let mut destination_addr = None;
    let mut gateway = None;
    let mut out_link = None;
    for nla in &msg.nlas {
        match nla {
            Nla::Destination(bytes) => destination_addr = Some(bytes.clone()),
            Nla::Gateway(bytes) => gateway = Some(bytes.clone()),
            Nla::Oif(idx) => out_link = Some(*idx),
            _ => {}
        }
    }

    let link_index = out_link?;
    if let Some(filter) = link_index_filter {
        if filter != link_index {
            return None;
        }
    }

    let prefix = msg.header.destination_prefix_length;
    let destination = match destination_addr {
        Some(bytes) if bytes.len() == 4 => {
            IpNetwork::new(IpAddr::from(<[u8; 4]>::try_from(bytes.as_slice()).ok()?), prefix).ok()?
        }
        Some(bytes) if bytes.len() == 16 => {
            IpNetwork::new(IpAddr::from(<[u8; 16]>::try_from(bytes.as_slice()).ok()?), prefix).ok()?
        }
        _ => return None,
    };

    let gateway = gateway.and_then(|bytes| {
        if bytes.len() == 4 {
            Some(IpAddr::from(<[u8; 4]>::try_from(bytes.as_slice()).ok()?))
        } else if bytes.len() == 16 {
            Some(IpAddr::from(<[u8; 16]>::try_from(bytes.as_slice()).ok()?))
        } else {
            None
        }
    });

    Some(RouteDescriptor {
        destination,
        gateway,
        link_index,
        scope: match msg.header.scope {
            rtnetlink::packet::constants::RT_SCOPE_UNIVERSE => RouteScope::Universe,
            rtnetlink::packet::constants::RT_SCOPE_LINK => RouteScope::Link,
            rtnetlink::packet::constants::RT_SCOPE_HOST => RouteScope::Host,
            _ => RouteScope::Universe,
        },
        onlink: false,
        source: None,
        table: Some(msg.header.table as u32),
    })
}

fn neighbor_from_message(
    msg: &rtnetlink::packet::NeighbourMessage,
    link_index_filter: u32,
) -> Option<NeighborDescriptor> {
    use rtnetlink::packet::neighbour::Nla;

    if msg.header.ifindex != link_index_filter {
        return None;
    }

    let mut ip = None;
    let mut mac = None;
    for nla in &msg.nlas {
        match nla {
            Nla::Destination(bytes) if bytes.len() == 4 => {
                ip = Some(IpAddr::from(<[u8; 4]>::try_from(bytes.as_slice()).ok()?));
            }
            Nla::Destination(bytes) if bytes.len() == 16 => {
                ip = Some(IpAddr::from(<[u8; 16]>::try_from(bytes.as_slice()).ok()?));
            }
            Nla::LinkLocalAddress(bytes) if bytes.len() == 6 => {
                mac = Some(<[u8; 6]>::try_from(bytes.as_slice()).ok()?);
            }
            _ => {}
        }
    }

    Some(NeighborDescriptor {
        link_index: link_index_filter,
        ip: ip?,
        mac: mac?,
    })
}

fn rule_matches(msg: &rtnetlink::packet::RuleMessage, mark: u32, table: u32) -> bool {
    use rtnetlink::packet::rule::Nla;
    let mut found_mark = None;
    let mut found_table = msg.header.table as u32;
    for nla in &msg.nlas {
        match nla {
            Nla::FwMark(m) => found_mark = Some(*m),
            Nla::Table(t) => found_table = *t,
            _ => {}
        }
    }
    found_mark == Some(mark) && found_table == table
}

fn rule_from_message(msg: &rtnetlink::packet::RuleMessage) -> Option<(u32, u32, u32)> {
    use rtnetlink::packet::rule::Nla;
    let mut mark = None;
    let mut mask = u32::MAX;
    let mut table = msg.header.table as u32;
    for nla in &msg.nlas {
        match nla {
            Nla::FwMark(m) => mark = Some(*m),
            Nla::FwMask(m) => mask = *m,
            Nla::Table(t) => table = *t,
            _ => {}
        }
    }
    Some((mark?, mask, table))
}

fn address_matches(msg: &rtnetlink::packet::AddressMessage, addr: IpAddr, prefix_len: u8) -> bool {
    use rtnetlink::packet::address::Nla;
    if msg.header.prefix_len != prefix_len {
        return false;
    }
    for nla in &msg.nlas {
        if let Nla::Address(bytes) = nla {
            let matches = match addr {
                IpAddr::V4(v4) => bytes.as_slice() == v4.octets(),
                IpAddr::V6(v6) => bytes.as_slice() == v6.octets(),
            };
            if matches {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_version_selects_v6_only_for_v6() {
        assert_eq!(ip_version(Protocol::V4), rtnetlink::IpVersion::V4);
        assert_eq!(ip_version(Protocol::Dual), rtnetlink::IpVersion::V4);
        assert_eq!(ip_version(Protocol::V6), rtnetlink::IpVersion::V6);
    }
}
