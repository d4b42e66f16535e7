//! Host-gateway link auto-discovery.
//!
//! Resolves the kernel link index for the configured host-gateway
//! interface name, or — if none is configured — picks the interface
//! carrying the node's default route, the same discovery order the
//! teacher used for its eBPF attach target.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct InterfaceInfo {
    pub name: String,
    pub index: u32,
    pub is_up: bool,
    pub is_loopback: bool,
}

/// Resolve the host-gateway link to (index, name).
///
/// Priority:
/// 1. `config_override` (the configured `gw_link_name`), if it exists.
/// 2. The interface carrying the default route.
/// 3. The first non-loopback, up interface.
pub fn resolve_gateway_link(config_override: Option<&str>) -> Result<(u32, String)> {
    if let Some(name) = config_override {
        if interface_exists(name) {
            let index = read_ifindex(name)?;
            return Ok((index, name.to_string()));
        }
        anyhow::bail!("configured host-gateway link '{}' does not exist", name);
    }

    if let Some(name) = default_route_interface() {
        let index = read_ifindex(&name)?;
        return Ok((index, name));
    }

    let interfaces = list_interfaces()?;
    for iface in interfaces {
        if iface.is_up && !iface.is_loopback {
            return Ok((iface.index, iface.name));
        }
    }

    anyhow::bail!("no suitable host-gateway link found")
}

pub fn interface_exists(name: &str) -> bool {
    Path::new(&format!("/sys/class/net/{}", name)).exists()
}

fn read_ifindex(name: &str) -> Result<u32> {
    let path = format!("/sys/class/net/{}/ifindex", name);
    fs::read_to_string(&path)
        .with_context(|| format!("reading ifindex for {}", name))?
        .trim()
        .parse()
        .with_context(|| format!("parsing ifindex for {}", name))
}

#[cfg(target_os = "linux")]
fn default_route_interface() -> Option<String> {
    let content = fs::read_to_string("/proc/net/route").ok()?;
    for line in content.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() >= 2 && fields[1] == "00000000" {
            return Some(fields[0].to_string());
        }
    }
    None
}

#[cfg(not(target_os = "linux"))]
fn default_route_interface() -> Option<String> {
    None
}

#[cfg(target_os = "linux")]
pub fn list_interfaces() -> Result<Vec<InterfaceInfo>> {
    let mut interfaces = Vec::new();
    let net_dir = Path::new("/sys/class/net");
    if !net_dir.exists() {
        anyhow::bail!("/sys/class/net not found");
    }

    for entry in fs::read_dir(net_dir).context("reading /sys/class/net")? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();

        let index: u32 = fs::read_to_string(entry.path().join("ifindex"))
            .unwrap_or_else(|_| "0".to_string())
            .trim()
            .parse()
            .unwrap_or(0);

        let flags: u32 = fs::read_to_string(entry.path().join("flags"))
            .unwrap_or_else(|_| "0x0".to_string())
            .trim()
            .trim_start_matches("0x")
            .parse()
            .unwrap_or(0);

        interfaces.push(InterfaceInfo {
            name,
            index,
            is_up: (flags & 0x1) != 0,
            is_loopback: (flags & 0x8) != 0,
        });
    }

    interfaces.sort_by_key(|i| i.index);
    Ok(interfaces)
}

#[cfg(not(target_os = "linux"))]
pub fn list_interfaces() -> Result<Vec<InterfaceInfo>> {
    Ok(vec![InterfaceInfo { name: "lo".to_string(), index: 0, is_up: true, is_loopback: true }])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonexistent_interface_is_absent() {
        assert!(!interface_exists("nonexistent_iface_12345"));
    }

    #[test]
    fn configured_override_that_does_not_exist_errors() {
        let result = resolve_gateway_link(Some("nonexistent_12345"));
        assert!(result.is_err());
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn loopback_is_present_in_listing() {
        let interfaces = list_interfaces().unwrap();
        assert!(interfaces.iter().any(|i| i.name == "lo"));
    }
}
