//! Configuration management for podrouter.
//!
//! Loads configuration from a YAML file with environment variable
//! overrides, using env-then-file precedence for control-plane
//! credentials.

use anyhow::{Context, Result};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use crate::types::{EncryptionMode, FeatureGates, TrafficEncapMode, TunnelType};

/// Agent configuration: everything `main` needs before `NodeConfig` itself
/// can be assembled (which requires live kernel/interface discovery). The
/// node-topology fields below stand in for what a Kubernetes informer would
/// otherwise supply; wiring that informer is out of scope here, so this
/// agent takes the same data as static config instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Node name this agent is running on.
    pub node_name: String,

    /// Host-gateway link name to bind routes/rules/neighbors to.
    #[serde(default = "default_gw_link_name")]
    pub gw_link_name: String,

    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Reconciliation tick interval, in seconds.
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,

    /// Run against the in-memory fake adapters instead of the live kernel.
    #[serde(default)]
    pub dry_run: bool,

    /// Binary path for the `ipset` CLI.
    #[serde(default = "default_ipset_binary")]
    pub ipset_binary: String,

    /// Path to state directory (PID file, any on-disk cache).
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    pub pod_cidr_v4: Option<IpNetwork>,
    pub pod_cidr_v6: Option<IpNetwork>,
    pub gw_ipv4: Option<IpAddr>,
    pub gw_ipv6: Option<IpAddr>,
    #[serde(default = "default_node_transport_ip")]
    pub node_transport_ip: IpAddr,
    pub transport_subnet_v4: Option<IpNetwork>,
    pub transport_subnet_v6: Option<IpNetwork>,

    #[serde(default = "default_encap_mode")]
    pub encap_mode: TrafficEncapMode,
    #[serde(default = "default_tunnel_type")]
    pub tunnel_type: TunnelType,
    #[serde(default = "default_tunnel_port")]
    pub tunnel_port: u16,
    #[serde(default = "default_encryption_mode")]
    pub encryption_mode: EncryptionMode,
    #[serde(default = "default_wireguard_port")]
    pub wireguard_port: u16,
    #[serde(default)]
    pub wireguard_link_index: Option<u32>,

    #[serde(default = "default_true")]
    pub ipv4_enabled: bool,
    #[serde(default)]
    pub ipv6_enabled: bool,

    #[serde(default)]
    pub features: FeatureGates,

    /// Path where config was loaded from (not serialized).
    #[serde(skip)]
    pub config_path: PathBuf,
}

fn default_encap_mode() -> TrafficEncapMode {
    TrafficEncapMode::Encap
}

fn default_tunnel_type() -> TunnelType {
    TunnelType::Geneve
}

fn default_tunnel_port() -> u16 {
    6081
}

fn default_encryption_mode() -> EncryptionMode {
    EncryptionMode::None
}

fn default_wireguard_port() -> u16 {
    51820
}

fn default_true() -> bool {
    true
}

fn default_node_transport_ip() -> IpAddr {
    IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_gw_link_name() -> String {
    "antrea-gw0".to_string()
}

fn default_reconcile_interval_secs() -> u64 {
    60
}

fn default_ipset_binary() -> String {
    "ipset".to_string()
}

fn default_state_dir() -> PathBuf {
    if cfg!(unix) {
        PathBuf::from("/var/lib/podrouter")
    } else {
        dirs::data_local_dir().unwrap_or_else(|| PathBuf::from(".")).join("podrouter")
    }
}

impl AgentConfig {
    /// Load configuration from the `PODROUTER_NODE_NAME` env var or a
    /// config file, env taking priority over the file when both are
    /// present.
    pub fn load() -> Result<Self> {
        if let Ok(node_name) = std::env::var("PODROUTER_NODE_NAME") {
            let config = AgentConfig {
                node_name,
                gw_link_name: std::env::var("PODROUTER_GW_LINK_NAME").unwrap_or_else(|_| default_gw_link_name()),
                log_level: std::env::var("PODROUTER_LOG_LEVEL").unwrap_or_else(|_| default_log_level()),
                reconcile_interval_secs: std::env::var("PODROUTER_RECONCILE_INTERVAL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or_else(default_reconcile_interval_secs),
                dry_run: std::env::var("PODROUTER_DRY_RUN").map(|v| v == "1" || v == "true").unwrap_or(false),
                ipset_binary: std::env::var("PODROUTER_IPSET_BINARY").unwrap_or_else(|_| default_ipset_binary()),
                state_dir: default_state_dir(),
                pod_cidr_v4: std::env::var("PODROUTER_POD_CIDR_V4").ok().and_then(|s| s.parse().ok()),
                pod_cidr_v6: std::env::var("PODROUTER_POD_CIDR_V6").ok().and_then(|s| s.parse().ok()),
                gw_ipv4: std::env::var("PODROUTER_GW_IPV4").ok().and_then(|s| s.parse().ok()),
                gw_ipv6: std::env::var("PODROUTER_GW_IPV6").ok().and_then(|s| s.parse().ok()),
                node_transport_ip: std::env::var("PODROUTER_NODE_TRANSPORT_IP")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or_else(default_node_transport_ip),
                transport_subnet_v4: std::env::var("PODROUTER_TRANSPORT_SUBNET_V4").ok().and_then(|s| s.parse().ok()),
                transport_subnet_v6: std::env::var("PODROUTER_TRANSPORT_SUBNET_V6").ok().and_then(|s| s.parse().ok()),
                encap_mode: default_encap_mode(),
                tunnel_type: default_tunnel_type(),
                tunnel_port: default_tunnel_port(),
                encryption_mode: default_encryption_mode(),
                wireguard_port: default_wireguard_port(),
                wireguard_link_index: None,
                ipv4_enabled: true,
                ipv6_enabled: false,
                features: FeatureGates::default(),
                config_path: PathBuf::from("env"),
            };
            config.validate()?;
            return Ok(config);
        }

        let paths = Self::config_paths();
        for path in &paths {
            if path.exists() {
                return Self::load_from_file(path);
            }
        }

        anyhow::bail!(
            "No configuration found. Tried: {:?}\nOr set PODROUTER_NODE_NAME (and friends).",
            paths
        );
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).with_context(|| format!("failed to read config file: {}", path.display()))?;

        let mut config: AgentConfig =
            serde_yaml::from_str(&content).with_context(|| format!("failed to parse config file: {}", path.display()))?;

        config.config_path = path.to_path_buf();

        if let Ok(node_name) = std::env::var("PODROUTER_NODE_NAME") {
            config.node_name = node_name;
        }
        if let Ok(log_level) = std::env::var("PODROUTER_LOG_LEVEL") {
            config.log_level = log_level;
        }
        if let Ok(dry_run) = std::env::var("PODROUTER_DRY_RUN") {
            config.dry_run = dry_run == "1" || dry_run == "true";
        }

        config.validate()?;
        Ok(config)
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Assemble a `NodeConfig` from this config plus the gateway link the
    /// kernel/interface lookup resolved. The topology fields here play the
    /// role a CRD informer would otherwise fill.
    pub fn to_node_config(&self, gw_link_index: u32, gw_link_name: String) -> crate::types::NodeConfig {
        crate::types::NodeConfig {
            node_name: self.node_name.clone(),
            gw_link_index,
            gw_link_name,
            gw_ipv4: self.gw_ipv4,
            gw_ipv6: self.gw_ipv6,
            pod_cidr_v4: self.pod_cidr_v4,
            pod_cidr_v6: self.pod_cidr_v6,
            node_transport_ip: self.node_transport_ip,
            encap_mode: self.encap_mode,
            tunnel_type: self.tunnel_type,
            tunnel_port: self.tunnel_port,
            encryption_mode: self.encryption_mode,
            wireguard_port: self.wireguard_port,
            wireguard_link_index: self.wireguard_link_index,
            ipv4_enabled: self.ipv4_enabled,
            ipv6_enabled: self.ipv6_enabled,
            features: self.features,
            transport_subnet_v4: self.transport_subnet_v4,
            transport_subnet_v6: self.transport_subnet_v6,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.node_name.is_empty() {
            anyhow::bail!("node_name cannot be empty");
        }
        if self.gw_link_name.is_empty() {
            anyhow::bail!("gw_link_name cannot be empty");
        }
        if self.reconcile_interval_secs == 0 {
            anyhow::bail!("reconcile_interval_secs must be nonzero");
        }
        Ok(())
    }

    fn config_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();
        paths.push(PathBuf::from("config.yaml"));
        paths.push(PathBuf::from("podrouter.yaml"));
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("podrouter").join("config.yaml"));
        }
        #[cfg(unix)]
        paths.push(PathBuf::from("/etc/podrouter/config.yaml"));
        paths
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_config(dir: &TempDir, content: &str) -> PathBuf {
        let path = dir.path().join("config.yaml");
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn load_valid_config() {
        std::env::remove_var("PODROUTER_NODE_NAME");

        let dir = TempDir::new().unwrap();
        let path = create_test_config(
            &dir,
            r#"
node_name: node-a
log_level: debug
"#,
        );

        let config = AgentConfig::load_from_file(&path).unwrap();
        assert_eq!(config.node_name, "node-a");
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.gw_link_name, "antrea-gw0");
    }

    #[test]
    fn rejects_empty_node_name() {
        let dir = TempDir::new().unwrap();
        let path = create_test_config(&dir, "node_name: \"\"\n");
        let result = AgentConfig::load_from_file(&path);
        assert!(result.is_err());
    }

    #[test]
    fn default_values_applied() {
        let dir = TempDir::new().unwrap();
        let path = create_test_config(&dir, "node_name: node-a\n");
        let config = AgentConfig::load_from_file(&path).unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.reconcile_interval_secs, 60);
        assert!(!config.dry_run);
    }
}
