//! C1 — address-set manager, bound to the `ipset` CLI.
//!
//! Mirrors the idempotency wrappers used for `iptables` in the netavark
//! firewall driver (`add_chain_unique`/`append_unique`): every mutating
//! call passes `-exist` so "already exists"/"does not exist" collapse to
//! success at the tool boundary, and we never need to pre-check state with
//! a separate list call.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::IpsetClient;
use crate::error::AgentError;
use crate::types::{Protocol, SetType};

pub struct SystemIpset {
    binary: String,
}

impl SystemIpset {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }

    async fn run(&self, args: &[&str]) -> Result<String, AgentError> {
        debug!(args = ?args, "ipset");
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| AgentError::KernelUnavailable(format!("exec {}: {}", self.binary, e)))?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(AgentError::rejected(args.join(" "), stderr))
    }
}

impl Default for SystemIpset {
    fn default() -> Self {
        Self::new("ipset")
    }
}

#[async_trait]
impl IpsetClient for SystemIpset {
    async fn create_set(&self, name: &str, kind: SetType, protocol: Protocol) -> Result<(), AgentError> {
        let family = match protocol {
            Protocol::V6 => "inet6",
            _ => "inet",
        };
        self.run(&[
            "create",
            name,
            kind.ipset_type_name(protocol),
            "family",
            family,
            "-exist",
        ])
        .await
        .map(|_| ())
    }

    async fn destroy_set(&self, name: &str) -> Result<(), AgentError> {
        match self.run(&["destroy", name]).await {
            Ok(_) => Ok(()),
            Err(AgentError::KernelRejected { reason, .. }) if reason.contains("does not exist") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn add_entry(&self, name: &str, entry: &str) -> Result<(), AgentError> {
        self.run(&["add", name, entry, "-exist"]).await.map(|_| ())
    }

    async fn delete_entry(&self, name: &str, entry: &str) -> Result<(), AgentError> {
        match self.run(&["del", name, entry, "-exist"]).await {
            Ok(_) => Ok(()),
            // "-exist" on del still errors if the set itself is missing; a
            // missing set means the entry is certainly absent.
            Err(AgentError::KernelRejected { reason, .. }) if reason.contains("does not exist") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn list_entries(&self, name: &str) -> Result<Vec<String>, AgentError> {
        let out = match self.run(&["list", name, "-output", "plain"]).await {
            Ok(out) => out,
            Err(AgentError::KernelRejected { reason, .. }) if reason.contains("does not exist") => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut members = Vec::new();
        let mut in_members = false;
        for line in out.lines() {
            if in_members {
                if !line.trim().is_empty() {
                    members.push(line.trim().to_string());
                }
                continue;
            }
            if line.trim() == "Members:" {
                in_members = true;
            }
        }
        Ok(members)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipset_type_names_match_catalog() {
        assert_eq!(SetType::HashNet.ipset_type_name(Protocol::V4), "hash:net");
        assert_eq!(SetType::HashIp.ipset_type_name(Protocol::V4), "hash:ip");
        assert_eq!(SetType::HashIpPort.ipset_type_name(Protocol::V6), "hash:ip,port");
    }
}
