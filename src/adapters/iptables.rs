//! C2 — packet-filter manager.
//!
//! Per-rule operations (chain create, append/insert/delete, list) go
//! through the `iptables` crate the way `netavark`'s firewall driver uses
//! it — idempotency wrappers (`append_unique`/`add_chain_unique`/
//! `remove_if_rule_exists`) collapse "already there"/"already gone" into
//! success at this layer. Bulk `restore` shells out to
//! `iptables-restore`/`ip6tables-restore` directly, since the crate has no
//! bulk-transaction API, and retries on xtables-lock contention with
//! `backoff::future::retry` using a small backoff.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoff;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{FilterClient, RuleSpec};
use crate::error::AgentError;
use crate::types::Protocol;

pub struct SystemFilter {
    v4: iptables::IPTables,
    v6: iptables::IPTables,
    restore_v4_binary: String,
    restore_v6_binary: String,
    random_fully: bool,
}

impl SystemFilter {
    pub fn new() -> Result<Self, AgentError> {
        let v4 = iptables::new(false)
            .map_err(|e| AgentError::KernelUnavailable(format!("iptables: {e}")))?;
        let v6 = iptables::new(true)
            .map_err(|e| AgentError::KernelUnavailable(format!("ip6tables: {e}")))?;
        let random_fully = probe_random_fully(&v4);
        Ok(Self {
            v4,
            v6,
            restore_v4_binary: "iptables-restore".to_string(),
            restore_v6_binary: "ip6tables-restore".to_string(),
            random_fully,
        })
    }

    fn conn(&self, protocol: Protocol) -> Result<&iptables::IPTables, AgentError> {
        match protocol {
            Protocol::V4 => Ok(&self.v4),
            Protocol::V6 => Ok(&self.v6),
            Protocol::Dual => Err(AgentError::rejected(
                "protocol",
                "dual fan-out must be expanded by the caller for single-connection ops",
            )),
        }
    }

    async fn restore_one_family(&self, text: &str, flush_non_agent: bool, protocol: Protocol) -> Result<(), AgentError> {
        let binary = match protocol {
            Protocol::V4 => &self.restore_v4_binary,
            Protocol::V6 => &self.restore_v6_binary,
            Protocol::Dual => unreachable!("caller expands Dual before calling restore_one_family"),
        };

        let backoff_policy = ExponentialBackoff {
            initial_interval: Duration::from_millis(200),
            max_interval: Duration::from_secs(2),
            max_elapsed_time: Some(Duration::from_secs(10)),
            ..Default::default()
        };

        let text = text.to_string();
        backoff::future::retry(backoff_policy, || async {
            run_restore(binary, &text, flush_non_agent).await.map_err(|e| {
                if e.is_lock_contention() {
                    warn!(%binary, "xtables lock contended, retrying restore");
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        })
        .await
        .map_err(AgentError::from)
    }
}

async fn run_restore(binary: &str, text: &str, flush_non_agent: bool) -> Result<(), RestoreError> {
    let mut args = Vec::new();
    if !flush_non_agent {
        args.push("--noflush");
    }

    let mut child = Command::new(binary)
        .args(&args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| RestoreError::Unavailable(format!("exec {binary}: {e}")))?;

    child
        .stdin
        .take()
        .expect("stdin piped")
        .write_all(text.as_bytes())
        .await
        .map_err(|e| RestoreError::Unavailable(format!("write to {binary}: {e}")))?;

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| RestoreError::Unavailable(format!("wait on {binary}: {e}")))?;

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.contains("Resource temporarily unavailable") || stderr.contains("xtables lock") {
        return Err(RestoreError::LockContention(stderr));
    }
    Err(RestoreError::Rejected(stderr))
}

#[derive(Debug)]
enum RestoreError {
    Unavailable(String),
    LockContention(String),
    Rejected(String),
}

impl RestoreError {
    fn is_lock_contention(&self) -> bool {
        matches!(self, RestoreError::LockContention(_))
    }
}

impl From<RestoreError> for AgentError {
    fn from(e: RestoreError) -> Self {
        match e {
            RestoreError::Unavailable(s) => AgentError::KernelUnavailable(s),
            RestoreError::LockContention(s) => AgentError::KernelTransient(s),
            RestoreError::Rejected(s) => AgentError::rejected("iptables-restore", s),
        }
    }
}

fn probe_random_fully(conn: &iptables::IPTables) -> bool {
    conn.execute("nat", "-j SNAT --help 2>&1 | grep -q -- --random-fully")
        .map(|out| out.status.success())
        .unwrap_or(false)
}

#[async_trait]
impl FilterClient for SystemFilter {
    async fn ensure_chain(&self, protocol: Protocol, table: &str, chain: &str) -> Result<(), AgentError> {
        for p in protocol.families() {
            let conn = self.conn(*p)?;
            let exists = conn
                .list_chains(table)
                .map_err(|e| AgentError::rejected(chain, e.to_string()))?
                .iter()
                .any(|c| c == chain);
            if exists {
                continue;
            }
            conn.new_chain(table, chain)
                .map_err(|e| AgentError::rejected(chain, e.to_string()))?;
            debug!(table, chain, "chain created");
        }
        Ok(())
    }

    async fn append_rule(&self, protocol: Protocol, table: &str, chain: &str, rule: &RuleSpec) -> Result<(), AgentError> {
        for p in protocol.families() {
            let conn = self.conn(*p)?;
            if conn.exists(table, chain, rule).map_err(|e| AgentError::rejected(chain, e.to_string()))? {
                continue;
            }
            conn.append(table, chain, rule)
                .map_err(|e| AgentError::rejected(chain, e.to_string()))?;
        }
        Ok(())
    }

    async fn insert_rule(&self, protocol: Protocol, table: &str, chain: &str, rule: &RuleSpec, position: usize) -> Result<(), AgentError> {
        for p in protocol.families() {
            let conn = self.conn(*p)?;
            // A foreign jump (kube-proxy's own `-A FORWARD ...`) can land
            // ahead of ours between passes; `exists` alone can't tell us
            // that, so find our current index and reposition if it has
            // drifted off `position` instead of treating "already present"
            // as "already correct".
            let current_index = conn
                .list(table, chain)
                .map_err(|e| AgentError::rejected(chain, e.to_string()))?
                .iter()
                .position(|r| r == rule || r == &format!("-A {} {}", chain, rule));
            match current_index {
                Some(idx) if idx + 1 == position => continue,
                Some(_) => {
                    conn.delete(table, chain, rule).map_err(|e| AgentError::rejected(chain, e.to_string()))?;
                    conn.insert(table, chain, rule, position as i32)
                        .map_err(|e| AgentError::rejected(chain, e.to_string()))?;
                }
                None => {
                    conn.insert(table, chain, rule, position as i32)
                        .map_err(|e| AgentError::rejected(chain, e.to_string()))?;
                }
            }
        }
        Ok(())
    }

    async fn delete_rule(&self, protocol: Protocol, table: &str, chain: &str, rule: &RuleSpec) -> Result<(), AgentError> {
        for p in protocol.families() {
            let conn = self.conn(*p)?;
            if !conn.exists(table, chain, rule).map_err(|e| AgentError::rejected(chain, e.to_string()))? {
                continue;
            }
            conn.delete(table, chain, rule)
                .map_err(|e| AgentError::rejected(chain, e.to_string()))?;
        }
        Ok(())
    }

    async fn list_rules(&self, protocol: Protocol, table: &str, chain: &str) -> Result<Vec<RuleSpec>, AgentError> {
        let mut rules = Vec::new();
        for p in protocol.families() {
            let conn = self.conn(*p)?;
            rules.extend(
                conn.list(table, chain)
                    .map_err(|e| AgentError::rejected(chain, e.to_string()))?,
            );
        }
        Ok(rules)
    }

    async fn restore(&self, text: &str, flush_non_agent: bool, family: Protocol) -> Result<(), AgentError> {
        for p in family.families() {
            self.restore_one_family(text, flush_non_agent, *p).await?;
        }
        Ok(())
    }

    async fn delete_chain(&self, protocol: Protocol, table: &str, chain: &str) -> Result<(), AgentError> {
        for p in protocol.families() {
            let conn = self.conn(*p)?;
            let exists = conn
                .list_chains(table)
                .map_err(|e| AgentError::rejected(chain, e.to_string()))?
                .iter()
                .any(|c| c == chain);
            if !exists {
                continue;
            }
            conn.flush_chain(table, chain)
                .map_err(|e| AgentError::rejected(chain, e.to_string()))?;
            conn.delete_chain(table, chain)
                .map_err(|e| AgentError::rejected(chain, e.to_string()))?;
        }
        Ok(())
    }

    async fn has_random_fully(&self) -> bool {
        self.random_fully
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_contention_error_maps_to_transient() {
        let err: AgentError = RestoreError::LockContention("Resource temporarily unavailable".into()).into();
        assert!(matches!(err, AgentError::KernelTransient(_)));
    }

    #[test]
    fn rejected_error_carries_reason() {
        let err: AgentError = RestoreError::Rejected("bad rule".into()).into();
        match err {
            AgentError::KernelRejected { reason, .. } => assert_eq!(reason, "bad rule"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
