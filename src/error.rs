//! Error taxonomy for kernel-facing adapters.
//!
//! Adapter methods return `AgentError` so callers can match on kind;
//! engine- and reconciler-level code mostly propagates it as
//! `anyhow::Error` via `?`, annotating the failing kernel object with
//! `.context(...)` to annotate the failing kernel object.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    /// Required tool/module missing, or an unsupported capability was
    /// requested (e.g. `--random-fully` on a kernel that lacks it). Fatal
    /// on startup.
    #[error("kernel tooling unavailable: {0}")]
    KernelUnavailable(String),

    /// Lock contention or other transient busy condition. Retried with
    /// backoff inside the reconciliation loop; only surfaced after
    /// persistent failure.
    #[error("kernel operation transiently failed: {0}")]
    KernelTransient(String),

    /// Malformed command or unexpected output from a kernel tool.
    #[error("kernel rejected operation on {object}: {reason}")]
    KernelRejected { object: String, reason: String },
}

impl AgentError {
    pub fn rejected(object: impl Into<String>, reason: impl Into<String>) -> Self {
        AgentError::KernelRejected {
            object: object.into(),
            reason: reason.into(),
        }
    }

    /// True when the underlying error is the kind that retry-with-backoff
    /// is meant to paper over.
    pub fn is_transient(&self) -> bool {
        matches!(self, AgentError::KernelTransient(_))
    }
}
