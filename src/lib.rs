//! podrouter - per-node CNI dataplane and policy-enforcement agent.
//!
//! Split into a library and a thin `main.rs` binary so integration tests
//! can drive the forwarding engine and reconciler the same way `main`
//! does, against the in-memory fake adapters.

pub mod adapters;
pub mod collab;
pub mod config;
pub mod engine;
pub mod error;
pub mod interface;
pub mod packet;
pub mod reconcile;
pub mod types;
