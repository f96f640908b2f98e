//! Control-plane gateway for Talos clusters on Hetzner Cloud.
//!
//! Keeps two derived artifacts in sync with the set of cluster servers:
//!
//! - the backend list of a local HAProxy that forwards the Kubernetes API
//!   and Talos API ports to the control-plane nodes' private addresses
//! - the rule set of a Hetzner Cloud firewall that admits those ports only
//!   from the cluster's own public addresses
//!
//! Both are recomputed every reconcile interval; unchanged inputs produce no
//! writes and no remote mutations.

pub mod cli;
pub mod cloud;
pub mod config;
pub mod directory;
pub mod firewall;
pub mod haproxy;
pub mod hcloud;
pub mod logging;
pub mod reconciler;
pub mod service;
pub mod supervisor;

pub use config::{Config, ConfigError};
pub use reconciler::{ReconcileError, Reconciler};
pub use service::Service;

/// Kubernetes API server port.
pub const KUBERNETES_API_PORT: u16 = 6443;

/// Talos API (apid) port.
pub const TALOS_API_PORT: u16 = 50000;

/// Crate version, printed by the `version` command.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
