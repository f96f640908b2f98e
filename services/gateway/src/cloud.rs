//! Cloud inventory and firewall interfaces.
//!
//! The reconcilers only talk to the cloud through these traits:
//! - `NodeDirectory`: label-filtered lookup of machines and their addresses
//! - `FirewallApi`: firewall lookup by name and whole-rule-set replacement
//!
//! `HcloudClient` implements both against the Hetzner Cloud API; tests use
//! in-memory fakes.

use std::fmt;
use std::net::IpAddr;

use async_trait::async_trait;
use thiserror::Error;

use crate::firewall::{Firewall, FirewallRule};

/// Label key carrying the cluster identity.
pub const CLUSTER_LABEL: &str = "hct.airfocus.io/cluster";

/// Label key carrying the node role.
pub const ROLE_LABEL: &str = "hct.airfocus.io/role";

/// Role label value of control-plane nodes.
pub const CONTROLPLANE_ROLE: &str = "controlplane";

/// Cloud API errors.
#[derive(Debug, Error)]
pub enum CloudError {
    /// Transport-level failure (connect, timeout, body read).
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The API answered with a non-success status.
    #[error("API error (status={status}, code={code}): {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    /// The API token cannot be sent as a header value.
    #[error("API token contains invalid characters")]
    InvalidToken,

    /// The response body did not match the expected shape.
    #[error("invalid response: {0}")]
    Decode(String),
}

/// Conjunction of `key=value` label filters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelSelector {
    terms: Vec<(String, String)>,
}

impl LabelSelector {
    /// Selector matching every node of a cluster.
    pub fn cluster(cluster_name: &str) -> Self {
        Self {
            terms: vec![(CLUSTER_LABEL.to_string(), cluster_name.to_string())],
        }
    }

    /// Additionally require a role.
    pub fn with_role(mut self, role: &str) -> Self {
        self.terms.push((ROLE_LABEL.to_string(), role.to_string()));
        self
    }

    /// Selector terms in insertion order.
    pub fn terms(&self) -> &[(String, String)] {
        &self.terms
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.terms.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}={}", key, value)?;
        }
        Ok(())
    }
}

/// A machine matched by a directory lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub name: String,

    /// Public IPv4 address, if the machine has one.
    pub public: Option<IpAddr>,

    /// Addresses on attached private networks.
    pub private: Vec<IpAddr>,
}

/// Label-filtered machine lookup.
#[async_trait]
pub trait NodeDirectory: Send + Sync {
    /// List every node matching the selector.
    async fn list_nodes(&self, selector: &LabelSelector) -> Result<Vec<Node>, CloudError>;
}

/// Firewall lookup and rule replacement.
#[async_trait]
pub trait FirewallApi: Send + Sync {
    /// Find a firewall by its exact name.
    async fn firewall_by_name(&self, name: &str) -> Result<Option<Firewall>, CloudError>;

    /// Replace all rules of a firewall in one call.
    async fn set_rules(&self, firewall: &Firewall, rules: &[FirewallRule])
        -> Result<(), CloudError>;
}
