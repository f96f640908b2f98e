//! Node address queries against the node directory.
//!
//! One query per reconciliation tick; selectors are rebuilt on every call.
//! An empty result is an error, never "zero backends": rendering an empty
//! backend list or an empty allow-list would cut off all traffic because
//! of a transient bad answer.

use std::net::IpAddr;

use thiserror::Error;
use tracing::debug;

use crate::cloud::{CloudError, LabelSelector, NodeDirectory};

/// Directory query errors.
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("retrieving nodes failed")]
    Lookup(#[from] CloudError),

    #[error("no nodes found with labels {selector}")]
    NoNodes { selector: String },
}

/// Addresses of the nodes matched by one query, in directory order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeAddresses {
    /// Public IPv4 address of every node that has one.
    pub public: Vec<IpAddr>,

    /// Private addresses of all nodes, flattened node by node.
    pub private: Vec<IpAddr>,
}

/// Look up the addresses of a cluster's nodes, optionally restricted to a role.
pub async fn node_addresses(
    directory: &dyn NodeDirectory,
    cluster_name: &str,
    role: Option<&str>,
) -> Result<NodeAddresses, DirectoryError> {
    let mut selector = LabelSelector::cluster(cluster_name);
    if let Some(role) = role {
        selector = selector.with_role(role);
    }

    let nodes = directory.list_nodes(&selector).await?;
    if nodes.is_empty() {
        return Err(DirectoryError::NoNodes {
            selector: selector.to_string(),
        });
    }

    debug!(label_selector = %selector, count = nodes.len(), "Found nodes");

    let mut addresses = NodeAddresses::default();
    for node in nodes {
        if let Some(public) = node.public {
            addresses.public.push(public);
        }
        addresses.private.extend(node.private);
    }

    Ok(addresses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{Node, CONTROLPLANE_ROLE};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FixedDirectory {
        nodes: Vec<Node>,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl NodeDirectory for FixedDirectory {
        async fn list_nodes(&self, selector: &LabelSelector) -> Result<Vec<Node>, CloudError> {
            self.seen.lock().unwrap().push(selector.to_string());
            Ok(self.nodes.clone())
        }
    }

    fn node(name: &str, public: Option<&str>, private: &[&str]) -> Node {
        Node {
            name: name.to_string(),
            public: public.map(|p| p.parse().unwrap()),
            private: private.iter().map(|p| p.parse().unwrap()).collect(),
        }
    }

    #[tokio::test]
    async fn test_addresses_keep_directory_order() {
        let directory = FixedDirectory {
            nodes: vec![
                node("cp-2", Some("1.1.1.2"), &["10.0.0.2"]),
                node("cp-1", Some("1.1.1.1"), &["10.0.0.1", "10.1.0.1"]),
                node("cp-3", None, &["10.0.0.3"]),
            ],
            seen: Mutex::new(Vec::new()),
        };

        let addrs = node_addresses(&directory, "prod", Some(CONTROLPLANE_ROLE))
            .await
            .unwrap();

        assert_eq!(
            addrs.public,
            vec!["1.1.1.2".parse::<IpAddr>().unwrap(), "1.1.1.1".parse().unwrap()]
        );
        assert_eq!(
            addrs.private,
            vec![
                "10.0.0.2".parse::<IpAddr>().unwrap(),
                "10.0.0.1".parse().unwrap(),
                "10.1.0.1".parse().unwrap(),
                "10.0.0.3".parse().unwrap(),
            ]
        );
        assert_eq!(
            directory.seen.lock().unwrap().as_slice(),
            ["hct.airfocus.io/cluster=prod,hct.airfocus.io/role=controlplane"]
        );
    }

    #[tokio::test]
    async fn test_empty_result_is_an_error() {
        let directory = FixedDirectory {
            nodes: Vec::new(),
            seen: Mutex::new(Vec::new()),
        };

        let err = node_addresses(&directory, "prod", None).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "no nodes found with labels hct.airfocus.io/cluster=prod"
        );
    }
}
