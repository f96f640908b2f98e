//! Hetzner Cloud API client.
//!
//! Implements the cloud interfaces the reconcilers consume:
//! - Listing servers by label selector (all pages)
//! - Looking up a firewall by name
//! - Replacing a firewall's rules via the `set_rules` action

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cloud::{CloudError, FirewallApi, LabelSelector, Node, NodeDirectory};
use crate::firewall::{Firewall, FirewallRule};

/// Public Hetzner Cloud API endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://api.hetzner.cloud/v1";

/// Page size for list requests (API maximum).
pub const PAGE_SIZE: u32 = 50;

/// Hetzner Cloud API client.
pub struct HcloudClient {
    client: reqwest::Client,
    base_url: String,
}

impl HcloudClient {
    /// Create a client authenticating with the given API token.
    pub fn new(token: &str, endpoint: &str) -> Result<Self, CloudError> {
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", token.trim()))
            .map_err(|_| CloudError::InvalidToken)?;
        auth.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);

        let client = reqwest::Client::builder()
            .user_agent(concat!(
                "hcloud-talos-controlplane-gateway/",
                env!("CARGO_PKG_VERSION")
            ))
            .timeout(Duration::from_secs(30))
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            base_url: endpoint.trim_end_matches('/').to_string(),
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, CloudError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.client.get(&url).query(query).send().await?;
        let response = check_status(response).await?;

        response
            .json::<T>()
            .await
            .map_err(|e| CloudError::Decode(e.to_string()))
    }
}

/// Turn a non-success response into `CloudError::Api`.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, CloudError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let (code, message) = match serde_json::from_str::<ErrorResponse>(&body) {
        Ok(parsed) => (parsed.error.code, parsed.error.message),
        Err(_) => ("unknown".to_string(), body),
    };

    Err(CloudError::Api {
        status: status.as_u16(),
        code,
        message,
    })
}

#[async_trait]
impl NodeDirectory for HcloudClient {
    async fn list_nodes(&self, selector: &LabelSelector) -> Result<Vec<Node>, CloudError> {
        let label_selector = selector.to_string();
        let mut nodes = Vec::new();
        let mut page = 1u32;

        loop {
            let resp: ServersResponse = self
                .get_json(
                    "/servers",
                    &[
                        ("label_selector", label_selector.clone()),
                        ("page", page.to_string()),
                        ("per_page", PAGE_SIZE.to_string()),
                    ],
                )
                .await?;

            debug!(
                label_selector = %label_selector,
                page,
                count = resp.servers.len(),
                "Listed servers"
            );

            let next = resp.next_page();
            nodes.extend(resp.servers.into_iter().map(Server::into_node));

            match next {
                Some(next) if next > page => page = next,
                _ => break,
            }
        }

        Ok(nodes)
    }
}

#[async_trait]
impl FirewallApi for HcloudClient {
    async fn firewall_by_name(&self, name: &str) -> Result<Option<Firewall>, CloudError> {
        let resp: FirewallsResponse = self
            .get_json("/firewalls", &[("name", name.to_string())])
            .await?;

        Ok(resp.firewalls.into_iter().find(|fw| fw.name == name))
    }

    async fn set_rules(
        &self,
        firewall: &Firewall,
        rules: &[FirewallRule],
    ) -> Result<(), CloudError> {
        let url = format!(
            "{}/firewalls/{}/actions/set_rules",
            self.base_url, firewall.id
        );
        debug!(
            firewall_id = firewall.id,
            rule_count = rules.len(),
            "Setting firewall rules"
        );

        let response = self
            .client
            .post(&url)
            .json(&SetRulesRequest { rules })
            .send()
            .await?;
        check_status(response).await?;

        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ServersResponse {
    servers: Vec<Server>,
    #[serde(default)]
    meta: Option<Meta>,
}

impl ServersResponse {
    fn next_page(&self) -> Option<u32> {
        self.meta
            .as_ref()
            .and_then(|m| m.pagination.as_ref())
            .and_then(|p| p.next_page)
    }
}

#[derive(Debug, Deserialize)]
struct Meta {
    #[serde(default)]
    pagination: Option<Pagination>,
}

#[derive(Debug, Deserialize)]
struct Pagination {
    #[serde(default)]
    next_page: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct Server {
    name: String,
    public_net: PublicNet,
    #[serde(default)]
    private_net: Vec<PrivateNet>,
}

impl Server {
    fn into_node(self) -> Node {
        Node {
            name: self.name,
            public: self.public_net.ipv4.map(|v4| v4.ip),
            private: self.private_net.into_iter().map(|n| n.ip).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PublicNet {
    #[serde(default)]
    ipv4: Option<AddressInfo>,
}

#[derive(Debug, Deserialize)]
struct AddressInfo {
    ip: IpAddr,
}

#[derive(Debug, Deserialize)]
struct PrivateNet {
    ip: IpAddr,
}

#[derive(Debug, Deserialize)]
struct FirewallsResponse {
    firewalls: Vec<Firewall>,
}

#[derive(Debug, Serialize)]
struct SetRulesRequest<'a> {
    rules: &'a [FirewallRule],
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: String,
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_without_public_ipv4() {
        let server: Server = serde_json::from_value(serde_json::json!({
            "id": 1,
            "name": "cp-1",
            "public_net": { "ipv4": null, "ipv6": { "ip": "2001:db8::/64" } },
            "private_net": [
                { "network": 7, "ip": "10.0.0.2", "alias_ips": [] }
            ]
        }))
        .unwrap();

        let node = server.into_node();
        assert_eq!(node.name, "cp-1");
        assert_eq!(node.public, None);
        assert_eq!(node.private, vec!["10.0.0.2".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn test_next_page_absent_without_meta() {
        let resp: ServersResponse = serde_json::from_value(serde_json::json!({
            "servers": []
        }))
        .unwrap();
        assert_eq!(resp.next_page(), None);
    }
}
