//! Gateway configuration.
//!
//! Built from the `start` command line (see `cli`), then validated before
//! the service is constructed.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::hcloud::DEFAULT_ENDPOINT;
use crate::supervisor::RestartPolicy;

/// Environment variable holding the Hetzner Cloud API token.
pub const HCLOUD_TOKEN_ENV: &str = "HCLOUD_TOKEN";

/// Default interval between reconciliation ticks.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Configuration errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("hcloud token missing")]
    MissingToken,

    #[error("cluster name missing")]
    MissingClusterName,

    #[error("firewall name missing")]
    MissingFirewallName,

    #[error("reconcile interval must be greater than zero")]
    InvalidInterval,
}

/// API token that never shows up in logs.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Token(String);

impl Token {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Read the token from `HCLOUD_TOKEN`; unset yields an empty token.
    pub fn from_env() -> Self {
        Self(std::env::var(HCLOUD_TOKEN_ENV).unwrap_or_default())
    }

    /// The raw token value.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(<redacted>)")
    }
}

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Hetzner Cloud API token.
    pub hcloud_token: Token,

    /// Hetzner Cloud API base URL.
    pub hcloud_endpoint: String,

    /// Value of the cluster label identifying this cluster's nodes.
    pub cluster_name: String,

    /// Name of the firewall whose rules are managed.
    pub firewall_name: String,

    /// HAProxy executable.
    pub haproxy_binary: PathBuf,

    /// Interval between reconciliation ticks.
    pub reconcile_interval: Duration,

    /// HAProxy restart behaviour.
    pub restart: RestartPolicy,
}

impl Config {
    /// Configuration with defaults for everything but the required fields.
    pub fn new(
        hcloud_token: impl Into<String>,
        cluster_name: impl Into<String>,
        firewall_name: impl Into<String>,
    ) -> Self {
        Self {
            hcloud_token: Token::new(hcloud_token),
            hcloud_endpoint: DEFAULT_ENDPOINT.to_string(),
            cluster_name: cluster_name.into(),
            firewall_name: firewall_name.into(),
            haproxy_binary: PathBuf::from("haproxy"),
            reconcile_interval: DEFAULT_RECONCILE_INTERVAL,
            restart: RestartPolicy::default(),
        }
    }

    /// Check that every required setting is present.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hcloud_token.is_empty() {
            return Err(ConfigError::MissingToken);
        }
        if self.cluster_name.trim().is_empty() {
            return Err(ConfigError::MissingClusterName);
        }
        if self.firewall_name.trim().is_empty() {
            return Err(ConfigError::MissingFirewallName);
        }
        if self.reconcile_interval.is_zero() {
            return Err(ConfigError::InvalidInterval);
        }
        Ok(())
    }
}
