//! Command line interface.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use hctg_reconcile::BackoffPolicy;

use crate::config::{Config, Token, DEFAULT_RECONCILE_INTERVAL};
use crate::hcloud::DEFAULT_ENDPOINT;
use crate::logging::LogFormat;
use crate::supervisor::RestartPolicy;

/// HAProxy and firewall reconciliation for a Talos control-plane gateway
/// on Hetzner Cloud.
#[derive(Debug, Parser)]
#[command(name = "hcloud-talos-controlplane-gateway")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable debug logging (ignored when RUST_LOG is set).
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the gateway until SIGINT or SIGTERM.
    Start(StartArgs),

    /// Print the version.
    Version,
}

#[derive(Debug, Clone, Args)]
pub struct StartArgs {
    /// Cluster label value selecting this cluster's servers.
    #[arg(short = 'c', long, env = "HCTG_CLUSTER_NAME", default_value = "")]
    pub cluster_name: String,

    /// Name of the firewall guarding the control plane.
    #[arg(short = 'f', long, env = "HCTG_FIREWALL_NAME", default_value = "")]
    pub firewall_name: String,

    /// Hetzner Cloud API base URL.
    #[arg(long, env = "HCTG_HCLOUD_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    pub hcloud_endpoint: String,

    /// HAProxy executable.
    #[arg(long, env = "HCTG_HAPROXY_BINARY", default_value = "haproxy")]
    pub haproxy_binary: PathBuf,

    /// Seconds between reconciliation ticks.
    #[arg(
        long,
        env = "HCTG_RECONCILE_INTERVAL_SECS",
        default_value_t = DEFAULT_RECONCILE_INTERVAL.as_secs()
    )]
    pub reconcile_interval_secs: u64,

    /// Initial delay before restarting HAProxy, in milliseconds.
    #[arg(long, default_value_t = 100)]
    pub restart_backoff_base_ms: u64,

    /// Upper bound of the HAProxy restart delay, in milliseconds.
    #[arg(long, default_value_t = 30_000)]
    pub restart_backoff_max_ms: u64,
}

impl StartArgs {
    /// Convert to a gateway config. The token never comes from the command
    /// line (see `Token::from_env`). Validation happens in the service.
    pub fn into_config(self, hcloud_token: Token) -> Config {
        let backoff = BackoffPolicy {
            base: Duration::from_millis(self.restart_backoff_base_ms),
            max: Duration::from_millis(self.restart_backoff_max_ms),
            ..BackoffPolicy::default()
        };

        Config {
            hcloud_token,
            hcloud_endpoint: self.hcloud_endpoint,
            cluster_name: self.cluster_name,
            firewall_name: self.firewall_name,
            haproxy_binary: self.haproxy_binary,
            reconcile_interval: Duration::from_secs(self.reconcile_interval_secs),
            restart: RestartPolicy {
                backoff,
                ..RestartPolicy::default()
            },
        }
    }
}
