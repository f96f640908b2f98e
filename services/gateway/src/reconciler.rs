//! The two reconciliation functions driven by the scheduler.
//!
//! - `reconcile_haproxy`: control-plane private addresses -> rendered HAProxy
//!   config -> reload signal when the file changed
//! - `reconcile_firewall`: all cluster nodes' public addresses -> expected
//!   allow-list -> one `set_rules` call when it differs from the remote one
//!
//! Both are idempotent: with unchanged membership a tick writes nothing
//! locally and mutates nothing remotely.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cloud::{CloudError, FirewallApi, LabelSelector, NodeDirectory, CONTROLPLANE_ROLE};
use crate::directory::{node_addresses, DirectoryError};
use crate::firewall::{expected_rules, rules_equivalent};
use crate::haproxy;
use crate::supervisor::{ReloadOutcome, SupervisorError, WorkerSlot};

/// Errors from a single reconciliation tick.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("retrieving server addresses failed")]
    Directory(#[from] DirectoryError),

    #[error("no {kind} addresses found on nodes with labels {selector}")]
    NoAddresses {
        kind: &'static str,
        selector: String,
    },

    #[error("writing haproxy config {} failed", .path.display())]
    WriteConfig {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("reloading haproxy failed")]
    Reload(#[from] SupervisorError),

    #[error("retrieving firewall failed")]
    FirewallLookup(#[source] CloudError),

    #[error("firewall {0} not found (creating firewall is not supported)")]
    FirewallMissing(String),

    #[error("updating firewall rules failed")]
    FirewallUpdate(#[source] CloudError),
}

/// Converges the HAProxy config and the firewall to the current nodes.
pub struct Reconciler {
    directory: Arc<dyn NodeDirectory>,
    firewalls: Arc<dyn FirewallApi>,
    cluster_name: String,
    firewall_name: String,
    config_path: PathBuf,
    worker: WorkerSlot,
}

impl Reconciler {
    pub fn new(
        directory: Arc<dyn NodeDirectory>,
        firewalls: Arc<dyn FirewallApi>,
        cluster_name: impl Into<String>,
        firewall_name: impl Into<String>,
        config_path: impl Into<PathBuf>,
        worker: WorkerSlot,
    ) -> Self {
        Self {
            directory,
            firewalls,
            cluster_name: cluster_name.into(),
            firewall_name: firewall_name.into(),
            config_path: config_path.into(),
            worker,
        }
    }

    /// Path of the rendered HAProxy config.
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Render the backend list and reload HAProxy if the config changed.
    pub async fn reconcile_haproxy(&self) -> Result<(), ReconcileError> {
        let addresses = node_addresses(
            self.directory.as_ref(),
            &self.cluster_name,
            Some(CONTROLPLANE_ROLE),
        )
        .await?;

        if addresses.private.is_empty() {
            return Err(ReconcileError::NoAddresses {
                kind: "private",
                selector: LabelSelector::cluster(&self.cluster_name)
                    .with_role(CONTROLPLANE_ROLE)
                    .to_string(),
            });
        }

        let config = haproxy::render(&addresses.private);
        let changed = haproxy::write_if_changed(&self.config_path, config.as_bytes()).map_err(
            |source| ReconcileError::WriteConfig {
                path: self.config_path.clone(),
                source,
            },
        )?;

        if !changed {
            debug!(path = %self.config_path.display(), "haproxy config unchanged");
            return Ok(());
        }

        info!(
            path = %self.config_path.display(),
            backend_count = addresses.private.len(),
            "Updated haproxy config"
        );

        match self.worker.reload()? {
            ReloadOutcome::Signalled { pid } => info!(pid, "Reloading haproxy"),
            ReloadOutcome::NotRunning => debug!("haproxy not running, skipping reload"),
            ReloadOutcome::Vanished { pid } => {
                warn!(pid, "haproxy exited before reload, restart will pick up the config")
            }
        }

        Ok(())
    }

    /// Replace the firewall rules if they differ from the expected set.
    pub async fn reconcile_firewall(&self) -> Result<(), ReconcileError> {
        let addresses = node_addresses(self.directory.as_ref(), &self.cluster_name, None).await?;

        // Nodes without a public address are skipped; none left counts as
        // no nodes at all.
        if addresses.public.is_empty() {
            return Err(DirectoryError::NoNodes {
                selector: LabelSelector::cluster(&self.cluster_name).to_string(),
            }
            .into());
        }

        let firewall = self
            .firewalls
            .firewall_by_name(&self.firewall_name)
            .await
            .map_err(ReconcileError::FirewallLookup)?
            .ok_or_else(|| ReconcileError::FirewallMissing(self.firewall_name.clone()))?;

        let expected = expected_rules(&addresses.public);
        if rules_equivalent(&expected, &firewall.rules) {
            debug!(firewall = %firewall.name, "Firewall rules unchanged");
            return Ok(());
        }

        self.firewalls
            .set_rules(&firewall, &expected)
            .await
            .map_err(ReconcileError::FirewallUpdate)?;

        info!(
            firewall = %firewall.name,
            firewall_id = firewall.id,
            source_count = addresses.public.len(),
            "Updated firewall rules"
        );

        Ok(())
    }
}
