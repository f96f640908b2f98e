//! Top-level wiring of the gateway.
//!
//! Startup order: validate config, create the rendered config file, run the
//! HAProxy reconciliation once, run the firewall reconciliation once, start
//! the HAProxy supervisor. A failure in either first run aborts startup.
//! After that, periodic failures are only logged.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use hctg_reconcile::Scheduler;
use tempfile::TempPath;
use tokio::sync::watch;
use tracing::info;

use crate::cloud::{FirewallApi, NodeDirectory};
use crate::config::Config;
use crate::hcloud::HcloudClient;
use crate::reconciler::Reconciler;
use crate::supervisor::{ProcessSupervisor, WorkerCommand, WorkerSlot};

/// The running gateway: two reconcile loops and the HAProxy supervisor.
pub struct Service {
    config: Config,
    reconciler: Arc<Reconciler>,
    worker: WorkerSlot,
    shutdown: watch::Receiver<bool>,

    // Removed when the service is dropped.
    config_file: TempPath,
}

impl Service {
    /// Create a service talking to the Hetzner Cloud API.
    pub fn from_config(config: Config, shutdown: watch::Receiver<bool>) -> anyhow::Result<Self> {
        let client = Arc::new(
            HcloudClient::new(config.hcloud_token.expose(), &config.hcloud_endpoint)
                .context("creating hcloud client failed")?,
        );
        Self::new(config, client.clone(), client, shutdown)
    }

    /// Create a service with explicit cloud backends.
    pub fn new(
        config: Config,
        directory: Arc<dyn NodeDirectory>,
        firewalls: Arc<dyn FirewallApi>,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        config.validate()?;

        let config_file = tempfile::Builder::new()
            .prefix("haproxy-")
            .suffix(".cfg")
            .tempfile()
            .context("creating haproxy config file failed")?
            .into_temp_path();

        let worker = WorkerSlot::new();
        let reconciler = Arc::new(Reconciler::new(
            directory,
            firewalls,
            config.cluster_name.clone(),
            config.firewall_name.clone(),
            config_file.to_path_buf(),
            worker.clone(),
        ));

        Ok(Self {
            config,
            reconciler,
            worker,
            shutdown,
            config_file,
        })
    }

    /// Location of the rendered HAProxy config.
    pub fn config_path(&self) -> &Path {
        &self.config_file
    }

    /// Shared view of the HAProxy process.
    pub fn worker(&self) -> WorkerSlot {
        self.worker.clone()
    }

    /// Run until shutdown is signalled and every task has stopped.
    pub async fn run(self) -> anyhow::Result<()> {
        info!(
            cluster_name = %self.config.cluster_name,
            firewall_name = %self.config.firewall_name,
            config_path = %self.config_file.display(),
            interval_secs = self.config.reconcile_interval.as_secs(),
            "Starting service"
        );

        let mut scheduler = Scheduler::new(self.shutdown.clone());

        let reconciler = Arc::clone(&self.reconciler);
        if let Err(e) = scheduler
            .schedule(self.config.reconcile_interval, "haproxy", move || {
                let reconciler = Arc::clone(&reconciler);
                async move { reconciler.reconcile_haproxy().await }
            })
            .await
        {
            scheduler.abort().await;
            return Err(e.into());
        }

        let reconciler = Arc::clone(&self.reconciler);
        if let Err(e) = scheduler
            .schedule(self.config.reconcile_interval, "firewall", move || {
                let reconciler = Arc::clone(&reconciler);
                async move { reconciler.reconcile_firewall().await }
            })
            .await
        {
            scheduler.abort().await;
            return Err(e.into());
        }

        let command = WorkerCommand::new(&self.config.haproxy_binary)
            .arg("-f")
            .arg(self.config_file.as_os_str());
        let supervisor =
            ProcessSupervisor::new(command, self.worker.clone(), self.config.restart.clone());
        scheduler.spawn("haproxy-supervisor", supervisor.run(self.shutdown.clone()));

        scheduler.wait().await;

        info!("Stopped service");
        Ok(())
    }
}
