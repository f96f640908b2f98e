//! hcloud-talos-controlplane-gateway
//!
//! Runs HAProxy in front of a Talos control plane and keeps its backends and
//! the cluster firewall in sync with the servers labelled for the cluster.

use std::process::ExitCode;

use clap::Parser;
use hctg_gateway::cli::{Cli, Commands, StartArgs};
use hctg_gateway::config::Token;
use hctg_gateway::{logging, Service, VERSION};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Version => {
            println!("{VERSION}");
            ExitCode::SUCCESS
        }
        Commands::Start(args) => {
            if let Err(e) = logging::init(cli.verbose, cli.log_format) {
                eprintln!("initializing logging failed: {e:#}");
                return ExitCode::FAILURE;
            }

            match start(args).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    error!(error = %format!("{e:#}"), "Gateway failed");
                    ExitCode::FAILURE
                }
            }
        }
    }
}

async fn start(args: StartArgs) -> anyhow::Result<()> {
    info!(version = VERSION, "Starting hcloud-talos-controlplane-gateway");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut terminate = signal(SignalKind::terminate())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
            _ = terminate.recv() => info!("Received SIGTERM"),
        }
        let _ = shutdown_tx.send(true);
    });

    let service = Service::from_config(args.into_config(Token::from_env()), shutdown_rx)?;
    service.run().await
}
