//! `presence run ...` subcommands.

mod broker;
mod stats;
mod worker;

use anyhow::Result;
use clap::Subcommand;
use presence_core::RpcConfig;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Subcommand, Debug)]
pub enum RunCommand {
    /// Run the broker
    Broker,
    /// Run the registry
    Registry,
    /// Test the registry
    Test {
        /// Number of register calls to make
        #[arg(long, default_value_t = 10_000)]
        count: u32,
    },
    /// Get the broker stats
    Stats,
}

impl RunCommand {
    pub async fn execute(self, config: RpcConfig) -> Result<()> {
        match self {
            RunCommand::Broker => broker::run(config, shutdown_on_ctrl_c()).await,
            RunCommand::Registry => worker::run_registry(config, shutdown_on_ctrl_c()).await,
            RunCommand::Test { count } => worker::test_registry(config, count).await,
            RunCommand::Stats => stats::print(config).await,
        }
    }
}

/// Shutdown flag that flips to true on Ctrl-C.
fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received, exiting");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                warn!("Cannot listen for Ctrl-C: {}", e);
                shutdown_tx.closed().await;
            }
        }
    });

    shutdown_rx
}
