use anyhow::Result;
use presence_core::{ControlClient, RpcConfig};
use tracing::info;

/// Print broker stats, then the usage of each worker it knows.
pub async fn print(config: RpcConfig) -> Result<()> {
    info!(broker = %config.broker, port = config.port, "Getting stats...");

    let mut control = ControlClient::new(config)?;
    let stats = control.stats().await?;

    // Intentional stdout: this is the command's output.
    println!("{}", serde_json::to_string_pretty(&stats)?);

    for worker in &stats.workers {
        println!("{}", worker);
        let usage = control.worker_stats(worker).await?;
        println!("{}", serde_json::to_string_pretty(&usage)?);
    }

    Ok(())
}
