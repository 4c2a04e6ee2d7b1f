use crate::registry::Registry;
use anyhow::Result;
use presence_core::{Client, RpcConfig, WorkerAgent};
use serde_json::{json, Map};
use std::time::Instant;
use tokio::sync::watch;
use tracing::info;

/// Serve the registry until shutdown.
pub async fn run_registry(config: RpcConfig, shutdown: watch::Receiver<bool>) -> Result<()> {
    info!(broker = %config.broker, port = config.port, "Running Registry...");

    WorkerAgent::new(config, Registry).run(shutdown).await?;
    Ok(())
}

/// Call `Registry.register("test")` `count` times and report the elapsed time.
pub async fn test_registry(config: RpcConfig, count: u32) -> Result<()> {
    info!(broker = %config.broker, port = config.port, "Testing Registry...");

    let mut registry = Client::new(config, Registry::service_descriptor())?;
    let start = Instant::now();
    for _ in 0..count {
        registry
            .call("register", vec![json!("test")], Map::new())
            .await?;
    }

    info!(count, time = ?start.elapsed(), "Calls finished");
    Ok(())
}
