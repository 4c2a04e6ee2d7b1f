use anyhow::Result;
use presence_core::{Broker, RpcConfig};
use tokio::sync::watch;
use tracing::info;

/// Bind all interfaces on the configured port and route until shutdown.
pub async fn run(config: RpcConfig, shutdown: watch::Receiver<bool>) -> Result<()> {
    let bind = config.bind_addr();
    info!(%bind, "Broker starting...");

    let broker = Broker::bind(&config, bind).await?;
    broker.run(shutdown).await;
    Ok(())
}
