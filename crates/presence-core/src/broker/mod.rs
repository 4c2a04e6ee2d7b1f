//! The broker: routes client requests to idle workers and replies back.
//!
//! One task owns the [`RouterSocket`] and the [`BrokerState`]. Each loop
//! iteration waits at most one heartbeat interval for an inbound message, then
//! sweeps expired workers and emits due heartbeats, so liveness tracking keeps
//! running with no traffic at all.

mod state;

pub use state::{
    BrokerSettings, BrokerState, BrokerStats, QueuedRequest, ServiceRecord, WorkerRecord,
};

use crate::config::RpcConfig;
use crate::transport::{RouterEvent, RouterSocket};
use crate::usage::{ProcessUsage, UsageProvider};
use crate::Result;
use bytes::Bytes;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Handle to a spawned broker. Dropping shuts it down.
pub struct BrokerHandle {
    pub addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl BrokerHandle {
    /// Get the address the broker is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop the event loop after its current iteration.
    pub fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Shut down and wait for the loop to exit.
    pub async fn join(mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for BrokerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

pub struct Broker {
    socket: RouterSocket,
    state: BrokerState,
    heartbeat_interval: Duration,
}

impl Broker {
    /// Bind the broker on `addr` with process usage reporting.
    pub async fn bind(config: &RpcConfig, addr: SocketAddr) -> Result<Self> {
        Self::bind_with_usage(config, addr, Box::new(ProcessUsage::new())).await
    }

    pub async fn bind_with_usage(
        config: &RpcConfig,
        addr: SocketAddr,
        usage: Box<dyn UsageProvider>,
    ) -> Result<Self> {
        config.validate()?;
        let socket = RouterSocket::bind(addr).await?;
        let settings = BrokerSettings {
            control_service: Bytes::from(config.control_service.clone().into_bytes()),
            heartbeat_interval: config.heartbeat_interval(),
            heartbeat_expiry: config.heartbeat_expiry(),
        };

        info!("Broker listening on {}", socket.local_addr());

        Ok(Self {
            socket,
            state: BrokerState::new(settings, usage, Instant::now()),
            heartbeat_interval: config.heartbeat_interval(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    /// Run the event loop until `shutdown` flips to true or its sender drops.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            let inbound = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                polled = tokio::time::timeout(self.heartbeat_interval, self.socket.recv_event()) => polled,
            };

            match inbound {
                Ok(Some(RouterEvent::Message(message))) => {
                    debug!(parts = message.len(), "Broker received message");
                    if let Err(e) = self.state.handle_message(message, Instant::now()) {
                        warn!("Dropping invalid message: {}", e);
                    }
                }
                Ok(Some(RouterEvent::Closed(address))) => {
                    self.state.peer_closed(&address);
                }
                Ok(None) => {
                    warn!("Router closed, broker stopping");
                    break;
                }
                Err(_) => {}
            }

            let now = Instant::now();
            self.state.purge_workers(now);
            self.state.send_heartbeats(now);
            self.flush().await;
        }

        info!("Broker stopped");
    }

    /// Spawn the event loop on the current runtime.
    pub fn spawn(self) -> BrokerHandle {
        let addr = self.local_addr();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task_handle = tokio::spawn(self.run(shutdown_rx));

        BrokerHandle {
            addr,
            shutdown_tx,
            task_handle: Some(task_handle),
        }
    }

    async fn flush(&mut self) {
        for message in self.state.take_outbound() {
            if let Err(e) = self.socket.send(message).await {
                warn!("Broker send failed: {}", e);
            }
        }
    }
}
