//! Centralized configuration for the RPC core.
//!
//! Wire limits are associated constants. Everything an operator can tune lives
//! in [`RpcConfig`], which deserializes from JSON with every field optional.

use crate::{Result, RpcError};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Wire-level limits and connection constants.
pub struct ProtocolConfig;

impl ProtocolConfig {
    /// Largest single frame part accepted off the wire.
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
    /// Largest number of parts in one multi-part message.
    pub const MAX_FRAME_PARTS: usize = 64;
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
    /// Outbound messages buffered per routed peer before sends start waiting.
    pub const PEER_QUEUE_DEPTH: usize = 1024;
    pub const INBOUND_QUEUE_DEPTH: usize = 4096;
    /// Cap on the worker's connect backoff, as a multiple of the reconnect interval.
    pub const RECONNECT_BACKOFF_CAP: u32 = 8;
}

/// Default values for [`RpcConfig`].
pub struct Defaults;

impl Defaults {
    pub const BROKER: &'static str = "127.0.0.1";
    pub const PORT: u16 = 5000;
    pub const CLIENT_RETRIES: u32 = 3;
    pub const CLIENT_TIMEOUT_MS: u64 = 2500;
    pub const CONTROL_SERVICE: &'static str = "icc";
    pub const HEARTBEAT_COUNT: u32 = 3;
    pub const HEARTBEAT_INTERVAL_MS: u64 = 2500;
    pub const HEARTBEAT_LIVENESS: u32 = 3;
    pub const RECONNECT_INTERVAL_MS: u64 = 2500;
    pub const WORKER_TIMEOUT_MS: u64 = 2500;
}

/// Runtime configuration shared by broker, workers and clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Host workers and clients dial.
    pub broker: String,
    /// Port the broker binds and peers dial.
    pub port: u16,
    /// Attempts a client makes before giving up on a call.
    pub client_retries: u32,
    /// How long a client waits for each attempt's reply.
    pub client_timeout_ms: u64,
    /// Reserved service name for broker administration.
    pub control_service: String,
    /// Missed heartbeat intervals before the broker expires a worker.
    pub heartbeat_count: u32,
    pub heartbeat_interval_ms: u64,
    /// Silent polls a worker tolerates before reconnecting.
    pub heartbeat_liveness: u32,
    pub reconnect_interval_ms: u64,
    /// How long one worker poll blocks.
    pub worker_timeout_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            broker: Defaults::BROKER.to_string(),
            port: Defaults::PORT,
            client_retries: Defaults::CLIENT_RETRIES,
            client_timeout_ms: Defaults::CLIENT_TIMEOUT_MS,
            control_service: Defaults::CONTROL_SERVICE.to_string(),
            heartbeat_count: Defaults::HEARTBEAT_COUNT,
            heartbeat_interval_ms: Defaults::HEARTBEAT_INTERVAL_MS,
            heartbeat_liveness: Defaults::HEARTBEAT_LIVENESS,
            reconnect_interval_ms: Defaults::RECONNECT_INTERVAL_MS,
            worker_timeout_ms: Defaults::WORKER_TIMEOUT_MS,
        }
    }
}

impl RpcConfig {
    /// Load configuration from a JSON file. Missing keys keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| RpcError::Config {
            message: format!("cannot read {}: {}", path.display(), e),
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| RpcError::Config {
            message: format!("cannot parse {}: {}", path.display(), e),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall or spin the protocol loops.
    pub fn validate(&self) -> Result<()> {
        let checks: [(&str, bool); 7] = [
            ("client_retries", self.client_retries > 0),
            ("client_timeout_ms", self.client_timeout_ms > 0),
            ("heartbeat_count", self.heartbeat_count > 0),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms > 0),
            ("heartbeat_liveness", self.heartbeat_liveness > 0),
            ("worker_timeout_ms", self.worker_timeout_ms > 0),
            ("control_service", !self.control_service.is_empty()),
        ];

        for (field, ok) in checks {
            if !ok {
                return Err(RpcError::Validation {
                    field: field.to_string(),
                    message: "must not be zero or empty".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_millis(self.client_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Window after which a silent worker is presumed dead.
    pub fn heartbeat_expiry(&self) -> Duration {
        self.heartbeat_interval() * self.heartbeat_count
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn worker_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_timeout_ms)
    }

    /// Address the broker binds: all interfaces on the configured port.
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.port))
    }

    /// Resolve the broker address workers and clients dial.
    pub async fn broker_addr(&self) -> Result<SocketAddr> {
        let target = format!("{}:{}", self.broker, self.port);
        let addr = tokio::net::lookup_host(&target).await?.next();
        addr.ok_or_else(|| RpcError::Config {
            message: format!("broker address {} did not resolve", target),
        })
    }
}
