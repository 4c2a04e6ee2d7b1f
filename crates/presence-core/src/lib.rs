//! Presence Core - broker-mediated RPC over asynchronous routed messaging.
//!
//! A central [`Broker`] routes calls from [`Client`] proxies to a pool of
//! interchangeable workers registered under named services. Each worker runs a
//! [`WorkerAgent`] around a [`Dispatch`] implementation. Workers and broker
//! track each other with heartbeats; clients retry silent calls on fresh
//! connections.
//!
//! # Example
//!
//! ```rust,ignore
//! use presence_core::{Broker, Client, RpcConfig, WorkerAgent};
//!
//! #[tokio::main]
//! async fn main() -> presence_core::Result<()> {
//!     let config = RpcConfig::default();
//!
//!     let broker = Broker::bind(&config, config.bind_addr()).await?.spawn();
//!     let worker = WorkerAgent::new(config.clone(), Registry).spawn();
//!
//!     let mut registry = Client::new(config, Registry.descriptor())?;
//!     let ok = registry.call("register", vec!["test".into()], Default::default()).await?;
//!     println!("registered: {}", ok);
//!
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod broker;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod protocol;
pub mod transport;
pub mod usage;
pub mod worker;

// Re-export commonly used types
pub use broker::{Broker, BrokerHandle, BrokerStats};
pub use client::{Client, ControlClient};
pub use codec::{Call, Codec, JsonCodec, Reply};
pub use config::RpcConfig;
pub use error::{RemoteFault, Result, RpcError};
pub use usage::{ProcessUsage, StaticUsage, UsageProvider, UsageSnapshot};
pub use worker::{Dispatch, ServiceDescriptor, WorkerAgent, WorkerHandle};
