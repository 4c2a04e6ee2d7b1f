//! Client proxies: call a remote service through the broker as if local.
//!
//! Each call is sent, then waited on for at most the configured timeout. A
//! silent attempt drops the connection and retries on a fresh one, since a
//! dead connection can swallow replies forever. Only one call is ever in
//! flight per proxy; `&mut self` on every call enforces it.

use crate::broker::BrokerStats;
use crate::codec::{Call, Codec, JsonCodec};
use crate::config::{ProtocolConfig, RpcConfig};
use crate::protocol::{self, STATS, WORKER_STATS};
use crate::transport::{DealerSocket, Multipart};
use crate::usage::UsageSnapshot;
use crate::worker::ServiceDescriptor;
use crate::{Result, RpcError};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::net::SocketAddr;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Retrying request/reply exchange with one service through the broker.
struct Channel {
    config: RpcConfig,
    service: Bytes,
    /// Control replies may be relayed under a worker's service name.
    check_service: bool,
    broker: Option<SocketAddr>,
    socket: Option<DealerSocket>,
    reconnects: u32,
}

impl Channel {
    fn new(config: RpcConfig, service: &str, check_service: bool) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            service: Bytes::from(service.to_string().into_bytes()),
            check_service,
            broker: None,
            socket: None,
            reconnects: 0,
        })
    }

    fn service_name(&self) -> String {
        String::from_utf8_lossy(&self.service).into_owned()
    }

    /// Send `body` and return the reply body, retrying on silence.
    async fn request(&mut self, body: Multipart) -> Result<Multipart> {
        let envelope = protocol::client_envelope(self.service.clone(), body);
        let retries = self.config.client_retries;

        for attempt in 1..=retries {
            if attempt > 1 {
                self.reconnect();
            }

            let deadline = Instant::now() + self.config.client_timeout();
            if let Some(reply) = self.attempt(&envelope, deadline).await? {
                return Ok(reply);
            }

            if attempt < retries {
                warn!(service = %self.service_name(), attempt, "No reply, reconnecting");
            } else {
                error!(service = %self.service_name(), "No reply. No retries left. Abandoning");
            }
        }

        // A late reply to the abandoned call must not reach the next one.
        self.socket = None;
        Err(RpcError::Timeout {
            service: self.service_name(),
            attempts: retries,
        })
    }

    /// One send-and-wait bounded by `deadline`. `None` means no usable reply.
    ///
    /// Transport failures spend the rest of the attempt and count as silence;
    /// errors no retry can fix, such as an unresolvable broker name or an
    /// oversized request, are returned.
    async fn attempt(&mut self, envelope: &Multipart, deadline: Instant) -> Result<Option<Multipart>> {
        let broker = match self.broker_addr().await {
            Ok(addr) => addr,
            Err(e) if e.is_retryable() => {
                warn!("Failed to resolve broker: {}", e);
                tokio::time::sleep_until(deadline).await;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if self.socket.is_none() {
            let connect = DealerSocket::connect(broker, ProtocolConfig::CONNECT_TIMEOUT);
            match tokio::time::timeout_at(deadline, connect).await {
                Ok(Ok(socket)) => self.socket = Some(socket),
                Ok(Err(e)) if e.is_retryable() => {
                    warn!("Failed to connect to broker: {}", e);
                    tokio::time::sleep_until(deadline).await;
                    return Ok(None);
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => return Ok(None),
            }
        }
        let expected = self.service.clone();
        let check_service = self.check_service;
        let Some(socket) = self.socket.as_mut() else {
            return Ok(None);
        };

        if let Err(e) = socket.send(envelope.clone()).await {
            if !e.is_retryable() {
                return Err(e);
            }
            warn!("Failed to send to broker: {}", e);
            self.socket = None;
            tokio::time::sleep_until(deadline).await;
            return Ok(None);
        }

        loop {
            let frames = match tokio::time::timeout_at(deadline, socket.recv()).await {
                Err(_) => return Ok(None),
                Ok(Ok(Some(frames))) => frames,
                Ok(Ok(None)) | Ok(Err(_)) => {
                    warn!("Broker connection closed");
                    self.socket = None;
                    tokio::time::sleep_until(deadline).await;
                    return Ok(None);
                }
            };

            match protocol::parse_client_reply(frames) {
                Ok((service, body)) if !check_service || service == expected => {
                    return Ok(Some(body));
                }
                Ok((service, _)) => warn!(
                    expected = %String::from_utf8_lossy(&expected),
                    actual = %String::from_utf8_lossy(&service),
                    "Ignoring reply for another service"
                ),
                Err(e) => warn!("Ignoring malformed reply: {}", e),
            }
        }
    }

    /// Drop the current connection; the next attempt dials a fresh one.
    fn reconnect(&mut self) {
        self.socket = None;
        self.reconnects += 1;
    }

    async fn broker_addr(&mut self) -> Result<SocketAddr> {
        match self.broker {
            Some(addr) => Ok(addr),
            None => {
                let addr = self.config.broker_addr().await?;
                self.broker = Some(addr);
                Ok(addr)
            }
        }
    }
}

/// The single payload part of a reply.
fn single_part(body: Multipart) -> Result<Bytes> {
    let [payload]: [Bytes; 1] = body.try_into().map_err(|parts: Multipart| {
        RpcError::protocol(format!("expected one reply part, got {}", parts.len()))
    })?;
    Ok(payload)
}

/// Proxy for one application service.
pub struct Client<C = JsonCodec> {
    channel: Channel,
    descriptor: ServiceDescriptor,
    codec: C,
}

impl Client<JsonCodec> {
    pub fn new(config: RpcConfig, descriptor: ServiceDescriptor) -> Result<Self> {
        Ok(Self {
            channel: Channel::new(config, &descriptor.name, true)?,
            descriptor,
            codec: JsonCodec,
        })
    }
}

impl<C: Codec> Client<C> {
    /// Use a different payload codec.
    pub fn with_codec<C2: Codec>(self, codec: C2) -> Client<C2> {
        Client {
            channel: self.channel,
            descriptor: self.descriptor,
            codec,
        }
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    /// Connections discarded after silent attempts so far.
    pub fn reconnects(&self) -> u32 {
        self.channel.reconnects
    }

    /// Call `method` remotely.
    ///
    /// Methods outside the descriptor fail here without any I/O. A fault
    /// raised by the worker comes back as [`RpcError::Remote`].
    pub async fn call(
        &mut self,
        method: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Value> {
        if !self.descriptor.has_method(method) {
            return Err(RpcError::UnknownMethod {
                service: self.descriptor.name.clone(),
                method: method.to_string(),
            });
        }

        debug!(service = %self.descriptor.name, method, "Calling remote procedure");

        let call = Call::new(self.descriptor.name.clone(), method)
            .with_args(args)
            .with_kwargs(kwargs);
        let payload = self.codec.encode_call(&call)?;

        let body = self.channel.request(vec![payload]).await?;
        let reply = self.codec.decode_reply(&single_part(body)?)?;
        reply.into_result().map_err(RpcError::Remote)
    }

    /// Zero-argument call, the form attribute-like members take.
    pub async fn call0(&mut self, method: &str) -> Result<Value> {
        self.call(method, Vec::new(), Map::new()).await
    }
}

/// Administrative client for the broker's control service.
pub struct ControlClient {
    channel: Channel,
}

impl ControlClient {
    pub fn new(config: RpcConfig) -> Result<Self> {
        let service = config.control_service.clone();
        Ok(Self {
            channel: Channel::new(config, &service, false)?,
        })
    }

    pub fn reconnects(&self) -> u32 {
        self.channel.reconnects
    }

    /// Broker registry snapshot.
    pub async fn stats(&mut self) -> Result<BrokerStats> {
        self.command(vec![Bytes::from_static(STATS)]).await
    }

    /// Resource usage of one worker, `None` if the broker does not know it.
    pub async fn worker_stats(&mut self, identity: &str) -> Result<Option<UsageSnapshot>> {
        self.command(vec![
            Bytes::from_static(WORKER_STATS),
            Bytes::from(identity.to_string().into_bytes()),
        ])
        .await
    }

    async fn command<T: DeserializeOwned>(&mut self, body: Multipart) -> Result<T> {
        let reply = self.channel.request(body).await?;
        Ok(serde_json::from_slice(&single_part(reply)?)?)
    }
}

impl std::fmt::Debug for ControlClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlClient")
            .field("service", &self.channel.service_name())
            .field("reconnects", &self.channel.reconnects)
            .finish()
    }
}
