//! Broker protocol envelopes.
//!
//! Frame layouts as seen on a worker or client connection (the broker's router
//! additionally sees the sender identity in front of each):
//!
//! ```text
//! client -> broker   ["", "client", service, payload...]
//! broker -> client   ["", "client", service, payload...]
//! worker -> broker   ["", "worker", "ready", service]
//!                    ["", "worker", "reply", client, "", payload...]
//!                    ["", "worker", "heartbeat"]
//!                    ["", "worker", "disconnect"]
//! broker -> worker   ["", "worker", "request", client, "", payload...]
//!                    ["", "worker", "heartbeat"]
//!                    ["", "worker", "disconnect"]
//!                    ["", "worker", "stats", client]
//! ```
//!
//! Control requests are ordinary client envelopes addressed to the control
//! service, whose first payload part is `"stats"` or `"worker_stats"`.

use crate::transport::Multipart;
use crate::{Result, RpcError};
use bytes::Bytes;

pub const CLIENT: &[u8] = b"client";
pub const WORKER: &[u8] = b"worker";

pub const READY: &[u8] = b"ready";
pub const REQUEST: &[u8] = b"request";
pub const REPLY: &[u8] = b"reply";
pub const HEARTBEAT: &[u8] = b"heartbeat";
pub const DISCONNECT: &[u8] = b"disconnect";
pub const STATS: &[u8] = b"stats";
pub const WORKER_STATS: &[u8] = b"worker_stats";

/// Commands a worker sends to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerCommand {
    Ready { service: Bytes },
    Reply { client: Bytes, body: Multipart },
    Heartbeat,
    Disconnect,
}

impl WorkerCommand {
    /// Parse the frames that follow the `worker` header.
    pub fn parse(mut frames: Multipart) -> Result<Self> {
        if frames.is_empty() {
            return Err(RpcError::protocol("worker message has no command"));
        }
        let command = frames.remove(0);

        match &command[..] {
            READY => {
                let service = frames
                    .into_iter()
                    .next()
                    .ok_or_else(|| RpcError::protocol("ready without service name"))?;
                Ok(WorkerCommand::Ready { service })
            }
            REPLY => {
                let (client, body) = split_route(frames)?;
                Ok(WorkerCommand::Reply { client, body })
            }
            HEARTBEAT => Ok(WorkerCommand::Heartbeat),
            DISCONNECT => Ok(WorkerCommand::Disconnect),
            other => Err(RpcError::protocol(format!(
                "unknown worker command {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }

    /// Serialize as a worker-side envelope.
    pub fn into_frames(self) -> Multipart {
        match self {
            WorkerCommand::Ready { service } => worker_envelope(READY, vec![service]),
            WorkerCommand::Reply { client, body } => {
                worker_envelope(REPLY, with_route(client, body))
            }
            WorkerCommand::Heartbeat => worker_envelope(HEARTBEAT, Vec::new()),
            WorkerCommand::Disconnect => worker_envelope(DISCONNECT, Vec::new()),
        }
    }
}

/// Commands the broker sends to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerCommand {
    Request { client: Bytes, body: Multipart },
    Heartbeat,
    Disconnect,
    Stats { client: Bytes },
}

impl BrokerCommand {
    /// Parse a complete envelope received on a worker connection.
    pub fn parse(frames: Multipart) -> Result<Self> {
        let mut frames = strip_delimiter(frames)?.into_iter();

        match frames.next() {
            Some(header) if &header[..] == WORKER => {}
            _ => return Err(RpcError::protocol("expected worker header")),
        }
        let command = frames
            .next()
            .ok_or_else(|| RpcError::protocol("broker message has no command"))?;
        let rest: Multipart = frames.collect();

        match &command[..] {
            REQUEST => {
                let (client, body) = split_route(rest)?;
                Ok(BrokerCommand::Request { client, body })
            }
            HEARTBEAT => Ok(BrokerCommand::Heartbeat),
            DISCONNECT => Ok(BrokerCommand::Disconnect),
            STATS => {
                let client = rest
                    .into_iter()
                    .next()
                    .ok_or_else(|| RpcError::protocol("stats without requester address"))?;
                Ok(BrokerCommand::Stats { client })
            }
            other => Err(RpcError::protocol(format!(
                "unknown broker command {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }

    /// Serialize as a worker envelope addressed to `worker`.
    pub fn into_routed(self, worker: Bytes) -> Multipart {
        let frames = match self {
            BrokerCommand::Request { client, body } => {
                worker_envelope(REQUEST, with_route(client, body))
            }
            BrokerCommand::Heartbeat => worker_envelope(HEARTBEAT, Vec::new()),
            BrokerCommand::Disconnect => worker_envelope(DISCONNECT, Vec::new()),
            BrokerCommand::Stats { client } => worker_envelope(STATS, vec![client]),
        };
        routed(worker, frames)
    }
}

/// `["", "worker", command, rest...]`
pub fn worker_envelope(command: &'static [u8], rest: Multipart) -> Multipart {
    let mut frames = Vec::with_capacity(rest.len() + 3);
    frames.push(Bytes::new());
    frames.push(Bytes::from_static(WORKER));
    frames.push(Bytes::from_static(command));
    frames.extend(rest);
    frames
}

/// `["", "client", service, body...]`
pub fn client_envelope(service: Bytes, body: Multipart) -> Multipart {
    let mut frames = Vec::with_capacity(body.len() + 3);
    frames.push(Bytes::new());
    frames.push(Bytes::from_static(CLIENT));
    frames.push(service);
    frames.extend(body);
    frames
}

/// Parse a reply received on a client connection into `(service, body)`.
pub fn parse_client_reply(frames: Multipart) -> Result<(Bytes, Multipart)> {
    let mut frames = strip_delimiter(frames)?.into_iter();

    match frames.next() {
        Some(header) if &header[..] == CLIENT => {}
        _ => return Err(RpcError::protocol("expected client header")),
    }
    let service = frames
        .next()
        .ok_or_else(|| RpcError::protocol("client reply without service name"))?;
    let body: Multipart = frames.collect();
    if body.is_empty() {
        return Err(RpcError::protocol("client reply without payload"));
    }
    Ok((service, body))
}

/// Prefix a message with a router destination.
pub fn routed(address: Bytes, frames: Multipart) -> Multipart {
    let mut message = Vec::with_capacity(frames.len() + 1);
    message.push(address);
    message.extend(frames);
    message
}

/// `[client, "", body...]`
pub fn with_route(client: Bytes, body: Multipart) -> Multipart {
    let mut frames = Vec::with_capacity(body.len() + 2);
    frames.push(client);
    frames.push(Bytes::new());
    frames.extend(body);
    frames
}

/// Split `[client, "", body...]` into its route and body.
pub fn split_route(frames: Multipart) -> Result<(Bytes, Multipart)> {
    let mut frames = frames.into_iter();
    let client = frames
        .next()
        .ok_or_else(|| RpcError::protocol("missing reply route"))?;
    match frames.next() {
        Some(empty) if empty.is_empty() => {}
        _ => return Err(RpcError::protocol("missing empty delimiter after route")),
    }
    Ok((client, frames.collect()))
}

/// Drop the leading empty delimiter frame.
pub fn strip_delimiter(frames: Multipart) -> Result<Multipart> {
    let mut frames = frames.into_iter();
    match frames.next() {
        Some(empty) if empty.is_empty() => Ok(frames.collect()),
        _ => Err(RpcError::protocol("missing empty delimiter")),
    }
}
