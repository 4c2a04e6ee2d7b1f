//! Routing socket for the broker side.
//!
//! Accepts TCP connections and stamps every inbound message with the opaque
//! identity of the connection it arrived on. Outbound messages name their
//! destination the same way, in their first part.
//!
//! # Thread Safety
//!
//! Each connection runs a reader task and a writer task. The reader funnels
//! messages into one inbound channel, so the owner of the socket sees a single
//! serialized stream regardless of how many peers are connected. A peer's
//! disconnect is queued on the same channel, after its last message.

use super::frame::{read_multipart, write_multipart};
use super::{display_identity, Multipart};
use crate::config::ProtocolConfig;
use crate::{Result, RpcError};
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, trace, warn};

type PeerTable = Arc<Mutex<HashMap<Bytes, mpsc::Sender<Multipart>>>>;

/// What happened on one of the router's connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterEvent {
    /// A message, prefixed with the sender's identity.
    Message(Multipart),
    /// The peer with this identity closed its connection or failed a read.
    Closed(Bytes),
}

/// Server-side socket that multiplexes many peers over one receive queue.
pub struct RouterSocket {
    addr: SocketAddr,
    inbound: mpsc::Receiver<RouterEvent>,
    peers: PeerTable,
    shutdown_tx: watch::Sender<bool>,
    accept_task: tokio::task::JoinHandle<()>,
}

impl RouterSocket {
    /// Bind the listening socket and start accepting peers.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;

        info!("Router listening on {}", addr);

        let (inbound_tx, inbound) = mpsc::channel(ProtocolConfig::INBOUND_QUEUE_DEPTH);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let peers: PeerTable = Arc::new(Mutex::new(HashMap::new()));

        let accept_task = tokio::spawn(Self::accept_loop(
            listener,
            inbound_tx,
            peers.clone(),
            shutdown_rx,
        ));

        Ok(Self {
            addr,
            inbound,
            peers,
            shutdown_tx,
            accept_task,
        })
    }

    /// Get the address the socket is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Receive the next message or peer disconnect.
    ///
    /// Cancel-safe. Returns `None` once the socket has shut down.
    pub async fn recv_event(&mut self) -> Option<RouterEvent> {
        self.inbound.recv().await
    }

    /// Receive the next message, prefixed with the sender's identity.
    /// Disconnects are skipped.
    ///
    /// Cancel-safe. Returns `None` once the socket has shut down.
    pub async fn recv(&mut self) -> Option<Multipart> {
        loop {
            match self.inbound.recv().await? {
                RouterEvent::Message(message) => return Some(message),
                RouterEvent::Closed(_) => continue,
            }
        }
    }

    /// Route a message to the peer named by its first part.
    ///
    /// Messages for peers that are no longer connected are dropped.
    pub async fn send(&self, mut message: Multipart) -> Result<()> {
        if message.is_empty() {
            return Err(RpcError::protocol("routed message has no address"));
        }
        let identity = message.remove(0);

        let sender = self.peers.lock().await.get(&identity).cloned();
        match sender {
            Some(tx) => {
                if tx.send(message).await.is_err() {
                    debug!(peer = %display_identity(&identity), "Dropping message for closed peer");
                }
            }
            None => {
                debug!(peer = %display_identity(&identity), "Dropping message for unknown peer");
            }
        }
        Ok(())
    }

    async fn accept_loop(
        listener: TcpListener,
        inbound_tx: mpsc::Sender<RouterEvent>,
        peers: PeerTable,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    debug!("Router accept loop shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            Self::register_peer(
                                stream,
                                peer_addr,
                                inbound_tx.clone(),
                                peers.clone(),
                                shutdown_rx.clone(),
                            )
                            .await;
                        }
                        Err(e) => {
                            error!("Router accept error: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn register_peer(
        stream: TcpStream,
        peer_addr: SocketAddr,
        inbound_tx: mpsc::Sender<RouterEvent>,
        peers: PeerTable,
        shutdown_rx: watch::Receiver<bool>,
    ) {
        let _ = stream.set_nodelay(true);
        let identity = Bytes::copy_from_slice(uuid::Uuid::new_v4().as_bytes());
        let (reader, writer) = stream.into_split();
        let (outbound_tx, outbound_rx) = mpsc::channel(ProtocolConfig::PEER_QUEUE_DEPTH);

        peers.lock().await.insert(identity.clone(), outbound_tx);
        debug!(peer = %display_identity(&identity), %peer_addr, "Peer connected");

        tokio::spawn(Self::write_loop(writer, outbound_rx, shutdown_rx.clone()));
        tokio::spawn(Self::read_loop(
            reader,
            identity,
            inbound_tx,
            peers,
            shutdown_rx,
        ));
    }

    async fn read_loop(
        mut reader: OwnedReadHalf,
        identity: Bytes,
        inbound_tx: mpsc::Sender<RouterEvent>,
        peers: PeerTable,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let lost = loop {
            let message = tokio::select! {
                _ = shutdown_rx.changed() => break false,
                result = read_multipart(&mut reader) => match result {
                    Ok(Some(parts)) => parts,
                    Ok(None) => break true,
                    Err(e) => {
                        debug!(peer = %display_identity(&identity), "Peer read failed: {}", e);
                        break true;
                    }
                },
            };

            trace!(peer = %display_identity(&identity), parts = message.len(), "Routed inbound");

            let mut routed = Vec::with_capacity(message.len() + 1);
            routed.push(identity.clone());
            routed.extend(message);
            if inbound_tx.send(RouterEvent::Message(routed)).await.is_err() {
                break false;
            }
        };

        // Dropping the peer's sender ends its writer task.
        peers.lock().await.remove(&identity);
        debug!(peer = %display_identity(&identity), "Peer disconnected");

        if lost {
            let _ = inbound_tx.send(RouterEvent::Closed(identity)).await;
        }
    }

    async fn write_loop(
        mut writer: OwnedWriteHalf,
        mut outbound_rx: mpsc::Receiver<Multipart>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            let message = tokio::select! {
                _ = shutdown_rx.changed() => break,
                next = outbound_rx.recv() => match next {
                    Some(message) => message,
                    None => break,
                },
            };

            if let Err(e) = write_multipart(&mut writer, &message).await {
                if e.is_retryable() {
                    debug!("Peer write failed: {}", e);
                    break;
                }
                warn!("Dropping unsendable message: {}", e);
            }
        }
    }
}

impl Drop for RouterSocket {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        self.accept_task.abort();
    }
}
