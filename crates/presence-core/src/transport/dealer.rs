//! Connecting socket used by workers and clients.
//!
//! A background task reads whole messages off the connection and hands them
//! over through a channel, which keeps [`DealerSocket::recv`] cancel-safe: a
//! poll that times out never leaves a half-read message on the stream.

use super::frame::{read_multipart, write_multipart};
use super::Multipart;
use crate::config::ProtocolConfig;
use crate::{Result, RpcError};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::debug;

/// One outbound connection to a routing peer.
#[derive(Debug)]
pub struct DealerSocket {
    peer: SocketAddr,
    writer: OwnedWriteHalf,
    inbound: mpsc::Receiver<Result<Multipart>>,
    reader_task: tokio::task::JoinHandle<()>,
}

impl DealerSocket {
    /// Connect to `peer`, giving up after `connect_timeout`.
    pub async fn connect(peer: SocketAddr, connect_timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(peer))
            .await
            .map_err(|_| RpcError::Io {
                message: format!("connect to {} timed out after {:?}", peer, connect_timeout),
                source: None,
            })??;
        let _ = stream.set_nodelay(true);

        let (reader, writer) = stream.into_split();
        let (inbound_tx, inbound) = mpsc::channel(ProtocolConfig::PEER_QUEUE_DEPTH);
        let reader_task = tokio::spawn(Self::read_loop(reader, inbound_tx));

        debug!("Dealer connected to {}", peer);

        Ok(Self {
            peer,
            writer,
            inbound,
            reader_task,
        })
    }

    pub async fn send(&mut self, message: Multipart) -> Result<()> {
        write_multipart(&mut self.writer, &message)
            .await
            .map_err(|e| match e {
                RpcError::Io { .. } => RpcError::Disconnected {
                    peer: self.peer.to_string(),
                },
                other => other,
            })
    }

    /// Receive the next message.
    ///
    /// Returns `Ok(None)` once the peer has closed the connection.
    pub async fn recv(&mut self) -> Result<Option<Multipart>> {
        match self.inbound.recv().await {
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    async fn read_loop(mut reader: OwnedReadHalf, inbound_tx: mpsc::Sender<Result<Multipart>>) {
        loop {
            match read_multipart(&mut reader).await {
                Ok(Some(message)) => {
                    if inbound_tx.send(Ok(message)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = inbound_tx.send(Err(e)).await;
                    break;
                }
            }
        }
    }
}

impl Drop for DealerSocket {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_to_dead_port_fails() {
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let result = DealerSocket::connect(addr, Duration::from_millis(500)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_recv_reports_peer_close() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut dealer = DealerSocket::connect(addr, Duration::from_secs(1))
            .await
            .unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        drop(stream);

        assert!(dealer.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recv_survives_timeout_cancellation() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut dealer = DealerSocket::connect(addr, Duration::from_secs(1))
            .await
            .unwrap();
        let (mut stream, _) = listener.accept().await.unwrap();

        let timed_out =
            tokio::time::timeout(Duration::from_millis(20), dealer.recv()).await;
        assert!(timed_out.is_err());

        write_multipart(&mut stream, &[bytes::Bytes::from_static(b"late")])
            .await
            .unwrap();
        let message = dealer.recv().await.unwrap().unwrap();
        assert_eq!(&message[0][..], b"late");
    }
}
