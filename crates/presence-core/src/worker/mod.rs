//! Worker agent: binds a [`Dispatch`] implementation to a broker service.
//!
//! The agent is a strict one-request-at-a-time state machine:
//!
//! ```text
//! Connecting -> Idle <-> Executing
//!     ^          |
//!     +----------+  (broker disconnect, lost connection, liveness exhausted)
//! ```
//!
//! It only ever waits for a frame in `Idle`, so a `stats` probe arriving while
//! a call executes stays queued until the reply has gone out.

mod dispatch;

pub use dispatch::{Dispatch, ServiceDescriptor};

use crate::backoff::Backoff;
use crate::codec::{Call, Codec, JsonCodec, Reply};
use crate::config::{ProtocolConfig, RpcConfig};
use crate::error::RemoteFault;
use crate::protocol::{BrokerCommand, WorkerCommand};
use crate::transport::{DealerSocket, Multipart};
use crate::usage::{ProcessUsage, UsageProvider};
use crate::{Result, RpcError};
use bytes::Bytes;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Where the agent is in its request cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
enum AgentState {
    Connecting,
    Idle,
    /// A request was taken; its reply is owed to `reply_to`.
    Executing { reply_to: Bytes },
}

/// Outcome of waiting on the broker connection.
enum Event {
    Request(Multipart),
    /// Broker asked us to re-register.
    Reconnect,
    /// Liveness ran out or the connection died.
    Lost,
    Shutdown,
}

/// One live broker connection.
struct Session {
    socket: DealerSocket,
    liveness: u32,
    heartbeat_at: Instant,
}

/// Handle to a spawned worker agent. Dropping it stops the agent.
pub struct WorkerHandle {
    shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<Result<()>>>,
}

impl WorkerHandle {
    /// Ask the agent to disconnect from the broker and stop.
    pub fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Shut down and wait for the agent to exit.
    pub async fn join(mut self) -> Result<()> {
        self.shutdown();
        match self.task_handle.take() {
            Some(handle) => handle
                .await
                .map_err(|e| RpcError::Other(format!("worker task failed: {}", e)))?,
            None => Ok(()),
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

pub struct WorkerAgent<D, C = JsonCodec> {
    config: RpcConfig,
    dispatch: D,
    codec: C,
    descriptor: ServiceDescriptor,
    usage: Box<dyn UsageProvider>,
    state: AgentState,
}

impl<D: Dispatch> WorkerAgent<D, JsonCodec> {
    pub fn new(config: RpcConfig, dispatch: D) -> Self {
        let descriptor = dispatch.descriptor();
        Self {
            config,
            dispatch,
            codec: JsonCodec,
            descriptor,
            usage: Box::new(ProcessUsage::new()),
            state: AgentState::Connecting,
        }
    }
}

impl<D: Dispatch, C: Codec> WorkerAgent<D, C> {
    /// Use a different payload codec.
    pub fn with_codec<C2: Codec>(self, codec: C2) -> WorkerAgent<D, C2> {
        WorkerAgent {
            config: self.config,
            dispatch: self.dispatch,
            codec,
            descriptor: self.descriptor,
            usage: self.usage,
            state: self.state,
        }
    }

    /// Register under the dispatch's service name followed by `suffix`.
    pub fn with_service_suffix(mut self, suffix: &str) -> Self {
        self.descriptor = self.descriptor.with_suffix(suffix);
        self
    }

    /// Replace the source of `stats` probe answers.
    pub fn with_usage(mut self, usage: Box<dyn UsageProvider>) -> Self {
        self.usage = usage;
        self
    }

    /// Service name this agent registers under.
    pub fn service(&self) -> &str {
        &self.descriptor.name
    }

    /// Serve calls until `shutdown` flips to true or its sender drops.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.config.validate()?;
        let broker = self.config.broker_addr().await?;

        'connect: while let Some(mut session) = self.connect(broker, &mut shutdown).await {
            loop {
                match self.poll(&mut session, &mut shutdown).await? {
                    Event::Request(body) => {
                        let payload = self.execute(body).await;
                        if self.send_reply(&mut session, payload).await.is_err() {
                            warn!(service = %self.descriptor.name, "Lost broker while replying");
                            if !self.pause(&mut shutdown).await {
                                break 'connect;
                            }
                            continue 'connect;
                        }
                    }
                    Event::Reconnect => continue 'connect,
                    Event::Lost => {
                        warn!(service = %self.descriptor.name, "Disconnected from broker");
                        if !self.pause(&mut shutdown).await {
                            break 'connect;
                        }
                        continue 'connect;
                    }
                    Event::Shutdown => {
                        let _ = session
                            .socket
                            .send(WorkerCommand::Disconnect.into_frames())
                            .await;
                        break 'connect;
                    }
                }
            }
        }

        info!(service = %self.descriptor.name, "Worker stopped");
        Ok(())
    }

    /// Spawn the agent on the current runtime.
    pub fn spawn(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task_handle = tokio::spawn(self.run(shutdown_rx));

        WorkerHandle {
            shutdown_tx,
            task_handle: Some(task_handle),
        }
    }

    /// Dial the broker and register, backing off while it is unreachable.
    ///
    /// Returns `None` if shutdown is requested first.
    async fn connect(
        &mut self,
        broker: SocketAddr,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<Session> {
        self.state = AgentState::Connecting;
        let interval = self.config.reconnect_interval();
        let backoff = Backoff::new(interval, interval * ProtocolConfig::RECONNECT_BACKOFF_CAP);
        let mut attempt = 0u32;

        loop {
            if *shutdown.borrow() {
                return None;
            }

            info!(broker = %broker, service = %self.descriptor.name, "Connecting to broker");
            match DealerSocket::connect(broker, ProtocolConfig::CONNECT_TIMEOUT).await {
                Ok(mut socket) => {
                    let ready = WorkerCommand::Ready {
                        service: Bytes::from(self.descriptor.name.clone().into_bytes()),
                    };
                    match socket.send(ready.into_frames()).await {
                        Ok(()) => {
                            self.state = AgentState::Idle;
                            return Some(Session {
                                socket,
                                liveness: self.config.heartbeat_liveness,
                                heartbeat_at: Instant::now() + self.config.heartbeat_interval(),
                            });
                        }
                        Err(e) => warn!("Failed to register with broker: {}", e),
                    }
                }
                Err(e) => warn!("Failed to connect to broker: {}", e),
            }

            let delay = backoff.delay(attempt);
            attempt = attempt.saturating_add(1);
            if !wait_or_shutdown(delay, shutdown).await {
                return None;
            }
        }
    }

    /// Sleep one reconnect interval; `false` if shutdown interrupted it.
    async fn pause(&mut self, shutdown: &mut watch::Receiver<bool>) -> bool {
        self.state = AgentState::Connecting;
        wait_or_shutdown(self.config.reconnect_interval(), shutdown).await
    }

    /// Wait for the next request, serving heartbeats and probes meanwhile.
    async fn poll(
        &mut self,
        session: &mut Session,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Event> {
        if self.state != AgentState::Idle {
            return Err(RpcError::protocol(format!(
                "worker asked to receive in state {:?}",
                self.state
            )));
        }

        let timeout = self.config.worker_timeout();
        let mut deadline = Instant::now() + timeout;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(Event::Shutdown);
                    }
                }
                _ = tokio::time::sleep_until(session.heartbeat_at) => {
                    if session.socket.send(WorkerCommand::Heartbeat.into_frames()).await.is_err() {
                        return Ok(Event::Lost);
                    }
                    session.heartbeat_at = Instant::now() + self.config.heartbeat_interval();
                }
                received = tokio::time::timeout_at(deadline, session.socket.recv()) => {
                    let frames = match received {
                        Err(_) => {
                            session.liveness = session.liveness.saturating_sub(1);
                            if session.liveness == 0 {
                                return Ok(Event::Lost);
                            }
                            deadline = Instant::now() + timeout;
                            continue;
                        }
                        Ok(Ok(Some(frames))) => frames,
                        Ok(Ok(None)) => return Ok(Event::Lost),
                        Ok(Err(e)) => {
                            warn!("Broker connection failed: {}", e);
                            return Ok(Event::Lost);
                        }
                    };

                    session.liveness = self.config.heartbeat_liveness;
                    deadline = Instant::now() + timeout;

                    match BrokerCommand::parse(frames) {
                        Ok(BrokerCommand::Request { client, body }) => {
                            self.state = AgentState::Executing { reply_to: client };
                            return Ok(Event::Request(body));
                        }
                        Ok(BrokerCommand::Heartbeat) => {}
                        Ok(BrokerCommand::Stats { client }) => {
                            if self.answer_stats(session, client).await.is_err() {
                                return Ok(Event::Lost);
                            }
                        }
                        Ok(BrokerCommand::Disconnect) => {
                            info!(service = %self.descriptor.name, "Broker requested reconnect");
                            return Ok(Event::Reconnect);
                        }
                        Err(e) => warn!("Invalid message from broker: {}", e),
                    }
                }
            }
        }
    }

    /// Run one call and encode its outcome. Never fails: faults become data.
    async fn execute(&self, body: Multipart) -> Bytes {
        let reply = match self.decode(body) {
            Ok(call) => self.invoke(call).await,
            Err(fault) => Reply::Fault(fault),
        };

        match self.codec.encode_reply(&reply) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode reply: {}", e);
                let fault = Reply::Fault(RemoteFault::new("EncodeError", e.to_string()));
                self.codec.encode_reply(&fault).unwrap_or_default()
            }
        }
    }

    fn decode(&self, body: Multipart) -> std::result::Result<Call, RemoteFault> {
        let [payload]: [Bytes; 1] = body.try_into().map_err(|parts: Multipart| {
            RemoteFault::new(
                "DecodeError",
                format!("expected one payload part, got {}", parts.len()),
            )
        })?;
        self.codec
            .decode_call(&payload)
            .map_err(|e| RemoteFault::new("DecodeError", e.to_string()))
    }

    async fn invoke(&self, call: Call) -> Reply {
        debug!(service = %call.service, method = %call.method, "Call received");

        if call.service != self.descriptor.name {
            return Reply::Fault(RemoteFault::service_mismatch(
                &self.descriptor.name,
                &call.service,
            ));
        }
        if !self.descriptor.has_method(&call.method) {
            return Reply::Fault(RemoteFault::unknown_method(&call.service, &call.method));
        }

        self.dispatch
            .dispatch(&call.method, call.args, call.kwargs)
            .await
            .into()
    }

    async fn send_reply(&mut self, session: &mut Session, payload: Bytes) -> Result<()> {
        let AgentState::Executing { reply_to } =
            std::mem::replace(&mut self.state, AgentState::Idle)
        else {
            return Err(RpcError::protocol("reply without an outstanding request"));
        };

        let reply = WorkerCommand::Reply {
            client: reply_to,
            body: vec![payload],
        };
        session.socket.send(reply.into_frames()).await
    }

    async fn answer_stats(&mut self, session: &mut Session, client: Bytes) -> Result<()> {
        let payload = serde_json::to_vec(&self.usage.snapshot())?;
        let reply = WorkerCommand::Reply {
            client,
            body: vec![Bytes::from(payload)],
        };
        session.socket.send(reply.into_frames()).await
    }
}

/// Sleep for `delay` unless shutdown arrives first.
async fn wait_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        changed = shutdown.changed() => {
            let stopped = changed.is_err() || *shutdown.borrow();
            !stopped
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol;
    use crate::transport::RouterSocket;
    use crate::usage::{MemoryUsage, StaticUsage, UsageSnapshot};
    use async_trait::async_trait;
    use serde_json::{json, Map, Value};

    struct Echo;

    #[async_trait]
    impl Dispatch for Echo {
        fn descriptor(&self) -> ServiceDescriptor {
            ServiceDescriptor::new("Echo", ["echo", "fail"])
        }

        async fn dispatch(
            &self,
            method: &str,
            args: Vec<Value>,
            _kwargs: Map<String, Value>,
        ) -> std::result::Result<Value, RemoteFault> {
            match method {
                "echo" => Ok(Value::Array(args)),
                _ => Err(RemoteFault::new("ValueError", "failed on purpose")),
            }
        }
    }

    fn test_config(port: u16) -> RpcConfig {
        RpcConfig {
            port,
            heartbeat_interval_ms: 10_000,
            worker_timeout_ms: 10_000,
            reconnect_interval_ms: 50,
            ..RpcConfig::default()
        }
    }

    async fn recv(router: &mut RouterSocket) -> Multipart {
        tokio::time::timeout(Duration::from_secs(5), router.recv())
            .await
            .expect("router recv timed out")
            .expect("router closed")
    }

    /// Bind a fake broker and wait for the agent's ready. Returns its identity.
    async fn start(agent_config: impl FnOnce(u16) -> RpcConfig) -> (RouterSocket, Bytes, WorkerHandle) {
        let mut router = RouterSocket::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let usage = StaticUsage(UsageSnapshot {
            memory: MemoryUsage {
                resident: 42,
                virtual_size: 84,
            },
            ..UsageSnapshot::default()
        });
        let handle = WorkerAgent::new(agent_config(router.local_addr().port()), Echo)
            .with_usage(Box::new(usage))
            .spawn();

        let ready = recv(&mut router).await;
        assert_eq!(&ready[3][..], protocol::READY);
        assert_eq!(&ready[4][..], b"Echo");
        (router, ready[0].clone(), handle)
    }

    async fn call(router: &mut RouterSocket, worker: &Bytes, call: &Call) -> Reply {
        let payload = JsonCodec.encode_call(call).unwrap();
        let request = BrokerCommand::Request {
            client: Bytes::from_static(b"c1"),
            body: vec![payload],
        };
        router.send(request.into_routed(worker.clone())).await.unwrap();

        let message = recv(router).await;
        match WorkerCommand::parse(message[3..].to_vec()).unwrap() {
            WorkerCommand::Reply { client, body } => {
                assert_eq!(&client[..], b"c1");
                JsonCodec.decode_reply(&body[0]).unwrap()
            }
            other => panic!("Expected reply, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_request_answered_with_dispatch_result() {
        let (mut router, worker, _handle) = start(test_config).await;

        let reply = call(
            &mut router,
            &worker,
            &Call::new("Echo", "echo").with_args(vec![json!(1), json!("a")]),
        )
        .await;
        assert_eq!(reply, Reply::Value(json!([1, "a"])));
    }

    #[tokio::test]
    async fn test_faults_are_returned_not_raised() {
        let (mut router, worker, _handle) = start(test_config).await;

        let reply = call(&mut router, &worker, &Call::new("Echo", "fail")).await;
        assert_eq!(
            reply.into_result().unwrap_err(),
            RemoteFault::new("ValueError", "failed on purpose")
        );

        // Still serving afterwards.
        let reply = call(&mut router, &worker, &Call::new("Echo", "echo")).await;
        assert_eq!(reply, Reply::Value(json!([])));
    }

    #[tokio::test]
    async fn test_wrong_service_and_unknown_method_faults() {
        let (mut router, worker, _handle) = start(test_config).await;

        let mismatch = call(&mut router, &worker, &Call::new("Store", "echo")).await;
        match mismatch {
            Reply::Fault(fault) => assert_eq!(fault.kind, "ServiceMismatch"),
            other => panic!("Expected fault, got: {:?}", other),
        }

        let unknown = call(&mut router, &worker, &Call::new("Echo", "nope")).await;
        match unknown {
            Reply::Fault(fault) => assert_eq!(fault.kind, "UnknownMethod"),
            other => panic!("Expected fault, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_decode_fault() {
        let (mut router, worker, _handle) = start(test_config).await;

        let request = BrokerCommand::Request {
            client: Bytes::from_static(b"c1"),
            body: vec![Bytes::from_static(b"\x00garbage")],
        };
        router.send(request.into_routed(worker)).await.unwrap();

        let message = recv(&mut router).await;
        let WorkerCommand::Reply { body, .. } = WorkerCommand::parse(message[3..].to_vec()).unwrap()
        else {
            panic!("Expected reply");
        };
        match JsonCodec.decode_reply(&body[0]).unwrap() {
            Reply::Fault(fault) => assert_eq!(fault.kind, "DecodeError"),
            other => panic!("Expected fault, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stats_probe_answered_with_usage() {
        let (mut router, worker, _handle) = start(test_config).await;

        let probe = BrokerCommand::Stats {
            client: Bytes::from_static(b"admin"),
        };
        router.send(probe.into_routed(worker)).await.unwrap();

        let message = recv(&mut router).await;
        let WorkerCommand::Reply { client, body } =
            WorkerCommand::parse(message[3..].to_vec()).unwrap()
        else {
            panic!("Expected reply");
        };
        assert_eq!(&client[..], b"admin");
        let usage: UsageSnapshot = serde_json::from_slice(&body[0]).unwrap();
        assert_eq!(usage.memory.resident, 42);
    }

    #[tokio::test]
    async fn test_broker_disconnect_triggers_fresh_ready() {
        let (mut router, worker, _handle) = start(test_config).await;

        router
            .send(BrokerCommand::Disconnect.into_routed(worker.clone()))
            .await
            .unwrap();

        let ready = recv(&mut router).await;
        assert_ne!(ready[0], worker);
        assert_eq!(&ready[3][..], protocol::READY);
    }

    #[tokio::test]
    async fn test_silent_broker_exhausts_liveness_and_reconnects() {
        let (mut router, worker, _handle) = start(|port| RpcConfig {
            worker_timeout_ms: 30,
            heartbeat_liveness: 2,
            ..test_config(port)
        })
        .await;

        let ready = recv(&mut router).await;
        assert_ne!(ready[0], worker);
        assert_eq!(&ready[3][..], protocol::READY);
    }

    #[tokio::test]
    async fn test_worker_heartbeats_on_interval() {
        let (mut router, _worker, _handle) = start(|port| RpcConfig {
            heartbeat_interval_ms: 50,
            ..test_config(port)
        })
        .await;

        let beat = recv(&mut router).await;
        assert_eq!(&beat[3][..], protocol::HEARTBEAT);
    }

    #[tokio::test]
    async fn test_shutdown_sends_disconnect() {
        let (mut router, worker, handle) = start(test_config).await;

        handle.join().await.unwrap();

        let goodbye = recv(&mut router).await;
        assert_eq!(goodbye[0], worker);
        assert_eq!(&goodbye[3][..], protocol::DISCONNECT);
    }
}
