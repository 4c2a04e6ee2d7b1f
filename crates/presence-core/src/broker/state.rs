//! Worker and service registries plus the dispatch state machine.
//!
//! `BrokerState` owns every [`WorkerRecord`] and [`ServiceRecord`] and is only
//! ever driven from the broker's single event-loop task, so pairing a queued
//! request with an idle worker is atomic without locks. Outbound messages are
//! queued and drained by the loop after each step; all timing decisions take
//! the caller's `Instant`, which keeps the machine deterministic under test.

use crate::protocol::{self, BrokerCommand, WorkerCommand};
use crate::transport::{display_identity, Multipart};
use crate::usage::{UsageProvider, UsageSnapshot};
use crate::{Result, RpcError};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A worker known to the broker.
#[derive(Debug)]
pub struct WorkerRecord {
    /// Hex rendering of the connection identity; the registry key.
    pub identity: String,
    /// Router address replies are sent to.
    pub address: Bytes,
    pub service: Option<Bytes>,
    pub expiry: Instant,
    /// Requesters of forwarded `stats` probes still awaiting this worker's answer.
    stats_requesters: VecDeque<Bytes>,
}

/// A client request waiting for a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedRequest {
    /// Router address of the requesting client.
    pub client: Bytes,
    /// Opaque payload frames.
    pub body: Multipart,
}

/// A named pool of workers and its backlog.
#[derive(Debug)]
pub struct ServiceRecord {
    pub name: Bytes,
    /// Pending requests, oldest first.
    pub requests: VecDeque<QueuedRequest>,
    /// Idle worker identities, longest idle first.
    pub waiting: VecDeque<String>,
}

impl ServiceRecord {
    fn new(name: Bytes) -> Self {
        Self {
            name,
            requests: VecDeque::new(),
            waiting: VecDeque::new(),
        }
    }
}

/// Snapshot returned by the `stats` control command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrokerStats {
    pub workers: Vec<String>,
    pub waiting_workers: Vec<String>,
    /// Pending request count per service.
    pub services: BTreeMap<String, usize>,
    pub usage: UsageSnapshot,
}

/// Broker timing and naming knobs.
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub control_service: Bytes,
    pub heartbeat_interval: Duration,
    pub heartbeat_expiry: Duration,
}

pub struct BrokerState {
    settings: BrokerSettings,
    workers: HashMap<String, WorkerRecord>,
    services: HashMap<Bytes, ServiceRecord>,
    /// Idle workers across all services.
    waiting: Vec<String>,
    heartbeat_at: Instant,
    outbound: Vec<Multipart>,
    usage: Box<dyn UsageProvider>,
}

impl BrokerState {
    pub fn new(settings: BrokerSettings, usage: Box<dyn UsageProvider>, now: Instant) -> Self {
        Self {
            heartbeat_at: now + settings.heartbeat_interval,
            settings,
            workers: HashMap::new(),
            services: HashMap::new(),
            waiting: Vec::new(),
            outbound: Vec::new(),
            usage,
        }
    }

    /// Process one `[sender, "", header, ...]` message from the router.
    pub fn handle_message(&mut self, message: Multipart, now: Instant) -> Result<()> {
        let mut frames = message.into_iter();
        let sender = frames
            .next()
            .ok_or_else(|| RpcError::protocol("message without sender"))?;
        let rest = protocol::strip_delimiter(frames.collect())?;
        let mut rest = rest.into_iter();
        let header = rest
            .next()
            .ok_or_else(|| RpcError::protocol("message without header"))?;

        match &header[..] {
            protocol::CLIENT => self.handle_client(sender, rest.collect(), now),
            protocol::WORKER => {
                self.handle_worker(sender, rest.collect(), now);
                Ok(())
            }
            other => Err(RpcError::protocol(format!(
                "invalid header {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }

    fn handle_worker(&mut self, sender: Bytes, frames: Multipart, now: Instant) {
        let identity = display_identity(&sender);
        let registered = self.workers.contains_key(&identity);

        let command = match WorkerCommand::parse(frames) {
            Ok(command) => command,
            Err(e) => {
                warn!(worker = %identity, "Disconnecting worker: {}", e);
                self.disconnect_peer(&identity, sender);
                return;
            }
        };

        match command {
            WorkerCommand::Ready { service } => {
                if registered || service == self.settings.control_service {
                    warn!(
                        worker = %identity,
                        service = %String::from_utf8_lossy(&service),
                        "Rejecting ready from worker"
                    );
                    self.disconnect_peer(&identity, sender);
                } else {
                    self.ensure_service(&service);
                    info!(
                        worker = %identity,
                        service = %String::from_utf8_lossy(&service),
                        "New worker"
                    );
                    self.workers.insert(
                        identity.clone(),
                        WorkerRecord {
                            identity: identity.clone(),
                            address: sender,
                            service: Some(service),
                            expiry: now + self.settings.heartbeat_expiry,
                            stats_requesters: VecDeque::new(),
                        },
                    );
                    self.worker_waiting(&identity, now);
                }
            }
            WorkerCommand::Reply { client, body } => {
                if !registered {
                    self.disconnect_peer(&identity, sender);
                    return;
                }
                let (service, stats_answer) = match self.workers.get_mut(&identity) {
                    Some(worker) => {
                        let position = worker.stats_requesters.iter().position(|c| *c == client);
                        let stats_answer = position
                            .and_then(|i| worker.stats_requesters.remove(i))
                            .is_some();
                        (worker.service.clone().unwrap_or_default(), stats_answer)
                    }
                    None => return,
                };

                self.outbound.push(protocol::routed(
                    client,
                    protocol::client_envelope(service, body),
                ));

                // A probe answer says nothing about the worker's request slot.
                if !stats_answer {
                    self.worker_waiting(&identity, now);
                }
            }
            WorkerCommand::Heartbeat => match self.workers.get_mut(&identity) {
                Some(worker) => {
                    worker.expiry = now + self.settings.heartbeat_expiry;
                }
                None => self.disconnect_peer(&identity, sender),
            },
            WorkerCommand::Disconnect => {
                debug!(worker = %identity, "Worker disconnected");
                self.delete_worker(&identity);
            }
        }
    }

    fn handle_client(&mut self, sender: Bytes, frames: Multipart, now: Instant) -> Result<()> {
        let mut frames = frames.into_iter();
        let service = frames
            .next()
            .ok_or_else(|| RpcError::protocol("client message without service"))?;
        let body: Multipart = frames.collect();
        if body.is_empty() {
            return Err(RpcError::protocol("client message without payload"));
        }

        if service == self.settings.control_service {
            self.handle_control(sender, body);
            return Ok(());
        }

        self.ensure_service(&service);
        if let Some(record) = self.services.get_mut(&service) {
            record.requests.push_back(QueuedRequest {
                client: sender,
                body,
            });
        }
        self.dispatch(&service, now);
        Ok(())
    }

    fn handle_control(&mut self, client: Bytes, body: Multipart) {
        let mut body = body.into_iter();
        let command = body.next().unwrap_or_default();

        let reply = match &command[..] {
            protocol::STATS => serde_json::to_value(self.stats()).ok(),
            protocol::WORKER_STATS => {
                let target = body
                    .next()
                    .map(|identity| String::from_utf8_lossy(&identity).into_owned());
                match target.and_then(|identity| self.workers.get_mut(&identity)) {
                    Some(worker) => {
                        worker.stats_requesters.push_back(client.clone());
                        let address = worker.address.clone();
                        self.outbound
                            .push(BrokerCommand::Stats { client }.into_routed(address));
                        // The worker answers the requester itself.
                        return;
                    }
                    None => None,
                }
            }
            other => {
                warn!(
                    command = %String::from_utf8_lossy(other),
                    "Unknown control command"
                );
                None
            }
        };

        let payload = serde_json::to_vec(&reply.unwrap_or(serde_json::Value::Null))
            .map(Bytes::from)
            .unwrap_or_else(|_| Bytes::from_static(b"null"));
        self.outbound.push(protocol::routed(
            client,
            protocol::client_envelope(self.settings.control_service.clone(), vec![payload]),
        ));
    }

    /// Registry snapshot for the `stats` control command.
    pub fn stats(&mut self) -> BrokerStats {
        let mut workers: Vec<String> = self.workers.keys().cloned().collect();
        workers.sort();

        BrokerStats {
            workers,
            waiting_workers: self.waiting.clone(),
            services: self
                .services
                .values()
                .map(|s| (String::from_utf8_lossy(&s.name).into_owned(), s.requests.len()))
                .collect(),
            usage: self.usage.snapshot(),
        }
    }

    fn ensure_service(&mut self, name: &Bytes) {
        if !self.services.contains_key(name) {
            info!(service = %String::from_utf8_lossy(name), "New service");
            self.services
                .insert(name.clone(), ServiceRecord::new(name.clone()));
        }
    }

    /// Mark a registered worker idle and try to hand it work.
    fn worker_waiting(&mut self, identity: &str, now: Instant) {
        let service = match self.workers.get_mut(identity) {
            Some(worker) => {
                worker.expiry = now + self.settings.heartbeat_expiry;
                worker.service.clone()
            }
            None => return,
        };
        let Some(service) = service else { return };

        if !self.waiting.iter().any(|w| w == identity) {
            self.waiting.push(identity.to_string());
        }
        if let Some(record) = self.services.get_mut(&service) {
            if !record.waiting.iter().any(|w| w == identity) {
                record.waiting.push_back(identity.to_string());
            }
        }

        self.dispatch(&service, now);
    }

    /// Pair queued requests with idle workers, oldest first on both sides.
    fn dispatch(&mut self, service: &Bytes, now: Instant) {
        self.purge_workers(now);

        loop {
            let Some(record) = self.services.get_mut(service) else {
                return;
            };
            if record.requests.is_empty() || record.waiting.is_empty() {
                return;
            }
            let (Some(request), Some(identity)) =
                (record.requests.pop_front(), record.waiting.pop_front())
            else {
                return;
            };

            self.waiting.retain(|w| *w != identity);

            match self.workers.get(&identity) {
                Some(worker) => {
                    debug!(worker = %identity, "Dispatching request");
                    let QueuedRequest { client, body } = request;
                    self.outbound.push(
                        BrokerCommand::Request { client, body }.into_routed(worker.address.clone()),
                    );
                }
                None => {
                    // Stale entry; put the request back for the next worker.
                    if let Some(record) = self.services.get_mut(service) {
                        record.requests.push_front(request);
                    }
                }
            }
        }
    }

    /// Forget the worker behind a closed connection, busy or not.
    ///
    /// Identities are per connection, so a worker that comes back registers
    /// as a new one.
    pub fn peer_closed(&mut self, address: &Bytes) {
        let identity = display_identity(address);
        if !self.workers.contains_key(&identity) {
            return;
        }
        info!(worker = %identity, "Worker connection lost");
        self.delete_worker(&identity);
        self.evict_idle_services();
    }

    /// Evict idle workers whose expiry has passed, without notifying them.
    ///
    /// Workers busy with a request are not swept; they are not heartbeated by
    /// the broker either, and rejoin the idle list with a fresh expiry when
    /// they reply. A busy worker that dies is dropped through
    /// [`BrokerState::peer_closed`] instead. Services left with no workers, no
    /// bound worker and no backlog are evicted too.
    pub fn purge_workers(&mut self, now: Instant) {
        let workers = &self.workers;
        self.waiting.sort_by_key(|identity| {
            workers
                .get(identity)
                .map(|w| w.expiry)
                .unwrap_or(now)
        });

        let expired: Vec<String> = self
            .waiting
            .iter()
            .take_while(|identity| {
                self.workers
                    .get(*identity)
                    .map(|w| w.expiry < now)
                    .unwrap_or(true)
            })
            .cloned()
            .collect();

        if expired.is_empty() {
            return;
        }
        for identity in expired {
            info!(worker = %identity, "Expiring worker");
            self.delete_worker(&identity);
        }
        self.evict_idle_services();
    }

    fn evict_idle_services(&mut self) {
        let bound: Vec<Bytes> = self
            .workers
            .values()
            .filter_map(|w| w.service.clone())
            .collect();

        self.services.retain(|name, record| {
            let keep = !record.requests.is_empty()
                || !record.waiting.is_empty()
                || bound.contains(name);
            if !keep {
                debug!(service = %String::from_utf8_lossy(name), "Evicting idle service");
            }
            keep
        });
    }

    /// Heartbeat every idle worker once per interval.
    pub fn send_heartbeats(&mut self, now: Instant) {
        if now < self.heartbeat_at {
            return;
        }
        for identity in &self.waiting {
            if let Some(worker) = self.workers.get(identity) {
                self.outbound
                    .push(BrokerCommand::Heartbeat.into_routed(worker.address.clone()));
            }
        }
        self.heartbeat_at = now + self.settings.heartbeat_interval;
    }

    /// Tell a peer to go away and forget it.
    fn disconnect_peer(&mut self, identity: &str, address: Bytes) {
        info!(worker = %identity, "Disconnecting worker");
        self.outbound
            .push(BrokerCommand::Disconnect.into_routed(address));
        self.delete_worker(identity);
    }

    /// Remove a worker from every registry.
    fn delete_worker(&mut self, identity: &str) {
        let Some(worker) = self.workers.remove(identity) else {
            return;
        };
        if let Some(record) = worker
            .service
            .as_ref()
            .and_then(|service| self.services.get_mut(service))
        {
            record.waiting.retain(|w| w != identity);
        }
        self.waiting.retain(|w| w != identity);
    }

    /// Drain messages queued for the router.
    pub fn take_outbound(&mut self) -> Vec<Multipart> {
        std::mem::take(&mut self.outbound)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Idle worker identities in the global waiting order.
    pub fn waiting_workers(&self) -> &[String] {
        &self.waiting
    }

    pub fn pending_requests(&self, service: &[u8]) -> usize {
        self.services
            .get(service)
            .map(|s| s.requests.len())
            .unwrap_or(0)
    }

    pub fn has_service(&self, service: &[u8]) -> bool {
        self.services.contains_key(service)
    }
}
