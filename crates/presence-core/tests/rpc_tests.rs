//! End-to-end tests: real broker, worker agents and clients over loopback TCP.

use async_trait::async_trait;
use presence_core::usage::MemoryUsage;
use presence_core::{
    Broker, BrokerHandle, BrokerStats, Client, ControlClient, Dispatch, RemoteFault, RpcConfig,
    RpcError, ServiceDescriptor, StaticUsage, UsageSnapshot, WorkerAgent,
};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

/// Test service. `block` waits on the gate before answering.
#[derive(Clone)]
struct Store {
    gate: Arc<Semaphore>,
}

impl Store {
    fn open() -> Self {
        Self {
            gate: Arc::new(Semaphore::new(1)),
        }
    }

    fn closed() -> Self {
        Self {
            gate: Arc::new(Semaphore::new(0)),
        }
    }
}

#[async_trait]
impl Dispatch for Store {
    fn descriptor(&self) -> ServiceDescriptor {
        store_descriptor()
    }

    async fn dispatch(
        &self,
        method: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Value, RemoteFault> {
        match method {
            "echo" => Ok(json!({ "args": args, "kwargs": kwargs })),
            "test" => Err(RemoteFault::new("NameError", "blah")),
            "block" => {
                let _permit = self
                    .gate
                    .acquire()
                    .await
                    .map_err(|e| RemoteFault::new("GateClosed", e.to_string()))?;
                Ok(json!(true))
            }
            "size" => Ok(json!(0)),
            other => Err(RemoteFault::unknown_method("Store", other)),
        }
    }
}

fn store_descriptor() -> ServiceDescriptor {
    ServiceDescriptor::new("Store", ["echo", "test", "block", "size"])
}

fn test_config() -> RpcConfig {
    RpcConfig {
        broker: "127.0.0.1".to_string(),
        port: 0,
        client_retries: 3,
        client_timeout_ms: 2_000,
        heartbeat_count: 3,
        heartbeat_interval_ms: 100,
        heartbeat_liveness: 3,
        reconnect_interval_ms: 100,
        worker_timeout_ms: 250,
        ..RpcConfig::default()
    }
}

/// Start a broker on an ephemeral port and point `config` at it.
async fn start_broker(config: &mut RpcConfig) -> BrokerHandle {
    let broker = Broker::bind_with_usage(
        config,
        "127.0.0.1:0".parse().unwrap(),
        Box::new(StaticUsage::default()),
    )
    .await
    .unwrap();
    config.port = broker.local_addr().port();
    broker.spawn()
}

fn worker_usage(resident: u64) -> Box<StaticUsage> {
    Box::new(StaticUsage(UsageSnapshot {
        memory: MemoryUsage {
            resident,
            virtual_size: resident * 2,
        },
        ..UsageSnapshot::default()
    }))
}

/// Poll broker stats until `ready` holds.
async fn wait_for_stats(config: &RpcConfig, ready: impl Fn(&BrokerStats) -> bool) -> BrokerStats {
    let mut control = ControlClient::new(config.clone()).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let stats = control.stats().await.unwrap();
        if ready(&stats) {
            return stats;
        }
        assert!(Instant::now() < deadline, "stats never settled: {:?}", stats);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_call_round_trip_preserves_args_and_kwargs() {
    let mut config = test_config();
    let _broker = start_broker(&mut config).await;
    let _worker = WorkerAgent::new(config.clone(), Store::open()).spawn();

    let mut client = Client::new(config, store_descriptor()).unwrap();
    let mut kwargs = Map::new();
    kwargs.insert("x".to_string(), json!(2));

    let value = client
        .call("echo", vec![json!(1), json!("a")], kwargs)
        .await
        .unwrap();

    assert_eq!(value, json!({ "args": [1, "a"], "kwargs": { "x": 2 } }));
    assert_eq!(client.reconnects(), 0);
}

#[tokio::test]
async fn test_zero_argument_member() {
    let mut config = test_config();
    let _broker = start_broker(&mut config).await;
    let _worker = WorkerAgent::new(config.clone(), Store::open()).spawn();

    let mut client = Client::new(config, store_descriptor()).unwrap();
    assert_eq!(client.call0("size").await.unwrap(), json!(0));
}

#[tokio::test]
async fn test_remote_fault_reraised_with_kind_and_message() {
    let mut config = test_config();
    let _broker = start_broker(&mut config).await;
    let _worker = WorkerAgent::new(config.clone(), Store::open()).spawn();

    let mut client = Client::new(config, store_descriptor()).unwrap();
    match client.call0("test").await {
        Err(RpcError::Remote(fault)) => {
            assert_eq!(fault.kind, "NameError");
            assert_eq!(fault.message, "blah");
        }
        other => panic!("Expected remote fault, got: {:?}", other),
    }

    // The worker survives its own faults.
    assert_eq!(client.call0("size").await.unwrap(), json!(0));
}

#[tokio::test]
async fn test_call_without_workers_times_out_after_two_reconnects() {
    let mut config = test_config();
    let _broker = start_broker(&mut config).await;
    config.client_retries = 3;
    config.client_timeout_ms = 100;

    let mut client = Client::new(config, store_descriptor()).unwrap();
    let started = Instant::now();
    let result = client.call0("size").await;
    let elapsed = started.elapsed();

    assert!(
        matches!(result, Err(RpcError::Timeout { attempts: 3, .. })),
        "got: {:?}",
        result
    );
    assert!(elapsed >= Duration::from_millis(300), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(2), "elapsed {:?}", elapsed);
    assert_eq!(client.reconnects(), 2);
}

#[tokio::test]
async fn test_requests_queue_until_a_worker_registers() {
    let mut config = test_config();
    let _broker = start_broker(&mut config).await;

    let client_config = config.clone();
    let call = tokio::spawn(async move {
        let mut client = Client::new(client_config, store_descriptor()).unwrap();
        client.call0("size").await
    });

    wait_for_stats(&config, |s| s.services.get("Store") == Some(&1)).await;
    let _worker = WorkerAgent::new(config.clone(), Store::open()).spawn();

    assert_eq!(call.await.unwrap().unwrap(), json!(0));
}

#[tokio::test]
async fn test_stats_reports_busy_workers_and_pending_requests() {
    let mut config = test_config();
    let _broker = start_broker(&mut config).await;

    let store = Store::closed();
    let _w1 = WorkerAgent::new(config.clone(), store.clone())
        .with_usage(worker_usage(11))
        .spawn();
    let _w2 = WorkerAgent::new(config.clone(), store.clone())
        .with_usage(worker_usage(11))
        .spawn();
    wait_for_stats(&config, |s| s.workers.len() == 2).await;

    // Long single attempts so no call is ever re-enqueued.
    let mut calls = Vec::new();
    for _ in 0..5 {
        let client_config = RpcConfig {
            client_retries: 1,
            client_timeout_ms: 10_000,
            ..config.clone()
        };
        calls.push(tokio::spawn(async move {
            let mut client = Client::new(client_config, store_descriptor()).unwrap();
            client.call0("block").await
        }));
    }

    let stats = wait_for_stats(&config, |s| s.services.get("Store") == Some(&3)).await;
    assert_eq!(stats.workers.len(), 2);
    assert!(stats.waiting_workers.is_empty());

    store.gate.add_permits(1);
    for call in calls {
        assert_eq!(call.await.unwrap().unwrap(), json!(true));
    }

    let stats = wait_for_stats(&config, |s| s.waiting_workers.len() == 2).await;
    assert_eq!(stats.services.get("Store"), Some(&0));
}

#[tokio::test]
async fn test_worker_stats_proxied_to_worker() {
    let mut config = test_config();
    let _broker = start_broker(&mut config).await;
    let _worker = WorkerAgent::new(config.clone(), Store::open())
        .with_usage(worker_usage(4096))
        .spawn();

    let stats = wait_for_stats(&config, |s| s.workers.len() == 1).await;
    let mut control = ControlClient::new(config).unwrap();

    let usage = control.worker_stats(&stats.workers[0]).await.unwrap();
    assert_eq!(usage.map(|u| u.memory.resident), Some(4096));

    let unknown = control.worker_stats("00000000").await.unwrap();
    assert!(unknown.is_none());
}

#[tokio::test]
async fn test_graceful_worker_shutdown_unregisters() {
    let mut config = test_config();
    let _broker = start_broker(&mut config).await;
    let worker = WorkerAgent::new(config.clone(), Store::open()).spawn();
    wait_for_stats(&config, |s| s.workers.len() == 1).await;

    worker.join().await.unwrap();

    wait_for_stats(&config, |s| s.workers.is_empty()).await;
}

#[tokio::test]
async fn test_vanished_worker_expires() {
    let mut config = test_config();
    let _broker = start_broker(&mut config).await;
    let worker = WorkerAgent::new(config.clone(), Store::open()).spawn();
    wait_for_stats(&config, |s| s.workers.len() == 1).await;

    // Dropping aborts the agent without waiting for a goodbye.
    drop(worker);

    let stats = wait_for_stats(&config, |s| s.workers.is_empty()).await;
    assert!(stats.waiting_workers.is_empty());
}

#[tokio::test]
async fn test_worker_lost_mid_call_is_unregistered() {
    let mut config = test_config();
    let _broker = start_broker(&mut config).await;
    let worker = WorkerAgent::new(config.clone(), Store::closed()).spawn();
    wait_for_stats(&config, |s| s.workers.len() == 1).await;

    let client_config = RpcConfig {
        client_retries: 1,
        client_timeout_ms: 10_000,
        ..config.clone()
    };
    let call = tokio::spawn(async move {
        let mut client = Client::new(client_config, store_descriptor()).unwrap();
        client.call0("block").await
    });
    wait_for_stats(&config, |s| s.workers.len() == 1 && s.waiting_workers.is_empty()).await;

    drop(worker);

    let stats = wait_for_stats(&config, |s| s.workers.is_empty()).await;
    assert!(stats.waiting_workers.is_empty());
    call.abort();
}

#[tokio::test]
async fn test_suffixed_worker_serves_suffixed_service() {
    let mut config = test_config();
    let _broker = start_broker(&mut config).await;
    let _worker = WorkerAgent::new(config.clone(), Store::open())
        .with_service_suffix("-eu")
        .spawn();

    let mut client = Client::new(config, store_descriptor().with_suffix("-eu")).unwrap();
    assert_eq!(client.call0("size").await.unwrap(), json!(0));
}
