//! End-to-end dispatch loop tests against an in-memory store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleetflow_dispatch::{
    DispatchError, FlowDispatchOptions, FlowDispatcher, FlowProcessingHandler,
    MessageDispatchOptions, MessageDispatcher, MessageHandler,
};
use fleetflow_store::{
    ClientId, FlowId, FlowProcessingRequest, FlowStore, MessageHandlerRequest,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn fpr(flow: &str) -> FlowProcessingRequest {
    FlowProcessingRequest::new(ClientId::from("C.1"), FlowId::from(flow))
}

fn fast_options() -> FlowDispatchOptions {
    FlowDispatchOptions {
        poll_interval: Duration::from_millis(50),
        ..Default::default()
    }
}

struct CountingHandler {
    calls: AtomicUsize,
    fail: bool,
}

impl CountingHandler {
    fn new(fail: bool) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail,
        })
    }
}

#[async_trait]
impl FlowProcessingHandler for CountingHandler {
    async fn handle(&self, _request: FlowProcessingRequest) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("simulated processing failure");
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_flow_loop_processes_and_acks() {
    init_tracing();
    let store = FlowStore::open_memory().await.unwrap();
    store
        .write_flow_processing_requests(&[fpr("F.1"), fpr("F.2"), fpr("F.3")])
        .await
        .unwrap();

    let handler = CountingHandler::new(false);
    let handle = FlowDispatcher::spawn(store.clone(), handler.clone(), fast_options());

    tokio::time::sleep(Duration::from_millis(400)).await;
    handle.shutdown().await.unwrap();

    assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    assert!(store
        .read_flow_processing_requests()
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_flow_loop_leaves_failed_requests_leased() {
    init_tracing();
    let store = FlowStore::open_memory().await.unwrap();
    store
        .write_flow_processing_requests(&[fpr("F.1")])
        .await
        .unwrap();

    let handler = CountingHandler::new(true);
    let handle = FlowDispatcher::spawn(store.clone(), handler.clone(), fast_options());

    tokio::time::sleep(Duration::from_millis(400)).await;
    handle.shutdown().await.unwrap();

    // The request failed once and stays leased until the window
    // expires; repeated polls must not re-run it early.
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    let remaining = store.read_flow_processing_requests().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert!(remaining[0].leased_until.is_some());
}

struct ConcurrencyProbe {
    running: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl FlowProcessingHandler for ConcurrencyProbe {
    async fn handle(&self, _request: FlowProcessingRequest) -> anyhow::Result<()> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_flow_loop_bounds_concurrency() {
    init_tracing();
    let store = FlowStore::open_memory().await.unwrap();
    store
        .write_flow_processing_requests(&[fpr("F.1"), fpr("F.2"), fpr("F.3"), fpr("F.4")])
        .await
        .unwrap();

    let handler = Arc::new(ConcurrencyProbe {
        running: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });
    let handle = FlowDispatcher::spawn(
        store.clone(),
        handler.clone(),
        FlowDispatchOptions {
            worker_count: 2,
            poll_interval: Duration::from_millis(20),
            ..Default::default()
        },
    );

    tokio::time::sleep(Duration::from_millis(600)).await;
    handle.shutdown().await.unwrap();

    assert!(handler.peak.load(Ordering::SeqCst) <= 2);
    assert!(store
        .read_flow_processing_requests()
        .await
        .unwrap()
        .is_empty());
}

struct StuckHandler;

#[async_trait]
impl FlowProcessingHandler for StuckHandler {
    async fn handle(&self, _request: FlowProcessingRequest) -> anyhow::Result<()> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }
}

#[tokio::test]
async fn test_flow_loop_shutdown_timeout() {
    init_tracing();
    let store = FlowStore::open_memory().await.unwrap();
    store
        .write_flow_processing_requests(&[fpr("F.1")])
        .await
        .unwrap();

    let handle = FlowDispatcher::spawn(
        store,
        Arc::new(StuckHandler),
        FlowDispatchOptions {
            poll_interval: Duration::from_millis(20),
            shutdown_timeout: Duration::from_millis(200),
            ..Default::default()
        },
    );

    // Let the loop lease the request and get stuck in the handler.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let err = handle.shutdown().await.unwrap_err();
    assert!(matches!(err, DispatchError::ShutdownTimeout(_)));
}

struct StuckMessageHandler;

#[async_trait]
impl MessageHandler for StuckMessageHandler {
    async fn handle(&self, _requests: Vec<MessageHandlerRequest>) -> anyhow::Result<()> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }
}

#[tokio::test]
async fn test_message_loop_shutdown_timeout() {
    init_tracing();
    let store = FlowStore::open_memory().await.unwrap();
    store
        .write_message_handler_requests(&[MessageHandlerRequest::new("Foreman", 1, b"m1".to_vec())])
        .await
        .unwrap();

    let handle = MessageDispatcher::new(
        store.clone(),
        MessageDispatchOptions {
            poll_interval: Duration::from_millis(20),
            shutdown_timeout: Duration::from_millis(200),
            ..Default::default()
        },
    )
    .register("Foreman", Arc::new(StuckMessageHandler))
    .spawn();

    // Let the loop lease the batch and get stuck in the handler; the
    // shutdown must escalate instead of waiting forever.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let err = handle.shutdown().await.unwrap_err();
    assert!(matches!(err, DispatchError::ShutdownTimeout(_)));

    // The abandoned batch stays leased for expiry-driven retry.
    let remaining = store.read_message_handler_requests().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert!(remaining[0].leased_until.is_some());
}

struct RecordingMessageHandler {
    payloads: std::sync::Mutex<Vec<Vec<u8>>>,
}

#[async_trait]
impl MessageHandler for RecordingMessageHandler {
    async fn handle(&self, requests: Vec<MessageHandlerRequest>) -> anyhow::Result<()> {
        let mut payloads = self.payloads.lock().unwrap();
        payloads.extend(requests.into_iter().map(|r| r.payload));
        Ok(())
    }
}

#[tokio::test]
async fn test_message_loop_routes_and_deletes() {
    init_tracing();
    let store = FlowStore::open_memory().await.unwrap();
    store
        .write_message_handler_requests(&[
            MessageHandlerRequest::new("Foreman", 1, b"m1".to_vec()),
            MessageHandlerRequest::new("Foreman", 2, b"m2".to_vec()),
            MessageHandlerRequest::new("Unregistered", 3, b"m3".to_vec()),
        ])
        .await
        .unwrap();

    let handler = Arc::new(RecordingMessageHandler {
        payloads: std::sync::Mutex::new(Vec::new()),
    });
    let handle = MessageDispatcher::new(
        store.clone(),
        MessageDispatchOptions {
            poll_interval: Duration::from_millis(50),
            ..Default::default()
        },
    )
    .register("Foreman", handler.clone())
    .spawn();

    tokio::time::sleep(Duration::from_millis(400)).await;
    handle.shutdown().await.unwrap();

    let mut seen = handler.payloads.lock().unwrap().clone();
    seen.sort();
    assert_eq!(seen, vec![b"m1".to_vec(), b"m2".to_vec()]);

    // The request without a registered handler stays queued (leased).
    let remaining = store.read_message_handler_requests().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].request_id, 3);
}
