//! Leasing tests for the FPR queue and the message handler inbox.

use std::time::Duration;

use chrono::Utc;
use fleetflow_store::{ClientId, FlowId, FlowProcessingRequest, FlowStore, MessageHandlerRequest};

fn fpr(flow: &str) -> FlowProcessingRequest {
    FlowProcessingRequest::new(ClientId::from("C.1"), FlowId::from(flow))
}

#[tokio::test]
async fn test_open_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let store = FlowStore::open(dir.path().join("flows.db")).await.unwrap();
    store
        .write_flow_processing_requests(&[fpr("F.1")])
        .await
        .unwrap();
    assert_eq!(store.read_flow_processing_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_lease_fprs_claims_each_once() {
    let store = FlowStore::open_memory().await.unwrap();
    store
        .write_flow_processing_requests(&[fpr("F.1"), fpr("F.2"), fpr("F.3")])
        .await
        .unwrap();

    let leased = store.lease_flow_processing_requests(10).await.unwrap();
    assert_eq!(leased.len(), 3);
    for r in &leased {
        assert!(r.leased_until.is_some());
        assert!(r.leased_by.is_some());
        assert!(r.creation_time.is_some());
    }

    // Everything is claimed; a second worker gets nothing.
    let again = store.lease_flow_processing_requests(10).await.unwrap();
    assert!(again.is_empty());
}

#[tokio::test]
async fn test_lease_fprs_respects_limit() {
    let store = FlowStore::open_memory().await.unwrap();
    store
        .write_flow_processing_requests(&[fpr("F.1"), fpr("F.2"), fpr("F.3")])
        .await
        .unwrap();

    let first = store.lease_flow_processing_requests(2).await.unwrap();
    assert_eq!(first.len(), 2);
    let second = store.lease_flow_processing_requests(2).await.unwrap();
    assert_eq!(second.len(), 1);
}

#[tokio::test]
async fn test_expired_fpr_lease_is_retried() {
    let store = FlowStore::open_memory().await.unwrap();
    store
        .write_flow_processing_requests(&[fpr("F.1")])
        .await
        .unwrap();

    let leased = store.lease_flow_processing_requests(10).await.unwrap();
    assert_eq!(leased.len(), 1);

    // Simulate the ten-minute window elapsing without an ack.
    sqlx::query("UPDATE flow_processing_requests SET leased_until = leased_until - 601000000")
        .execute(store.pool())
        .await
        .unwrap();

    let retried = store.lease_flow_processing_requests(10).await.unwrap();
    assert_eq!(retried.len(), 1);
    assert_eq!(retried[0].flow_id, leased[0].flow_id);
}

#[tokio::test]
async fn test_fpr_delivery_time_defers_lease() {
    let store = FlowStore::open_memory().await.unwrap();
    let mut due = fpr("F.due");
    due.delivery_time = Some(Utc::now() - chrono::Duration::minutes(1));
    let mut deferred = fpr("F.later");
    deferred.delivery_time = Some(Utc::now() + chrono::Duration::hours(1));
    store
        .write_flow_processing_requests(&[due, deferred])
        .await
        .unwrap();

    let leased = store.lease_flow_processing_requests(10).await.unwrap();
    assert_eq!(leased.len(), 1);
    assert_eq!(leased[0].flow_id, FlowId::from("F.due"));
}

#[tokio::test]
async fn test_ack_fprs_is_idempotent() {
    let store = FlowStore::open_memory().await.unwrap();
    store
        .write_flow_processing_requests(&[fpr("F.1"), fpr("F.2")])
        .await
        .unwrap();

    let leased = store.lease_flow_processing_requests(10).await.unwrap();
    store.ack_flow_processing_requests(&leased).await.unwrap();
    assert!(store
        .read_flow_processing_requests()
        .await
        .unwrap()
        .is_empty());

    // Second ack of the same requests is a no-op, as is acking a
    // request that was never persisted.
    store.ack_flow_processing_requests(&leased).await.unwrap();
    store
        .ack_flow_processing_requests(&[fpr("F.unwritten")])
        .await
        .unwrap();
}

#[tokio::test]
async fn test_delete_all_fprs() {
    let store = FlowStore::open_memory().await.unwrap();
    store
        .write_flow_processing_requests(&[fpr("F.1"), fpr("F.2")])
        .await
        .unwrap();
    store.delete_all_flow_processing_requests().await.unwrap();
    assert!(store
        .read_flow_processing_requests()
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_message_inbox_lease_and_expiry() {
    let store = FlowStore::open_memory().await.unwrap();
    store
        .write_message_handler_requests(&[
            MessageHandlerRequest::new("Foreman", 1, b"m1".to_vec()),
            MessageHandlerRequest::new("Foreman", 2, b"m2".to_vec()),
        ])
        .await
        .unwrap();

    let leased = store
        .lease_message_handler_requests(Duration::from_millis(100), 10)
        .await
        .unwrap();
    assert_eq!(leased.len(), 2);

    let empty = store
        .lease_message_handler_requests(Duration::from_millis(100), 10)
        .await
        .unwrap();
    assert!(empty.is_empty());

    // The lease expires; unacked requests come back.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let retried = store
        .lease_message_handler_requests(Duration::from_secs(60), 10)
        .await
        .unwrap();
    assert_eq!(retried.len(), 2);
}

#[tokio::test]
async fn test_message_inbox_duplicate_ids_ignored() {
    let store = FlowStore::open_memory().await.unwrap();
    store
        .write_message_handler_requests(&[
            MessageHandlerRequest::new("Foreman", 1, b"first".to_vec()),
            MessageHandlerRequest::new("Foreman", 1, b"second".to_vec()),
        ])
        .await
        .unwrap();

    let all = store.read_message_handler_requests().await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].payload, b"first");
}

#[tokio::test]
async fn test_message_inbox_delete() {
    let store = FlowStore::open_memory().await.unwrap();
    let requests = vec![
        MessageHandlerRequest::new("Foreman", 1, b"m1".to_vec()),
        MessageHandlerRequest::new("Stats", 2, b"m2".to_vec()),
    ];
    store.write_message_handler_requests(&requests).await.unwrap();

    store
        .delete_message_handler_requests(&requests[..1])
        .await
        .unwrap();

    let all = store.read_message_handler_requests().await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].request_id, 2);

    // Deleting already-deleted requests is a no-op.
    store
        .delete_message_handler_requests(&requests)
        .await
        .unwrap();
    assert!(store
        .read_message_handler_requests()
        .await
        .unwrap()
        .is_empty());
}
