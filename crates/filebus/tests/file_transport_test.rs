//! File-system transport integration tests
//!
//! These tests drive the public API end to end against a temporary
//! directory: one-way producers, consuming transports, transactions and
//! several consumers competing for the same queue.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use filebus::prelude::*;
use filebus::store::RecordName;
use tempfile::TempDir;
use tokio_test::assert_err;
use tokio_util::sync::CancellationToken;

fn queue_config() -> FileQueueConfig {
    FileQueueConfig::default()
        .with_scan_backoff(Duration::ZERO)
        .with_deferred_scan_backoff(Duration::ZERO)
}

fn consumer(base: &TempDir, queue: &str) -> FileSystemTransport {
    FileSystemTransport::new(base.path(), Some(queue), queue_config()).unwrap()
}

fn message(id: &str) -> TransportMessage {
    TransportMessage::new(BTreeMap::new(), id.as_bytes().to_vec())
        .with_header(headers::MESSAGE_ID, id)
        .with_header(headers::MESSAGE_TYPE, "test.Ping")
}

fn record_names(base: &TempDir, queue: &str) -> Vec<RecordName> {
    let mut names: Vec<RecordName> = std::fs::read_dir(base.path().join(queue))
        .unwrap()
        .filter_map(|entry| {
            let entry = entry.unwrap();
            RecordName::parse(entry.file_name().to_str()?)
        })
        .collect();
    names.sort_by_key(|n| n.to_string());
    names
}

/// Receive one message and commit it
async fn receive_committed(transport: &FileSystemTransport) -> Option<TransportMessage> {
    let context = TransactionContext::new();
    let message = transport
        .receive(&context, &CancellationToken::new())
        .await
        .unwrap();
    context.complete().await.unwrap();
    message
}

// ============================================================================
// Ordering
// ============================================================================

#[tokio::test]
async fn test_single_producer_messages_arrive_in_send_order() {
    let base = TempDir::new().unwrap();
    let producer = FileSystemTransport::one_way(base.path()).unwrap();
    let orders = consumer(&base, "orders");

    for i in 0..25 {
        producer
            .send("orders", message(&format!("m-{i:02}")), None)
            .await
            .unwrap();
    }
    assert_eq!(orders.queue_depth("orders").await.unwrap(), 25);

    for i in 0..25 {
        let received = receive_committed(&orders).await.unwrap();
        assert_eq!(received.message_id(), Some(format!("m-{i:02}").as_str()));
    }
    assert!(receive_committed(&orders).await.is_none());
    assert_eq!(orders.queue_depth("orders").await.unwrap(), 0);
}

#[tokio::test]
async fn test_headers_and_body_survive_the_trip() {
    let base = TempDir::new().unwrap();
    let producer = FileSystemTransport::one_way(base.path()).unwrap();
    let inbox = consumer(&base, "inbox");

    let body = vec![0u8, 159, 146, 150, 255];
    let sent = TransportMessage::new(BTreeMap::new(), body.clone())
        .with_header(headers::MESSAGE_ID, "binary-1")
        .with_header("x-tenant", "acme");
    producer.send("inbox", sent, None).await.unwrap();

    let received = receive_committed(&inbox).await.unwrap();
    assert_eq!(received.body, body);
    assert_eq!(received.header("x-tenant"), Some("acme"));
    assert_eq!(received.label(), "binary-1");
}

// ============================================================================
// Transactions
// ============================================================================

#[tokio::test]
async fn test_handler_sends_are_published_with_the_commit() {
    let base = TempDir::new().unwrap();
    let producer = FileSystemTransport::one_way(base.path()).unwrap();
    let orders = consumer(&base, "orders");
    orders.create_queue("invoices").unwrap();

    producer.send("orders", message("order-1"), None).await.unwrap();

    let context = TransactionContext::new();
    let received = orders
        .receive(&context, &CancellationToken::new())
        .await
        .unwrap()
        .unwrap();
    orders
        .send("invoices", message(&format!("invoice-for-{}", received.label())), Some(&context))
        .await
        .unwrap();

    // nothing is visible before the commit
    assert_eq!(orders.queue_depth("invoices").await.unwrap(), 0);

    context.complete().await.unwrap();
    assert_eq!(orders.queue_depth("invoices").await.unwrap(), 1);
    assert!(record_names(&base, "orders").is_empty());
}

#[tokio::test]
async fn test_aborted_receive_keeps_record_in_error_and_drops_sends() {
    let base = TempDir::new().unwrap();
    let producer = FileSystemTransport::one_way(base.path()).unwrap();
    let orders = consumer(&base, "orders");

    producer.send("orders", message("order-2"), None).await.unwrap();

    let context = TransactionContext::new();
    orders
        .receive(&context, &CancellationToken::new())
        .await
        .unwrap()
        .unwrap();
    orders
        .send("invoices", message("never"), Some(&context))
        .await
        .unwrap();
    context.abort().await.unwrap();

    let names = record_names(&base, "orders");
    assert_eq!(names.len(), 1);
    assert_eq!(names[0].visibility, Visibility::Error);
    assert_eq!(orders.queue_depth("invoices").await.unwrap(), 0);

    // error records are never handed out again
    assert!(receive_committed(&orders).await.is_none());
}

#[tokio::test]
async fn test_failed_forward_keeps_received_record() {
    let base = TempDir::new().unwrap();
    let producer = FileSystemTransport::one_way(base.path()).unwrap();
    let orders = consumer(&base, "orders");
    orders.create_queue("out").unwrap();

    producer.send("orders", message("order-3"), None).await.unwrap();

    let context = TransactionContext::new();
    orders
        .receive(&context, &CancellationToken::new())
        .await
        .unwrap()
        .unwrap();
    orders
        .send("out", message("forwarded"), Some(&context))
        .await
        .unwrap();

    // the destination disappears before the commit publishes into it
    std::fs::remove_dir_all(base.path().join("out")).unwrap();

    let err = assert_err!(context.complete().await);
    assert!(matches!(err, TransportError::Store(_)));
    assert_eq!(context.outcome(), Some(TransactionOutcome::Aborted));

    let names = record_names(&base, "orders");
    assert_eq!(names.len(), 1);
    assert_eq!(names[0].visibility, Visibility::Error);
    assert!(!base.path().join("out").exists());
}

// ============================================================================
// Deferred delivery and expiry
// ============================================================================

#[tokio::test]
async fn test_deferred_message_is_delivered_once_due() {
    let base = TempDir::new().unwrap();
    let producer = FileSystemTransport::one_way(base.path()).unwrap();
    let reminders = consumer(&base, "reminders");

    let due = Utc::now() + chrono::Duration::milliseconds(300);
    producer
        .send("reminders", message("later").with_deferred_until(due), None)
        .await
        .unwrap();
    producer.send("reminders", message("now"), None).await.unwrap();

    let first = receive_committed(&reminders).await.unwrap();
    assert_eq!(first.message_id(), Some("now"));
    assert!(receive_committed(&reminders).await.is_none());

    tokio::time::sleep(Duration::from_millis(400)).await;
    let second = receive_committed(&reminders).await.unwrap();
    assert_eq!(second.message_id(), Some("later"));
}

#[tokio::test]
async fn test_deferred_time_in_the_past_sends_ready_record() {
    let base = TempDir::new().unwrap();
    let producer = FileSystemTransport::one_way(base.path()).unwrap();

    let due = Utc::now() - chrono::Duration::seconds(5);
    producer
        .send("reminders", message("overdue").with_deferred_until(due), None)
        .await
        .unwrap();

    let names = record_names(&base, "reminders");
    assert_eq!(names.len(), 1);
    assert_eq!(names[0].visibility, Visibility::Ready);
}

#[tokio::test]
async fn test_expired_message_is_skipped_for_the_next_one() {
    let base = TempDir::new().unwrap();
    let producer = FileSystemTransport::one_way(base.path()).unwrap();
    let alerts = consumer(&base, "alerts");

    producer
        .send(
            "alerts",
            message("stale").with_time_to_be_received(Duration::from_millis(50)),
            None,
        )
        .await
        .unwrap();
    producer
        .send(
            "alerts",
            message("fresh").with_time_to_be_received(Duration::from_secs(60)),
            None,
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;

    let received = receive_committed(&alerts).await.unwrap();
    assert_eq!(received.message_id(), Some("fresh"));
    assert!(record_names(&base, "alerts").is_empty());
}

// ============================================================================
// Competing consumers
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_competing_consumers_receive_each_message_once() {
    let base = TempDir::new().unwrap();
    let producer = FileSystemTransport::one_way(base.path()).unwrap();
    let total = 60;

    for i in 0..total {
        producer
            .send("work", message(&format!("job-{i}")), None)
            .await
            .unwrap();
    }

    let received = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for _ in 0..3 {
        let transport = consumer(&base, "work");
        let received = Arc::clone(&received);
        handles.push(tokio::spawn(async move {
            let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
            while received.lock().len() < total && tokio::time::Instant::now() < deadline {
                match receive_committed(&transport).await {
                    Some(message) => received
                        .lock()
                        .push(message.message_id().unwrap_or_default().to_string()),
                    None => tokio::task::yield_now().await,
                }
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let received = received.lock();
    let unique: HashSet<&String> = received.iter().collect();
    assert_eq!(received.len(), total);
    assert_eq!(unique.len(), total);
    assert!(record_names(&base, "work").is_empty());
}

#[tokio::test]
async fn test_invalid_destination_is_rejected() {
    let base = TempDir::new().unwrap();
    let producer = FileSystemTransport::one_way(base.path()).unwrap();

    let err = assert_err!(producer.send("bad/queue", message("x"), None).await);
    assert!(matches!(
        err,
        TransportError::Store(StoreError::Configuration(_))
    ));
}
