//! Connection registry tests
//!
//! Covers presence side effects of register/unregister, self-healing on failed
//! writes and concurrent mutation from many connection tasks.

mod common;

use common::InMemoryPresence;
use realtime_delivery_service::websocket::{
    ConnectionHandle, ConnectionRegistry, Frame, WriteFailure,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use uuid::Uuid;

fn registry() -> (ConnectionRegistry, Arc<InMemoryPresence>) {
    let presence = InMemoryPresence::new();
    (ConnectionRegistry::new(presence.clone()), presence)
}

#[tokio::test]
async fn test_first_registration_marks_online_last_unregister_marks_offline() {
    let (registry, presence) = registry();
    let user = Uuid::new_v4();

    let (first, _rx1) = ConnectionHandle::channel(user, 8);
    let (second, _rx2) = ConnectionHandle::channel(user, 8);
    let (first_id, second_id) = (first.id(), second.id());

    registry.register(first).await;
    registry.register(second).await;
    assert!(presence.is_online(user));
    assert_eq!(presence.set_online_calls.load(Ordering::SeqCst), 1);
    assert_eq!(registry.connection_count(user), 2);

    assert!(registry.unregister(user, first_id).await);
    assert!(presence.is_online(user), "one connection is still open");
    assert_eq!(presence.set_offline_calls.load(Ordering::SeqCst), 0);

    assert!(registry.unregister(user, second_id).await);
    assert!(!presence.is_online(user));
    assert!(!registry.is_online(user));
    assert_eq!(registry.total_connections(), 0);
}

#[tokio::test]
async fn test_unregister_is_idempotent() {
    let (registry, presence) = registry();
    let user = Uuid::new_v4();
    let (handle, _rx) = ConnectionHandle::channel(user, 8);
    let id = handle.id();

    registry.register(handle).await;
    assert!(registry.unregister(user, id).await);
    assert!(!registry.unregister(user, id).await);
    assert!(!registry.unregister(Uuid::new_v4(), id).await);
    assert_eq!(presence.set_offline_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_presence_failure_does_not_block_registration() {
    let (registry, presence) = registry();
    presence.fail(true);
    let user = Uuid::new_v4();
    let (handle, mut rx) = ConnectionHandle::channel(user, 8);

    registry.register(handle).await;
    assert!(registry.is_online(user));

    let failures = registry.push(user, &Frame::new("hello")).await;
    assert!(failures.is_empty());
    assert_eq!(rx.recv().await.unwrap().as_str(), "hello");
}

#[tokio::test]
async fn test_push_reaches_every_connection_of_user() {
    let (registry, _) = registry();
    let user = Uuid::new_v4();
    let (a, mut rx_a) = ConnectionHandle::channel(user, 8);
    let (b, mut rx_b) = ConnectionHandle::channel(user, 8);
    registry.register(a).await;
    registry.register(b).await;

    assert!(registry.push(user, &Frame::new("x")).await.is_empty());
    assert_eq!(rx_a.recv().await.unwrap().as_str(), "x");
    assert_eq!(rx_b.recv().await.unwrap().as_str(), "x");

    // Nobody home
    assert!(registry.push(Uuid::new_v4(), &Frame::new("x")).await.is_empty());
}

#[tokio::test]
async fn test_failed_write_removes_connection_in_same_push() {
    let (registry, presence) = registry();
    let user = Uuid::new_v4();
    let (dead, dead_rx) = ConnectionHandle::channel(user, 8);
    let (alive, mut alive_rx) = ConnectionHandle::channel(user, 8);
    let dead_id = dead.id();
    registry.register(dead).await;
    registry.register(alive).await;
    drop(dead_rx);

    let failures = registry.push(user, &Frame::new("first")).await;
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].connection_id, dead_id);
    assert_eq!(failures[0].reason, WriteFailure::Closed);
    assert_eq!(registry.connection_count(user), 1);
    assert_eq!(alive_rx.recv().await.unwrap().as_str(), "first");

    // The dead connection is not attempted again
    assert!(registry.push(user, &Frame::new("second")).await.is_empty());
    assert_eq!(alive_rx.recv().await.unwrap().as_str(), "second");
    assert!(presence.is_online(user));
}

#[tokio::test]
async fn test_slow_consumer_is_disconnected() {
    let (registry, presence) = registry();
    let user = Uuid::new_v4();
    let (handle, mut rx) = ConnectionHandle::channel(user, 1);
    registry.register(handle).await;

    assert!(registry.push(user, &Frame::new("one")).await.is_empty());
    let failures = registry.push(user, &Frame::new("two")).await;
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].reason, WriteFailure::BufferFull);

    assert!(!registry.is_online(user));
    assert!(!presence.is_online(user));

    // Buffered frame is still delivered, then the channel ends and the session stops
    assert_eq!(rx.recv().await.unwrap().as_str(), "one");
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn test_broadcast_counts_skipped_members() {
    let (registry, _) = registry();
    let (a, b, offline) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    let (ha, _rxa) = ConnectionHandle::channel(a, 8);
    let (hb, _rxb) = ConnectionHandle::channel(b, 8);
    registry.register(ha).await;
    registry.register(hb).await;

    let report = registry
        .broadcast_to_members(&[a, b, offline], &Frame::new("m"))
        .await;
    assert_eq!(report.delivered, 2);
    assert_eq!(report.skipped, 1);
    assert!(report.failed.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_register_unregister_leaves_no_entries() {
    let (registry, presence) = registry();
    let users: Vec<Uuid> = (0..8).map(|_| Uuid::new_v4()).collect();

    let mut tasks = Vec::new();
    for i in 0..64 {
        let registry = registry.clone();
        let user = users[i % users.len()];
        tasks.push(tokio::spawn(async move {
            let (handle, _rx) = ConnectionHandle::channel(user, 128);
            let id = handle.id();
            registry.register(handle).await;
            tokio::task::yield_now().await;
            registry.push(user, &Frame::new("ping")).await;
            assert!(registry.unregister(user, id).await);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(registry.total_connections(), 0);
    assert!(registry.online_users().is_empty());
    for user in users {
        assert!(!presence.is_online(user), "user {user} left online");
    }
}
