use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use rabbit_bus::common::{
    handler_fn, ConnectionState, ExchangeKind, InMemoryBroker, MessageHandler,
};

use crate::support::{connection, test_config, wait_until};

#[tokio::test]
async fn falls_back_to_next_reachable_host() {
    let broker = InMemoryBroker::new();
    broker.set_host_reachable("primary", false);
    broker.set_host_reachable("rabbitmq", false);
    let mut config = test_config();
    config.connection.host = Some("primary".to_string());
    config.connection.fallback_hosts = vec!["rabbitmq".to_string(), "localhost".to_string()];
    let manager = connection(&broker, &config);

    assert!(manager.connect().await.is_some());
    assert_eq!(broker.connect_attempts(), vec!["primary", "rabbitmq", "localhost"]);
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(manager.reconnect_attempts(), 0);
}

#[tokio::test]
async fn concurrent_connects_share_one_session() {
    let broker = InMemoryBroker::new();
    let manager = connection(&broker, &test_config());

    let (first, second) = tokio::join!(manager.connect(), manager.connect());

    assert!(first.is_some() || second.is_some());
    assert_eq!(broker.open_sessions(), 1);
}

#[tokio::test]
async fn gives_up_after_max_reconnect_attempts() {
    let broker = InMemoryBroker::new();
    broker.set_host_reachable("localhost", false);
    let mut config = test_config();
    config.reconnect.max_attempts = 2;
    let manager = connection(&broker, &config);

    assert!(manager.connect().await.is_none());
    assert!(wait_until(Duration::from_secs(2), || manager.state() == ConnectionState::Failed).await);
    // initial attempt plus two scheduled reconnects
    assert_eq!(broker.connect_attempts().len(), 3);
}

#[tokio::test]
async fn recovers_once_broker_becomes_reachable() {
    let broker = InMemoryBroker::new();
    broker.fail_next_connects(2);
    let manager = connection(&broker, &test_config());

    assert!(manager.connect().await.is_none());
    assert!(wait_until(Duration::from_secs(2), || manager.is_connected()).await);
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(manager.reconnect_attempts(), 0);
}

#[tokio::test]
async fn repeated_topology_assertions_are_idempotent() {
    let broker = InMemoryBroker::new();
    let manager = connection(&broker, &test_config());

    assert!(manager.assert_exchange("events", ExchangeKind::Topic).await);
    assert!(manager.assert_queue("audit").await);
    assert!(manager.bind_queue("audit", "events", "#").await);
    let bindings = broker.binding_count();

    assert!(manager.assert_exchange("events", ExchangeKind::Topic).await);
    assert!(manager.assert_queue("audit").await);
    assert!(manager.bind_queue("audit", "events", "#").await);

    assert_eq!(broker.binding_count(), bindings);
    assert_eq!(manager.topology().len(), 3);
}

#[tokio::test]
async fn conflicting_declaration_reports_failure() {
    let broker = InMemoryBroker::new();
    let manager = connection(&broker, &test_config());

    assert!(manager.assert_exchange("events", ExchangeKind::Topic).await);
    assert!(!manager.assert_exchange("events", ExchangeKind::Direct).await);
    assert_eq!(broker.exchange_kind("events"), Some(ExchangeKind::Topic));
}

#[tokio::test]
async fn topology_declared_offline_is_applied_on_connect() {
    let broker = InMemoryBroker::new();
    broker.set_host_reachable("localhost", false);
    let manager = connection(&broker, &test_config());

    assert!(!manager.assert_queue("late_queue").await);
    assert!(!broker.queue_exists("late_queue"));

    broker.set_host_reachable("localhost", true);
    assert!(wait_until(Duration::from_secs(2), || broker.queue_exists("late_queue")).await);
}

#[tokio::test]
async fn consumer_survives_reconnect() {
    let broker = InMemoryBroker::new();
    let manager = connection(&broker, &test_config());
    assert!(manager.assert_queue("jobs").await);

    let (tx, mut rx) = mpsc::unbounded_channel();
    manager
        .consume_queue(
            "jobs",
            handler_fn(move |message| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(message.content);
                    Ok::<(), anyhow::Error>(())
                }
            }),
        )
        .await;

    broker.inject("", "jobs", &json!({"n": 1})).unwrap();
    assert_eq!(rx.recv().await, Some(json!({"n": 1})));

    broker.disconnect_all("network partition");
    assert!(wait_until(Duration::from_secs(2), || {
        manager.is_connected() && broker.consumer_count("jobs") == 1
    })
    .await);

    broker.inject("", "jobs", &json!({"n": 2})).unwrap();
    let delivered = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap();
    assert_eq!(delivered, Some(json!({"n": 2})));
}

fn forward_to(tx: mpsc::UnboundedSender<Value>) -> Arc<dyn MessageHandler> {
    handler_fn(move |message| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(message.content);
            Ok::<(), anyhow::Error>(())
        }
    })
}

#[tokio::test]
async fn consumer_resubscribes_when_reconnect_precedes_failure_notice() {
    let broker = InMemoryBroker::new();
    let manager = connection(&broker, &test_config());
    assert!(manager.assert_queue("jobs").await);

    let (tx, mut rx) = mpsc::unbounded_channel();
    manager.consume_queue("jobs", forward_to(tx)).await;
    broker.inject("", "jobs", &json!({"n": 1})).unwrap();
    assert_eq!(rx.recv().await, Some(json!({"n": 1})));

    // a publisher notices the dead channel before the failure watcher runs
    broker.disconnect_all("network partition");
    assert!(manager.connect().await.is_some());

    assert!(wait_until(Duration::from_secs(1), || broker.consumer_count("jobs") == 1).await);
    broker.inject("", "jobs", &json!({"n": 2})).unwrap();
    let delivered = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap();
    assert_eq!(delivered, Some(json!({"n": 2})));
}

#[tokio::test]
async fn consumer_cancelled_by_broker_is_resubscribed() {
    let broker = InMemoryBroker::new();
    let manager = connection(&broker, &test_config());
    assert!(manager.assert_queue("jobs").await);

    let (tx, mut rx) = mpsc::unbounded_channel();
    manager.consume_queue("jobs", forward_to(tx)).await;
    assert_eq!(broker.consumer_count("jobs"), 1);

    broker.cancel_consumers("jobs");
    assert_eq!(broker.consumer_count("jobs"), 0);
    assert!(wait_until(Duration::from_secs(1), || broker.consumer_count("jobs") == 1).await);

    broker.inject("", "jobs", &json!({"n": 1})).unwrap();
    let delivered = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap();
    assert_eq!(delivered, Some(json!({"n": 1})));
    // same session throughout
    assert_eq!(broker.connect_attempts().len(), 1);
    assert_eq!(broker.open_sessions(), 1);
}

#[tokio::test]
async fn channel_error_closes_superseded_connection() {
    let broker = InMemoryBroker::new();
    let manager = connection(&broker, &test_config());
    assert!(manager.connect().await.is_some());

    broker.raise_channel_error("PRECONDITION_FAILED - inequivalent arg 'type'");

    assert!(wait_until(Duration::from_secs(2), || {
        broker.connect_attempts().len() == 2 && manager.is_connected()
    })
    .await);
    assert!(wait_until(Duration::from_secs(1), || broker.open_sessions() == 1).await);
}

#[tokio::test]
async fn failed_message_is_requeued_once_then_dropped() {
    let broker = InMemoryBroker::new();
    let manager = connection(&broker, &test_config());
    assert!(manager.assert_queue("fragile").await);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = seen.clone();
    manager
        .consume_queue(
            "fragile",
            handler_fn(move |message| {
                let recorder = recorder.clone();
                async move {
                    recorder.lock().unwrap().push(message.redelivered);
                    Err::<(), _>(anyhow::anyhow!("cannot process"))
                }
            }),
        )
        .await;

    broker.inject("", "fragile", &json!({"n": 1})).unwrap();

    assert!(wait_until(Duration::from_secs(1), || broker.dead_lettered().len() == 1).await);
    assert_eq!(*seen.lock().unwrap(), vec![false, true]);
    assert_eq!(broker.queue_depth("fragile"), 0);
    assert_eq!(broker.unacked_count(), 0);
}

#[tokio::test]
async fn cancelled_consumer_is_not_replayed() {
    let broker = InMemoryBroker::new();
    let manager = connection(&broker, &test_config());
    assert!(manager.assert_queue("jobs").await);

    let id = manager
        .consume_queue("jobs", handler_fn(|_message| async move { Ok::<(), anyhow::Error>(()) }))
        .await;
    assert!(manager.cancel_consumer(id));
    assert!(!manager.cancel_consumer(id));

    broker.disconnect_all("restart");
    assert!(wait_until(Duration::from_secs(2), || manager.is_connected()).await);
    assert_eq!(broker.consumer_count("jobs"), 0);
}

#[tokio::test]
async fn close_is_idempotent() {
    let broker = InMemoryBroker::new();
    let manager = connection(&broker, &test_config());
    assert!(manager.connect().await.is_some());

    manager.close().await;
    manager.close().await;

    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(broker.open_sessions(), 0);
    assert!(!manager.is_connected());
}
