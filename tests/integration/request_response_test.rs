use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use rabbit_bus::common::{handler_fn, InMemoryBroker, RequestResponseCoordinator, RpcError};
use rabbit_bus::message::{OperationResponse, ResponseStatus};

use crate::support::{connection, test_config, wait_until};

async fn started(broker: &InMemoryBroker) -> RequestResponseCoordinator {
    let config = test_config();
    let coordinator = RequestResponseCoordinator::new(connection(broker, &config), &config);
    coordinator.start().await;
    coordinator
}

fn success(correlation_id: &str, data: Value) -> OperationResponse {
    OperationResponse {
        correlation_id: correlation_id.to_string(),
        operation_type: "GET_COURSE".to_string(),
        timestamp: chrono::Utc::now(),
        status: ResponseStatus::Success,
        data: Some(data),
        error: None,
    }
}

#[tokio::test]
async fn response_right_after_publish_is_matched() {
    let broker = InMemoryBroker::new();
    let coordinator = started(&broker).await;

    let call = coordinator
        .call("GET_COURSE", json!({"id": 1}), Some("user-1"), None)
        .await
        .unwrap();
    assert!(coordinator.handle_response(success(call.correlation_id(), json!({"title": "Rust"}))));

    assert_eq!(call.await.unwrap(), json!({"title": "Rust"}));
    assert_eq!(coordinator.pending_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn response_delivered_while_publish_in_flight_is_matched() {
    let broker = InMemoryBroker::new();
    let config = test_config();
    let connection = connection(&broker, &config);
    let coordinator = RequestResponseCoordinator::new(connection.clone(), &config);
    coordinator.start().await;

    let matched = Arc::new(AtomicU32::new(0));
    let dropped = Arc::new(AtomicU32::new(0));
    let (responder, hits, misses) = (coordinator.clone(), matched.clone(), dropped.clone());
    // answers straight from the request queue, racing the publish call
    connection
        .consume_queue(
            "rpc_request_queue",
            handler_fn(move |message| {
                let (responder, hits, misses) = (responder.clone(), hits.clone(), misses.clone());
                async move {
                    let id = message.content["correlationId"].as_str().unwrap_or_default();
                    if responder.handle_response(success(id, json!({"answered": true}))) {
                        hits.fetch_add(1, Ordering::SeqCst);
                    } else {
                        misses.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok::<(), anyhow::Error>(())
                }
            }),
        )
        .await;

    for _ in 0..20 {
        let result = tokio::time::timeout(
            Duration::from_secs(1),
            coordinator.send_request("GET_COURSE", json!({}), None, None),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(result, json!({"answered": true}));
    }

    assert_eq!(matched.load(Ordering::SeqCst), 20);
    assert_eq!(dropped.load(Ordering::SeqCst), 0);
    assert_eq!(coordinator.pending_count(), 0);
}

#[tokio::test]
async fn response_arrives_through_response_queue() {
    let broker = InMemoryBroker::new();
    let coordinator = started(&broker).await;

    let call = coordinator
        .call("GET_COURSE", json!({"id": 1}), None, None)
        .await
        .unwrap();
    let routed = broker
        .inject(
            "rpc_responses",
            "operation.response",
            &json!({
                "correlationId": call.correlation_id(),
                "operationType": "GET_COURSE",
                "timestamp": chrono::Utc::now(),
                "status": "success",
                "data": {"id": 1}
            }),
        )
        .unwrap();
    assert_eq!(routed, 1);

    let outcome = tokio::time::timeout(Duration::from_secs(1), call).await.unwrap();
    assert_eq!(outcome.unwrap(), json!({"id": 1}));
}

#[tokio::test]
async fn duplicate_response_settles_once() {
    let broker = InMemoryBroker::new();
    let coordinator = started(&broker).await;

    let call = coordinator
        .call("GET_COURSE", json!({}), None, None)
        .await
        .unwrap();
    let id = call.correlation_id().to_string();

    assert!(coordinator.handle_response(success(&id, json!(1))));
    assert!(!coordinator.handle_response(success(&id, json!(2))));
    assert_eq!(call.await.unwrap(), json!(1));
}

#[tokio::test]
async fn unknown_response_is_dropped() {
    let broker = InMemoryBroker::new();
    let coordinator = started(&broker).await;

    assert!(!coordinator.handle_response(success("nobody-waits-for-this", json!(null))));
    broker
        .inject("rpc_responses", "operation.response", &json!({"garbage": true}))
        .unwrap();
    assert_eq!(coordinator.pending_count(), 0);
}

#[tokio::test]
async fn error_response_rejects_with_remote_message() {
    let broker = InMemoryBroker::new();
    let coordinator = started(&broker).await;

    let call = coordinator
        .call("CREATE_COURSE", json!({}), None, None)
        .await
        .unwrap();
    let mut response = success(call.correlation_id(), json!(null));
    response.status = ResponseStatus::Error;
    response.data = None;
    response.error = Some("title is required".to_string());
    coordinator.handle_response(response);

    match call.await {
        Err(RpcError::Remote(message)) => assert_eq!(message, "title is required"),
        other => panic!("unexpected outcome: {:?}", other),
    }
}

#[tokio::test]
async fn request_envelope_is_published_to_request_exchange() {
    let broker = InMemoryBroker::new();
    let coordinator = started(&broker).await;

    let call = coordinator
        .call("GET_COURSE", json!({"id": 9}), Some("user-7"), Some(Duration::from_secs(5)))
        .await
        .unwrap();

    let published = broker.published_to("rpc_requests");
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].routing_key, "operation.request");
    assert_eq!(published[0].properties.correlation_id.as_deref(), Some(call.correlation_id()));
    let body = published[0].json().unwrap();
    assert_eq!(body["correlationId"], call.correlation_id());
    assert_eq!(body["operationType"], "GET_COURSE");
    assert_eq!(body["data"], json!({"id": 9}));
    assert_eq!(body["userId"], "user-7");
    assert_eq!(body["source"], "integration-tests");
    assert_eq!(body["timeout"], 5000);
    assert!(body.get("idempotencyKey").is_none());
    assert_eq!(broker.queue_depth("rpc_request_queue"), 1);
}

#[tokio::test]
async fn unanswered_request_times_out() {
    let broker = InMemoryBroker::new();
    let coordinator = started(&broker).await;

    let started_at = Instant::now();
    let call = coordinator
        .call("SLOW_OPERATION", json!({}), None, Some(Duration::from_millis(50)))
        .await
        .unwrap();
    let id = call.correlation_id().to_string();

    let err = call.await.unwrap_err();
    assert!(err.is_timeout());
    assert!(err.is_unknown_outcome());
    assert!(started_at.elapsed() >= Duration::from_millis(50));
    assert!(!coordinator.is_pending(&id));
}

#[tokio::test]
async fn cleanup_rejects_every_pending_request() {
    let broker = InMemoryBroker::new();
    let coordinator = started(&broker).await;

    let mut calls = Vec::new();
    for _ in 0..3 {
        calls.push(
            coordinator
                .call("GET_COURSE", json!({}), None, None)
                .await
                .unwrap(),
        );
    }

    assert_eq!(coordinator.cleanup_stale_requests(Duration::ZERO), 3);
    assert_eq!(coordinator.pending_count(), 0);
    for call in calls {
        assert!(matches!(call.await, Err(RpcError::Stale(_))));
    }
    assert_eq!(coordinator.cleanup_stale_requests(Duration::ZERO), 0);
}

#[tokio::test]
async fn failed_publish_rejects_immediately() {
    let broker = InMemoryBroker::new();
    let coordinator = started(&broker).await;
    broker.set_publish_failure(true);

    let err = coordinator
        .send_request("GET_COURSE", json!({}), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::PublishFailed { .. }));
    assert_eq!(coordinator.pending_count(), 0);
}

#[tokio::test]
async fn buffered_publish_rejects_immediately() {
    let broker = InMemoryBroker::new();
    let coordinator = started(&broker).await;
    broker.set_backpressure(true);

    let err = coordinator
        .call("GET_COURSE", json!({}), None, None)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, RpcError::PublishFailed { .. }));
    assert_eq!(coordinator.pending_count(), 0);
}

#[tokio::test]
async fn stats_break_down_pending_by_type() {
    let broker = InMemoryBroker::new();
    let coordinator = started(&broker).await;

    let _a = coordinator.call("GET_COURSE", json!({}), None, None).await.unwrap();
    let _b = coordinator.call("GET_COURSE", json!({}), None, None).await.unwrap();
    let _c = coordinator.call("CREATE_COURSE", json!({}), None, None).await.unwrap();

    let stats = coordinator.pending_request_stats();
    assert_eq!(stats.count, 3);
    assert_eq!(stats.types_breakdown.get("GET_COURSE"), Some(&2));
    assert_eq!(stats.types_breakdown.get("CREATE_COURSE"), Some(&1));

    let serialized = serde_json::to_value(&stats).unwrap();
    assert_eq!(serialized["typesBreakdown"]["GET_COURSE"], 2);
}

#[tokio::test]
async fn shutdown_rejects_pending_requests() {
    let broker = InMemoryBroker::new();
    let coordinator = started(&broker).await;

    let call = coordinator.call("GET_COURSE", json!({}), None, None).await.unwrap();
    assert_eq!(coordinator.shutdown(), 1);

    assert!(matches!(call.await, Err(RpcError::Shutdown)));
    assert!(wait_until(Duration::from_secs(1), || broker.consumer_count("rpc_response_queue") == 0).await);
}
