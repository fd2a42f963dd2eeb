// src/common/request_response.rs
// Call/await semantics over the request and response queues. Every pending
// request is settled exactly once: by its response, its timer, the stale
// sweep, or shutdown.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::amqp_client::MessageProperties;
use super::connection::ConnectionManager;
use super::consumer::{handler_fn, ConsumerId};
use super::errors::RpcError;
use super::retry::{with_retry, RetryOptions};
use super::topology::rpc_topology;
use crate::config::{BrokerConfig, TopologyNames};
use crate::message::{OperationRequest, OperationResponse};

type Outcome = Result<Value, RpcError>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct PendingRequest {
    operation_type: String,
    payload: Value,
    created_at: Instant,
    timeout_handle: JoinHandle<()>,
    responder: oneshot::Sender<Outcome>,
}

#[derive(Default)]
struct PendingTable {
    entries: Mutex<HashMap<String, PendingRequest>>,
}

impl PendingTable {
    /// Inserts the entry and arms its timer under one lock, so the timer can
    /// never observe a missing entry.
    fn register(
        self: &Arc<Self>,
        correlation_id: &str,
        operation_type: &str,
        payload: Value,
        timeout: Duration,
    ) -> oneshot::Receiver<Outcome> {
        let (responder, receiver) = oneshot::channel();
        let mut entries = lock(&self.entries);

        let weak: Weak<PendingTable> = Arc::downgrade(self);
        let id = correlation_id.to_string();
        let timeout_handle = tokio::spawn(async move {
            sleep(timeout).await;
            if let Some(table) = weak.upgrade() {
                warn!(correlation_id = %id, timeout_ms = timeout.as_millis() as u64, "Request timed out");
                table.settle(
                    &id,
                    Err(RpcError::Timeout {
                        correlation_id: id.clone(),
                        timeout,
                    }),
                );
            }
        });

        entries.insert(
            correlation_id.to_string(),
            PendingRequest {
                operation_type: operation_type.to_string(),
                payload,
                created_at: Instant::now(),
                timeout_handle,
                responder,
            },
        );
        receiver
    }

    /// The only way an entry leaves the table. Unknown ids are logged and
    /// ignored, which makes late and duplicate signals harmless.
    fn settle(&self, correlation_id: &str, outcome: Outcome) -> bool {
        let entry = lock(&self.entries).remove(correlation_id);
        let Some(entry) = entry else {
            warn!(correlation_id, "No pending request for correlation id, dropping");
            return false;
        };

        entry.timeout_handle.abort();
        if entry.responder.send(outcome).is_err() {
            debug!(
                correlation_id,
                operation_type = %entry.operation_type,
                payload = %entry.payload,
                "Caller stopped waiting before settlement"
            );
        }
        true
    }

    fn resolve(&self, response: OperationResponse) -> bool {
        let correlation_id = response.correlation_id.clone();
        let outcome = if response.is_success() {
            Ok(response.data.unwrap_or(Value::Null))
        } else {
            Err(RpcError::Remote(
                response
                    .error
                    .unwrap_or_else(|| "Unknown error".to_string()),
            ))
        };
        let settled = self.settle(&correlation_id, outcome);
        if settled {
            debug!(
                correlation_id = %correlation_id,
                operation_type = %response.operation_type,
                status = ?response.status,
                "Settled pending request"
            );
        }
        settled
    }

    fn ids_older_than(&self, max_age: Duration) -> Vec<String> {
        lock(&self.entries)
            .iter()
            .filter(|(_, entry)| entry.created_at.elapsed() >= max_age)
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn sweep(&self, max_age: Duration) -> usize {
        let stale = self.ids_older_than(max_age);
        let removed = stale
            .into_iter()
            .filter(|id| self.settle(id, Err(RpcError::Stale(id.clone()))))
            .count();
        if removed > 0 {
            warn!(removed, max_age_ms = max_age.as_millis() as u64, "Cleaned up stale requests");
        }
        removed
    }
}

/// A published request waiting for its response.
pub struct PendingCall {
    correlation_id: String,
    receiver: oneshot::Receiver<Outcome>,
}

impl PendingCall {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}

impl Future for PendingCall {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(RpcError::ResponseChannelClosed)))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRequestStats {
    pub count: usize,
    pub types_breakdown: HashMap<String, usize>,
}

struct CoordinatorInner {
    connection: ConnectionManager,
    names: TopologyNames,
    source: String,
    default_timeout: Duration,
    cleanup_interval: Duration,
    stale_after: Duration,
    pending: Arc<PendingTable>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    response_consumer: Mutex<Option<ConsumerId>>,
}

#[derive(Clone)]
pub struct RequestResponseCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl RequestResponseCoordinator {
    pub fn new(connection: ConnectionManager, config: &BrokerConfig) -> Self {
        RequestResponseCoordinator {
            inner: Arc::new(CoordinatorInner {
                connection,
                names: config.topology.clone(),
                source: config.source.clone(),
                default_timeout: config.rpc.request_timeout(),
                cleanup_interval: config.rpc.cleanup_interval(),
                stale_after: config.rpc.stale_after(),
                pending: Arc::new(PendingTable::default()),
                sweeper: Mutex::new(None),
                response_consumer: Mutex::new(None),
            }),
        }
    }

    /// Asserts the RPC topology, subscribes to the response queue and starts
    /// the periodic stale sweep. Calling it again is a no-op.
    pub async fn start(&self) {
        let already_started = lock(&self.inner.response_consumer).is_some();
        if already_started {
            return;
        }

        for declaration in rpc_topology(&self.inner.names) {
            let label = declaration.to_string();
            if !self.inner.connection.declare(declaration).await {
                warn!("RPC topology not asserted yet: {}", label);
            }
        }

        let table = self.inner.pending.clone();
        let handler = handler_fn(move |message| {
            let table = table.clone();
            async move {
                match serde_json::from_value::<OperationResponse>(message.content) {
                    Ok(response) => {
                        table.resolve(response);
                    }
                    Err(e) => warn!(error = %e, "Discarding malformed response"),
                }
                Ok::<(), anyhow::Error>(())
            }
        });
        let consumer = self
            .inner
            .connection
            .consume_queue(&self.inner.names.response_queue, handler)
            .await;
        *lock(&self.inner.response_consumer) = Some(consumer);

        self.spawn_sweeper();
        info!(
            queue = %self.inner.names.response_queue,
            "Request/response coordinator started"
        );
    }

    fn spawn_sweeper(&self) {
        let table = self.inner.pending.clone();
        let every = self.inner.cleanup_interval;
        let max_age = self.inner.stale_after;
        let handle = tokio::spawn(async move {
            let mut ticker = interval(every.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                table.sweep(max_age);
            }
        });
        let previous = lock(&self.inner.sweeper).replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Publishes a request and returns a future for its response.
    ///
    /// The pending entry exists before the publish starts. A failed publish
    /// settles it at once and is returned here instead of through the future.
    pub async fn call(
        &self,
        operation_type: &str,
        data: Value,
        requester: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<PendingCall, RpcError> {
        self.call_with_key(operation_type, data, requester, timeout, None)
            .await
    }

    async fn call_with_key(
        &self,
        operation_type: &str,
        data: Value,
        requester: Option<&str>,
        timeout: Option<Duration>,
        idempotency_key: Option<String>,
    ) -> Result<PendingCall, RpcError> {
        let timeout = timeout.unwrap_or(self.inner.default_timeout);
        let correlation_id = Uuid::new_v4().to_string();
        let request = OperationRequest {
            correlation_id: correlation_id.clone(),
            operation_type: operation_type.to_string(),
            timestamp: chrono::Utc::now(),
            data,
            user_id: requester.map(str::to_string),
            source: self.inner.source.clone(),
            timeout: Some(timeout.as_millis() as u64),
            idempotency_key,
        };
        let body = serde_json::to_vec(&request)?;

        let receiver = self.inner.pending.register(
            &correlation_id,
            operation_type,
            request.data.clone(),
            timeout,
        );

        let properties = MessageProperties::json()
            .with_correlation_id(correlation_id.clone())
            .with_message_id(correlation_id.clone());
        let published = self
            .inner
            .connection
            .publish(
                &self.inner.names.request_exchange,
                &self.inner.names.request_routing_key,
                &body,
                properties,
            )
            .await;

        let failure = match published {
            Ok(true) => None,
            Ok(false) => Some("channel buffered the request".to_string()),
            Err(e) => Some(e.to_string()),
        };
        if let Some(reason) = failure {
            error!(correlation_id = %correlation_id, operation_type, reason = %reason, "Failed to publish request");
            let err = RpcError::PublishFailed {
                operation_type: operation_type.to_string(),
                reason,
            };
            self.inner.pending.settle(&correlation_id, Err(err.clone()));
            return Err(err);
        }

        debug!(correlation_id = %correlation_id, operation_type, "Request published");
        Ok(PendingCall {
            correlation_id,
            receiver,
        })
    }

    /// Publishes a request and waits for its response, timeout, or sweep.
    pub async fn send_request(
        &self,
        operation_type: &str,
        data: Value,
        requester: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<Value, RpcError> {
        self.call(operation_type, data, requester, timeout)
            .await?
            .await
    }

    /// Retries the whole call. Every attempt gets a fresh correlation id but
    /// shares one idempotency key, so a worker that already executed the
    /// operation replays its result instead of running it again.
    pub async fn send_request_with_retry(
        &self,
        operation_type: &str,
        data: Value,
        requester: Option<&str>,
        options: &RetryOptions,
    ) -> Result<Value, RpcError> {
        let idempotency_key = Uuid::new_v4().to_string();
        with_retry(
            || {
                let data = data.clone();
                let key = idempotency_key.clone();
                async move {
                    self.call_with_key(operation_type, data, requester, None, Some(key))
                        .await?
                        .await
                }
            },
            options,
        )
        .await
    }

    /// Settles the matching pending request. Returns `false` for unknown,
    /// late or duplicate responses.
    pub fn handle_response(&self, response: OperationResponse) -> bool {
        self.inner.pending.resolve(response)
    }

    /// Rejects and removes every request pending for at least `max_age`.
    pub fn cleanup_stale_requests(&self, max_age: Duration) -> usize {
        self.inner.pending.sweep(max_age)
    }

    pub fn pending_request_stats(&self) -> PendingRequestStats {
        let entries = lock(&self.inner.pending.entries);
        let mut types_breakdown = HashMap::new();
        for entry in entries.values() {
            *types_breakdown
                .entry(entry.operation_type.clone())
                .or_insert(0) += 1;
        }
        PendingRequestStats {
            count: entries.len(),
            types_breakdown,
        }
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.inner.pending.entries).len()
    }

    pub fn is_pending(&self, correlation_id: &str) -> bool {
        lock(&self.inner.pending.entries).contains_key(correlation_id)
    }

    /// Stops the sweep and response consumer, then rejects everything still
    /// pending with [`RpcError::Shutdown`]. Returns the number rejected.
    pub fn shutdown(&self) -> usize {
        let sweeper = lock(&self.inner.sweeper).take();
        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }
        let consumer = lock(&self.inner.response_consumer).take();
        if let Some(consumer) = consumer {
            self.inner.connection.cancel_consumer(consumer);
        }

        let ids: Vec<String> = lock(&self.inner.pending.entries).keys().cloned().collect();
        let rejected = ids
            .iter()
            .filter(|id| self.inner.pending.settle(id, Err(RpcError::Shutdown)))
            .count();
        info!(rejected, "Request/response coordinator stopped");
        rejected
    }
}
