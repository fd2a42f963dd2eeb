// src/common/worker.rs
// Consumes operation requests and answers each with exactly one response.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use futures::FutureExt;
use moka::sync::Cache;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::amqp_client::MessageProperties;
use super::connection::ConnectionManager;
use super::consumer::{panic_message, ConsumerId, IncomingMessage, MessageHandler};
use super::topology::rpc_topology;
use crate::config::{BrokerConfig, TopologyNames};
use crate::message::{OperationRequest, OperationResponse};

#[async_trait]
pub trait OperationHandler: Send + Sync {
    async fn execute(&self, request: &OperationRequest) -> anyhow::Result<Value>;
}

pub struct FnOperation<F>(F);

#[async_trait]
impl<F, Fut> OperationHandler for FnOperation<F>
where
    F: Fn(OperationRequest) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn execute(&self, request: &OperationRequest) -> anyhow::Result<Value> {
        (self.0)(request.clone()).await
    }
}

pub fn operation_fn<F, Fut>(f: F) -> Arc<dyn OperationHandler>
where
    F: Fn(OperationRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(FnOperation(f))
}

/// Successful results by idempotency key. A capacity of zero disables it.
struct IdempotencyCache {
    entries: Option<Cache<String, Value>>,
}

impl IdempotencyCache {
    fn new(capacity: usize) -> Self {
        let entries = (capacity > 0).then(|| Cache::builder().max_capacity(capacity as u64).build());
        debug!(capacity, "Idempotency cache created");
        IdempotencyCache { entries }
    }

    fn get(&self, key: &str) -> Option<Value> {
        self.entries.as_ref().and_then(|entries| entries.get(key))
    }

    fn insert(&self, key: String, value: Value) {
        if let Some(entries) = &self.entries {
            entries.insert(key, value);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct WorkerInner {
    connection: ConnectionManager,
    names: TopologyNames,
    handlers: Mutex<HashMap<String, Arc<dyn OperationHandler>>>,
    completed: IdempotencyCache,
    consumer: Mutex<Option<ConsumerId>>,
}

#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

/// Holds the worker weakly so the connection's consumer registry does not
/// keep it alive.
struct RequestQueueHandler(Weak<WorkerInner>);

#[async_trait]
impl MessageHandler for RequestQueueHandler {
    async fn handle(&self, message: IncomingMessage) -> anyhow::Result<()> {
        let inner = self
            .0
            .upgrade()
            .ok_or_else(|| anyhow!("worker was dropped"))?;
        Worker { inner }.process(message.content).await
    }
}

impl Worker {
    pub fn new(connection: ConnectionManager, config: &BrokerConfig) -> Self {
        Worker {
            inner: Arc::new(WorkerInner {
                connection,
                names: config.topology.clone(),
                handlers: Mutex::new(HashMap::new()),
                completed: IdempotencyCache::new(config.rpc.idempotency_cache_size),
                consumer: Mutex::new(None),
            }),
        }
    }

    pub fn register(&self, operation_type: &str, handler: Arc<dyn OperationHandler>) {
        let replaced = lock(&self.inner.handlers)
            .insert(operation_type.to_string(), handler)
            .is_some();
        if replaced {
            warn!(operation_type, "Replaced existing operation handler");
        } else {
            debug!(operation_type, "Registered operation handler");
        }
    }

    pub fn operations(&self) -> Vec<String> {
        let mut operations: Vec<String> = lock(&self.inner.handlers).keys().cloned().collect();
        operations.sort();
        operations
    }

    /// Asserts the RPC topology and starts consuming the request queue.
    pub async fn start(&self) -> ConsumerId {
        let existing = *lock(&self.inner.consumer);
        if let Some(id) = existing {
            return id;
        }

        for declaration in rpc_topology(&self.inner.names) {
            let label = declaration.to_string();
            if !self.inner.connection.declare(declaration).await {
                warn!("RPC topology not asserted yet: {}", label);
            }
        }

        let handler = Arc::new(RequestQueueHandler(Arc::downgrade(&self.inner)));
        let id = self
            .inner
            .connection
            .consume_queue(&self.inner.names.request_queue, handler)
            .await;
        *lock(&self.inner.consumer) = Some(id);
        info!(
            queue = %self.inner.names.request_queue,
            operations = ?self.operations(),
            "Worker started"
        );
        id
    }

    pub fn stop(&self) {
        let consumer = lock(&self.inner.consumer).take();
        if let Some(id) = consumer {
            self.inner.connection.cancel_consumer(id);
            info!("Worker stopped");
        }
    }

    /// Handles one request body. An `Err` means no response could be
    /// published, so the delivery is nacked.
    pub async fn process(&self, content: Value) -> anyhow::Result<()> {
        let request: OperationRequest =
            serde_json::from_value(content).context("Malformed operation request")?;
        let response = self.respond(&request).await;
        self.publish_response(&response).await
    }

    /// Always produces a response: handler errors, panics and unknown
    /// operation types become error responses.
    pub async fn respond(&self, request: &OperationRequest) -> OperationResponse {
        let operation_type = request.operation_type.as_str();
        let correlation_id = request.correlation_id.as_str();

        if let Some(key) = &request.idempotency_key {
            let cached = self.inner.completed.get(key);
            if let Some(data) = cached {
                info!(correlation_id, operation_type, idempotency_key = %key, "Replaying completed operation");
                return OperationResponse::success(request, data);
            }
        }

        let handler = lock(&self.inner.handlers).get(operation_type).cloned();
        let Some(handler) = handler else {
            warn!(correlation_id, operation_type, "No handler for operation type");
            return OperationResponse::error(
                request,
                format!("Unknown operation type: {}", operation_type),
            );
        };

        debug!(correlation_id, operation_type, "Executing operation");
        match AssertUnwindSafe(handler.execute(request)).catch_unwind().await {
            Ok(Ok(data)) => {
                if let Some(key) = &request.idempotency_key {
                    self.inner.completed.insert(key.clone(), data.clone());
                }
                OperationResponse::success(request, data)
            }
            Ok(Err(e)) => {
                warn!(correlation_id, operation_type, error = %e, "Operation failed");
                OperationResponse::error(request, e.to_string())
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(correlation_id, operation_type, panic = %message, "Operation handler panicked");
                OperationResponse::error(request, format!("Operation handler panicked: {}", message))
            }
        }
    }

    async fn publish_response(&self, response: &OperationResponse) -> anyhow::Result<()> {
        let body = serde_json::to_vec(response).context("Failed to serialize response")?;
        let properties =
            MessageProperties::json().with_correlation_id(response.correlation_id.clone());

        let accepted = self
            .inner
            .connection
            .publish(
                &self.inner.names.response_exchange,
                &self.inner.names.response_routing_key,
                &body,
                properties,
            )
            .await
            .with_context(|| format!("Failed to publish response {}", response.correlation_id))?;
        if !accepted {
            bail!("Response {} was not accepted by the channel", response.correlation_id);
        }

        debug!(
            correlation_id = %response.correlation_id,
            status = ?response.status,
            "Response published"
        );
        Ok(())
    }
}
