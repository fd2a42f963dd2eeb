use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::amqp_client::{BrokerChannel, Delivery, DeliveryStream};

/// Opaque handle for a registered consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerId(pub(crate) u64);

impl ConsumerId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

/// A delivery after JSON parsing. Bodies that are not valid JSON arrive
/// as `Value::String` holding the raw text.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub queue: String,
    pub routing_key: String,
    pub correlation_id: Option<String>,
    pub redelivered: bool,
    pub content: Value,
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: IncomingMessage) -> anyhow::Result<()>;
}

pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(IncomingMessage) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, message: IncomingMessage) -> anyhow::Result<()> {
        (self.0)(message).await
    }
}

/// Wraps an async closure as a [`MessageHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(IncomingMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Durable subscription record, replayed after every reconnect.
#[derive(Clone)]
pub struct ConsumerRegistration {
    pub id: ConsumerId,
    pub queue: String,
    pub handler: Arc<dyn MessageHandler>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// nack with requeue, first failure only
    Requeue,
    /// nack without requeue
    Reject,
}

impl Disposition {
    /// A failed message is requeued once; a failed redelivery is dropped.
    pub fn for_failure(redelivered: bool) -> Self {
        if redelivered {
            Disposition::Reject
        } else {
            Disposition::Requeue
        }
    }
}

pub fn parse_content(data: &[u8]) -> Value {
    match serde_json::from_slice(data) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "Message body is not valid JSON, passing raw text");
            Value::String(String::from_utf8_lossy(data).into_owned())
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Parse, run the handler, then ack or nack the delivery.
pub async fn process_delivery(
    channel: &dyn BrokerChannel,
    queue: &str,
    handler: &dyn MessageHandler,
    delivery: Delivery,
) -> Disposition {
    let delivery_tag = delivery.delivery_tag;
    let redelivered = delivery.redelivered;
    let message = IncomingMessage {
        queue: queue.to_string(),
        routing_key: delivery.routing_key,
        correlation_id: delivery.properties.correlation_id,
        redelivered,
        content: parse_content(&delivery.data),
    };

    let outcome = AssertUnwindSafe(handler.handle(message)).catch_unwind().await;
    let disposition = match outcome {
        Ok(Ok(())) => Disposition::Ack,
        Ok(Err(e)) => {
            warn!(queue, delivery_tag, redelivered, error = %e, "Message handler failed");
            Disposition::for_failure(redelivered)
        }
        Err(panic) => {
            error!(
                queue,
                delivery_tag,
                redelivered,
                panic = %panic_message(panic.as_ref()),
                "Message handler panicked"
            );
            Disposition::for_failure(redelivered)
        }
    };

    let settled = match disposition {
        Disposition::Ack => channel.ack(delivery_tag).await,
        Disposition::Requeue => channel.nack(delivery_tag, true).await,
        Disposition::Reject => channel.nack(delivery_tag, false).await,
    };
    if let Err(e) = settled {
        error!(queue, delivery_tag, error = %e, "Failed to settle delivery");
    } else {
        debug!(queue, delivery_tag, ?disposition, "Delivery settled");
    }
    disposition
}

/// Handles deliveries one at a time, in broker order, until the stream ends.
pub(crate) async fn run_consumer(
    channel: Arc<dyn BrokerChannel>,
    registration: ConsumerRegistration,
    mut deliveries: DeliveryStream,
) {
    info!(queue = %registration.queue, consumer = registration.id.0, "Consumer started");

    while let Some(next) = deliveries.next().await {
        match next {
            Ok(delivery) => {
                process_delivery(
                    channel.as_ref(),
                    &registration.queue,
                    registration.handler.as_ref(),
                    delivery,
                )
                .await;
            }
            Err(e) => {
                error!(queue = %registration.queue, error = %e, "Error receiving message");
                if !channel.is_open() {
                    break;
                }
            }
        }
    }

    warn!(queue = %registration.queue, consumer = registration.id.0, "Consumer stream ended");
}
