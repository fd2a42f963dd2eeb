use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::amqp_client::MessageProperties;
use super::connection::ConnectionManager;
use super::errors::BrokerError;
use super::topology::standard_topology;
use crate::config::{BrokerConfig, TopologyNames};
use crate::message::OutboundEvent;

/// A typed domain event; the event type doubles as the routing key.
pub trait DomainEvent: Serialize {
    fn event_type(&self) -> &str;
}

/// Fire-and-forget event distribution. Nothing is tracked after the
/// channel accepts a message, and a `false` return means "possibly
/// undelivered", never an error to escalate.
#[derive(Clone)]
pub struct EventPublisher {
    connection: ConnectionManager,
    names: TopologyNames,
    source: String,
}

impl EventPublisher {
    pub fn new(connection: ConnectionManager, config: &BrokerConfig) -> Self {
        EventPublisher {
            connection,
            names: config.topology.clone(),
            source: config.source.clone(),
        }
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    /// Asserts the event exchanges, the standard queues and their bindings.
    pub async fn initialize(&self) -> Result<(), BrokerError> {
        let mut failed = Vec::new();
        for declaration in standard_topology(&self.names) {
            let label = declaration.to_string();
            if !self.connection.declare(declaration).await {
                failed.push(label);
            }
        }

        if failed.is_empty() {
            info!(
                exchange = %self.names.events_exchange,
                "Event publisher topology initialized"
            );
            Ok(())
        } else {
            Err(BrokerError::TopologyError(format!(
                "failed to assert: {}",
                failed.join(", ")
            )))
        }
    }

    /// Wraps `payload` in an event envelope and publishes it to the events
    /// exchange with `event_type` as the routing key.
    pub async fn publish(&self, event_type: &str, payload: Value) -> bool {
        let event = OutboundEvent::new(event_type, &self.source, payload);
        let body = match serde_json::to_vec(&event) {
            Ok(body) => body,
            Err(e) => {
                error!(event_type, error = %e, "Failed to serialize event");
                return false;
            }
        };
        let properties = MessageProperties::json()
            .with_message_id(event.id.to_string())
            .with_correlation_id(event.correlation_id.to_string());

        let exchange = &self.names.events_exchange;
        match self
            .connection
            .publish(exchange, event_type, &body, properties)
            .await
        {
            Ok(true) => {
                debug!(event_type, event_id = %event.id, "Published event");
                true
            }
            Ok(false) => {
                warn!(event_type, event_id = %event.id, "Event buffered by channel (backpressure)");
                false
            }
            Err(e) => {
                error!(event_type, error = %e, "Failed to publish event");
                false
            }
        }
    }

    pub async fn emit<E: DomainEvent>(&self, event: &E) -> bool {
        match serde_json::to_value(event) {
            Ok(payload) => self.publish(event.event_type(), payload).await,
            Err(e) => {
                error!(event_type = event.event_type(), error = %e, "Failed to serialize event");
                false
            }
        }
    }

    /// Sends `payload` straight to `queue` through the default exchange,
    /// bypassing topic routing.
    pub async fn send_notification(&self, queue: &str, payload: Value) -> bool {
        self.send_direct("", queue, payload).await
    }

    /// Routes `payload` to the email queue through the notifications exchange.
    pub async fn send_email(&self, payload: Value) -> bool {
        let exchange = self.names.notifications_exchange.clone();
        let routing_key = self.names.email_routing_key.clone();
        self.send_direct(&exchange, &routing_key, payload).await
    }

    async fn send_direct(&self, exchange: &str, routing_key: &str, payload: Value) -> bool {
        let body = match serde_json::to_vec(&payload) {
            Ok(body) => body,
            Err(e) => {
                error!(routing_key, error = %e, "Failed to serialize notification");
                return false;
            }
        };

        match self
            .connection
            .publish(exchange, routing_key, &body, MessageProperties::json())
            .await
        {
            Ok(true) => {
                debug!(exchange, routing_key, "Sent notification");
                true
            }
            Ok(false) => {
                warn!(exchange, routing_key, "Notification buffered by channel (backpressure)");
                false
            }
            Err(e) => {
                error!(exchange, routing_key, error = %e, "Failed to send notification");
                false
            }
        }
    }
}
