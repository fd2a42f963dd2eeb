// src/common/amqp_client.rs

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::channel_manager::{configure_channel, ChannelConfig};
use super::errors::{BrokerError, Result};
use super::topology::ExchangeKind;

/// Properties carried next to a message body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    pub correlation_id: Option<String>,
    pub message_id: Option<String>,
    pub content_type: Option<String>,
    pub timestamp: Option<u64>,
    pub persistent: bool,
}

impl MessageProperties {
    pub fn json() -> Self {
        Self {
            content_type: Some("application/json".to_string()),
            timestamp: Some(chrono::Utc::now().timestamp() as u64),
            persistent: true,
            ..Self::default()
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    /// Set by the broker when the message was requeued at least once
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub data: Vec<u8>,
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// A live channel plus a receiver that yields once the connection or
/// channel fails.
pub struct BrokerSession {
    pub channel: Arc<dyn BrokerChannel>,
    pub failures: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn open(&self, uri: &str) -> Result<BrokerSession>;
}

/// Trait for the channel operations the messaging core needs
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()>;

    async fn declare_queue(&self, name: &str) -> Result<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// `Ok(false)` when the broker buffered or refused the message without
    /// a transport error.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: MessageProperties,
    ) -> Result<bool>;

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()>;

    async fn close(&self) -> Result<()>;

    fn is_open(&self) -> bool;
}

/// Opens lapin connections and configures one channel per connection.
pub struct LapinConnector {
    channel_config: ChannelConfig,
    connect_timeout: Duration,
    heartbeat_seconds: u16,
}

impl LapinConnector {
    pub fn new(channel_config: ChannelConfig, connect_timeout: Duration) -> Self {
        Self {
            channel_config,
            connect_timeout,
            heartbeat_seconds: 0,
        }
    }

    pub fn with_heartbeat(mut self, heartbeat_seconds: u16) -> Self {
        self.heartbeat_seconds = heartbeat_seconds;
        self
    }

    fn uri_with_options(&self, uri: &str) -> String {
        if self.heartbeat_seconds == 0 || uri.contains('?') {
            return uri.to_string();
        }
        format!("{}?heartbeat={}", uri, self.heartbeat_seconds)
    }
}

#[async_trait]
impl BrokerConnector for LapinConnector {
    async fn open(&self, uri: &str) -> Result<BrokerSession> {
        let properties =
            ConnectionProperties::default().with_connection_name("rabbit_bus".into());
        let connection = tokio::time::timeout(
            self.connect_timeout,
            Connection::connect(&self.uri_with_options(uri), properties),
        )
        .await
        .map_err(|_| {
            BrokerError::ConnectionError(format!(
                "Connection attempt timed out after {:?}",
                self.connect_timeout
            ))
        })?
        .map_err(|e| BrokerError::ConnectionError(format!("Failed to connect: {}", e)))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::ChannelError(format!("Failed to create channel: {}", e)))?;
        configure_channel(&channel, &self.channel_config).await?;

        let (failure_tx, failures) = mpsc::unbounded_channel();
        let connection_tx = failure_tx.clone();
        connection.on_error(move |err| {
            let _ = connection_tx.send(format!("connection error: {}", err));
        });
        channel.on_error(move |err| {
            let _ = failure_tx.send(format!("channel error: {}", err));
        });

        info!(channel_id = %self.channel_config.id, "Opened RabbitMQ connection and channel");
        Ok(BrokerSession {
            channel: Arc::new(LapinChannel {
                connection,
                channel,
                consumer_prefix: self.channel_config.id.clone(),
            }),
            failures,
        })
    }
}

pub struct LapinChannel {
    connection: Connection,
    channel: Channel,
    consumer_prefix: String,
}

impl From<MessageProperties> for BasicProperties {
    fn from(properties: MessageProperties) -> Self {
        let mut basic = BasicProperties::default()
            .with_delivery_mode(if properties.persistent { 2 } else { 1 });
        if let Some(content_type) = properties.content_type {
            basic = basic.with_content_type(content_type.into());
        }
        if let Some(correlation_id) = properties.correlation_id {
            basic = basic.with_correlation_id(correlation_id.into());
        }
        if let Some(message_id) = properties.message_id {
            basic = basic.with_message_id(message_id.into());
        }
        if let Some(timestamp) = properties.timestamp {
            basic = basic.with_timestamp(timestamp);
        }
        basic
    }
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(delivery: lapin::message::Delivery) -> Self {
        let props = &delivery.properties;
        let properties = MessageProperties {
            correlation_id: props.correlation_id().as_ref().map(|s| s.as_str().to_string()),
            message_id: props.message_id().as_ref().map(|s| s.as_str().to_string()),
            content_type: props.content_type().as_ref().map(|s| s.as_str().to_string()),
            timestamp: *props.timestamp(),
            persistent: props.delivery_mode().map_or(false, |mode| mode == 2),
        };
        Delivery {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.as_str().to_string(),
            routing_key: delivery.routing_key.as_str().to_string(),
            redelivered: delivery.redelivered,
            properties,
            data: delivery.data,
        }
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        self.channel
            .exchange_declare(
                name,
                kind.into(),
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::TopologyError(format!("exchange '{}': {}", name, e)))
    }

    async fn declare_queue(&self, name: &str) -> Result<()> {
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::TopologyError(format!("queue '{}': {}", name, e)))?;
        debug!(queue = name, messages = queue.message_count(), "Queue declared");
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                BrokerError::TopologyError(format!(
                    "binding '{}' -> '{}' [{}]: {}",
                    exchange, queue, routing_key, e
                ))
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: MessageProperties,
    ) -> Result<bool> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties.into(),
            )
            .await
            .map_err(|e| BrokerError::PublishError(e.to_string()))?;

        match confirm
            .await
            .map_err(|e| BrokerError::PublishError(e.to_string()))?
        {
            Confirmation::Nack(_) => {
                warn!(exchange, routing_key, "Broker nacked published message");
                Ok(false)
            }
            _ => Ok(true),
        }
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let tag = format!("{}-{}", self.consumer_prefix, consumer_tag);
        let consumer = self
            .channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::ConsumeError(format!("queue '{}': {}", queue, e)))?;

        Ok(consumer
            .map(|delivery| delivery.map(Delivery::from).map_err(BrokerError::from))
            .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::AckError(e.to_string()))
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    requeue,
                    ..BasicNackOptions::default()
                },
            )
            .await
            .map_err(|e| BrokerError::AckError(e.to_string()))
    }

    async fn close(&self) -> Result<()> {
        if self.channel.status().connected() {
            self.channel
                .close(200, "Closing channel")
                .await
                .map_err(|e| BrokerError::ChannelError(e.to_string()))?;
        }
        if self.connection.status().connected() {
            self.connection
                .close(200, "Closing connection")
                .await
                .map_err(|e| BrokerError::ConnectionError(e.to_string()))?;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }
}
