// src/common/errors.rs

use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    #[error("Message serialization error: {0}")]
    SerializationError(#[from] SerdeError),

    #[error("RabbitMQ publish error: {0}")]
    PublishError(String),

    #[error("RabbitMQ consume error: {0}")]
    ConsumeError(String),

    #[error("RabbitMQ acknowledge error: {0}")]
    AckError(String),

    #[error("Topology error: {0}")]
    TopologyError(String),

    #[error("No broker connection available")]
    NotConnected,
}

pub type Result<T> = std::result::Result<T, BrokerError>;

// lapin does not expose a stable error kind, so classify on the message
impl From<LapinError> for BrokerError {
    fn from(error: LapinError) -> Self {
        let error_text = error.to_string();
        let lowered = error_text.to_lowercase();

        if lowered.contains("connection") || lowered.contains("io error") {
            BrokerError::ConnectionError(error_text)
        } else if lowered.contains("channel") {
            BrokerError::ChannelError(error_text)
        } else if lowered.contains("publish") {
            BrokerError::PublishError(error_text)
        } else if lowered.contains("consume") {
            BrokerError::ConsumeError(error_text)
        } else if lowered.contains("ack") {
            BrokerError::AckError(error_text)
        } else {
            BrokerError::ChannelError(error_text)
        }
    }
}

/// Failures surfaced to callers of the request/response coordinator.
///
/// A [`RpcError::Timeout`] means the outcome is unknown: the worker may still
/// have executed the operation after the caller stopped waiting.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    #[error("Failed to publish {operation_type} request: {reason}")]
    PublishFailed {
        operation_type: String,
        reason: String,
    },

    #[error("Request {correlation_id} timed out after {timeout:?}")]
    Timeout {
        correlation_id: String,
        timeout: Duration,
    },

    #[error("Remote operation failed: {0}")]
    Remote(String),

    #[error("Request {0} removed by stale request cleanup")]
    Stale(String),

    #[error("Response channel was closed unexpectedly")]
    ResponseChannelClosed,

    #[error("Failed to serialize request: {0}")]
    SerializationError(String),

    #[error("Coordinator is shutting down")]
    Shutdown,
}

impl RpcError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Timeout { .. })
    }

    /// True when the caller cannot know whether the operation ran remotely.
    pub fn is_unknown_outcome(&self) -> bool {
        matches!(
            self,
            RpcError::Timeout { .. } | RpcError::Stale(_) | RpcError::Shutdown
        )
    }
}

impl From<SerdeError> for RpcError {
    fn from(error: SerdeError) -> Self {
        RpcError::SerializationError(error.to_string())
    }
}
