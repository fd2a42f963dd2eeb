use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Envelope keys that payload fields may not override.
const RESERVED_EVENT_KEYS: [&str; 5] = ["id", "type", "timestamp", "correlationId", "source"];

/// Domain event as it goes out on the topic exchange.
///
/// Payload fields are flattened next to the envelope, so consumers see
/// `{id, type, timestamp, correlationId, source, ...fields}`.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundEvent {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: Uuid,
    pub source: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl OutboundEvent {
    /// Creates an event with a fresh id and correlation id and the current timestamp.
    /// Non-object payloads are carried under a `data` field.
    pub fn new(event_type: &str, source: &str, payload: Value) -> Self {
        let mut fields = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("data".to_string(), other);
                map
            }
        };
        for key in RESERVED_EVENT_KEYS {
            fields.remove(key);
        }

        OutboundEvent {
            id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            timestamp: Utc::now(),
            correlation_id: Uuid::new_v4(),
            source: source.to_string(),
            fields,
        }
    }
}

/// RPC request envelope published to the request exchange.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRequest {
    pub correlation_id: String,
    pub operation_type: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub source: String,
    /// Caller-side deadline in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Shared by every retry of one logical call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
}

/// RPC response envelope, one per consumed request.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResponse {
    pub correlation_id: String,
    #[serde(default)]
    pub operation_type: String,
    pub timestamp: DateTime<Utc>,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OperationResponse {
    pub fn success(request: &OperationRequest, data: Value) -> Self {
        OperationResponse {
            correlation_id: request.correlation_id.clone(),
            operation_type: request.operation_type.clone(),
            timestamp: Utc::now(),
            status: ResponseStatus::Success,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(request: &OperationRequest, message: impl Into<String>) -> Self {
        OperationResponse {
            correlation_id: request.correlation_id.clone(),
            operation_type: request.operation_type.clone(),
            timestamp: Utc::now(),
            status: ResponseStatus::Error,
            data: None,
            error: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }
}
