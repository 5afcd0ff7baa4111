use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use waypoint_core::{JobId, MessageId};

use crate::Message;

/// Envelope for a message on the bus, containing routing + correlation metadata.
///
/// Notes:
/// - `message_id` identifies this publication; redeliveries keep it.
/// - `correlation_id` is the job id, independent of the transport's own ids.
/// - `payload` is the message body as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    message_id: MessageId,
    message_type: String,
    correlation_id: JobId,
    published_at: DateTime<Utc>,

    payload: JsonValue,
}

impl MessageEnvelope {
    pub fn new(
        message_id: MessageId,
        message_type: impl Into<String>,
        correlation_id: JobId,
        published_at: DateTime<Utc>,
        payload: JsonValue,
    ) -> Self {
        Self {
            message_id,
            message_type: message_type.into(),
            correlation_id,
            published_at,
            payload,
        }
    }

    /// Wrap a typed message in a fresh envelope.
    pub fn wrap<M: Message>(message: &M) -> Result<Self, serde_json::Error> {
        Ok(Self::new(
            MessageId::new(),
            M::MESSAGE_TYPE,
            message.correlation_id(),
            Utc::now(),
            serde_json::to_value(message)?,
        ))
    }

    /// Decode the payload as `M`.
    pub fn decode<M: Message>(&self) -> Result<M, serde_json::Error> {
        M::deserialize(&self.payload)
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn correlation_id(&self) -> JobId {
        self.correlation_id
    }

    pub fn published_at(&self) -> DateTime<Utc> {
        self.published_at
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    pub fn into_payload(self) -> JsonValue {
        self.payload
    }
}
