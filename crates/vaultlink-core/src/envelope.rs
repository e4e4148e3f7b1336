//! JSON envelopes exchanged with the vault.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// An app -> vault request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

impl RequestEnvelope {
    /// New request with a random id and the current time.
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), kind, payload)
    }

    pub fn with_id(id: impl Into<String>, kind: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            timestamp: Utc::now(),
            payload,
            reply_to: None,
        }
    }

    pub fn reply_to(mut self, subject: impl Into<String>) -> Self {
        self.reply_to = Some(subject.into());
        self
    }
}

/// A vault -> app response, correlated by `event_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub event_id: String,
    pub success: bool,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponseEnvelope {
    pub fn ok(event_id: impl Into<String>, result: Value) -> Self {
        Self {
            event_id: event_id.into(),
            success: true,
            timestamp: Utc::now(),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(event_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            success: false,
            timestamp: Utc::now(),
            result: None,
            error: Some(error.into()),
        }
    }
}

/// An unsolicited vault -> app push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}
