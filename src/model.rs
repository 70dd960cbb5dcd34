use crate::error::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which durable table a queue row points at.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MessageType {
    Published,
    Received,
}

impl MessageType {
    pub fn as_i64(&self) -> i64 {
        match self {
            MessageType::Published => 0,
            MessageType::Received => 1,
        }
    }

    pub fn from_i64(value: i64) -> Result<Self, StoreError> {
        match value {
            0 => Ok(MessageType::Published),
            1 => Ok(MessageType::Received),
            other => Err(StoreError::UnknownMessageType(other)),
        }
    }

    /// Backing table name.
    pub(crate) fn table(&self) -> &'static str {
        match self {
            MessageType::Published => "published",
            MessageType::Received => "received",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum StatusName {
    Scheduled,
    Queued,
    Succeeded,
    Failed,
}

impl StatusName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusName::Scheduled => "Scheduled",
            StatusName::Queued => "Queued",
            StatusName::Succeeded => "Succeeded",
            StatusName::Failed => "Failed",
        }
    }

    /// Parse a stored status. Anything outside the vocabulary is rejected.
    pub fn parse_status(s: &str) -> Result<Self, StoreError> {
        match s {
            "Scheduled" => Ok(StatusName::Scheduled),
            "Queued" => Ok(StatusName::Queued),
            "Succeeded" => Ok(StatusName::Succeeded),
            "Failed" => Ok(StatusName::Failed),
            other => Err(StoreError::UnknownStatus(other.to_string())),
        }
    }
}

/// Outbox row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublishedMessage {
    pub id: i64,
    pub name: String,
    pub content: Option<String>,
    pub message_id: i64,
    pub transaction_id: i64,
    pub retries: i32,
    pub added: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_warned_time: Option<DateTime<Utc>>,
    pub status_name: StatusName,
}

/// Inbox row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReceivedMessage {
    pub id: i64,
    pub name: String,
    pub group: Option<String>,
    pub content: Option<String>,
    pub message_id: i64,
    pub transaction_id: i64,
    pub retries: i32,
    pub added: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_warned_time: Option<DateTime<Utc>>,
    pub status_name: StatusName,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewPublishedMessage {
    pub name: String,
    pub content: String,
    pub message_id: i64,
    pub transaction_id: i64,
    pub retries: i32,
    pub status_name: StatusName,
}

/// Inbox insert. `content` is the raw wire form, a JSON [`MessageEnvelope`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewReceivedMessage {
    pub name: String,
    pub group: Option<String>,
    pub content: String,
    pub retries: i32,
    pub status_name: StatusName,
}

/// Wire envelope carried in a received message's content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    pub content: String,
    pub meta_data: EnvelopeMetaData,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeMetaData {
    pub message_id: i64,
    pub transaction_id: i64,
}

impl MessageEnvelope {
    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        Ok(serde_json::from_str(raw)?)
    }
}
