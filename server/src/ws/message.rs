//! JSON wire envelope exchanged with WebSocket clients.
//!
//! Every frame is a single `Message` object. The server overwrites
//! `sender_id` and `timestamp` on inbound frames, so neither is ever
//! trusted from the client.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{GroupId, UserId};

/// Frame type tag, serialized as the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    NewDirect,
    NewGroup,
    ReadReceipt,
    Typing,
    Ping,
    Pong,
    UserJoined,
    UserLeft,
    /// Any tag this server does not understand.
    #[serde(other)]
    Unknown,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewDirect => "new_direct",
            Self::NewGroup => "new_group",
            Self::ReadReceipt => "read_receipt",
            Self::Typing => "typing",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::UserJoined => "user_joined",
            Self::UserLeft => "user_left",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Map<String, serde_json::Value>>,
    /// Server-assigned; any client value is ignored.
    #[serde(default = "Utc::now", skip_deserializing)]
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(kind: MessageType) -> Self {
        Self {
            kind,
            sender_id: None,
            receiver_id: None,
            group_id: None,
            content: None,
            data: None,
            timestamp: Utc::now(),
        }
    }

    pub fn pong() -> Self {
        Self::new(MessageType::Pong)
    }

    /// Presence event carrying `{user_id, username}` in `data`.
    pub fn presence(kind: MessageType, user_id: UserId, username: &str) -> Self {
        let mut data = serde_json::Map::new();
        data.insert("user_id".into(), serde_json::Value::String(user_id.to_string()));
        data.insert("username".into(), serde_json::Value::String(username.to_string()));
        Self {
            data: Some(data),
            ..Self::new(kind)
        }
    }

    /// Read receipt pushed by the server: `reader` has read messages
    /// previously sent by `original_sender`.
    pub fn read_receipt(reader: UserId, original_sender: UserId) -> Self {
        Self {
            sender_id: Some(reader),
            receiver_id: Some(original_sender),
            ..Self::new(MessageType::ReadReceipt)
        }
    }

    /// Parse an inbound text frame.
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Serialize to a text frame.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Overwrite the fields a client must never control.
    pub fn stamp(&mut self, sender: Uuid) {
        self.sender_id = Some(sender);
        self.timestamp = Utc::now();
    }
}
