use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geo::GeoPoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    Customer,
    Driver,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSender {
    pub role: ChatRole,
    pub id: Option<Uuid>,
}

impl ChatSender {
    pub fn customer(id: Uuid) -> Self {
        Self {
            role: ChatRole::Customer,
            id: Some(id),
        }
    }

    pub fn driver(id: Uuid) -> Self {
        Self {
            role: ChatRole::Driver,
            id: Some(id),
        }
    }

    pub fn system() -> Self {
        Self {
            role: ChatRole::System,
            id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    StatusUpdate,
    Location,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub order_id: Uuid,
    pub sender: ChatSender,
    pub kind: MessageKind,
    pub content: String,
    pub image_ref: Option<String>,
    pub location: Option<GeoPoint>,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    /// Identity used for at-most-once rendering: the id when both sides have
    /// one, otherwise the sender/timestamp/content tuple.
    pub fn same_payload(&self, other: &ChatMessage) -> bool {
        self.sender == other.sender && self.kind == other.kind && self.content == other.content
    }
}
