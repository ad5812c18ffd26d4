use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    System,
    Image,
    File,
}

impl MessageType {
    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "text" => Some(Self::Text),
            "system" => Some(Self::System),
            "image" => Some(Self::Image),
            "file" => Some(Self::File),
            _ => None,
        }
    }

    pub fn to_db(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::System => "system",
            Self::Image => "image",
            Self::File => "file",
        }
    }
}

/// A chat message. Immutable once created.
///
/// `id` is a UUIDv7: its byte order follows creation time, so it doubles as a
/// pagination cursor and orders last-message pointers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    pub fn new(author: Uuid, request: SendMessageRequest) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            conversation_id: request.conversation_id,
            user_id: author,
            message_type: request.message_type,
            body: request.body,
            reply_to: request.reply_to,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendMessageRequest {
    pub conversation_id: Uuid,
    #[serde(rename = "type", default)]
    pub message_type: MessageType,
    pub body: String,
    #[serde(default)]
    pub reply_to: Option<Uuid>,
}
