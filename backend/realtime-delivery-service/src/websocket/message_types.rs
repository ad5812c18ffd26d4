use crate::models::Message;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Inbound WebSocket events from client to server
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WsInboundEvent {
    /// Application-level keepalive for clients that cannot send ping frames
    #[serde(rename = "ping")]
    Ping,
}

/// Display metadata of a message author, as known to the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorInfo {
    pub user_id: Uuid,
    pub full_name: Option<String>,
    pub avatar: Option<String>,
}

/// Outbound WebSocket events from server to client
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WsOutboundEvent {
    /// Sent once after the upgrade
    #[serde(rename = "connected")]
    Connected {
        connection_id: Uuid,
        user_id: Uuid,
    },

    #[serde(rename = "message.new")]
    MessageNew {
        message: Message,
        /// `None` when the author is no longer a member
        author: Option<AuthorInfo>,
    },

    #[serde(rename = "pong")]
    Pong,
}

impl WsOutboundEvent {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
