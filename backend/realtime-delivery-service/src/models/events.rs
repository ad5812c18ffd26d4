//! Stream and subject names shared by every replica. Changing any of these
//! orphans the consumer groups already stored in the broker.

use event_bus::StreamConfig;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const STREAM_CONVERSATION: &str = "CONVERSATION";
pub const STREAM_WS_MESSAGE: &str = "WS_MESSAGE";

pub const SUBJECT_WILDCARD_CONVERSATION: &str = "conversation.>";
pub const SUBJECT_WILDCARD_WS_MESSAGE: &str = "ws_message.>";

/// Payload: [`crate::models::Message`]
pub const SUBJECT_NEW_MESSAGE: &str = "ws_message.new";
/// Payload: [`UpdateLastMessageId`]
pub const SUBJECT_UPDATE_LAST_MESSAGE_ID: &str = "conversation.update_last_message_id";

/// Exclusive durable for fan-out (the bus suffixes it per instance)
pub const DURABLE_WS_MESSAGE_NEW: &str = "ws_message_new";
/// Competing group for pointer updates
pub const GROUP_UPDATE_LAST_MESSAGE: &str = "conversation_update_last_message";
/// Reserved competing group for other conversation workers
pub const GROUP_CONVERSATION_WORKER: &str = "conversation_worker";

pub fn stream_catalogue() -> Vec<StreamConfig> {
    vec![
        StreamConfig::new(STREAM_CONVERSATION, &[SUBJECT_WILDCARD_CONVERSATION]),
        StreamConfig::new(STREAM_WS_MESSAGE, &[SUBJECT_WILDCARD_WS_MESSAGE]),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateLastMessageId {
    pub conversation_id: Uuid,
    pub message_id: Uuid,
}
