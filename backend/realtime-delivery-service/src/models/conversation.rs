use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationType {
    Direct,
    Group,
}

impl ConversationType {
    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "direct" => Some(Self::Direct),
            "group" => Some(Self::Group),
            _ => None,
        }
    }

    pub fn to_db(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Group => "group",
        }
    }
}

/// Conversation row. A non-null `last_message_id` references a message of this
/// conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub conversation_type: ConversationType,
    pub title: Option<String>,
    pub avatar: Option<String>,
    pub last_message_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// A `conversation_member` row. Membership is append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMember {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationMember {
    pub fn with_profile(
        self,
        full_name: Option<String>,
        avatar: Option<String>,
        user_type: Option<String>,
    ) -> ConversationMemberWithUser {
        ConversationMemberWithUser {
            conversation_id: self.conversation_id,
            user_id: self.user_id,
            full_name,
            avatar,
            user_type,
        }
    }
}

/// Member plus the display metadata fan-out frames carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMemberWithUser {
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    pub full_name: Option<String>,
    pub avatar: Option<String>,
    pub user_type: Option<String>,
}
