use crate::error::{AppError, AppResult};
use crate::models::{ConversationMember, ConversationMemberWithUser};
use async_trait::async_trait;
use deadpool_postgres::Pool;
use uuid::Uuid;

#[async_trait]
pub trait MembershipLookup: Send + Sync {
    /// Members of the conversation with their display metadata.
    /// Failures surface as [`AppError::MembershipLookupFailed`].
    async fn get_members(&self, conversation_id: Uuid) -> AppResult<Vec<ConversationMemberWithUser>>;
}

pub struct PgMembershipLookup {
    db: Pool,
}

impl PgMembershipLookup {
    pub fn new(db: Pool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl MembershipLookup for PgMembershipLookup {
    async fn get_members(&self, conversation_id: Uuid) -> AppResult<Vec<ConversationMemberWithUser>> {
        let client = self
            .db
            .get()
            .await
            .map_err(|e| AppError::MembershipLookupFailed(format!("get client: {e}")))?;

        // LEFT JOIN: a member without a profile row still receives messages
        let rows = client
            .query(
                r#"
                SELECT cm.id, cm.conversation_id, cm.user_id, cm.created_at, cm.updated_at,
                       ui.full_name, ui.avatar, ui.type AS user_type
                FROM conversation_member cm
                LEFT JOIN user_info ui ON ui.id = cm.user_id
                WHERE cm.conversation_id = $1
                "#,
                &[&conversation_id],
            )
            .await
            .map_err(|e| AppError::MembershipLookupFailed(format!("get_members: {e}")))?;

        Ok(rows
            .into_iter()
            .map(|row| {
                ConversationMember {
                    id: row.get("id"),
                    conversation_id: row.get("conversation_id"),
                    user_id: row.get("user_id"),
                    created_at: row.get("created_at"),
                    updated_at: row.get("updated_at"),
                }
                .with_profile(row.get("full_name"), row.get("avatar"), row.get("user_type"))
            })
            .collect())
    }
}
