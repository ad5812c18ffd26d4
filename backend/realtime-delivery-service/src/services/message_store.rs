use crate::error::{AppError, AppResult};
use crate::models::{Message, MessageType};
use async_trait::async_trait;
use deadpool_postgres::Pool;

#[async_trait]
pub trait MessageRepository: Send + Sync {
    async fn create(&self, message: &Message) -> AppResult<Message>;
}

pub struct PgMessageRepository {
    db: Pool,
}

impl PgMessageRepository {
    pub fn new(db: Pool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl MessageRepository for PgMessageRepository {
    async fn create(&self, message: &Message) -> AppResult<Message> {
        let client = self.db.get().await?;

        let row = client
            .query_one(
                r#"
                INSERT INTO message (id, conversation_id, user_id, type, body, reply_to, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                RETURNING id, conversation_id, user_id, type, body, reply_to, created_at, updated_at
                "#,
                &[
                    &message.id,
                    &message.conversation_id,
                    &message.user_id,
                    &message.message_type.to_db(),
                    &message.body,
                    &message.reply_to,
                    &message.created_at,
                    &message.updated_at,
                ],
            )
            .await
            .map_err(|e| AppError::Database(format!("insert message: {e}")))?;

        let kind: String = row.get("type");
        Ok(Message {
            id: row.get("id"),
            conversation_id: row.get("conversation_id"),
            user_id: row.get("user_id"),
            message_type: MessageType::from_db(&kind)
                .ok_or_else(|| AppError::Database(format!("unknown message type {kind}")))?,
            body: row.get("body"),
            reply_to: row.get("reply_to"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}
