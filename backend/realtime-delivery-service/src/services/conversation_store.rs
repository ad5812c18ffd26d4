//! Last-message pointer persistence with optimistic concurrency.
//!
//! The pointer is updated in a transaction: the row is read with
//! `SELECT ... FOR UPDATE`, then written with an `UPDATE` conditioned on the
//! `(last_message_id, updated_at)` pair that was read. Zero affected rows means
//! another writer got there first and the caller should retry.

use crate::error::AppError;
use crate::models::{Conversation, ConversationType};
use async_trait::async_trait;
use deadpool_postgres::Pool;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tokio_postgres::Row;
use tracing::debug;
use uuid::Uuid;

/// How a pointer update compares against the pointer already stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PointerPolicy {
    /// Only move the pointer forward in message-id order. Stale and duplicate
    /// updates are no-ops, so redelivery is idempotent.
    #[default]
    NewestWins,
    /// Apply updates in the order they are handled; the last one applied wins.
    /// Re-applying the current pointer is still a no-op.
    DeliveryOrder,
}

impl PointerPolicy {
    pub fn should_apply(&self, current: Option<Uuid>, candidate: Uuid) -> bool {
        match (self, current) {
            (_, None) => true,
            (_, Some(current)) if current == candidate => false,
            (PointerPolicy::NewestWins, Some(current)) => candidate > current,
            (PointerPolicy::DeliveryOrder, Some(_)) => true,
        }
    }
}

impl FromStr for PointerPolicy {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "newest_wins" | "newest" => Ok(Self::NewestWins),
            "delivery_order" | "last_write_wins" => Ok(Self::DeliveryOrder),
            other => Err(AppError::Config(format!("unknown POINTER_POLICY {other}"))),
        }
    }
}

impl fmt::Display for PointerPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NewestWins => write!(f, "newest_wins"),
            Self::DeliveryOrder => write!(f, "delivery_order"),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// The row changed between read and conditional write
    #[error("concurrent update conflict on conversation {0}")]
    ConcurrentUpdateConflict(Uuid),

    #[error("conversation {0} not found")]
    ConversationNotFound(Uuid),

    #[error("message {message_id} does not belong to conversation {conversation_id}")]
    MessageNotInConversation {
        conversation_id: Uuid,
        message_id: Uuid,
    },

    #[error("database error: {0}")]
    Database(String),
}

impl StoreError {
    /// Retrying cannot change the outcome.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            StoreError::ConversationNotFound(_) | StoreError::MessageNotInConversation { .. }
        )
    }
}

impl From<tokio_postgres::Error> for StoreError {
    fn from(e: tokio_postgres::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for StoreError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        StoreError::Database(e.to_string())
    }
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Point `conversation_id` at `message_id` subject to `policy`. Returns the
    /// row as stored afterwards (unchanged when the policy skipped the update).
    async fn update_last_message_id(
        &self,
        conversation_id: Uuid,
        message_id: Uuid,
        policy: PointerPolicy,
    ) -> Result<Conversation, StoreError>;
}

const CONVERSATION_COLUMNS: &str =
    "id, type, title, avatar, last_message_id, created_at, updated_at, deleted_at";

fn conversation_from_row(row: &Row) -> Result<Conversation, StoreError> {
    let kind: String = row.get("type");
    let conversation_type = ConversationType::from_db(&kind)
        .ok_or_else(|| StoreError::Database(format!("unknown conversation type {kind}")))?;

    Ok(Conversation {
        id: row.get("id"),
        conversation_type,
        title: row.get("title"),
        avatar: row.get("avatar"),
        last_message_id: row.get("last_message_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        deleted_at: row.get("deleted_at"),
    })
}

pub struct PgConversationStore {
    db: Pool,
}

impl PgConversationStore {
    pub fn new(db: Pool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ConversationStore for PgConversationStore {
    async fn update_last_message_id(
        &self,
        conversation_id: Uuid,
        message_id: Uuid,
        policy: PointerPolicy,
    ) -> Result<Conversation, StoreError> {
        let mut client = self.db.get().await?;
        let tx = client.transaction().await?;

        let select_sql = format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversation \
             WHERE id = $1 AND deleted_at IS NULL FOR UPDATE"
        );
        let current = tx
            .query_opt(select_sql.as_str(), &[&conversation_id])
            .await?
            .ok_or(StoreError::ConversationNotFound(conversation_id))?;
        let current = conversation_from_row(&current)?;

        let belongs = tx
            .query_opt(
                "SELECT 1 FROM message WHERE id = $1 AND conversation_id = $2",
                &[&message_id, &conversation_id],
            )
            .await?;
        if belongs.is_none() {
            return Err(StoreError::MessageNotInConversation {
                conversation_id,
                message_id,
            });
        }

        if !policy.should_apply(current.last_message_id, message_id) {
            debug!(
                conversation_id = %conversation_id,
                message_id = %message_id,
                current = ?current.last_message_id,
                policy = %policy,
                "last message pointer already up to date"
            );
            tx.commit().await?;
            return Ok(current);
        }

        let update_sql = format!(
            "UPDATE conversation SET last_message_id = $1, updated_at = NOW() \
             WHERE id = $2 \
               AND last_message_id IS NOT DISTINCT FROM $3 \
               AND updated_at = $4 \
             RETURNING {CONVERSATION_COLUMNS}"
        );
        let updated = tx
            .query_opt(
                update_sql.as_str(),
                &[
                    &message_id,
                    &conversation_id,
                    &current.last_message_id,
                    &current.updated_at,
                ],
            )
            .await?
            .ok_or(StoreError::ConcurrentUpdateConflict(conversation_id))?;
        let updated = conversation_from_row(&updated)?;

        tx.commit().await?;
        Ok(updated)
    }
}
