//! # Message Service
//!
//! Message creation entry point: persist, then hand the message to the
//! real-time path by publishing
//!
//! 1. `ws_message.new` (fan-out to connected members on every replica)
//! 2. `conversation.update_last_message_id` (pointer update, one replica)
//!
//! Only a persistence failure means the message does not exist. A publish
//! failure is reported as `BrokerUnavailable` after the message was stored.
//! When only the pointer update is refused the message has already gone out
//! to connected members; that case is logged separately.

use crate::error::{AppError, AppResult};
use crate::models::{Message, SendMessageRequest};
use crate::services::membership::MembershipLookup;
use crate::services::message_store::MessageRepository;
use crate::services::publisher::MessagePublisher;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

const MAX_BODY_LEN: usize = 10_000;

pub struct MessageService {
    messages: Arc<dyn MessageRepository>,
    membership: Arc<dyn MembershipLookup>,
    publisher: MessagePublisher,
}

impl MessageService {
    pub fn new(
        messages: Arc<dyn MessageRepository>,
        membership: Arc<dyn MembershipLookup>,
        publisher: MessagePublisher,
    ) -> Self {
        Self {
            messages,
            membership,
            publisher,
        }
    }

    pub async fn send_message(
        &self,
        author: Uuid,
        request: SendMessageRequest,
    ) -> AppResult<Message> {
        if request.body.trim().is_empty() {
            return Err(AppError::BadRequest("message body is empty".into()));
        }
        if request.body.len() > MAX_BODY_LEN {
            return Err(AppError::BadRequest(format!(
                "message body exceeds {MAX_BODY_LEN} bytes"
            )));
        }

        let members = self.membership.get_members(request.conversation_id).await?;
        if !members.iter().any(|m| m.user_id == author) {
            warn!(
                user_id = %author,
                conversation_id = %request.conversation_id,
                "rejected message from non-member"
            );
            return Err(AppError::Forbidden);
        }

        let message = self.messages.create(&Message::new(author, request)).await?;

        self.publisher.publish_new_message(&message).await?;
        if let Err(e) = self
            .publisher
            .publish_pointer_update(message.conversation_id, message.id)
            .await
        {
            error!(
                message_id = %message.id,
                conversation_id = %message.conversation_id,
                error = %e,
                "message stored and fanned out, last message pointer update not published"
            );
            return Err(e);
        }

        info!(
            message_id = %message.id,
            conversation_id = %message.conversation_id,
            user_id = %author,
            "message created"
        );
        Ok(message)
    }
}
