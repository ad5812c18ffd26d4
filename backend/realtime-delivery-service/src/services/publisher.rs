use crate::error::{AppError, AppResult};
use crate::models::events::{SUBJECT_NEW_MESSAGE, SUBJECT_UPDATE_LAST_MESSAGE_ID};
use crate::models::{Message, UpdateLastMessageId};
use event_bus::EventBus;
use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;

/// Typed producer for the two message events. Success means the broker
/// accepted the event, not that anyone consumed it.
#[derive(Clone)]
pub struct MessagePublisher {
    bus: Arc<dyn EventBus>,
}

impl MessagePublisher {
    pub fn new(bus: Arc<dyn EventBus>) -> Self {
        Self { bus }
    }

    pub async fn publish_new_message(&self, message: &Message) -> AppResult<String> {
        let payload = serde_json::to_vec(message).map_err(|e| {
            error!(error = %e, "failed to encode message event");
            AppError::Internal
        })?;
        self.publish(SUBJECT_NEW_MESSAGE, payload).await
    }

    pub async fn publish_pointer_update(
        &self,
        conversation_id: Uuid,
        message_id: Uuid,
    ) -> AppResult<String> {
        let payload = serde_json::to_vec(&UpdateLastMessageId {
            conversation_id,
            message_id,
        })
        .map_err(|e| {
            error!(error = %e, "failed to encode pointer update event");
            AppError::Internal
        })?;
        self.publish(SUBJECT_UPDATE_LAST_MESSAGE_ID, payload).await
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> AppResult<String> {
        let event_id = self.bus.publish(subject, payload).await.map_err(|e| {
            error!(
                subject = %subject,
                transient = e.is_transient(),
                error = %e,
                "failed to publish event"
            );
            AppError::from(e)
        })?;
        debug!(subject = %subject, event_id = %event_id, "event accepted by broker");
        Ok(event_id)
    }
}
