//! Conversation synchronizer: competing consumer of pointer-update events.
//!
//! Outcome per event:
//!
//! | store result                     | bus outcome              |
//! |----------------------------------|--------------------------|
//! | updated / already up to date     | ack                      |
//! | `ConcurrentUpdateConflict`       | nack, redelivered        |
//! | `Database`                       | nack, redelivered        |
//! | not found / wrong conversation   | ack (logged)             |
//! | undecodable payload              | ack (logged)             |

use crate::models::events::{GROUP_UPDATE_LAST_MESSAGE, SUBJECT_UPDATE_LAST_MESSAGE_ID};
use crate::models::UpdateLastMessageId;
use crate::services::conversation_store::{ConversationStore, PointerPolicy, StoreError};
use async_trait::async_trait;
use event_bus::{BusResult, Event, EventBus, EventHandler, Subscription};
use std::sync::Arc;
use tracing::{debug, error, warn};

pub struct ConversationSynchronizer {
    store: Arc<dyn ConversationStore>,
    policy: PointerPolicy,
}

impl ConversationSynchronizer {
    pub fn new(store: Arc<dyn ConversationStore>, policy: PointerPolicy) -> Self {
        Self { store, policy }
    }

    /// Join the pointer-update group on `bus`.
    pub async fn subscribe(self, bus: &dyn EventBus) -> BusResult<Subscription> {
        bus.subscribe_competing(
            GROUP_UPDATE_LAST_MESSAGE,
            SUBJECT_UPDATE_LAST_MESSAGE_ID,
            Arc::new(self),
        )
        .await
    }
}

#[async_trait]
impl EventHandler for ConversationSynchronizer {
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        let update: UpdateLastMessageId = match event.decode() {
            Ok(update) => update,
            Err(e) => {
                error!(event_id = %event.id, error = %e, "dropping undecodable pointer update");
                return Ok(());
            }
        };

        match self
            .store
            .update_last_message_id(update.conversation_id, update.message_id, self.policy)
            .await
        {
            Ok(conversation) => {
                debug!(
                    conversation_id = %update.conversation_id,
                    message_id = %update.message_id,
                    last_message_id = ?conversation.last_message_id,
                    attempt = event.attempt,
                    redelivery = event.is_redelivery(),
                    "last message pointer synchronized"
                );
                Ok(())
            }
            Err(e) if e.is_permanent() => {
                warn!(
                    conversation_id = %update.conversation_id,
                    message_id = %update.message_id,
                    error = %e,
                    "dropping pointer update"
                );
                Ok(())
            }
            Err(StoreError::ConcurrentUpdateConflict(conversation_id)) => {
                debug!(
                    conversation_id = %conversation_id,
                    attempt = event.attempt,
                    "pointer update lost a race, will be redelivered"
                );
                Err(StoreError::ConcurrentUpdateConflict(conversation_id).into())
            }
            Err(e) => Err(e.into()),
        }
    }
}
