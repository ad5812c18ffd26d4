//! Presence-aware fan-out of new messages to this instance's connections.
//!
//! Every replica runs one exclusive subscription on `ws_message.new` and
//! pushes to the members it holds connections for. Delivery is best-effort:
//! lookup failures are logged and the event is acknowledged, since a
//! redelivery would see the same membership and presence.

use crate::error::{AppError, AppResult};
use crate::models::events::{DURABLE_WS_MESSAGE_NEW, SUBJECT_NEW_MESSAGE};
use crate::models::Message;
use crate::services::membership::MembershipLookup;
use crate::services::presence::PresenceStore;
use crate::websocket::message_types::{AuthorInfo, WsOutboundEvent};
use crate::websocket::{ConnectionRegistry, Frame};
use async_trait::async_trait;
use event_bus::{BusResult, Event, EventBus, EventHandler, Subscription};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FanoutReport {
    /// Members considered for delivery (author excluded unless configured)
    pub recipients: usize,
    /// Successful connection writes
    pub delivered: usize,
    /// Connections dropped after a failed write
    pub failed: usize,
    /// Recipients with no connection on this instance
    pub skipped: usize,
}

pub struct PresenceAwareFanout {
    registry: ConnectionRegistry,
    membership: Arc<dyn MembershipLookup>,
    presence: Arc<dyn PresenceStore>,
    deliver_to_author: bool,
}

impl PresenceAwareFanout {
    pub fn new(
        registry: ConnectionRegistry,
        membership: Arc<dyn MembershipLookup>,
        presence: Arc<dyn PresenceStore>,
        deliver_to_author: bool,
    ) -> Self {
        Self {
            registry,
            membership,
            presence,
            deliver_to_author,
        }
    }

    /// Exclusive subscription: this instance sees every new message.
    pub async fn subscribe(self: Arc<Self>, bus: &dyn EventBus) -> BusResult<Subscription> {
        bus.subscribe_exclusive(DURABLE_WS_MESSAGE_NEW, SUBJECT_NEW_MESSAGE, self)
            .await
    }

    /// Push `message` to every connected member of its conversation.
    pub async fn deliver(&self, message: &Message) -> AppResult<FanoutReport> {
        let members = self.membership.get_members(message.conversation_id).await?;

        let author = members
            .iter()
            .find(|m| m.user_id == message.user_id)
            .map(|m| AuthorInfo {
                user_id: m.user_id,
                full_name: m.full_name.clone(),
                avatar: m.avatar.clone(),
            });

        let recipients: Vec<Uuid> = members
            .iter()
            .map(|m| m.user_id)
            .filter(|user_id| self.deliver_to_author || *user_id != message.user_id)
            .collect();

        let online = self.online_hint(&recipients).await;
        // Presence lags behind connects by one round trip, the local registry never does
        let targets: Vec<Uuid> = recipients
            .iter()
            .copied()
            .filter(|user_id| {
                online.as_ref().is_some_and(|set| set.contains(user_id))
                    || self.registry.is_online(*user_id)
            })
            .collect();

        let mut report = FanoutReport {
            recipients: recipients.len(),
            skipped: recipients.len() - targets.len(),
            ..FanoutReport::default()
        };
        if targets.is_empty() {
            return Ok(report);
        }

        let frame = WsOutboundEvent::MessageNew {
            message: message.clone(),
            author,
        }
        .to_json()
        .map(Frame::new)
        .map_err(|e| {
            error!(message_id = %message.id, error = %e, "failed to encode message frame");
            AppError::Internal
        })?;

        let broadcast = self.registry.broadcast_to_members(&targets, &frame).await;
        report.delivered = broadcast.delivered;
        report.failed = broadcast.failed.len();
        report.skipped += broadcast.skipped;
        Ok(report)
    }

    async fn online_hint(&self, user_ids: &[Uuid]) -> Option<HashSet<Uuid>> {
        match self.presence.online_users(user_ids).await {
            Ok(online) => Some(online),
            Err(e) => {
                warn!(error = %e, "presence lookup failed, falling back to local registry");
                None
            }
        }
    }
}

#[async_trait]
impl EventHandler for PresenceAwareFanout {
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        let message: Message = match event.decode() {
            Ok(message) => message,
            Err(e) => {
                error!(event_id = %event.id, error = %e, "dropping undecodable message event");
                return Ok(());
            }
        };

        match self.deliver(&message).await {
            Ok(report) => debug!(
                message_id = %message.id,
                conversation_id = %message.conversation_id,
                recipients = report.recipients,
                delivered = report.delivered,
                failed = report.failed,
                skipped = report.skipped,
                "message fanned out"
            ),
            Err(e) => warn!(
                message_id = %message.id,
                conversation_id = %message.conversation_id,
                error = %e,
                "fan-out skipped"
            ),
        }
        Ok(())
    }
}
