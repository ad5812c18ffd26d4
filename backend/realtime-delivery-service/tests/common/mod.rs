//! In-memory collaborators shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use event_bus::{
    BusConfig, BusError, BusResult, EventBus, EventHandler, InMemoryBus, Subscription,
};
use realtime_delivery_service::error::{AppError, AppResult};
use realtime_delivery_service::models::events::stream_catalogue;
use realtime_delivery_service::models::{
    Conversation, ConversationMemberWithUser, ConversationType, Message, MessageType,
    SendMessageRequest,
};
use realtime_delivery_service::services::{
    ConversationStore, MembershipLookup, MessageRepository, PointerPolicy, PresenceStore,
    SessionResolver, StoreError,
};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// Poll `check` until it holds or two seconds pass.
pub async fn wait_until<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

pub fn test_bus() -> Arc<InMemoryBus> {
    Arc::new(InMemoryBus::new(BusConfig {
        ack_wait: Duration::from_millis(5),
        max_backoff: Duration::from_millis(20),
        max_deliver: 20,
        workers: 2,
        ..BusConfig::with_streams(stream_catalogue())
    }))
}

pub fn member(conversation_id: Uuid, user_id: Uuid, name: &str) -> ConversationMemberWithUser {
    ConversationMemberWithUser {
        conversation_id,
        user_id,
        full_name: Some(name.to_string()),
        avatar: None,
        user_type: Some("user".into()),
    }
}

pub fn message(conversation_id: Uuid, author: Uuid, body: &str) -> Message {
    Message::new(author, send_request(conversation_id, body))
}

pub fn send_request(conversation_id: Uuid, body: &str) -> SendMessageRequest {
    SendMessageRequest {
        conversation_id,
        message_type: MessageType::Text,
        body: body.to_string(),
        reply_to: None,
    }
}

pub fn conversation(id: Uuid) -> Conversation {
    let now = Utc::now();
    Conversation {
        id,
        conversation_type: ConversationType::Group,
        title: Some("test".into()),
        avatar: None,
        last_message_id: None,
        created_at: now,
        updated_at: now,
        deleted_at: None,
    }
}

// ---------------------------------------------------------------------------
// Presence
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryPresence {
    online: Mutex<HashSet<Uuid>>,
    fail: AtomicBool,
    pub set_online_calls: AtomicUsize,
    pub set_offline_calls: AtomicUsize,
}

impl InMemoryPresence {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn is_online(&self, user_id: Uuid) -> bool {
        self.online.lock().unwrap().contains(&user_id)
    }

    /// Mark a user online as if another instance held their connection.
    pub fn mark_remote(&self, user_id: Uuid) {
        self.online.lock().unwrap().insert(user_id);
    }

    fn check(&self) -> AppResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(AppError::PresenceLookupFailed("presence store down".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl PresenceStore for InMemoryPresence {
    async fn set_online(&self, user_id: Uuid) -> AppResult<()> {
        self.set_online_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.online.lock().unwrap().insert(user_id);
        Ok(())
    }

    async fn set_offline(&self, user_id: Uuid) -> AppResult<()> {
        self.set_offline_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.online.lock().unwrap().remove(&user_id);
        Ok(())
    }

    async fn online_users(&self, user_ids: &[Uuid]) -> AppResult<HashSet<Uuid>> {
        self.check()?;
        let online = self.online.lock().unwrap();
        Ok(user_ids
            .iter()
            .filter(|id| online.contains(id))
            .copied()
            .collect())
    }

    async fn refresh(&self, _user_ids: &[Uuid]) -> AppResult<()> {
        self.check()
    }
}

// ---------------------------------------------------------------------------
// Membership
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct StaticMembership {
    members: Mutex<HashMap<Uuid, Vec<ConversationMemberWithUser>>>,
    fail: AtomicBool,
}

impl StaticMembership {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, member: ConversationMemberWithUser) {
        self.members
            .lock()
            .unwrap()
            .entry(member.conversation_id)
            .or_default()
            .push(member);
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl MembershipLookup for StaticMembership {
    async fn get_members(
        &self,
        conversation_id: Uuid,
    ) -> AppResult<Vec<ConversationMemberWithUser>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(AppError::MembershipLookupFailed("db down".into()));
        }
        Ok(self
            .members
            .lock()
            .unwrap()
            .get(&conversation_id)
            .cloned()
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Conversation store
// ---------------------------------------------------------------------------

/// Read, yield, then compare-and-swap on `(last_message_id, updated_at)`,
/// the same shape as the Postgres store without its row lock.
#[derive(Default)]
pub struct InMemoryConversationStore {
    conversations: Mutex<HashMap<Uuid, Conversation>>,
    // message_id -> conversation_id
    messages: Mutex<HashMap<Uuid, Uuid>>,
    forced_conflicts: AtomicUsize,
    pub commits: AtomicUsize,
    pub conflicts: AtomicUsize,
}

impl InMemoryConversationStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert_conversation(&self, conversation: Conversation) {
        self.conversations
            .lock()
            .unwrap()
            .insert(conversation.id, conversation);
    }

    pub fn insert_message(&self, conversation_id: Uuid, message_id: Uuid) {
        self.messages
            .lock()
            .unwrap()
            .insert(message_id, conversation_id);
    }

    pub fn get(&self, conversation_id: Uuid) -> Option<Conversation> {
        self.conversations
            .lock()
            .unwrap()
            .get(&conversation_id)
            .cloned()
    }

    /// The next `n` updates fail as if another writer won the race.
    pub fn force_conflicts(&self, n: usize) {
        self.forced_conflicts.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn update_last_message_id(
        &self,
        conversation_id: Uuid,
        message_id: Uuid,
        policy: PointerPolicy,
    ) -> Result<Conversation, StoreError> {
        let snapshot = self
            .get(conversation_id)
            .filter(|c| c.deleted_at.is_none())
            .ok_or(StoreError::ConversationNotFound(conversation_id))?;

        if self.messages.lock().unwrap().get(&message_id) != Some(&conversation_id) {
            return Err(StoreError::MessageNotInConversation {
                conversation_id,
                message_id,
            });
        }
        if !policy.should_apply(snapshot.last_message_id, message_id) {
            return Ok(snapshot);
        }

        tokio::task::yield_now().await;

        let forced = self
            .forced_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        let mut conversations = self.conversations.lock().unwrap();
        let current = conversations
            .get_mut(&conversation_id)
            .ok_or(StoreError::ConversationNotFound(conversation_id))?;

        if forced
            || current.last_message_id != snapshot.last_message_id
            || current.updated_at != snapshot.updated_at
        {
            self.conflicts.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::ConcurrentUpdateConflict(conversation_id));
        }

        current.last_message_id = Some(message_id);
        current.updated_at = snapshot.updated_at + ChronoDuration::microseconds(1);
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(current.clone())
    }
}

// ---------------------------------------------------------------------------
// Message repository
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryMessageRepository {
    messages: Mutex<Vec<Message>>,
    fail: AtomicBool,
}

impl InMemoryMessageRepository {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn stored(&self) -> Vec<Message> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageRepository for InMemoryMessageRepository {
    async fn create(&self, message: &Message) -> AppResult<Message> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(AppError::Database("insert message: connection reset".into()));
        }
        self.messages.lock().unwrap().push(message.clone());
        Ok(message.clone())
    }
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct StaticSessions {
    tokens: Mutex<HashMap<String, Uuid>>,
}

impl StaticSessions {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, token: &str, user_id: Uuid) {
        self.tokens
            .lock()
            .unwrap()
            .insert(token.to_string(), user_id);
    }
}

#[async_trait]
impl SessionResolver for StaticSessions {
    async fn resolve(&self, token: &str) -> AppResult<Uuid> {
        self.tokens
            .lock()
            .unwrap()
            .get(token)
            .copied()
            .ok_or(AppError::Unauthorized)
    }
}

// ---------------------------------------------------------------------------
// Bus that refuses every publish
// ---------------------------------------------------------------------------

pub struct UnavailableBus;

#[async_trait]
impl EventBus for UnavailableBus {
    async fn publish(&self, _subject: &str, _payload: Vec<u8>) -> BusResult<String> {
        Err(BusError::BrokerUnavailable("connection refused".into()))
    }

    async fn subscribe_exclusive(
        &self,
        _durable: &str,
        _subject: &str,
        _handler: Arc<dyn EventHandler>,
    ) -> BusResult<Subscription> {
        Err(BusError::BrokerUnavailable("connection refused".into()))
    }

    async fn subscribe_competing(
        &self,
        _group: &str,
        _subject: &str,
        _handler: Arc<dyn EventHandler>,
    ) -> BusResult<Subscription> {
        Err(BusError::BrokerUnavailable("connection refused".into()))
    }

    async fn drain(&self) -> BusResult<()> {
        Ok(())
    }
}

/// Accepts everything except subjects under `rejected`, which fail as if that
/// stream's broker node were down.
pub struct PartiallyAvailableBus {
    pub inner: Arc<InMemoryBus>,
    pub rejected: &'static str,
}

#[async_trait]
impl EventBus for PartiallyAvailableBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<String> {
        if subject.starts_with(self.rejected) {
            return Err(BusError::BrokerUnavailable("stream unavailable".into()));
        }
        self.inner.publish(subject, payload).await
    }

    async fn subscribe_exclusive(
        &self,
        durable: &str,
        subject: &str,
        handler: Arc<dyn EventHandler>,
    ) -> BusResult<Subscription> {
        self.inner.subscribe_exclusive(durable, subject, handler).await
    }

    async fn subscribe_competing(
        &self,
        group: &str,
        subject: &str,
        handler: Arc<dyn EventHandler>,
    ) -> BusResult<Subscription> {
        self.inner.subscribe_competing(group, subject, handler).await
    }

    async fn drain(&self) -> BusResult<()> {
        self.inner.drain().await
    }
}
