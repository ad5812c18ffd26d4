pub mod conversation_store;
pub mod membership;
pub mod message_service;
pub mod message_store;
pub mod presence;
pub mod publisher;
pub mod sessions;
pub mod synchronizer;

pub use conversation_store::{ConversationStore, PgConversationStore, PointerPolicy, StoreError};
pub use membership::{MembershipLookup, PgMembershipLookup};
pub use message_service::MessageService;
pub use message_store::{MessageRepository, PgMessageRepository};
pub use presence::{PresenceStore, RedisPresenceStore};
pub use publisher::MessagePublisher;
pub use sessions::{CachedSessionResolver, SessionResolver};
pub use synchronizer::ConversationSynchronizer;
