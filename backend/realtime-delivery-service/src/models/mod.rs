pub mod conversation;
pub mod events;
pub mod message;

pub use conversation::{Conversation, ConversationMember, ConversationMemberWithUser, ConversationType};
pub use events::UpdateLastMessageId;
pub use message::{Message, MessageType, SendMessageRequest};
