pub mod conversation;
pub mod message;

pub use conversation::{direct_lookup_key, Conversation, ConversationType, Participant, Role};
pub use message::{Message, MAX_MESSAGE_SIZE};
