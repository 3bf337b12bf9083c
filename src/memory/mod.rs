//! 记忆层：单会话有界历史 + 按会话 ID 的并发存储

pub mod conversation;
pub mod store;

pub use conversation::{ConversationMemory, Message, Role};
pub use store::ConversationStore;
