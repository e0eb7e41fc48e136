//! Bounded, per-conversation message windows.
//!
//! Every conversation id owns its own async mutex, created lazily the first time the id is
//! seen. Requests on the same id queue on that mutex in arrival order while unrelated ids
//! never contend on anything but a map shard for the instant it takes to look up the slot.
pub mod conversation;
pub mod store;

pub use conversation::{Conversation, ConversationGuard, ConversationMemory};
pub use store::{ConversationStore, InMemoryStore};
