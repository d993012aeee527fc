//! Conversation history and its persistence.

pub mod history;
pub mod store;

pub use history::HistoryStore;
pub use store::{MemoryStateStore, RedbStateStore, StateStore};
