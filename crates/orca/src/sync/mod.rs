//! Conversation synchronization.
//!
//! One monitor per running workspace polls the IDE's agent panel through the
//! evaluation transport and broadcasts an update only when the content
//! actually changed. A cheap probe script gates the expensive full
//! extraction, and item growth is shipped as an append-only suffix instead
//! of a full re-send.

mod monitor;
mod scripts;
mod snapshot;

pub use monitor::{MonitorConfig, MonitorRegistry};
pub use snapshot::{
    ConversationItem, ConversationSnapshot, ConversationUpdate, plan_update, value_hash,
};
