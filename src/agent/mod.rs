//! Conversational side: sessions, consolidation and message handling.

pub mod consolidation;
pub mod conversation;
pub mod session;

pub use consolidation::{ConsolidationScheduler, Consolidator, LlmConsolidator};
pub use conversation::Conversation;
pub use session::{Session, SessionManager};
