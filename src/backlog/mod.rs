//! Persistent milestone backlog and its dispatcher.

pub mod dispatcher;
pub mod lock;
pub mod model;
pub mod review;

pub use dispatcher::{BacklogDispatcher, DispatchResult, spawn_dispatch_ticker};
pub use lock::{BacklogLock, PendingClaims};
pub use model::{Milestone, MilestoneState, match_milestone_label, parse_milestones};
pub use review::{CleanOutcome, PreCleanHook, ReviewBacklog, ScriptHook};
