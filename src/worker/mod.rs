//! Subagent execution.
//!
//! - `state`: task status machine and records
//! - `admission`: the single path by which task records are created
//! - `runtime`: background execution with always-finalize
//! - `narrative`: summary normalization for chat replies
//! - `reaper`: retires stale pending/running tasks

pub mod admission;
pub mod narrative;
pub mod reaper;
pub mod runtime;
pub mod state;

pub use admission::AdmissionController;
pub use narrative::extract_narrative;
pub use reaper::{ReapReport, reap_once, spawn_reaper};
pub use runtime::{SpawnOutcome, SpawnRequest, SubagentRuntime};
pub use state::{NewTask, TaskOrigin, TaskRecord, TaskStatus};
