//! `TaskStore` trait: the single writer-of-record for task status.

use async_trait::async_trait;

use crate::config::CapacityConfig;
use crate::error::{AdmissionError, DatabaseError, TaskError};
use crate::worker::state::{NewTask, TaskRecord, TaskStatus};

/// Maximum stored length of a task's result summary, in characters.
pub const SUMMARY_MAX_CHARS: usize = 200;

/// Durable task lifecycle storage.
///
/// Mutating operations propagate storage errors. Reads that only feed
/// logging or capacity displays degrade to an empty value instead.
#[async_trait]
pub trait TaskStore: Send + Sync {
    // ── Lifecycle ───────────────────────────────────────────────────

    /// Release the storage handle. Safe to call more than once.
    async fn close(&self);

    /// Limits enforced by `admit`.
    fn limits(&self) -> &CapacityConfig;

    // ── Mutations ───────────────────────────────────────────────────

    /// Atomically check every applicable capacity limit and insert a
    /// `pending` record.
    async fn admit(&self, task: &NewTask) -> Result<TaskRecord, AdmissionError>;

    /// `pending → running`, stamping `started_at`.
    async fn mark_running(&self, id: &str) -> Result<(), TaskError>;

    /// Move an active task to `completed` or `failed` with a summary
    /// truncated to [`SUMMARY_MAX_CHARS`].
    async fn finalize(&self, id: &str, status: TaskStatus, summary: &str)
    -> Result<(), TaskError>;

    /// Force an active task to `lost`, recording a diagnostic.
    async fn mark_lost(&self, id: &str, diagnostic: &str) -> Result<(), TaskError>;

    /// Withdraw an active task as `cancelled_requeue` and bump its retry count.
    async fn requeue(&self, id: &str) -> Result<(), TaskError>;

    /// Mark every pending/running record lost. Returns how many changed.
    async fn recover_on_startup(&self) -> Result<u64, DatabaseError>;

    // ── Queries ─────────────────────────────────────────────────────

    /// Count of pending + running tasks (0 if storage is unavailable).
    async fn running_count(&self) -> usize;

    /// All pending + running tasks, oldest first (empty if unavailable).
    async fn active(&self) -> Vec<TaskRecord>;

    /// Retry count of a task, 0 when absent.
    async fn retry_count_of(&self, id: &str) -> u32;

    async fn get(&self, id: &str) -> Result<Option<TaskRecord>, DatabaseError>;
}
