//! Timeout reaper.
//!
//! Sweeps active task records and retires the ones whose execution unit is
//! gone or stuck. The handle is aborted before the record is rewritten, so a
//! unit that wakes up late finds a terminal record and drops its result.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::worker::runtime::SubagentRuntime;
use crate::worker::state::{TaskOrigin, TaskRecord, TaskStatus};

/// What one sweep did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReapReport {
    pub requeued: Vec<String>,
    pub lost: Vec<String>,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.lost.is_empty()
    }
}

/// Run one sweep as of `now`.
pub async fn reap_once(runtime: &SubagentRuntime, now: DateTime<Utc>) -> ReapReport {
    let config = runtime.config();
    let store = runtime.store();
    let mut report = ReapReport::default();

    for task in store.active().await {
        let elapsed = task.age(now).to_std().unwrap_or_default();
        match task.status {
            TaskStatus::Pending if elapsed > config.pending_timeout => {
                runtime.abort(&task.id).await;
                let retries = store.retry_count_of(&task.id).await;
                if task.origin == TaskOrigin::Scheduled && retries < config.max_retry_count {
                    match store.requeue(&task.id).await {
                        Ok(()) => {
                            info!(task_id = %task.id, label = %task.label, retries, "Requeued stale scheduled task");
                            report.requeued.push(task.id);
                        }
                        Err(e) => warn!(task_id = %task.id, "Requeue failed: {}", e),
                    }
                } else {
                    let diagnostic = format!(
                        "pending for {}s without starting (retries: {retries})",
                        elapsed.as_secs()
                    );
                    if retire(runtime, &task, &diagnostic).await {
                        report.lost.push(task.id);
                    }
                }
            }
            TaskStatus::Running if elapsed > config.execution_timeout => {
                runtime.abort(&task.id).await;
                let diagnostic = format!(
                    "execution exceeded {}s (ran {}s)",
                    config.execution_timeout.as_secs(),
                    elapsed.as_secs()
                );
                if retire(runtime, &task, &diagnostic).await {
                    report.lost.push(task.id);
                }
            }
            _ => {}
        }
    }

    report
}

/// Start the periodic sweep.
pub fn spawn_reaper(runtime: Arc<SubagentRuntime>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; startup recovery already covered it.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let report = reap_once(&runtime, Utc::now()).await;
            if !report.is_empty() {
                debug!(
                    requeued = report.requeued.len(),
                    lost = report.lost.len(),
                    "Reaper sweep finished"
                );
            }
        }
    })
}

async fn retire(runtime: &SubagentRuntime, task: &TaskRecord, diagnostic: &str) -> bool {
    match runtime.store().mark_lost(&task.id, diagnostic).await {
        Ok(()) => {
            error!(
                task_id = %task.id,
                label = %task.label,
                origin = %task.origin,
                "Subagent marked lost: {}",
                diagnostic
            );
            true
        }
        Err(e) => {
            warn!(task_id = %task.id, "mark_lost failed: {}", e);
            false
        }
    }
}
