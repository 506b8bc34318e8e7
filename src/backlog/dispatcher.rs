//! Backlog dispatcher: one milestone per cycle, safe against concurrent cycles.
//!
//! The backlog lock is held only for "read, select, flip to `[~]`, write"
//! and for rollbacks. It is never held across `spawn`. Until the spawn
//! settles the milestone stays in `PendingClaims`, so a review pass in any
//! process does not take its `[~]` for an orphan.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use tokio::fs;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backlog::lock::{BacklogLock, PendingClaims};
use crate::backlog::model::{Milestone, MilestoneState, find_eligible, parse_milestones, set_marker};
use crate::backlog::review::{CleanOutcome, PreCleanHook};
use crate::config::DispatchConfig;
use crate::error::BacklogError;
use crate::tools::ToolContext;
use crate::worker::runtime::{SpawnRequest, SubagentRuntime};
use crate::worker::state::TaskOrigin;

/// Outcome of a cycle that selected a milestone.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchResult {
    pub milestone_num: String,
    pub label: String,
    pub task_brief: String,
    /// The runtime's reply, `Error: ...` when the spawn was refused.
    pub spawn_result: String,
    pub dispatched: bool,
}

pub struct BacklogDispatcher {
    backlog_path: PathBuf,
    lock_path: PathBuf,
    hook: Option<Arc<dyn PreCleanHook>>,
    model: Option<String>,
    reply_to: ToolContext,
    claims: PendingClaims,
}

impl BacklogDispatcher {
    pub fn new(backlog_path: impl Into<PathBuf>, lock_path: impl Into<PathBuf>) -> Self {
        let lock_path = lock_path.into();
        Self {
            backlog_path: backlog_path.into(),
            claims: PendingClaims::beside(&lock_path),
            lock_path,
            hook: None,
            model: None,
            reply_to: ToolContext::default(),
        }
    }

    pub fn from_config(config: &DispatchConfig) -> Self {
        Self::new(&config.backlog_path, &config.lock_path)
            .with_model(config.model.clone())
            .reply_to(ToolContext::new(&config.notify_channel, &config.notify_chat_id))
    }

    pub fn with_hook(mut self, hook: Arc<dyn PreCleanHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn reply_to(mut self, ctx: ToolContext) -> Self {
        self.reply_to = ctx;
        self
    }

    pub fn backlog_path(&self) -> &Path {
        &self.backlog_path
    }

    /// Run one dispatch cycle.
    ///
    /// `Ok(None)` means nothing was selected (no capacity, no eligible
    /// milestone, or no backlog). Lock and IO failures propagate without the
    /// backlog having been modified.
    pub async fn dispatch_next(
        &self,
        runtime: &SubagentRuntime,
    ) -> Result<Option<DispatchResult>, BacklogError> {
        self.pre_clean().await;

        let admission = runtime.admission();
        if !admission.has_capacity().await {
            let running = admission.running_count().await;
            info!(
                running = running,
                capacity = admission.capacity(),
                "Dispatch: at capacity, skipping"
            );
            return Ok(None);
        }

        let Some(milestone) = self.select_and_mark().await? else {
            info!("Dispatch: no ready milestones");
            return Ok(None);
        };

        let task_brief = milestone.task_brief(&self.backlog_path);
        let request = SpawnRequest::new(task_brief.clone(), TaskOrigin::Scheduled)
            .with_label(milestone.number.clone())
            .with_model(self.model.clone())
            .reply_to(self.reply_to.clone());
        let outcome = runtime.spawn(request).await;
        let dispatched = outcome.is_started();

        if dispatched {
            info!(milestone = %milestone.number, "Dispatch: milestone handed to subagent");
            if let Err(e) = self.release_claim(&milestone.number).await {
                warn!(milestone = %milestone.number, "Dispatch: claim release failed: {}", e);
            }
        } else {
            warn!(milestone = %milestone.number, "Dispatch: spawn refused: {}", outcome);
            if let Err(e) = self.rollback(&milestone.number).await {
                error!(milestone = %milestone.number, "Dispatch: rollback failed: {}", e);
            }
        }

        Ok(Some(DispatchResult {
            label: milestone.number.clone(),
            milestone_num: milestone.number,
            task_brief,
            spawn_result: outcome.to_string(),
            dispatched,
        }))
    }

    /// Flip `[~]` back to `[ ]` for `number` and drop its claim. Returns
    /// whether a marker was found.
    pub async fn rollback(&self, number: &str) -> Result<bool, BacklogError> {
        let lock = BacklogLock::acquire(&self.lock_path).await?;
        if let Err(e) = self.claims.release(&lock, number).await {
            warn!(milestone = %number, "Failed to drop claim during rollback: {}", e);
        }

        let content = match fs::read_to_string(&self.backlog_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(milestone = %number, "Backlog missing, cannot roll back");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        match set_marker(&content, number, MilestoneState::InProgress, MilestoneState::Todo) {
            Some(updated) => {
                fs::write(&self.backlog_path, updated).await?;
                info!(milestone = %number, "Rolled back milestone marker to [ ]");
                Ok(true)
            }
            None => {
                warn!(milestone = %number, "No [~] marker found, nothing to roll back");
                Ok(false)
            }
        }
    }

    /// The task row now exists, so the store speaks for the marker.
    async fn release_claim(&self, number: &str) -> Result<(), BacklogError> {
        let lock = BacklogLock::acquire(&self.lock_path).await?;
        self.claims.release(&lock, number).await
    }

    async fn pre_clean(&self) {
        let Some(hook) = &self.hook else {
            return;
        };
        match hook.run().await {
            CleanOutcome::Cleaned {
                blockers_cleared,
                orphans_reset,
            } => debug!(blockers_cleared, orphans_reset, "Backlog pre-clean done"),
            CleanOutcome::Skipped(reason) => debug!("Backlog pre-clean skipped: {}", reason),
            CleanOutcome::Failed(reason) => warn!("Backlog pre-clean failed: {}", reason),
        }
    }

    /// Under the lock: pick the first eligible milestone, claim it and
    /// persist `[~]`.
    async fn select_and_mark(&self) -> Result<Option<Milestone>, BacklogError> {
        let lock = BacklogLock::acquire(&self.lock_path).await?;

        let content = match fs::read_to_string(&self.backlog_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %self.backlog_path.display(), "Backlog not found");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let milestones = parse_milestones(&content);
        let Some(milestone) = find_eligible(&milestones).cloned() else {
            return Ok(None);
        };
        let Some(updated) = set_marker(
            &content,
            &milestone.number,
            MilestoneState::Todo,
            MilestoneState::InProgress,
        ) else {
            warn!(milestone = %milestone.number, "Selected milestone has no [ ] marker");
            return Ok(None);
        };

        self.claims.claim(&lock, &milestone.number).await?;
        fs::write(&self.backlog_path, updated).await?;
        info!(milestone = %milestone.number, "Dispatch: marked milestone [~]");
        Ok(Some(milestone))
    }
}

/// Run `dispatch_next` on a cron schedule, and again whenever a subagent
/// finishes and frees a slot.
pub fn spawn_dispatch_ticker(
    dispatcher: Arc<BacklogDispatcher>,
    runtime: Arc<SubagentRuntime>,
    schedule: &str,
) -> Result<JoinHandle<()>, BacklogError> {
    let schedule = cron::Schedule::from_str(schedule).map_err(|e| BacklogError::Schedule {
        schedule: schedule.to_string(),
        reason: e.to_string(),
    })?;
    let completed = runtime.completion_signal();

    Ok(tokio::spawn(async move {
        loop {
            let Some(next) = schedule.upcoming(Utc).next() else {
                warn!("Dispatch schedule has no upcoming fire time, ticker stopped");
                return;
            };
            let wait = (next - Utc::now()).to_std().unwrap_or_default();

            tokio::select! {
                _ = tokio::time::sleep(wait) => debug!("Dispatch tick"),
                _ = completed.notified() => debug!("Subagent finished, dispatching"),
            }

            match dispatcher.dispatch_next(&runtime).await {
                Ok(Some(result)) if result.dispatched => {
                    info!(milestone = %result.milestone_num, "Dispatched milestone");
                }
                Ok(Some(result)) => {
                    info!(milestone = %result.milestone_num, "Dispatch refused: {}", result.spawn_result);
                }
                Ok(None) => {}
                Err(e) => error!("Dispatch cycle failed: {}", e),
            }
        }
    }))
}
