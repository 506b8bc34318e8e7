//! Task state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a subagent task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Admitted, execution not yet started.
    Pending,
    /// Execution has made its first model call.
    Running,
    Completed,
    Failed,
    /// Abandoned: the owning execution unit no longer exists.
    Lost,
    /// Withdrawn so it can be scheduled again later.
    CancelledRequeue,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        Self::Pending,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Lost,
        Self::CancelledRequeue,
    ];

    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Pending, Running)
                | (Pending | Running, Completed)
                | (Pending | Running, Failed)
                | (Pending | Running, Lost)
                | (Pending | Running, CancelledRequeue)
        )
    }

    /// Every state from which `target` can be reached.
    pub fn sources_of(target: TaskStatus) -> Vec<TaskStatus> {
        Self::ALL
            .into_iter()
            .filter(|from| from.can_transition_to(target))
            .collect()
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    /// Pending and running tasks hold a capacity slot.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Lost => "lost",
            Self::CancelledRequeue => "cancelled_requeue",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "lost" => Ok(Self::Lost),
            "cancelled_requeue" => Ok(Self::CancelledRequeue),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Who asked for the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOrigin {
    /// Spawned from a conversation.
    User,
    /// Spawned by the backlog dispatcher or another timer.
    Scheduled,
}

impl TaskOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Scheduled => "scheduled",
        }
    }
}

impl std::fmt::Display for TaskOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskOrigin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            // Rows written by older schedulers used "cron".
            "scheduled" | "cron" => Ok(Self::Scheduled),
            other => Err(format!("unknown task origin: {other}")),
        }
    }
}

/// Request to admit a new task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub id: String,
    pub label: String,
    pub origin: TaskOrigin,
    /// Capacity class (the model servicing the task), if any.
    pub class: Option<String>,
}

impl NewTask {
    pub fn new(id: impl Into<String>, label: impl Into<String>, origin: TaskOrigin) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            origin,
            class: None,
        }
    }

    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.class = Some(class.into());
        self
    }
}

/// Durable record of one subagent task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub label: String,
    pub origin: TaskOrigin,
    pub class: Option<String>,
    pub status: TaskStatus,
    pub spawned_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub result_summary: Option<String>,
    pub stack_frame: Option<String>,
}

impl TaskRecord {
    /// Time since the task last changed phase: start time when running,
    /// spawn time otherwise.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        let since = match (self.status, self.started_at) {
            (TaskStatus::Running, Some(started)) => started,
            _ => self.spawned_at,
        };
        now - since
    }
}
