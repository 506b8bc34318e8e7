//! Pre-clean hooks run before each dispatch cycle.
//!
//! A hook never fails the cycle. Its outcome is reported as a value and the
//! dispatcher only logs it.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs;
use tokio::process::Command;

use crate::backlog::lock::{BacklogLock, PendingClaims};
use crate::backlog::model::{
    MilestoneState, NO_BLOCKER, completed_numbers, match_milestone_label, parse_milestones,
};
use crate::store::TaskStore;

/// What a pre-clean pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanOutcome {
    Cleaned {
        blockers_cleared: usize,
        orphans_reset: usize,
    },
    Skipped(String),
    Failed(String),
}

#[async_trait]
pub trait PreCleanHook: Send + Sync {
    async fn run(&self) -> CleanOutcome;
}

/// Result of reviewing backlog text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Review {
    pub content: String,
    pub blockers_cleared: usize,
    pub orphans_reset: usize,
}

impl Review {
    pub fn changed(&self) -> bool {
        self.blockers_cleared + self.orphans_reset > 0
    }
}

/// Clear blockers that point at finished milestones and reset `[~]` markers
/// no active task is working on.
pub fn review_content(content: &str, active_labels: &[String]) -> Review {
    let milestones = parse_milestones(content);
    let done = completed_numbers(&milestones);
    let mut lines: Vec<String> = content.split_inclusive('\n').map(str::to_string).collect();
    let mut blockers_cleared = 0;
    let mut orphans_reset = 0;

    for m in &milestones {
        if m.state == MilestoneState::Todo
            && m.blocker != NO_BLOCKER
            && done.contains(m.blocker.as_str())
            && let Some(idx) = m.blocker_line
        {
            lines[idx] = lines[idx].replacen(
                &format!("Blocker: {}", m.blocker),
                &format!("Blocker: {NO_BLOCKER}"),
                1,
            );
            blockers_cleared += 1;
        }

        if m.state == MilestoneState::InProgress
            && !active_labels
                .iter()
                .any(|label| match_milestone_label(label, &m.number))
        {
            lines[m.line] = lines[m.line].replacen(
                &MilestoneState::InProgress.line_prefix(&m.number),
                &MilestoneState::Todo.line_prefix(&m.number),
                1,
            );
            orphans_reset += 1;
        }
    }

    Review {
        content: lines.concat(),
        blockers_cleared,
        orphans_reset,
    }
}

/// Built-in review pass over the backlog file, done under the backlog lock.
pub struct ReviewBacklog {
    backlog_path: PathBuf,
    lock_path: PathBuf,
    store: Arc<dyn TaskStore>,
}

impl ReviewBacklog {
    pub fn new(
        backlog_path: impl Into<PathBuf>,
        lock_path: impl Into<PathBuf>,
        store: Arc<dyn TaskStore>,
    ) -> Self {
        Self {
            backlog_path: backlog_path.into(),
            lock_path: lock_path.into(),
            store,
        }
    }
}

#[async_trait]
impl PreCleanHook for ReviewBacklog {
    async fn run(&self) -> CleanOutcome {
        let lock = match BacklogLock::acquire(&self.lock_path).await {
            Ok(lock) => lock,
            Err(e) => return CleanOutcome::Failed(e.to_string()),
        };

        // Under the lock every `[~]` a dispatcher wrote is claimed, stored,
        // or both.
        let claimed = match PendingClaims::beside(&self.lock_path).numbers(&lock).await {
            Ok(claimed) => claimed,
            Err(e) => return CleanOutcome::Failed(format!("read claims: {e}")),
        };
        let mut active_labels: Vec<String> = self
            .store
            .active()
            .await
            .into_iter()
            .map(|t| t.label)
            .collect();
        active_labels.extend(claimed);

        let content = match fs::read_to_string(&self.backlog_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return CleanOutcome::Skipped(format!(
                    "backlog not found at {}",
                    self.backlog_path.display()
                ));
            }
            Err(e) => return CleanOutcome::Failed(format!("read backlog: {e}")),
        };

        let review = review_content(&content, &active_labels);
        if review.changed()
            && let Err(e) = fs::write(&self.backlog_path, &review.content).await
        {
            return CleanOutcome::Failed(format!("write backlog: {e}"));
        }

        CleanOutcome::Cleaned {
            blockers_cleared: review.blockers_cleared,
            orphans_reset: review.orphans_reset,
        }
    }
}

/// Runs an external review script.
///
/// The script is expected to print `Blockers cleared: N` and
/// `Orphaned [~] markers reset: N`; missing counts read as zero.
pub struct ScriptHook {
    script: PathBuf,
    timeout: Duration,
}

impl ScriptHook {
    pub fn new(script: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            script: script.into(),
            timeout,
        }
    }
}

#[async_trait]
impl PreCleanHook for ScriptHook {
    async fn run(&self) -> CleanOutcome {
        if !self.script.exists() {
            return CleanOutcome::Skipped(format!(
                "review script not found at {}",
                self.script.display()
            ));
        }

        let child = Command::new(&self.script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, child).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return CleanOutcome::Failed(format!("failed to run review script: {e}")),
            Err(_) => {
                return CleanOutcome::Failed(format!(
                    "review script timed out after {}s",
                    self.timeout.as_secs()
                ));
            }
        };

        if !output.status.success() {
            return CleanOutcome::Failed(format!(
                "review script exited {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        CleanOutcome::Cleaned {
            blockers_cleared: count_after(&stdout, "Blockers cleared:"),
            orphans_reset: count_after(&stdout, "Orphaned [~] markers reset:"),
        }
    }
}

fn count_after(output: &str, prefix: &str) -> usize {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix(prefix))
        .and_then(|n| n.trim().parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CapacityConfig;
    use crate::store::LibSqlTaskStore;
    use crate::worker::state::{NewTask, TaskOrigin};

    const BACKLOG: &str = "\
- [x] 1.1 Done thing
- [ ] 1.2 Waiting
  Blocker: 1.1
- [ ] 1.3 Still waiting
  Blocker: 1.2
- [~] 2.1 Orphaned
- [~] 2.2 Running
";

    #[test]
    fn clears_resolved_blockers_and_orphans() {
        let review = review_content(BACKLOG, &["2.2".to_string(), "21.1".to_string()]);
        assert_eq!(review.blockers_cleared, 1);
        assert_eq!(review.orphans_reset, 1);
        assert!(review.content.contains("- [ ] 1.2 Waiting\n  Blocker: none\n"));
        assert!(review.content.contains("  Blocker: 1.2\n"));
        assert!(review.content.contains("- [ ] 2.1 Orphaned\n"));
        assert!(review.content.contains("- [~] 2.2 Running\n"));
    }

    #[test]
    fn review_is_idempotent() {
        let labels = vec!["2.2".to_string()];
        let first = review_content(BACKLOG, &labels);
        let second = review_content(&first.content, &labels);
        assert!(!second.changed());
        assert_eq!(second.content, first.content);
    }

    #[tokio::test]
    async fn built_in_hook_uses_active_task_labels() {
        let dir = tempfile::tempdir().unwrap();
        let backlog = dir.path().join("BACKLOG.md");
        std::fs::write(&backlog, BACKLOG).unwrap();

        let store = Arc::new(
            LibSqlTaskStore::open_memory(CapacityConfig::default())
                .await
                .unwrap(),
        );
        store
            .admit(&NewTask::new("t1", "2.1", TaskOrigin::Scheduled))
            .await
            .unwrap();

        let hook = ReviewBacklog::new(&backlog, dir.path().join(".backlog.lock"), store);
        assert_eq!(
            hook.run().await,
            CleanOutcome::Cleaned {
                blockers_cleared: 1,
                orphans_reset: 1
            }
        );
        let content = std::fs::read_to_string(&backlog).unwrap();
        assert!(content.contains("- [~] 2.1 Orphaned"));
        assert!(content.contains("- [ ] 2.2 Running"));
    }

    #[tokio::test]
    async fn claimed_marker_is_not_an_orphan() {
        let dir = tempfile::tempdir().unwrap();
        let backlog = dir.path().join("BACKLOG.md");
        let lock_path = dir.path().join(".backlog.lock");
        std::fs::write(&backlog, "- [~] 2.1 Spawning\n- [~] 2.2 Abandoned\n").unwrap();
        {
            let lock = BacklogLock::acquire(&lock_path).await.unwrap();
            PendingClaims::beside(&lock_path).claim(&lock, "2.1").await.unwrap();
        }

        let store = Arc::new(
            LibSqlTaskStore::open_memory(CapacityConfig::default())
                .await
                .unwrap(),
        );
        let hook = ReviewBacklog::new(&backlog, &lock_path, store);
        assert_eq!(
            hook.run().await,
            CleanOutcome::Cleaned {
                blockers_cleared: 0,
                orphans_reset: 1
            }
        );
        assert_eq!(
            std::fs::read_to_string(&backlog).unwrap(),
            "- [~] 2.1 Spawning\n- [ ] 2.2 Abandoned\n"
        );
    }

    #[tokio::test]
    async fn missing_backlog_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            LibSqlTaskStore::open_memory(CapacityConfig::default())
                .await
                .unwrap(),
        );
        let hook = ReviewBacklog::new(
            dir.path().join("BACKLOG.md"),
            dir.path().join(".backlog.lock"),
            store,
        );
        assert!(matches!(hook.run().await, CleanOutcome::Skipped(_)));
    }

    #[tokio::test]
    async fn missing_script_is_skipped() {
        let hook = ScriptHook::new("/nonexistent/review_backlog", Duration::from_secs(1));
        assert!(matches!(hook.run().await, CleanOutcome::Skipped(_)));
    }

    #[test]
    fn parses_script_counts() {
        let out = "Blockers cleared: 2\nOrphaned [~] markers reset: 1\n";
        assert_eq!(count_after(out, "Blockers cleared:"), 2);
        assert_eq!(count_after(out, "Orphaned [~] markers reset:"), 1);
        assert_eq!(count_after("", "Blockers cleared:"), 0);
    }
}
