//! Dispatcher + runtime + store, end to end.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::json;
use tempfile::TempDir;

use ai_dispatch::backlog::{BacklogDispatcher, ReviewBacklog, spawn_dispatch_ticker};
use ai_dispatch::channels::{Announcer, InboundMessage};
use ai_dispatch::config::{CapacityConfig, SubagentConfig};
use ai_dispatch::error::{BacklogError, ChannelError, LlmError, ToolError};
use ai_dispatch::llm::{
    ChatRequest, ChatResponse, FinishReason, LlmProvider, ModelRouter, ToolCall,
};
use ai_dispatch::store::{LibSqlTaskStore, TaskStore};
use ai_dispatch::tools::builtin::EditFileTool;
use ai_dispatch::tools::{Tool, ToolContext, ToolRegistry};
use ai_dispatch::worker::{
    AdmissionController, SpawnRequest, SubagentRuntime, TaskOrigin, TaskStatus,
};

// ── Stubs ───────────────────────────────────────────────────────────

#[derive(Default)]
struct ScriptedLlm {
    replies: Mutex<VecDeque<ChatResponse>>,
    models: Vec<String>,
    /// Holds the spawn between the `[~]` write and admission.
    list_delay: Duration,
}

impl ScriptedLlm {
    fn replying(replies: Vec<ChatResponse>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    fn name(&self) -> &str {
        "scripted"
    }
    fn model_name(&self) -> &str {
        "local-model"
    }
    async fn chat(&self, _request: ChatRequest) -> Result<ChatResponse, LlmError> {
        let next = self.replies.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| ChatResponse::text("Done.")))
    }
    async fn list_available_models(&self) -> Result<Vec<String>, LlmError> {
        tokio::time::sleep(self.list_delay).await;
        Ok(self.models.clone())
    }
}

#[derive(Default)]
struct Inbox(Mutex<Vec<InboundMessage>>);

#[async_trait]
impl Announcer for Inbox {
    async fn publish(&self, message: InboundMessage) -> Result<(), ChannelError> {
        self.0.lock().unwrap().push(message);
        Ok(())
    }
}

struct PanickingTool;

#[async_trait]
impl Tool for PanickingTool {
    fn name(&self) -> &str {
        "boom"
    }
    fn description(&self) -> &str {
        "Always panics"
    }
    fn parameters_schema(&self) -> serde_json::Value {
        json!({"type": "object"})
    }
    async fn execute(
        &self,
        _params: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<String, ToolError> {
        panic!("tool blew up")
    }
}

fn tool_call(name: &str, arguments: serde_json::Value) -> ChatResponse {
    ChatResponse {
        content: None,
        tool_calls: vec![ToolCall {
            id: format!("call-{name}"),
            name: name.to_string(),
            arguments,
        }],
        finish_reason: FinishReason::ToolUse,
    }
}

// ── Fixture ─────────────────────────────────────────────────────────

struct Fixture {
    dir: TempDir,
    store: Arc<dyn TaskStore>,
    runtime: Arc<SubagentRuntime>,
    inbox: Arc<Inbox>,
}

impl Fixture {
    async fn new(limits: CapacityConfig, llm: ScriptedLlm) -> Self {
        Self::build(limits, |_| llm).await
    }

    /// `script` sees the backlog path, so replies can point tools at it.
    async fn build(limits: CapacityConfig, script: impl FnOnce(&Path) -> ScriptedLlm) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn TaskStore> = Arc::new(
            LibSqlTaskStore::open(&dir.path().join("subagents.db"), limits)
                .await
                .unwrap(),
        );
        let tools = Arc::new(ToolRegistry::new());
        tools.register_sync(Arc::new(EditFileTool::new(dir.path())));
        tools.register_sync(Arc::new(PanickingTool));
        let inbox = Arc::new(Inbox::default());
        let llm = script(&dir.path().join("memory").join("BACKLOG.md"));

        let runtime = Arc::new(SubagentRuntime::new(
            AdmissionController::new(Arc::clone(&store)),
            Arc::new(ModelRouter::new(Arc::new(llm))),
            tools,
            inbox.clone(),
            SubagentConfig::default(),
        ));
        Self {
            dir,
            store,
            runtime,
            inbox,
        }
    }

    fn backlog(&self) -> PathBuf {
        self.dir.path().join("memory").join("BACKLOG.md")
    }

    fn write_backlog(&self, content: &str) {
        std::fs::create_dir_all(self.dir.path().join("memory")).unwrap();
        std::fs::write(self.backlog(), content).unwrap();
    }

    fn read_backlog(&self) -> String {
        std::fs::read_to_string(self.backlog()).unwrap()
    }

    fn lock_path(&self) -> PathBuf {
        self.dir.path().join("memory/.backlog.lock")
    }

    fn dispatcher(&self) -> BacklogDispatcher {
        BacklogDispatcher::new(self.backlog(), self.lock_path())
    }

    /// A dispatcher with the built-in review pass, wired as the binary does.
    fn reviewing_dispatcher(&self) -> BacklogDispatcher {
        let hook = ReviewBacklog::new(self.backlog(), self.lock_path(), Arc::clone(&self.store));
        self.dispatcher().with_hook(Arc::new(hook))
    }

    async fn settle(&self) {
        for _ in 0..300 {
            if self.runtime.in_flight().await == 0 && self.store.running_count().await == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("subagents never settled");
    }
}

fn limits(max: usize) -> CapacityConfig {
    CapacityConfig {
        max_concurrent: max,
        per_class: HashMap::new(),
    }
}

// ── Scenarios ───────────────────────────────────────────────────────

#[tokio::test]
async fn dispatch_marks_first_ready_milestone_in_progress() {
    let fx = Fixture::new(limits(3), ScriptedLlm::default()).await;
    fx.write_backlog("## Phase 1\n- [ ] 1.1 Add tests\n  Criterion: tests pass\n  Blocker: none\n");

    let result = fx
        .dispatcher()
        .dispatch_next(&fx.runtime)
        .await
        .unwrap()
        .expect("a milestone is ready");

    assert_eq!(result.milestone_num, "1.1");
    assert_eq!(result.label, "1.1");
    assert!(result.dispatched);
    assert!(result.spawn_result.starts_with("Subagent [1.1] started"));
    assert!(result.task_brief.contains("change `- [~] 1.1 ` to `- [x] 1.1 `"));
    assert!(fx.read_backlog().contains("- [~] 1.1 Add tests"));

    fx.settle().await;
    assert!(fx.store.active().await.is_empty());
}

#[tokio::test]
async fn blocked_milestone_is_not_dispatched() {
    let fx = Fixture::new(limits(3), ScriptedLlm::default()).await;
    let content = "- [ ] 2.1 X\n  Blocker: 1.1\n";
    fx.write_backlog(content);

    let result = fx.dispatcher().dispatch_next(&fx.runtime).await.unwrap();
    assert!(result.is_none());
    assert_eq!(fx.read_backlog(), content);
    assert_eq!(fx.store.running_count().await, 0);
}

#[tokio::test]
async fn full_capacity_skips_without_touching_backlog() {
    let fx = Fixture::new(limits(1), ScriptedLlm::default()).await;
    let content = "- [ ] 1.1 X\n  Blocker: none\n";
    fx.write_backlog(content);
    fx.store
        .admit(&ai_dispatch::worker::NewTask::new("busy", "other", TaskOrigin::User))
        .await
        .unwrap();

    assert!(fx.dispatcher().dispatch_next(&fx.runtime).await.unwrap().is_none());
    assert_eq!(fx.read_backlog(), content);
}

#[tokio::test]
async fn class_capacity_refusal_rolls_back_marker() {
    let mut per_class = HashMap::new();
    per_class.insert("local-model".to_string(), 0);
    let fx = Fixture::new(
        CapacityConfig {
            max_concurrent: 3,
            per_class,
        },
        ScriptedLlm::default(),
    )
    .await;
    fx.write_backlog("- [ ] 1.1 X\n  Blocker: none\n- [ ] 1.2 Y\n");

    let result = fx
        .dispatcher()
        .dispatch_next(&fx.runtime)
        .await
        .unwrap()
        .unwrap();

    assert!(!result.dispatched);
    assert!(result.spawn_result.starts_with("Error:"));
    assert!(result.spawn_result.contains("capacity"));
    assert_eq!(fx.read_backlog(), "- [ ] 1.1 X\n  Blocker: none\n- [ ] 1.2 Y\n");
    assert!(fx.store.active().await.is_empty());
}

#[tokio::test]
async fn invalid_model_rolls_back_marker() {
    let llm = ScriptedLlm {
        models: vec!["qwen3-coder-next".to_string()],
        ..Default::default()
    };
    let fx = Fixture::new(limits(3), llm).await;
    fx.write_backlog("- [ ] 3.1 Z\n");

    let result = fx
        .dispatcher()
        .with_model(Some("missing-model".into()))
        .dispatch_next(&fx.runtime)
        .await
        .unwrap()
        .unwrap();

    assert!(!result.dispatched);
    assert!(result.spawn_result.contains("qwen3-coder-next"));
    assert_eq!(fx.read_backlog(), "- [ ] 3.1 Z\n");
}

#[tokio::test]
async fn concurrent_dispatches_never_share_a_milestone() {
    let fx = Fixture::new(limits(10), ScriptedLlm::default()).await;
    let backlog: String = (1..=6).map(|i| format!("- [ ] 5.{i} Task {i}\n")).collect();
    fx.write_backlog(&backlog);

    // Separate dispatcher instances, as separate processes would have.
    let dispatchers: Vec<BacklogDispatcher> = (0..4).map(|_| fx.dispatcher()).collect();
    let results = join_all(dispatchers.iter().map(|d| d.dispatch_next(&fx.runtime))).await;

    let picked: Vec<String> = results
        .into_iter()
        .map(|r| r.unwrap().unwrap().milestone_num)
        .collect();
    let unique: HashSet<&String> = picked.iter().collect();
    assert_eq!(picked.len(), 4);
    assert_eq!(unique.len(), 4);
    assert_eq!(fx.read_backlog().matches("- [~] ").count(), 4);

    fx.settle().await;
}

#[tokio::test]
async fn review_pass_spares_a_marker_whose_spawn_is_in_flight() {
    let llm = ScriptedLlm {
        models: vec!["local-model".to_string()],
        list_delay: Duration::from_millis(300),
        ..Default::default()
    };
    let fx = Fixture::new(limits(10), llm).await;
    fx.write_backlog("- [ ] 5.1 Only task\n  Blocker: none\n");

    let first = fx.reviewing_dispatcher().with_model(Some("local-model".into()));
    let second = fx.reviewing_dispatcher().with_model(Some("local-model".into()));

    // The second cycle starts while the first is still validating its model.
    let (first, second) = tokio::join!(first.dispatch_next(&fx.runtime), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        second.dispatch_next(&fx.runtime).await
    });

    let first = first.unwrap().expect("first cycle selects 5.1");
    assert_eq!(first.milestone_num, "5.1");
    assert!(first.dispatched);
    assert!(second.unwrap().is_none());
    assert_eq!(fx.read_backlog().matches("- [~] ").count(), 1);
    assert!(!fx.lock_path().with_extension("claims").exists());

    fx.settle().await;
    let inbox = fx.inbox.0.lock().unwrap();
    assert_eq!(
        inbox
            .iter()
            .filter(|m| m.content.contains("[Subagent '5.1'"))
            .count(),
        1
    );
}

#[tokio::test]
async fn subagent_completes_milestone_and_unblocks_the_next() {
    let fx = Fixture::build(limits(3), |backlog| {
        ScriptedLlm::replying(vec![
            tool_call(
                "edit_file",
                json!({
                    "path": backlog.to_string_lossy(),
                    "old_text": "- [~] 1.1 ",
                    "new_text": "- [x] 1.1 "
                }),
            ),
            ChatResponse::text("Milestone 1.1 finished."),
        ])
    })
    .await;
    fx.write_backlog("- [ ] 1.1 First\n  Blocker: none\n- [ ] 1.2 Second\n  Blocker: 1.1\n");

    let dispatcher = fx.reviewing_dispatcher();

    let first = dispatcher.dispatch_next(&fx.runtime).await.unwrap().unwrap();
    assert_eq!(first.milestone_num, "1.1");
    fx.settle().await;
    assert!(fx.read_backlog().contains("- [x] 1.1 First"));

    // The review pass clears the satisfied blocker before selection.
    let second = dispatcher.dispatch_next(&fx.runtime).await.unwrap().unwrap();
    assert_eq!(second.milestone_num, "1.2");
    assert_eq!(
        fx.read_backlog(),
        "- [x] 1.1 First\n  Blocker: none\n- [~] 1.2 Second\n  Blocker: none\n"
    );
    fx.settle().await;

    let inbox = fx.inbox.0.lock().unwrap();
    assert!(
        inbox
            .iter()
            .any(|m| m.content.contains("[Subagent '1.1' completed successfully]"))
    );
}

#[tokio::test]
async fn panicking_tool_still_finalizes() {
    let llm = ScriptedLlm::replying(vec![tool_call("boom", json!({}))]);
    let fx = Fixture::new(limits(3), llm).await;

    let outcome = fx
        .runtime
        .spawn(SpawnRequest::new("use the boom tool", TaskOrigin::User))
        .await;
    let id = outcome.task_id().unwrap().to_string();
    fx.settle().await;

    let task = fx.store.get(&id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.result_summary.unwrap().contains("tool blew up"));
    assert!(task.completed_at.is_some());
}

#[tokio::test]
async fn restart_recovers_abandoned_tasks_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("subagents.db");
    {
        let store = LibSqlTaskStore::open(&path, limits(3)).await.unwrap();
        for id in ["a", "b"] {
            store
                .admit(&ai_dispatch::worker::NewTask::new(id, id, TaskOrigin::Scheduled))
                .await
                .unwrap();
        }
        store.mark_running("a").await.unwrap();
        store.close().await;
    }

    let store = LibSqlTaskStore::open(&path, limits(3)).await.unwrap();
    assert_eq!(store.recover_on_startup().await.unwrap(), 2);
    assert_eq!(store.recover_on_startup().await.unwrap(), 0);
    assert_eq!(store.running_count().await, 0);

    let a = store.get("a").await.unwrap().unwrap();
    assert_eq!(a.status, TaskStatus::Lost);
    assert_eq!(a.stack_frame.as_deref(), Some("process restarted"));
}

#[tokio::test]
async fn invalid_schedule_is_rejected() {
    let fx = Fixture::new(limits(3), ScriptedLlm::default()).await;
    let err = spawn_dispatch_ticker(Arc::new(fx.dispatcher()), Arc::clone(&fx.runtime), "every minute")
        .unwrap_err();
    assert!(matches!(err, BacklogError::Schedule { .. }));
}
