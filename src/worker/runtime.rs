//! Subagent runtime.
//!
//! `spawn` validates the model hint, admits the task, launches it on its own
//! tokio task and returns immediately. The launched task runs a bounded
//! model/tool loop, then always finalizes the task record before announcing
//! the result, whether the loop returned, failed, or panicked.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{Mutex, Notify};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channels::{Announcer, InboundMessage, SYSTEM_CHANNEL};
use crate::config::SubagentConfig;
use crate::error::TaskError;
use crate::llm::{BackendResolver, ChatMessage, ChatRequest, LlmProvider};
use crate::store::TaskStore;
use crate::tools::{ToolContext, ToolRegistry};
use crate::worker::admission::AdmissionController;
use crate::worker::narrative::{INCOMPLETE_MARKER, extract_narrative};
use crate::worker::state::{NewTask, TaskOrigin, TaskStatus};

/// Labels derived from the task text are cut to this many characters.
const DEFAULT_LABEL_CHARS: usize = 30;

const FINALIZE_ATTEMPTS: u32 = 3;

/// What to run.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub task: String,
    pub label: Option<String>,
    pub origin: TaskOrigin,
    /// Model to run on. Validated against the resolved backend.
    pub model: Option<String>,
    /// Conversation that receives the result.
    pub reply_to: ToolContext,
}

impl SpawnRequest {
    pub fn new(task: impl Into<String>, origin: TaskOrigin) -> Self {
        Self {
            task: task.into(),
            label: None,
            origin,
            model: None,
            reply_to: ToolContext::default(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
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
}

/// Result of a spawn attempt. `Display` renders the user-facing text;
/// every variant except `Started` renders with a leading `Error:`.
#[derive(Debug, Clone, PartialEq)]
pub enum SpawnOutcome {
    Started { id: String, label: String },
    ModelListFailed(String),
    InvalidModel { model: String, available: Vec<String> },
    Capacity(String),
    AdmissionFailed(String),
}

impl SpawnOutcome {
    pub fn is_started(&self) -> bool {
        matches!(self, Self::Started { .. })
    }

    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::Started { id, .. } => Some(id),
            _ => None,
        }
    }
}

impl std::fmt::Display for SpawnOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Started { id, label } => write!(
                f,
                "Subagent [{label}] started (id: {id}). I'll notify you when it completes."
            ),
            Self::ModelListFailed(reason) => write!(
                f,
                "Error: Failed to fetch available models from provider: {reason}"
            ),
            Self::InvalidModel { model, available } => write!(
                f,
                "Error: Model '{model}' is not available from the provider. Available models: {}",
                available.join(", ")
            ),
            Self::Capacity(reason) => write!(f, "Error: {reason}. Try again later."),
            Self::AdmissionFailed(reason) => write!(f, "Error: failed to admit subagent: {reason}"),
        }
    }
}

/// How an execution ended.
#[derive(Debug)]
struct Execution {
    status: TaskStatus,
    result: String,
}

impl Execution {
    fn completed(result: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Completed,
            result: result.into(),
        }
    }

    fn failed(result: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Failed,
            result: result.into(),
        }
    }
}

/// One admitted task, carried into its execution unit.
struct SubagentJob {
    id: String,
    label: String,
    task: String,
    model: String,
    provider: Arc<dyn LlmProvider>,
    reply_to: ToolContext,
    max_iterations: usize,
}

/// State shared between the runtime and its execution units.
#[derive(Clone)]
struct ExecutionContext {
    store: Arc<dyn TaskStore>,
    tools: Arc<ToolRegistry>,
    announcer: Arc<dyn Announcer>,
    handles: Arc<Mutex<HashMap<String, AbortHandle>>>,
    completed: Arc<Notify>,
}

/// Launches and supervises subagent tasks.
pub struct SubagentRuntime {
    admission: AdmissionController,
    resolver: Arc<dyn BackendResolver>,
    config: SubagentConfig,
    ctx: ExecutionContext,
}

impl SubagentRuntime {
    pub fn new(
        admission: AdmissionController,
        resolver: Arc<dyn BackendResolver>,
        tools: Arc<ToolRegistry>,
        announcer: Arc<dyn Announcer>,
        config: SubagentConfig,
    ) -> Self {
        let ctx = ExecutionContext {
            store: Arc::clone(admission.store()),
            tools,
            announcer,
            handles: Arc::new(Mutex::new(HashMap::new())),
            completed: Arc::new(Notify::new()),
        };
        Self {
            admission,
            resolver,
            config,
            ctx,
        }
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.ctx.store
    }

    pub fn config(&self) -> &SubagentConfig {
        &self.config
    }

    /// Signalled each time an execution unit finishes.
    pub fn completion_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.ctx.completed)
    }

    /// Number of execution units still alive.
    pub async fn in_flight(&self) -> usize {
        self.ctx.handles.lock().await.len()
    }

    /// Abort a task's execution unit. Returns false if none was running.
    ///
    /// The record is left untouched; callers move it to a terminal state.
    pub async fn abort(&self, id: &str) -> bool {
        match self.ctx.handles.lock().await.remove(id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Validate, admit and launch a subagent. Never fails: problems are
    /// reported through the returned outcome.
    pub async fn spawn(&self, request: SpawnRequest) -> SpawnOutcome {
        let provider = self.resolver.resolve(request.model.as_deref());

        if let Some(model) = request.model.as_deref() {
            match provider.list_available_models().await {
                Err(e) => return SpawnOutcome::ModelListFailed(e.to_string()),
                Ok(available) if !available.is_empty() && !available.iter().any(|m| m == model) => {
                    warn!(model = %model, "Rejected subagent model hint");
                    return SpawnOutcome::InvalidModel {
                        model: model.to_string(),
                        available,
                    };
                }
                Ok(_) => {}
            }
        }

        let model = request
            .model
            .clone()
            .unwrap_or_else(|| provider.model_name().to_string());
        let id = Uuid::new_v4().simple().to_string();
        let label = request
            .label
            .as_deref()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| default_label(&request.task));

        let admitted = self
            .admission
            .try_admit(NewTask::new(&id, &label, request.origin).with_class(&model))
            .await;
        if let Err(e) = admitted {
            return if e.is_capacity() {
                SpawnOutcome::Capacity(e.to_string())
            } else {
                SpawnOutcome::AdmissionFailed(e.to_string())
            };
        }

        let job = SubagentJob {
            id: id.clone(),
            label: label.clone(),
            task: request.task,
            max_iterations: self.config.iterations_for(&model),
            model,
            provider,
            reply_to: request.reply_to,
        };
        info!(task_id = %id, label = %label, model = %job.model, "Subagent started");

        // Held across spawn + insert so the unit cannot deregister before it is registered.
        let mut handles = self.ctx.handles.lock().await;
        let handle = tokio::spawn(self.ctx.clone().run(job));
        handles.insert(id.clone(), handle.abort_handle());
        drop(handles);

        SpawnOutcome::Started { id, label }
    }
}

impl ExecutionContext {
    async fn run(self, job: SubagentJob) {
        let execution = match AssertUnwindSafe(self.execute(&job)).catch_unwind().await {
            Ok(execution) => execution,
            Err(panic) => {
                error!(task_id = %job.id, "Subagent panicked: {}", panic_message(&*panic));
                Execution::failed(format!(
                    "Error: subagent panicked: {}",
                    panic_message(&*panic)
                ))
            }
        };

        if self.finalize(&job, &execution).await {
            self.announce(&job, &execution).await;
        }

        self.handles.lock().await.remove(&job.id);
        self.completed.notify_one();
    }

    async fn execute(&self, job: &SubagentJob) -> Execution {
        if let Err(e) = self.store.mark_running(&job.id).await {
            warn!(task_id = %job.id, "Failed to mark subagent running: {}", e);
        }

        let definitions = self.tools.tool_definitions().await;
        let mut messages = vec![
            ChatMessage::system(subagent_prompt()),
            ChatMessage::user(&job.task),
        ];
        let mut last_output = String::new();

        for iteration in 1..=job.max_iterations {
            let request = ChatRequest::new(messages.clone())
                .with_tools(definitions.clone())
                .with_model(Some(job.model.clone()));

            let response = match job.provider.chat(request).await {
                Ok(response) => response,
                Err(e) => {
                    error!(task_id = %job.id, "Subagent model call failed: {}", e);
                    return Execution::failed(format!("Error: {e}"));
                }
            };
            if response.is_error() {
                return Execution::failed(
                    response
                        .content
                        .unwrap_or_else(|| "Error: model call failed".to_string()),
                );
            }
            if let Some(text) = response.content.as_deref().filter(|t| !t.trim().is_empty()) {
                last_output = text.to_string();
            }
            if !response.has_tool_calls() {
                return Execution::completed(response.content.unwrap_or_default());
            }

            debug!(
                task_id = %job.id,
                iteration,
                calls = response.tool_calls.len(),
                "Subagent tool round"
            );
            messages.push(ChatMessage::assistant_with_tools(
                response.content.clone(),
                response.tool_calls.clone(),
            ));
            for call in response.tool_calls {
                let output = self
                    .tools
                    .execute(&call.name, call.arguments, &job.reply_to)
                    .await;
                messages.push(ChatMessage::tool_result(call.id, call.name, output));
            }
        }

        warn!(task_id = %job.id, max = job.max_iterations, "Subagent hit iteration ceiling");
        Execution::completed(format!(
            "{INCOMPLETE_MARKER} Subagent exhausted {} iterations without producing a final \
             response. Last model output: {}",
            job.max_iterations,
            truncate(&last_output, 500)
        ))
    }

    /// Write the terminal status. Returns false when the record was already
    /// terminal, meaning someone else (the reaper) owns the outcome.
    async fn finalize(&self, job: &SubagentJob, execution: &Execution) -> bool {
        let narrative = extract_narrative(Some(&execution.result));

        for attempt in 1..=FINALIZE_ATTEMPTS {
            match self
                .store
                .finalize(&job.id, execution.status, &narrative)
                .await
            {
                Ok(()) => {
                    info!(
                        task_id = %job.id,
                        label = %job.label,
                        status = %execution.status,
                        "Subagent finished"
                    );
                    return true;
                }
                Err(TaskError::InvalidTransition { state, .. }) => {
                    warn!(task_id = %job.id, state = %state, "Subagent already terminal, result dropped");
                    return false;
                }
                Err(e) if attempt < FINALIZE_ATTEMPTS => {
                    warn!(task_id = %job.id, attempt, "Finalize failed, retrying: {}", e);
                    tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
                }
                Err(e) => {
                    error!(task_id = %job.id, "Failed to finalize subagent: {}", e);
                }
            }
        }
        // The result is still worth delivering even though the record is stale.
        true
    }

    async fn announce(&self, job: &SubagentJob, execution: &Execution) {
        let status_text = match execution.status {
            TaskStatus::Completed if execution.result.starts_with(INCOMPLETE_MARKER) => {
                "completed (incomplete)"
            }
            TaskStatus::Completed => "completed successfully",
            _ => "failed",
        };
        let content = format!(
            "[System: subagent] [Subagent '{label}' {status_text}]\n\n\
             Task: {task}\n\n\
             Summary: {narrative}\n\n\
             Result:\n{result}\n\n\
             Summarize this naturally for the user. Keep it brief (1-2 sentences). \
             Do not mention technical details like \"subagent\" or task IDs.",
            label = job.label,
            task = job.task,
            narrative = extract_narrative(Some(&execution.result)),
            result = execution.result,
        );

        let message = InboundMessage::new(
            SYSTEM_CHANNEL,
            "subagent",
            format!("{}:{}", job.reply_to.channel, job.reply_to.chat_id),
            content,
        );
        if let Err(e) = self.announcer.publish(message).await {
            warn!(task_id = %job.id, "Failed to announce subagent result: {}", e);
        }
    }
}

fn default_label(task: &str) -> String {
    if task.chars().count() > DEFAULT_LABEL_CHARS {
        let head: String = task.chars().take(DEFAULT_LABEL_CHARS).collect();
        format!("{head}...")
    } else {
        task.to_string()
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max).collect();
        format!("{head}...")
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

fn subagent_prompt() -> String {
    let now = chrono::Utc::now().format("%Y-%m-%d %H:%M (%A) UTC");
    format!(
        "# Subagent\n\n\
         ## Current Time\n{now}\n\n\
         You are a subagent spawned by the main agent to complete a specific task.\n\n\
         ## Rules\n\
         1. Stay focused - complete only the assigned task, nothing else\n\
         2. Your final response will be reported back to the main agent\n\
         3. Do not start conversations or take on side tasks\n\
         4. Be concise but informative in your findings\n\n\
         File paths are relative to the workspace root.\n\n\
         When you have completed the task, give a clear summary of what you did."
    )
}
