//! Conversational path: one inbound message in, at most one reply out.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::agent::consolidation::{ConsolidationScheduler, archive};
use crate::agent::session::{SessionManager, SharedSession};
use crate::channels::{InboundMessage, OutgoingResponse};
use crate::llm::{ChatMessage, ChatRequest, FallbackChain};
use crate::tools::{ToolContext, ToolRegistry};

pub const NEW_SESSION_REPLY: &str = "New session started. Memory consolidation in progress.";
pub const ARCHIVE_FAILED_REPLY: &str = "Failed to archive session memory. Session preserved.";
const HELP_REPLY: &str = "Commands:\n/new — Start a new conversation\n/help — Show available commands";
const BACKGROUND_DONE_REPLY: &str = "Background task completed.";

/// Handles conversations over the fallback chain and the tool registry.
pub struct Conversation {
    chain: Arc<FallbackChain>,
    tools: Arc<ToolRegistry>,
    sessions: SessionManager,
    scheduler: ConsolidationScheduler,
    memory_window: usize,
    max_iterations: usize,
    system_prompt: String,
}

impl Conversation {
    pub fn new(
        chain: Arc<FallbackChain>,
        tools: Arc<ToolRegistry>,
        scheduler: ConsolidationScheduler,
        memory_window: usize,
        max_iterations: usize,
    ) -> Self {
        Self {
            chain,
            tools,
            sessions: SessionManager::new(),
            scheduler,
            memory_window,
            max_iterations,
            system_prompt: default_system_prompt(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn scheduler(&self) -> &ConsolidationScheduler {
        &self.scheduler
    }

    /// Answer inbound messages one at a time until `shutdown` resolves or
    /// the bus closes. A turn still running when `shutdown` fires is dropped.
    pub async fn serve<F>(
        &self,
        inbound: &mut mpsc::Receiver<InboundMessage>,
        shutdown: F,
        mut deliver: impl FnMut(OutgoingResponse),
    ) where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            let message = tokio::select! {
                _ = &mut shutdown => break,
                message = inbound.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            tokio::select! {
                _ = &mut shutdown => {
                    warn!("Shutdown requested mid-turn, abandoning the turn");
                    break;
                }
                response = self.handle(message) => {
                    if let Some(response) = response {
                        deliver(response);
                    }
                }
            }
        }
    }

    /// Process one message. System messages (subagent results) are answered
    /// in the conversation they originated from.
    pub async fn handle(&self, msg: InboundMessage) -> Option<OutgoingResponse> {
        let (channel, chat_id) = msg.reply_target();
        let key = msg.session_key();
        let session = self.sessions.get_or_create(&key).await;
        let reply = |content: String| OutgoingResponse {
            channel: channel.clone(),
            chat_id: chat_id.clone(),
            content,
        };

        if msg.is_system() {
            info!(sender = %msg.sender_id, session = %key, "Processing system message");
            let content = self
                .run_turn(&session, &msg.content, ToolContext::new(&channel, &chat_id))
                .await
                .unwrap_or_else(|| BACKGROUND_DONE_REPLY.to_string());
            return Some(reply(content));
        }

        match msg.content.trim().to_lowercase().as_str() {
            "/new" => return Some(reply(self.start_new_session(&key, &session).await)),
            "/help" => return Some(reply(HELP_REPLY.to_string())),
            _ => {}
        }

        self.scheduler.trigger_if_needed(&session).await;

        let content = self
            .run_turn(&session, &msg.content, ToolContext::new(&channel, &chat_id))
            .await
            .unwrap_or_else(|| "The model returned no response.".to_string());
        Some(reply(content))
    }

    /// Archive everything, then clear. The session survives if archiving fails.
    async fn start_new_session(&self, key: &str, session: &SharedSession) -> String {
        self.scheduler.wait_for_all_inflight().await;
        let lock = self.scheduler.lock_for(key).await;
        let _guard = lock.lock().await;

        match archive(self.scheduler.consolidator().as_ref(), session, None).await {
            Ok(archived) => {
                session.lock().await.clear();
                self.sessions.invalidate(key).await;
                self.scheduler.invalidate(key).await;
                info!(session = %key, archived, "Session cleared");
                NEW_SESSION_REPLY.to_string()
            }
            Err(e) => {
                error!(session = %key, "Memory consolidation failed during /new: {}", e);
                ARCHIVE_FAILED_REPLY.to_string()
            }
        }
    }

    /// Model/tool loop for one turn. Records the exchange in the session.
    async fn run_turn(
        &self,
        session: &SharedSession,
        content: &str,
        ctx: ToolContext,
    ) -> Option<String> {
        let history = session.lock().await.history(self.memory_window);
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(&self.system_prompt));
        messages.extend(history);
        messages.push(ChatMessage::user(content));

        let definitions = self.tools.tool_definitions().await;
        let mut final_text = None;

        for _ in 0..self.max_iterations {
            let request = ChatRequest::new(messages.clone()).with_tools(definitions.clone());
            let response = self.chain.call_with_fallback(request).await;

            if response.is_error() || !response.has_tool_calls() {
                final_text = response.content.filter(|c| !c.trim().is_empty());
                break;
            }

            messages.push(ChatMessage::assistant_with_tools(
                response.content.clone(),
                response.tool_calls.clone(),
            ));
            for call in response.tool_calls {
                let output = self.tools.execute(&call.name, call.arguments, &ctx).await;
                messages.push(ChatMessage::tool_result(call.id, call.name, output));
            }
        }

        if final_text.is_none() {
            warn!(session = %session.lock().await.key, "Turn ended without a text reply");
        }

        let mut s = session.lock().await;
        s.add(ChatMessage::user(content));
        if let Some(text) = &final_text {
            s.add(ChatMessage::assistant(text));
        }
        final_text
    }
}

fn default_system_prompt() -> String {
    "You are a helpful assistant. For long or independent work, use the spawn tool to \
     start a background subagent; you will be told when it finishes. When a message \
     starts with [System: subagent], relay the result to the user briefly."
        .to_string()
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::agent::consolidation::Consolidator;
    use crate::channels::SYSTEM_CHANNEL;
    use crate::error::{ConsolidationError, LlmError, ToolError};
    use crate::llm::{ChatResponse, FinishReason, LlmBackend, LlmProvider, Tier, ToolCall};
    use crate::tools::Tool;

    struct Replay(std::sync::Mutex<VecDeque<ChatResponse>>);

    impl Replay {
        fn new(replies: Vec<ChatResponse>) -> Arc<Self> {
            Arc::new(Self(std::sync::Mutex::new(replies.into())))
        }
    }

    #[async_trait]
    impl LlmProvider for Replay {
        fn name(&self) -> &str {
            "replay"
        }
        fn model_name(&self) -> &str {
            "replay"
        }
        async fn chat(&self, _request: ChatRequest) -> Result<ChatResponse, LlmError> {
            Ok(self
                .0
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| ChatResponse::text("ok")))
        }
    }

    struct Recorder {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Consolidator for Recorder {
        async fn consolidate(
            &self,
            _session_key: &str,
            _messages: &[ChatMessage],
        ) -> Result<(), ConsolidationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(ConsolidationError::Model("backend down".into()))
            } else {
                Ok(())
            }
        }
    }

    struct Ping;

    #[async_trait]
    impl Tool for Ping {
        fn name(&self) -> &str {
            "ping"
        }
        fn description(&self) -> &str {
            "Reply with pong and the caller's chat"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(
            &self,
            _params: serde_json::Value,
            ctx: &ToolContext,
        ) -> Result<String, ToolError> {
            Ok(format!("pong {}:{}", ctx.channel, ctx.chat_id))
        }
    }

    fn conversation(llm: Arc<Replay>, consolidator: Arc<Recorder>) -> Conversation {
        let chain = FallbackChain::new(Tier::new(LlmBackend::OpenAiCompatible, llm), None, None);
        let tools = Arc::new(ToolRegistry::new());
        tools.register_sync(Arc::new(Ping));
        Conversation::new(
            Arc::new(chain),
            tools,
            ConsolidationScheduler::new(consolidator, 50),
            50,
            5,
        )
    }

    fn recorder(fail: bool) -> Arc<Recorder> {
        Arc::new(Recorder {
            calls: AtomicUsize::new(0),
            fail,
        })
    }

    #[tokio::test]
    async fn runs_tools_then_replies() {
        let llm = Replay::new(vec![
            ChatResponse {
                content: None,
                tool_calls: vec![ToolCall {
                    id: "1".into(),
                    name: "ping".into(),
                    arguments: serde_json::json!({}),
                }],
                finish_reason: FinishReason::ToolUse,
            },
            ChatResponse::text("All good."),
        ]);
        let conv = conversation(llm, recorder(false));

        let out = conv
            .handle(InboundMessage::new("cli", "u", "direct", "check"))
            .await
            .unwrap();
        assert_eq!(out.content, "All good.");
        assert_eq!((out.channel.as_str(), out.chat_id.as_str()), ("cli", "direct"));

        let session = conv.sessions().get_or_create("cli:direct").await;
        assert_eq!(session.lock().await.messages.len(), 2);
    }

    #[tokio::test]
    async fn system_message_replies_to_origin() {
        let conv = conversation(Replay::new(vec![ChatResponse::text("Your report is ready.")]), recorder(false));
        let out = conv
            .handle(InboundMessage::new(
                SYSTEM_CHANNEL,
                "subagent",
                "telegram:42",
                "[System: subagent] [Subagent 'report' completed successfully]",
            ))
            .await
            .unwrap();
        assert_eq!(out.channel, "telegram");
        assert_eq!(out.chat_id, "42");
        assert_eq!(out.content, "Your report is ready.");
    }

    #[tokio::test]
    async fn new_archives_and_clears() {
        let consolidator = recorder(false);
        let conv = conversation(Replay::new(vec![]), consolidator.clone());
        conv.handle(InboundMessage::new("cli", "u", "direct", "hello"))
            .await
            .unwrap();

        let old = conv.sessions().get_or_create("cli:direct").await;
        let out = conv
            .handle(InboundMessage::new("cli", "u", "direct", "/new"))
            .await
            .unwrap();
        assert_eq!(out.content, NEW_SESSION_REPLY);
        assert_eq!(consolidator.calls.load(Ordering::SeqCst), 1);
        assert!(old.lock().await.messages.is_empty());
        assert_eq!(conv.sessions().len().await, 0);
    }

    #[tokio::test]
    async fn failed_archive_preserves_session() {
        let conv = conversation(Replay::new(vec![]), recorder(true));
        conv.handle(InboundMessage::new("cli", "u", "direct", "hello"))
            .await
            .unwrap();

        let out = conv
            .handle(InboundMessage::new("cli", "u", "direct", "/new"))
            .await
            .unwrap();
        assert_eq!(out.content, ARCHIVE_FAILED_REPLY);
        let session = conv.sessions().get_or_create("cli:direct").await;
        assert_eq!(session.lock().await.messages.len(), 2);
    }

    #[tokio::test]
    async fn error_response_is_relayed() {
        let conv = conversation(
            Replay::new(vec![ChatResponse::error("Error calling LLM: bad request")]),
            recorder(false),
        );
        let out = conv
            .handle(InboundMessage::new("cli", "u", "direct", "hi"))
            .await
            .unwrap();
        assert_eq!(out.content, "Error calling LLM: bad request");
    }

    struct Hung;

    #[async_trait]
    impl LlmProvider for Hung {
        fn name(&self) -> &str {
            "hung"
        }
        fn model_name(&self) -> &str {
            "hung"
        }
        async fn chat(&self, _request: ChatRequest) -> Result<ChatResponse, LlmError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn serve_delivers_replies_until_the_bus_closes() {
        let conv = conversation(Replay::new(vec![ChatResponse::text("first")]), recorder(false));
        let (tx, mut rx) = mpsc::channel(4);
        tx.send(InboundMessage::new("cli", "u", "direct", "hi")).await.unwrap();
        tx.send(InboundMessage::new("cli", "u", "direct", "again")).await.unwrap();
        drop(tx);

        let mut replies = Vec::new();
        conv.serve(&mut rx, std::future::pending(), |r| replies.push(r.content))
            .await;
        assert_eq!(replies, vec!["first".to_string(), "ok".to_string()]);
    }

    #[tokio::test]
    async fn shutdown_interrupts_a_turn_in_progress() {
        let chain = FallbackChain::new(
            Tier::new(LlmBackend::OpenAiCompatible, Arc::new(Hung)),
            None,
            None,
        );
        let conv = Conversation::new(
            Arc::new(chain),
            Arc::new(ToolRegistry::new()),
            ConsolidationScheduler::new(recorder(false), 50),
            50,
            5,
        );
        let (tx, mut rx) = mpsc::channel(4);
        tx.send(InboundMessage::new("cli", "u", "direct", "hello")).await.unwrap();

        let shutdown = tokio::time::sleep(std::time::Duration::from_millis(50));
        let mut delivered = 0;
        tokio::time::timeout(
            std::time::Duration::from_secs(2),
            conv.serve(&mut rx, shutdown, |_| delivered += 1),
        )
        .await
        .expect("serve must return once shutdown fires");
        assert_eq!(delivered, 0);
    }
}
