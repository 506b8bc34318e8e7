//! Adapter from rig's completion clients to `LlmProvider`.
//!
//! System messages become the preamble, the last message is the prompt and
//! everything before it is chat history. Consecutive tool results are sent
//! as one user turn.

use async_trait::async_trait;
use rig::client::CompletionClient;
use rig::completion::{CompletionError, CompletionModel, ToolDefinition as RigToolDefinition};
use rig::message::{AssistantContent, Message, ToolResultContent, UserContent};
use rig::one_or_many::OneOrMany;

use crate::error::LlmError;
use crate::llm::models::ModelCatalog;
use crate::llm::provider::{
    ChatMessage, ChatRequest, ChatResponse, FinishReason, LlmProvider, Role, ToolCall,
};
use crate::llm::classify_error_text;

/// Used when a request sets no limit; some backends require one.
const DEFAULT_MAX_TOKENS: u64 = 4096;

pub struct RigAdapter<C> {
    client: C,
    provider: &'static str,
    model: String,
    catalog: Option<ModelCatalog>,
}

impl<C> RigAdapter<C> {
    pub fn new(client: C, provider: &'static str, model: &str) -> Self {
        Self {
            client,
            provider,
            model: model.to_string(),
            catalog: None,
        }
    }

    pub fn with_catalog(mut self, catalog: ModelCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }
}

/// A request in rig's shape.
pub(crate) struct RigConversation {
    pub preamble: Option<String>,
    pub history: Vec<Message>,
    pub prompt: Message,
}

pub(crate) fn to_rig_conversation(messages: &[ChatMessage]) -> Option<RigConversation> {
    let mut preamble: Vec<&str> = Vec::new();
    let mut converted: Vec<Message> = Vec::new();
    let mut pending_results: Vec<UserContent> = Vec::new();

    for message in messages {
        if message.role != Role::Tool {
            flush_results(&mut pending_results, &mut converted);
        }
        match message.role {
            Role::System => preamble.push(&message.content),
            Role::User => converted.push(Message::user(message.content.clone())),
            Role::Assistant if message.tool_calls.is_empty() => {
                converted.push(Message::assistant(message.content.clone()));
            }
            Role::Assistant => {
                let mut content = Vec::with_capacity(message.tool_calls.len() + 1);
                if !message.content.trim().is_empty() {
                    content.push(AssistantContent::text(message.content.clone()));
                }
                content.extend(message.tool_calls.iter().map(|call| {
                    AssistantContent::tool_call(
                        call.id.clone(),
                        call.name.clone(),
                        call.arguments.clone(),
                    )
                }));
                if let Ok(content) = OneOrMany::many(content) {
                    converted.push(Message::Assistant { id: None, content });
                }
            }
            Role::Tool => pending_results.push(UserContent::tool_result(
                message.tool_call_id.clone().unwrap_or_default(),
                OneOrMany::one(ToolResultContent::text(message.content.clone())),
            )),
        }
    }
    flush_results(&mut pending_results, &mut converted);

    let prompt = converted.pop()?;
    Some(RigConversation {
        preamble: (!preamble.is_empty()).then(|| preamble.join("\n\n")),
        history: converted,
        prompt,
    })
}

fn flush_results(pending: &mut Vec<UserContent>, out: &mut Vec<Message>) {
    if let Ok(content) = OneOrMany::many(std::mem::take(pending)) {
        out.push(Message::User { content });
    }
}

fn completion_error(provider: &str, err: CompletionError) -> LlmError {
    match err {
        CompletionError::JsonError(e) => LlmError::InvalidResponse {
            provider: provider.to_string(),
            reason: e.to_string(),
        },
        CompletionError::ResponseError(reason) => LlmError::InvalidResponse {
            provider: provider.to_string(),
            reason,
        },
        other => classify_error_text(provider, &other.to_string()),
    }
}

pub(crate) fn from_rig_choice(choice: OneOrMany<AssistantContent>) -> ChatResponse {
    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for item in choice {
        match item {
            AssistantContent::Text(t) => text.push_str(&t.text),
            AssistantContent::ToolCall(call) => tool_calls.push(ToolCall {
                id: call.id,
                name: call.function.name,
                arguments: call.function.arguments,
            }),
            _ => {}
        }
    }

    let finish_reason = if tool_calls.is_empty() {
        FinishReason::Stop
    } else {
        FinishReason::ToolUse
    };
    ChatResponse {
        content: (!text.is_empty()).then_some(text),
        tool_calls,
        finish_reason,
    }
}

#[async_trait]
impl<C> LlmProvider for RigAdapter<C>
where
    C: CompletionClient + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        self.provider
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, LlmError> {
        let conversation =
            to_rig_conversation(&request.messages).ok_or_else(|| LlmError::RequestFailed {
                provider: self.provider.to_string(),
                reason: "request has no messages".to_string(),
            })?;
        let tools: Vec<RigToolDefinition> = request
            .tools
            .iter()
            .map(|tool| RigToolDefinition {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters: tool.parameters.clone(),
            })
            .collect();

        let model = self
            .client
            .completion_model(request.model.as_deref().unwrap_or(&self.model));
        let mut builder = model
            .completion_request(conversation.prompt)
            .messages(conversation.history)
            .tools(tools)
            .max_tokens(request.max_tokens.map(u64::from).unwrap_or(DEFAULT_MAX_TOKENS));
        if let Some(preamble) = conversation.preamble {
            builder = builder.preamble(preamble);
        }
        if let Some(temperature) = request.temperature {
            builder = builder.temperature(f64::from(temperature));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| completion_error(self.provider, e))?;
        Ok(from_rig_choice(response.choice))
    }

    async fn list_available_models(&self) -> Result<Vec<String>, LlmError> {
        match &self.catalog {
            Some(catalog) => catalog.list().await,
            None => Ok(Vec::new()),
        }
    }
}
