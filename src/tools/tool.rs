//! Tool trait and execution context.

use async_trait::async_trait;

use crate::error::ToolError;

/// Where the conversation that invoked a tool lives.
///
/// Tools that start background work use it to route their results back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolContext {
    pub channel: String,
    pub chat_id: String,
}

impl ToolContext {
    pub fn new(channel: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            chat_id: chat_id.into(),
        }
    }
}

impl Default for ToolContext {
    fn default() -> Self {
        Self::new("cli", "direct")
    }
}

/// A capability the model can invoke.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema of the arguments object.
    fn parameters_schema(&self) -> serde_json::Value;

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<String, ToolError>;
}

/// Extract a required string parameter.
pub fn require_str<'a>(
    params: &'a serde_json::Value,
    tool: &str,
    name: &str,
) -> Result<&'a str, ToolError> {
    params
        .get(name)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::InvalidParameters {
            name: tool.to_string(),
            reason: format!("missing required string parameter '{name}'"),
        })
}

/// Extract an optional, non-empty string parameter.
pub fn optional_str<'a>(params: &'a serde_json::Value, name: &str) -> Option<&'a str> {
    params
        .get(name)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}
