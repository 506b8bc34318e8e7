//! `spawn` tool: lets the conversational agent delegate work to a subagent.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ToolError;
use crate::tools::tool::{Tool, ToolContext, optional_str, require_str};
use crate::worker::runtime::{SpawnRequest, SubagentRuntime};
use crate::worker::state::TaskOrigin;

pub struct SpawnTool {
    runtime: Arc<SubagentRuntime>,
}

impl SpawnTool {
    pub fn new(runtime: Arc<SubagentRuntime>) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl Tool for SpawnTool {
    fn name(&self) -> &str {
        "spawn"
    }

    fn description(&self) -> &str {
        "Spawn a subagent to handle a task in the background. Use this for complex or \
         time-consuming work that can run independently. The subagent reports back \
         when it finishes."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "task": {
                    "type": "string",
                    "description": "The task for the subagent to complete"
                },
                "label": {
                    "type": "string",
                    "description": "Optional short label for the task (for display)"
                },
                "model": {
                    "type": "string",
                    "description": "Optional model to run the subagent on"
                }
            },
            "required": ["task"]
        })
    }

    /// Refusals (capacity, unknown model) come back as `Ok("Error: ...")` so the
    /// model reads them like any other tool output.
    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<String, ToolError> {
        let task = require_str(&params, self.name(), "task")?;
        if task.trim().is_empty() {
            return Err(ToolError::InvalidParameters {
                name: self.name().to_string(),
                reason: "task must not be empty".to_string(),
            });
        }

        let mut request = SpawnRequest::new(task, TaskOrigin::User)
            .with_model(optional_str(&params, "model").map(str::to_string))
            .reply_to(ctx.clone());
        if let Some(label) = optional_str(&params, "label") {
            request = request.with_label(label);
        }

        Ok(self.runtime.spawn(request).await.to_string())
    }
}
