//! Workspace file tools for subagents.
//!
//! Every path is resolved against the workspace root and rejected if it
//! escapes it. Subagents use `edit_file` to flip backlog markers when a
//! milestone is done.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use crate::error::ToolError;
use crate::tools::tool::{Tool, ToolContext, require_str};

/// Maximum file size for reading (1MB).
const MAX_READ_SIZE: u64 = 1024 * 1024;

/// Maximum content size for writing (5MB).
const MAX_WRITE_SIZE: usize = 5 * 1024 * 1024;

/// Resolve `.` and `..` lexically, without touching the filesystem.
fn normalize_lexical(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                if components
                    .last()
                    .is_some_and(|c| matches!(c, Component::Normal(_)))
                {
                    components.pop();
                }
            }
            Component::CurDir => {}
            other => components.push(other),
        }
    }
    components.iter().collect()
}

/// Resolve `raw` inside `root`, rejecting anything that escapes it.
fn resolve_in(root: &Path, raw: &str, tool: &str) -> Result<PathBuf, ToolError> {
    let root = normalize_lexical(root);
    let candidate = Path::new(raw);
    let joined = if candidate.is_absolute() {
        normalize_lexical(candidate)
    } else {
        normalize_lexical(&root.join(candidate))
    };
    if !joined.starts_with(&root) {
        return Err(ToolError::InvalidParameters {
            name: tool.to_string(),
            reason: format!("path escapes workspace: {raw}"),
        });
    }
    Ok(joined)
}

fn failed(tool: &str, reason: impl Into<String>) -> ToolError {
    ToolError::ExecutionFailed {
        name: tool.to_string(),
        reason: reason.into(),
    }
}

// ── ReadFileTool ────────────────────────────────────────────────────

/// Read a workspace file.
pub struct ReadFileTool {
    root: PathBuf,
}

impl ReadFileTool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a file from the workspace and return its contents."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path relative to the workspace root"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<String, ToolError> {
        let path = resolve_in(&self.root, require_str(&params, self.name(), "path")?, self.name())?;

        let metadata = fs::metadata(&path)
            .await
            .map_err(|e| failed(self.name(), format!("Cannot access {}: {e}", path.display())))?;
        if metadata.len() > MAX_READ_SIZE {
            return Err(failed(
                self.name(),
                format!("File too large ({} bytes, max {MAX_READ_SIZE})", metadata.len()),
            ));
        }

        fs::read_to_string(&path)
            .await
            .map_err(|e| failed(self.name(), format!("Failed to read file: {e}")))
    }
}

// ── WriteFileTool ───────────────────────────────────────────────────

/// Create or overwrite a workspace file.
pub struct WriteFileTool {
    root: PathBuf,
}

impl WriteFileTool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a workspace file, creating parent directories. \
         Overwrites existing files; use edit_file for targeted changes."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path relative to the workspace root"
                },
                "content": {
                    "type": "string",
                    "description": "Full file content"
                }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<String, ToolError> {
        let path = resolve_in(&self.root, require_str(&params, self.name(), "path")?, self.name())?;
        let content = require_str(&params, self.name(), "content")?;
        if content.len() > MAX_WRITE_SIZE {
            return Err(ToolError::InvalidParameters {
                name: self.name().to_string(),
                reason: format!("content too large ({} bytes)", content.len()),
            });
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| failed(self.name(), format!("Failed to create directories: {e}")))?;
        }
        fs::write(&path, content)
            .await
            .map_err(|e| failed(self.name(), format!("Failed to write file: {e}")))?;

        Ok(format!("Wrote {} bytes to {}", content.len(), path.display()))
    }
}

// ── EditFileTool ────────────────────────────────────────────────────

/// Replace exactly one occurrence of a snippet in a workspace file.
pub struct EditFileTool {
    root: PathBuf,
}

impl EditFileTool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        "Replace old_text with new_text in a workspace file. \
         old_text must appear exactly once."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Path relative to the workspace root" },
                "old_text": { "type": "string", "description": "Exact text to find" },
                "new_text": { "type": "string", "description": "Replacement text" }
            },
            "required": ["path", "old_text", "new_text"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<String, ToolError> {
        let path = resolve_in(&self.root, require_str(&params, self.name(), "path")?, self.name())?;
        let old_text = require_str(&params, self.name(), "old_text")?;
        let new_text = require_str(&params, self.name(), "new_text")?;

        let content = fs::read_to_string(&path)
            .await
            .map_err(|e| failed(self.name(), format!("Failed to read file: {e}")))?;

        match content.matches(old_text).count() {
            0 => Err(failed(self.name(), "old_text not found in file")),
            1 => {
                let updated = content.replacen(old_text, new_text, 1);
                fs::write(&path, updated)
                    .await
                    .map_err(|e| failed(self.name(), format!("Failed to write file: {e}")))?;
                Ok(format!("Edited {}", path.display()))
            }
            n => Err(failed(
                self.name(),
                format!("old_text appears {n} times; include more context"),
            )),
        }
    }
}
