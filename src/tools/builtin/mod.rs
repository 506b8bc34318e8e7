//! Built-in tools: workspace file operations and subagent spawning.

pub mod file;
pub mod spawn;

pub use file::{EditFileTool, ReadFileTool, WriteFileTool};
pub use spawn::SpawnTool;
