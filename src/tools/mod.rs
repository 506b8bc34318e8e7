//! Tool boundary: the `Tool` trait, the registry, and built-in tools.

pub mod builtin;
pub mod registry;
pub mod tool;

pub use registry::ToolRegistry;
pub use tool::*;
