//! Persistence layer: libSQL-backed task store.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlTaskStore;
pub use traits::{SUMMARY_MAX_CHARS, TaskStore};
