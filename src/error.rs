//! Error types for AI Dispatch.

use std::time::Duration;

/// Top-level error type for the dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Admission error: {0}")]
    Admission(#[from] AdmissionError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Backlog error: {0}")]
    Backlog(#[from] BacklogError),

    #[error("Consolidation error: {0}")]
    Consolidation(#[from] ConsolidationError),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Task store is closed")]
    Closed,
}

/// Admission rejections and failures.
///
/// `Capacity` is the expected-contention case: nothing was written and the
/// caller may retry later.
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("subagent capacity reached for {scope} ({running}/{limit} running)")]
    Capacity {
        scope: String,
        running: usize,
        limit: usize,
    },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl AdmissionError {
    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::Capacity { .. })
    }
}

/// Rejected task state transitions.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task {id} not found")]
    NotFound { id: String },

    #[error("Task {id} already in state {state}, cannot transition to {target}")]
    InvalidTransition {
        id: String,
        state: String,
        target: String,
    },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Provider {provider} is overloaded")]
    Overloaded { provider: String },

    #[error("Provider {provider} quota exceeded: {reason}")]
    QuotaExceeded { provider: String, reason: String },

    #[error("Failed to list models from {provider}: {reason}")]
    ModelListFailed { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },
}

impl LlmError {
    /// Outage-class failures that the fallback chain is allowed to absorb.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::AuthFailed { .. }
                | Self::Overloaded { .. }
                | Self::QuotaExceeded { .. }
        )
    }
}

/// Tool execution errors.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Tool {name} not found")]
    NotFound { name: String },

    #[error("Invalid parameters for tool {name}: {reason}")]
    InvalidParameters { name: String, reason: String },

    #[error("Tool {name} execution failed: {reason}")]
    ExecutionFailed { name: String, reason: String },
}

/// Message delivery errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {name} closed")]
    Closed { name: String },
}

/// Backlog file and lock errors.
#[derive(Debug, thiserror::Error)]
pub enum BacklogError {
    #[error("Failed to acquire backlog lock {path}: {reason}")]
    Lock { path: String, reason: String },

    #[error("Invalid dispatch schedule '{schedule}': {reason}")]
    Schedule { schedule: String, reason: String },

    #[error("Backlog IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Session memory consolidation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConsolidationError {
    #[error("Consolidation model call failed: {0}")]
    Model(String),

    #[error("Failed to write history: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for the dispatcher.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_error_mentions_capacity() {
        let err = AdmissionError::Capacity {
            scope: "global".to_string(),
            running: 3,
            limit: 3,
        };
        assert!(err.is_capacity());
        assert!(err.to_string().contains("capacity"));
        assert!(err.to_string().contains("3/3"));
    }

    #[test]
    fn retryable_llm_errors() {
        let p = || "stub".to_string();
        assert!(LlmError::RateLimited { provider: p(), retry_after: None }.is_retryable());
        assert!(LlmError::AuthFailed { provider: p() }.is_retryable());
        assert!(LlmError::Overloaded { provider: p() }.is_retryable());
        assert!(LlmError::QuotaExceeded { provider: p(), reason: "x".into() }.is_retryable());
        assert!(
            !LlmError::RequestFailed { provider: p(), reason: "boom".into() }.is_retryable()
        );
        assert!(
            !LlmError::InvalidResponse { provider: p(), reason: "bad".into() }.is_retryable()
        );
    }
}
