//! AI Dispatch: admission-controlled subagents, backlog dispatch, tiered
//! backend fallback and per-session memory consolidation.

pub mod agent;
pub mod backlog;
pub mod channels;
pub mod config;
pub mod error;
pub mod llm;
pub mod store;
pub mod tools;
pub mod worker;
