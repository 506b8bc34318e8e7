//! Session memory consolidation.
//!
//! At most one consolidation runs per session at a time; different sessions
//! consolidate in parallel. Callers about to clear a session first call
//! [`ConsolidationScheduler::wait_for_all_inflight`], then take
//! [`ConsolidationScheduler::lock_for`] for that session.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared, join_all};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::agent::session::SharedSession;
use crate::error::ConsolidationError;
use crate::llm::{ChatMessage, ChatRequest, FallbackChain, Role};

/// Archives a batch of messages somewhere durable.
#[async_trait]
pub trait Consolidator: Send + Sync {
    async fn consolidate(
        &self,
        session_key: &str,
        messages: &[ChatMessage],
    ) -> Result<(), ConsolidationError>;
}

/// Summarizes old messages through the fallback chain and appends the
/// summary to a history file.
pub struct LlmConsolidator {
    chain: Arc<FallbackChain>,
    history_path: PathBuf,
}

impl LlmConsolidator {
    pub fn new(chain: Arc<FallbackChain>, history_path: impl Into<PathBuf>) -> Self {
        Self {
            chain,
            history_path: history_path.into(),
        }
    }
}

#[async_trait]
impl Consolidator for LlmConsolidator {
    async fn consolidate(
        &self,
        session_key: &str,
        messages: &[ChatMessage],
    ) -> Result<(), ConsolidationError> {
        let transcript = messages
            .iter()
            .filter(|m| matches!(m.role, Role::User | Role::Assistant))
            .map(|m| format!("{}: {}", m.role.as_str().to_uppercase(), m.content))
            .collect::<Vec<_>>()
            .join("\n");

        let request = ChatRequest::new(vec![
            ChatMessage::system(
                "You are a memory consolidation agent. Summarize the conversation below into \
                 one short paragraph of durable facts, decisions and open threads. \
                 Reply with the summary only.",
            ),
            ChatMessage::user(transcript),
        ]);
        let response = self.chain.call_with_fallback(request).await;
        if response.is_error() {
            return Err(ConsolidationError::Model(response.content.unwrap_or_default()));
        }
        let summary = response.content.unwrap_or_default();

        if let Some(parent) = self.history_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.history_path)
            .await?;
        let entry = format!(
            "[{}] {session_key}\n{}\n\n",
            chrono::Utc::now().format("%Y-%m-%d %H:%M"),
            summary.trim()
        );
        file.write_all(entry.as_bytes()).await?;
        Ok(())
    }
}

type InflightOp = Shared<BoxFuture<'static, ()>>;

#[derive(Default)]
struct Inflight {
    sessions: HashSet<String>,
    ops: HashMap<u64, InflightOp>,
    next_id: u64,
}

struct Inner {
    consolidator: Arc<dyn Consolidator>,
    memory_window: usize,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    inflight: Mutex<Inflight>,
}

/// Deduplicates background consolidation per session.
#[derive(Clone)]
pub struct ConsolidationScheduler {
    inner: Arc<Inner>,
}

impl ConsolidationScheduler {
    pub fn new(consolidator: Arc<dyn Consolidator>, memory_window: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                consolidator,
                memory_window,
                locks: Mutex::new(HashMap::new()),
                inflight: Mutex::new(Inflight::default()),
            }),
        }
    }

    pub fn consolidator(&self) -> &Arc<dyn Consolidator> {
        &self.inner.consolidator
    }

    /// The session's consolidation mutex, created on first use.
    pub async fn lock_for(&self, session_key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.inner.locks.lock().await;
        Arc::clone(locks.entry(session_key.to_string()).or_default())
    }

    /// Drop the session's mutex. Current holders keep theirs.
    pub async fn invalidate(&self, session_key: &str) {
        self.inner.locks.lock().await.remove(session_key);
    }

    pub async fn inflight_count(&self) -> usize {
        self.inner.inflight.lock().await.ops.len()
    }

    /// Start a background consolidation if the session has outgrown the
    /// memory window and none is running for it. Returns whether one started.
    pub async fn trigger_if_needed(&self, session: &SharedSession) -> bool {
        let (key, unconsolidated) = {
            let s = session.lock().await;
            (s.key.clone(), s.unconsolidated())
        };
        if unconsolidated <= self.inner.memory_window {
            return false;
        }

        let mut inflight = self.inner.inflight.lock().await;
        if !inflight.sessions.insert(key.clone()) {
            debug!(session = %key, "Consolidation already in flight");
            return false;
        }
        let id = inflight.next_id;
        inflight.next_id += 1;

        let lock = self.lock_for(&key).await;
        let inner = Arc::clone(&self.inner);
        let session = Arc::clone(session);
        let handle = tokio::spawn(async move {
            let work = async {
                let _guard = lock.lock().await;
                let keep = inner.memory_window / 2;
                archive(inner.consolidator.as_ref(), &session, Some(keep)).await
            };
            match AssertUnwindSafe(work).catch_unwind().await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => error!(session = %key, "Memory consolidation failed: {}", e),
                Err(_) => error!(session = %key, "Memory consolidation panicked"),
            }
            // Deregister on every path, panics included.
            let mut inflight = inner.inflight.lock().await;
            inflight.sessions.remove(&key);
            inflight.ops.remove(&id);
        });
        // Registered under the same guard the task needs to deregister.
        inflight.ops.insert(id, handle.map(|_| ()).boxed().shared());
        true
    }

    /// Resolve once every consolidation tracked right now has finished.
    pub async fn wait_for_all_inflight(&self) {
        let ops: Vec<InflightOp> = self.inner.inflight.lock().await.ops.values().cloned().collect();
        if !ops.is_empty() {
            debug!(count = ops.len(), "Waiting for in-flight consolidations");
            join_all(ops).await;
        }
    }
}

/// Archive the session's unconsolidated messages, leaving `keep` recent ones
/// (all of them when `keep` is `None`) unarchived. Returns how many were archived.
///
/// The session is only locked to take the batch and to record progress, not
/// across the consolidator call.
pub async fn archive(
    consolidator: &dyn Consolidator,
    session: &SharedSession,
    keep: Option<usize>,
) -> Result<usize, ConsolidationError> {
    let (key, start, end, batch) = {
        let s = session.lock().await;
        let end = match keep {
            Some(keep) => s.messages.len().saturating_sub(keep),
            None => s.messages.len(),
        };
        let start = s.last_consolidated.min(end);
        (s.key.clone(), start, end, s.messages[start..end].to_vec())
    };
    if batch.is_empty() {
        return Ok(0);
    }

    consolidator.consolidate(&key, &batch).await?;

    let mut s = session.lock().await;
    if s.last_consolidated == start && s.messages.len() >= end {
        s.last_consolidated = end;
    }
    info!(session = %key, archived = batch.len(), "Session memory consolidated");
    Ok(batch.len())
}
