//! In-memory conversation sessions.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::llm::ChatMessage;

/// One conversation's history.
///
/// `messages[..last_consolidated]` has already been archived; it stays in
/// memory until the session is cleared.
#[derive(Debug, Clone)]
pub struct Session {
    pub key: String,
    pub messages: Vec<ChatMessage>,
    pub last_consolidated: usize,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            messages: Vec::new(),
            last_consolidated: 0,
            created_at: Utc::now(),
        }
    }

    pub fn add(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    /// The most recent `max` messages.
    pub fn history(&self, max: usize) -> Vec<ChatMessage> {
        let start = self.messages.len().saturating_sub(max);
        self.messages[start..].to_vec()
    }

    /// Messages not yet archived.
    pub fn unconsolidated(&self) -> usize {
        self.messages.len().saturating_sub(self.last_consolidated)
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.last_consolidated = 0;
        self.created_at = Utc::now();
    }
}

pub type SharedSession = Arc<Mutex<Session>>;

/// Session cache keyed by `"{channel}:{chat_id}"`.
#[derive(Default)]
pub struct SessionManager {
    sessions: Mutex<HashMap<String, SharedSession>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_create(&self, key: &str) -> SharedSession {
        let mut sessions = self.sessions.lock().await;
        Arc::clone(
            sessions
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(Session::new(key)))),
        )
    }

    /// Drop a session from the cache. Holders of the old handle keep it.
    pub async fn invalidate(&self, key: &str) -> bool {
        self.sessions.lock().await.remove(key).is_some()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_and_unconsolidated() {
        let mut session = Session::new("cli:direct");
        for i in 0..5 {
            session.add(ChatMessage::user(format!("m{i}")));
        }
        session.last_consolidated = 2;

        let recent = session.history(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].content, "m3");
        assert_eq!(session.history(50).len(), 5);
        assert_eq!(session.unconsolidated(), 3);

        session.clear();
        assert!(session.messages.is_empty());
        assert_eq!(session.unconsolidated(), 0);
    }

    #[tokio::test]
    async fn manager_reuses_and_invalidates() {
        let manager = SessionManager::new();
        let a = manager.get_or_create("cli:direct").await;
        a.lock().await.add(ChatMessage::user("hi"));

        let again = manager.get_or_create("cli:direct").await;
        assert_eq!(again.lock().await.messages.len(), 1);
        assert_eq!(manager.len().await, 1);

        assert!(manager.invalidate("cli:direct").await);
        assert!(!manager.invalidate("cli:direct").await);
        let fresh = manager.get_or_create("cli:direct").await;
        assert!(fresh.lock().await.messages.is_empty());
    }
}
