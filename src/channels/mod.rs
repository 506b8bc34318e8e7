//! Message boundary between the dispatcher core and the conversational side.
//!
//! Everything that wants the agent's attention (user input, finished
//! subagents) arrives as an [`InboundMessage`] on one bus. Subagents only see
//! the [`Announcer`] half.

pub mod cli;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::error::ChannelError;

/// Channel name used for messages generated by the system itself.
pub const SYSTEM_CHANNEL: &str = "system";

/// A message entering the agent.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub channel: String,
    pub sender_id: String,
    /// For system messages, `"{origin_channel}:{origin_chat_id}"`.
    pub chat_id: String,
    pub content: String,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(
        channel: impl Into<String>,
        sender_id: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            sender_id: sender_id.into(),
            chat_id: chat_id.into(),
            content: content.into(),
            received_at: Utc::now(),
        }
    }

    pub fn is_system(&self) -> bool {
        self.channel == SYSTEM_CHANNEL
    }

    /// Channel and chat the reply should go to. System messages carry their
    /// origin in `chat_id`.
    pub fn reply_target(&self) -> (String, String) {
        if self.is_system()
            && let Some((channel, chat)) = self.chat_id.split_once(':')
        {
            return (channel.to_string(), chat.to_string());
        }
        (self.channel.clone(), self.chat_id.clone())
    }

    /// Session key of the conversation this message belongs to.
    pub fn session_key(&self) -> String {
        let (channel, chat) = self.reply_target();
        format!("{channel}:{chat}")
    }
}

/// A reply leaving the agent.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingResponse {
    pub channel: String,
    pub chat_id: String,
    pub content: String,
}

/// Delivers messages into the conversational system.
#[async_trait]
pub trait Announcer: Send + Sync {
    async fn publish(&self, message: InboundMessage) -> Result<(), ChannelError>;
}

/// Sending half of the inbound bus.
#[derive(Clone)]
pub struct MessageBus {
    tx: mpsc::Sender<InboundMessage>,
}

impl MessageBus {
    /// Create a bus and its receiving end.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<InboundMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Announcer for MessageBus {
    async fn publish(&self, message: InboundMessage) -> Result<(), ChannelError> {
        let channel = message.channel.clone();
        self.tx
            .send(message)
            .await
            .map_err(|_| ChannelError::Closed { name: channel })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_message_routes_to_origin() {
        let msg = InboundMessage::new(SYSTEM_CHANNEL, "subagent", "telegram:42", "done");
        assert!(msg.is_system());
        assert_eq!(msg.reply_target(), ("telegram".to_string(), "42".to_string()));
        assert_eq!(msg.session_key(), "telegram:42");

        let user = InboundMessage::new("cli", "local-user", "direct", "hi");
        assert_eq!(user.session_key(), "cli:direct");
    }

    #[tokio::test]
    async fn bus_delivers_and_reports_closed() {
        let (bus, mut rx) = MessageBus::new(4);
        bus.publish(InboundMessage::new("cli", "u", "direct", "one"))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().content, "one");

        drop(rx);
        let err = bus
            .publish(InboundMessage::new("cli", "u", "direct", "two"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Closed { .. }));
    }
}
