//! CLI channel: stdin/stdout REPL.

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;

use crate::channels::{Announcer, InboundMessage, MessageBus, OutgoingResponse};

pub const CLI_CHANNEL: &str = "cli";
pub const CLI_CHAT_ID: &str = "direct";

/// Forward stdin lines onto the bus until EOF or `/quit`.
pub fn spawn_stdin_reader(bus: MessageBus) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        eprint!("> ");

        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        eprint!("> ");
                        continue;
                    }
                    if line == "/quit" {
                        break;
                    }
                    let msg = InboundMessage::new(CLI_CHANNEL, "local-user", CLI_CHAT_ID, line);
                    if bus.publish(msg).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("Error reading stdin: {}", e);
                    break;
                }
            }
        }
        tracing::debug!("stdin reader stopped");
    })
}

/// Render a reply for the terminal.
pub fn print_response(response: &OutgoingResponse) {
    if response.channel == CLI_CHANNEL {
        println!("\n{}\n", response.content);
        eprint!("> ");
    } else {
        tracing::info!(
            channel = %response.channel,
            chat_id = %response.chat_id,
            "No connector for channel, reply dropped: {}",
            response.content.chars().take(100).collect::<String>()
        );
    }
}
