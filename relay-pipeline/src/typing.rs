//! Typing indicator shown while an answer is being prepared.

use relay_core::Bot;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Re-sends the "typing" chat action every `interval` for at most `max`; stops when dropped.
pub struct TypingIndicator {
    handle: JoinHandle<()>,
}

impl TypingIndicator {
    pub fn start(bot: Arc<dyn Bot>, chat_id: i64, interval: Duration, max: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let deadline = Instant::now() + max;
            while Instant::now() < deadline {
                if let Err(e) = bot.send_typing(chat_id).await {
                    debug!(chat_id, error = %e, "Failed to send typing action");
                }
                tokio::time::sleep(interval).await;
            }
        });
        Self { handle }
    }
}

impl Drop for TypingIndicator {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
