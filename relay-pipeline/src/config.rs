//! Timing and limit knobs of the pipeline.

use std::time::Duration;

/// Telegram's maximum text length per message.
pub const TELEGRAM_MESSAGE_LIMIT: usize = 4096;

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Idle period that closes a batch.
    pub batch_idle: Duration,
    /// Main threads whose last node was activated longer ago than this start empty.
    pub message_expiration: Duration,
    /// Minimum time between two edits of a streaming message.
    pub stream_edit_interval: Duration,
    /// Successive function/tool calls allowed before the answer fails.
    pub function_call_limit: usize,
    pub temperature: f32,
    pub message_limit: usize,
    pub typing_interval: Duration,
    pub typing_max: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_idle: Duration::from_millis(500),
            message_expiration: Duration::from_secs(3600),
            stream_edit_interval: Duration::from_secs(2),
            function_call_limit: 12,
            temperature: 0.3,
            message_limit: TELEGRAM_MESSAGE_LIMIT,
            typing_interval: Duration::from_secs(2),
            typing_max: Duration::from_secs(90),
        }
    }
}
