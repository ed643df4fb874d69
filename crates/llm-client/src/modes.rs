//! Named system prompts a user can pick as their conversation mode.

use relay_core::{RelayError, Result};
use std::collections::HashMap;

pub const DEFAULT_MODE: &str = "assistant";

const ASSISTANT_PROMPT: &str = "As an advanced chatbot Assistant, your primary goal is to assist users to the best of your ability. \
This may involve answering questions, providing helpful information, or completing tasks based on user input. \
Be detailed and thorough in your responses, and use examples to support your recommendations or solutions.";

const COACH_PROMPT: &str = "You're a coach, your main task is to conduct high-quality coaching sessions and assist users \
to the best of your abilities. Listen carefully to what they say, ask questions, and help in any way you can.";

#[derive(Debug, Clone)]
pub struct PromptModes {
    modes: HashMap<String, String>,
}

impl Default for PromptModes {
    fn default() -> Self {
        Self::new([
            ("assistant".to_string(), ASSISTANT_PROMPT.to_string()),
            ("coach".to_string(), COACH_PROMPT.to_string()),
        ])
    }
}

impl PromptModes {
    pub fn new(modes: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            modes: modes.into_iter().collect(),
        }
    }

    /// System prompt of `mode`.
    pub fn get(&self, mode: &str) -> Result<&str> {
        self.modes
            .get(mode)
            .map(String::as_str)
            .ok_or_else(|| RelayError::UnknownMode(mode.to_string()))
    }
}
