//! Token counting used to size threads against a model's context budgets.

use relay_core::{ContentPart, DialogTurn, MessageContent};
use std::collections::HashMap;
use tiktoken_rs::CoreBPE;
use tracing::debug;

/// Overhead of every message (role and separators).
pub const TOKENS_PER_MESSAGE: usize = 4;
/// Overhead of priming the assistant reply, added once per non-empty thread.
pub const TOKENS_PER_THREAD: usize = 2;

pub trait TokenCounter: Send + Sync {
    fn count_text(&self, text: &str) -> usize;

    /// Content, image costs and call payloads of one turn, without per-message overhead.
    fn count_turn(&self, turn: &DialogTurn) -> usize {
        let mut total = match &turn.content {
            MessageContent::Text(text) => self.count_text(text),
            MessageContent::Parts(parts) => parts
                .iter()
                .map(|part| match part {
                    ContentPart::Text { text } => self.count_text(text),
                    ContentPart::Image { image } => image.token_cost,
                })
                .sum(),
        };
        if let Some(name) = &turn.name {
            total += self.count_text(name);
        }
        if let Some(call) = &turn.function_call {
            total += self.count_text(&call.name) + self.count_text(&call.arguments);
        }
        for call in &turn.tool_calls {
            total += self.count_text(&call.function.name) + self.count_text(&call.function.arguments);
        }
        total
    }

    fn count_turns(&self, turns: &[DialogTurn]) -> usize {
        if turns.is_empty() {
            return 0;
        }
        TOKENS_PER_THREAD
            + turns
                .iter()
                .map(|t| TOKENS_PER_MESSAGE + self.count_turn(t))
                .sum::<usize>()
    }
}

/// Character-based estimate: about four characters per token, at least one token for non-empty text.
#[derive(Debug, Clone, Copy, Default)]
pub struct EstimateTokenCounter;

impl TokenCounter for EstimateTokenCounter {
    fn count_text(&self, text: &str) -> usize {
        let chars = text.chars().count();
        if chars == 0 {
            0
        } else {
            chars.div_ceil(4)
        }
    }
}

/// Counts with the BPE encoding the model uses.
pub struct TiktokenCounter {
    bpe: CoreBPE,
}

impl TiktokenCounter {
    /// `None` when tiktoken has no encoding for `model`.
    pub fn for_model(model: &str) -> Option<Self> {
        tiktoken_rs::get_bpe_from_model(model)
            .ok()
            .map(|bpe| Self { bpe })
    }
}

impl TokenCounter for TiktokenCounter {
    fn count_text(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }
}

/// Token counter for each model.
pub trait Tokenizers: Send + Sync {
    fn for_model(&self, model: &str) -> &dyn TokenCounter;
}

/// One counter for every model.
impl<T: TokenCounter> Tokenizers for T {
    fn for_model(&self, _model: &str) -> &dyn TokenCounter {
        self
    }
}

/// tiktoken encodings for the models it knows, the character estimate for the rest.
pub struct ModelTokenizers {
    by_model: HashMap<String, TiktokenCounter>,
    fallback: EstimateTokenCounter,
}

impl ModelTokenizers {
    pub fn new<'a>(models: impl IntoIterator<Item = &'a str>) -> Self {
        let mut by_model = HashMap::new();
        for model in models {
            match TiktokenCounter::for_model(model) {
                Some(counter) => {
                    by_model.insert(model.to_string(), counter);
                }
                None => debug!(model, "No tiktoken encoding, using the character estimate"),
            }
        }
        Self {
            by_model,
            fallback: EstimateTokenCounter,
        }
    }

    pub fn has_encoding(&self, model: &str) -> bool {
        self.by_model.contains_key(model)
    }
}

impl Tokenizers for ModelTokenizers {
    fn for_model(&self, model: &str) -> &dyn TokenCounter {
        if let Some(counter) = self.by_model.get(model) {
            return counter;
        }
        &self.fallback
    }
}
