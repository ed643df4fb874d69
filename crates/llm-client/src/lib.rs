//! # Completion backend abstraction
//!
//! Defines the [`CompletionBackend`] trait the relay pipeline drives, the [`ModelRegistry`] with
//! per-model capabilities and context budgets, [`PromptModes`], token counting, and an
//! OpenAI-compatible implementation ([`OpenAiBackend`]) that also serves Ollama endpoints.
//!
//! Streaming returns a boxed stream of accumulated partial turns so the trait stays object-safe.

use async_trait::async_trait;
use futures::Stream;
use relay_core::{DialogTurn, Result};
use serde::{Deserialize, Serialize};
use std::pin::Pin;

mod config;
mod mask;
mod models;
mod modes;
mod openai;
mod tokens;

pub use config::{ProviderConfig, DEFAULT_OPENAI_BASE_URL};
pub use mask::mask_token;
pub use models::{
    CallingStrategy, Capabilities, CompletionMode, ContextConfiguration, ModelRegistry, ModelSpec,
};
pub use modes::{PromptModes, DEFAULT_MODE};
pub use openai::OpenAiBackend;
pub use tokens::{
    EstimateTokenCounter, ModelTokenizers, TiktokenCounter, TokenCounter, Tokenizers,
    TOKENS_PER_MESSAGE, TOKENS_PER_THREAD,
};

/// Function/tool the model may call; `parameters` is a JSON schema object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// One call to the model.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub system_prompt: String,
    pub turns: Vec<DialogTurn>,
    /// Ignored unless `strategy` is `Functions` or `Tools`.
    pub tools: Vec<ToolSpec>,
    pub strategy: CallingStrategy,
    pub temperature: f32,
}

/// Token usage as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Result of a sync call.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub turn: DialogTurn,
    pub usage: Option<TokenUsage>,
}

/// Accumulated reply so far; `usage` is set on the chunk that carries it (usually the last).
#[derive(Debug, Clone, PartialEq)]
pub struct PartialTurn {
    pub turn: DialogTurn,
    pub usage: Option<TokenUsage>,
}

pub type TurnStream = Pin<Box<dyn Stream<Item = Result<PartialTurn>> + Send>>;

#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion>;

    /// Each item carries the whole reply accumulated so far, not a delta.
    async fn complete_stream(&self, request: CompletionRequest) -> Result<TurnStream>;
}
