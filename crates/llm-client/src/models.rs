//! Model registry: capability flags, context budgets and endpoints per model name.

use relay_core::{RelayError, Result};
use std::collections::HashMap;

use crate::config::ProviderConfig;

/// What a model's endpoint supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub supports_streaming: bool,
    pub supports_function_calling: bool,
    pub supports_tool_calling: bool,
    pub supports_images: bool,
}

impl Capabilities {
    /// Current OpenAI chat models: streaming and tool calling, legacy function calling still accepted.
    pub const OPENAI_CHAT: Capabilities = Capabilities {
        supports_streaming: true,
        supports_function_calling: true,
        supports_tool_calling: true,
        supports_images: false,
    };
}

/// Token budgets of one model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextConfiguration {
    /// Thread size that triggers summarization.
    pub short_term_budget_tokens: usize,
    /// Target length of a generated summary.
    pub summary_length_tokens: usize,
    /// Threads above this size are rejected; summarization cannot run either.
    pub hard_max_tokens: usize,
}

impl ContextConfiguration {
    pub fn new(
        short_term_budget_tokens: usize,
        summary_length_tokens: usize,
        hard_max_tokens: usize,
    ) -> Result<Self> {
        if hard_max_tokens <= short_term_budget_tokens {
            return Err(RelayError::Config(format!(
                "hard max tokens ({}) must be greater than short-term budget ({})",
                hard_max_tokens, short_term_budget_tokens
            )));
        }
        Ok(Self {
            short_term_budget_tokens,
            summary_length_tokens,
            hard_max_tokens,
        })
    }
}

/// How tools are offered to the model for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallingStrategy {
    /// No tools offered.
    Plain,
    /// Legacy `functions` / `function_call`.
    Functions,
    /// `tools` / `tool_calls`.
    Tools,
}

impl CallingStrategy {
    /// Tool calling wins over legacy functions; no tools, or functions disabled by the user, means `Plain`.
    pub fn select(capabilities: &Capabilities, has_tools: bool, use_functions: bool) -> Self {
        if !has_tools || !use_functions {
            CallingStrategy::Plain
        } else if capabilities.supports_tool_calling {
            CallingStrategy::Tools
        } else if capabilities.supports_function_calling {
            CallingStrategy::Functions
        } else {
            CallingStrategy::Plain
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    Sync,
    Streaming,
}

impl CompletionMode {
    pub fn select(capabilities: &Capabilities, prefer_streaming: bool) -> Self {
        if capabilities.supports_streaming && prefer_streaming {
            CompletionMode::Streaming
        } else {
            CompletionMode::Sync
        }
    }
}

/// One model the relay can talk to.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSpec {
    pub name: String,
    pub capabilities: Capabilities,
    pub context: ContextConfiguration,
    /// OpenAI-compatible endpoint; `None` means the default OpenAI endpoint.
    pub base_url: Option<String>,
    pub api_key: String,
}

#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: HashMap<String, ModelSpec>,
}

impl ModelRegistry {
    pub fn new(models: impl IntoIterator<Item = ModelSpec>) -> Self {
        Self {
            models: models.into_iter().map(|m| (m.name.clone(), m)).collect(),
        }
    }

    /// Built-in model table. Local models are registered only when an Ollama endpoint is configured.
    pub fn defaults(providers: &ProviderConfig) -> Result<Self> {
        let openai = |name: &str, budget, summary, hard| -> Result<ModelSpec> {
            Ok(ModelSpec {
                name: name.to_string(),
                capabilities: Capabilities::OPENAI_CHAT,
                context: ContextConfiguration::new(budget, summary, hard)?,
                base_url: Some(providers.openai_base_url.clone()),
                api_key: providers.openai_api_key.clone(),
            })
        };

        let mut models = vec![
            openai("gpt-3.5-turbo", 2560, 512, 5 * 1024)?,
            openai("gpt-3.5-turbo-16k", 4096, 1024, 17 * 1024)?,
            openai("gpt-4", 2048, 1024, 9 * 1024)?,
            openai("gpt-4-turbo", 5120, 2048, 13 * 1024)?,
            ModelSpec {
                capabilities: Capabilities {
                    supports_images: true,
                    ..Capabilities::OPENAI_CHAT
                },
                ..openai("gpt-4o", 5120, 2048, 13 * 1024)?
            },
        ];

        if let Some(base_url) = &providers.ollama_base_url {
            models.push(ModelSpec {
                name: "llama3".to_string(),
                capabilities: Capabilities {
                    supports_streaming: true,
                    supports_function_calling: false,
                    supports_tool_calling: false,
                    supports_images: false,
                },
                context: ContextConfiguration::new(2048, 512, 13 * 1024)?,
                base_url: Some(base_url.clone()),
                api_key: providers.ollama_api_key.clone(),
            });
        }

        Ok(Self::new(models))
    }

    pub fn get(&self, name: &str) -> Result<&ModelSpec> {
        self.models
            .get(name)
            .ok_or_else(|| RelayError::UnknownModel(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }
}
