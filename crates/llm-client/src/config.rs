//! Provider endpoints loaded from the environment.

use anyhow::{Context, Result};
use std::env;

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// API keys and base URLs of the OpenAI-compatible providers the model registry points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub openai_api_key: String,
    pub openai_base_url: String,
    /// Base URL of an Ollama server's OpenAI-compatible endpoint; local models are only registered when set.
    pub ollama_base_url: Option<String>,
    pub ollama_api_key: String,
}

impl ProviderConfig {
    /// Load from environment variables.
    pub fn from_env() -> Result<Self> {
        let openai_api_key = env::var("OPENAI_API_KEY").context("OPENAI_API_KEY not set")?;
        let openai_base_url =
            env::var("OPENAI_BASE_URL").unwrap_or_else(|_| DEFAULT_OPENAI_BASE_URL.to_string());
        let ollama_base_url = env::var("OLLAMA_BASE_URL")
            .ok()
            .filter(|s| !s.trim().is_empty());
        let ollama_api_key = env::var("OLLAMA_API_KEY").unwrap_or_else(|_| "ollama".to_string());
        Ok(Self {
            openai_api_key,
            openai_base_url,
            ollama_base_url,
            ollama_api_key,
        })
    }
}
