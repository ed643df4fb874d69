//! Relay configuration loaded from environment variables.

use anyhow::{anyhow, Context, Result};
use llm_client::ProviderConfig;
use relay_pipeline::{PipelineConfig, UserPreferences};
use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// BOT_TOKEN
    pub bot_token: String,
    /// SQLite database holding thread nodes and usage.
    pub database_url: String,
    pub log_file: String,
    pub providers: ProviderConfig,
    /// Preferences applied to every user.
    pub preferences: UserPreferences,
    pub pipeline: PipelineConfig,
}

/// Parses `key` when set and non-blank, else returns `default`.
fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("{} has an invalid value {:?}: {}", key, raw, e)),
        _ => Ok(default),
    }
}

impl RelayConfig {
    /// Load from environment variables. `token` overrides BOT_TOKEN if provided.
    pub fn load(token: Option<String>) -> Result<Self> {
        let bot_token = match token {
            Some(token) => token,
            None => env::var("BOT_TOKEN").context("BOT_TOKEN not set")?,
        };
        let database_url = env::var("DATABASE_URL").unwrap_or_else(|_| "./relay.db".to_string());
        let log_file = env::var("LOG_FILE").unwrap_or_else(|_| "logs/relay.log".to_string());
        let providers = ProviderConfig::from_env()?;

        let defaults = UserPreferences::default();
        let preferences = UserPreferences {
            model: env_or("DEFAULT_MODEL", defaults.model)?,
            mode: env_or("DEFAULT_MODE", defaults.mode)?,
            streaming: env_or("USE_STREAMING", defaults.streaming)?,
            auto_summarize: env_or("AUTO_SUMMARIZE", defaults.auto_summarize)?,
            forward_as_prompt: env_or("FORWARD_AS_PROMPT", defaults.forward_as_prompt)?,
            use_functions: env_or("USE_FUNCTIONS", defaults.use_functions)?,
        };

        let defaults = PipelineConfig::default();
        let pipeline = PipelineConfig {
            batch_idle: Duration::from_millis(env_or("BATCH_IDLE_MS", 500)?),
            message_expiration: Duration::from_secs(env_or("MESSAGE_EXPIRATION_SECS", 3600)?),
            stream_edit_interval: Duration::from_millis(env_or("STREAM_EDIT_INTERVAL_MS", 2000)?),
            function_call_limit: env_or("FUNCTION_CALL_LIMIT", defaults.function_call_limit)?,
            temperature: env_or("COMPLETION_TEMPERATURE", defaults.temperature)?,
            ..defaults
        };

        let config = Self {
            bot_token,
            database_url,
            log_file,
            providers,
            preferences,
            pipeline,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.bot_token.trim().is_empty() {
            anyhow::bail!("BOT_TOKEN is empty");
        }
        if self.pipeline.batch_idle.is_zero() {
            anyhow::bail!("BATCH_IDLE_MS must be greater than zero");
        }
        if !(0.0..=2.0).contains(&self.pipeline.temperature) {
            anyhow::bail!(
                "COMPLETION_TEMPERATURE must be between 0 and 2, got {}",
                self.pipeline.temperature
            );
        }
        Ok(())
    }
}
