//! Per-user answer preferences.

use async_trait::async_trait;
use relay_core::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPreferences {
    pub model: String,
    /// Prompt mode name (see `llm_client::PromptModes`).
    pub mode: String,
    pub streaming: bool,
    pub auto_summarize: bool,
    /// Forwarded messages trigger an answer instead of only becoming context.
    pub forward_as_prompt: bool,
    pub use_functions: bool,
}

impl Default for UserPreferences {
    fn default() -> Self {
        Self {
            model: "gpt-3.5-turbo".to_string(),
            mode: llm_client::DEFAULT_MODE.to_string(),
            streaming: true,
            auto_summarize: true,
            forward_as_prompt: false,
            use_functions: true,
        }
    }
}

#[async_trait]
pub trait PreferencesProvider: Send + Sync {
    async fn preferences(&self, user_id: i64) -> Result<UserPreferences>;
}

/// Same preferences for every user.
#[derive(Debug, Clone, Default)]
pub struct StaticPreferences {
    preferences: UserPreferences,
}

impl StaticPreferences {
    pub fn new(preferences: UserPreferences) -> Self {
        Self { preferences }
    }
}

#[async_trait]
impl PreferencesProvider for StaticPreferences {
    async fn preferences(&self, _user_id: i64) -> Result<UserPreferences> {
        Ok(self.preferences.clone())
    }
}
