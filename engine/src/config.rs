//! Engine configuration.
//!
//! Loaded from TOML; every field has a default so an empty file (or no
//! file) yields a working configuration. Values are validated on load so
//! a bad config fails at startup, not mid-turn.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_API_KEY_ENV: &str = "OPENAI_API_KEY";
const DEFAULT_HISTORY_PAGE_SIZE: usize = 25;
const DEFAULT_RECENCY_CAPACITY: usize = 20;
const DEFAULT_MAX_TOOL_CALLS_PER_TURN: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Model name sent with every chat request.
    pub model: String,
    /// Override for the chat endpoint (proxies, compatible servers).
    pub api_base_url: Option<String>,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    /// Messages per persisted-history page.
    pub history_page_size: usize,
    /// Capacity of the recently-viewed cache.
    pub recency_capacity: usize,
    /// Cap on tool calls accepted in a single turn.
    pub max_tool_calls_per_turn: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            api_base_url: None,
            api_key_env: DEFAULT_API_KEY_ENV.to_string(),
            history_page_size: DEFAULT_HISTORY_PAGE_SIZE,
            recency_capacity: DEFAULT_RECENCY_CAPACITY,
            max_tool_calls_per_turn: DEFAULT_MAX_TOOL_CALLS_PER_TURN,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(text: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(text).context("Failed to parse engine config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config at {}", path.display()))?;
        Self::from_toml_str(&text)
    }

    /// Resolve the API key from the configured environment variable.
    #[must_use]
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.model.trim().is_empty(), "model must not be empty");
        anyhow::ensure!(
            self.history_page_size >= 1,
            "history_page_size must be at least 1"
        );
        anyhow::ensure!(
            self.max_tool_calls_per_turn >= 1,
            "max_tool_calls_per_turn must be at least 1"
        );
        Ok(())
    }
}
