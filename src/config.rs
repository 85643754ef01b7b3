use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

/// Backend protocol spoken by a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// OpenAI-compatible chat backend (`/v1/chat/completions`).
    Openai,
    /// Bare text-generation backend (`/generate`), no chat endpoints.
    Generate,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    pub kind: ChannelKind,
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Public model name -> upstream model name.
    #[serde(default)]
    pub models: HashMap<String, String>,
    /// Channel cannot serve tool-calling requests; skipped when the
    /// request carries tools.
    #[serde(default)]
    pub only_chat: bool,
}

/// Process configuration, populated once at startup and injected; nothing
/// reads the environment after this point.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    pub timeout: u64,
    pub log_interval: u64,
    pub preprompt: String,
    pub guideline: String,
    pub channels: Vec<ChannelConfig>,
}

impl RelayConfig {
    /// System-message augmentation strings; absence means empty, not an error.
    pub fn augmentation_from_env() -> (String, String) {
        (
            std::env::var("CHAT_PREPROMPT").unwrap_or_default(),
            std::env::var("CHAT_GUIDELINE").unwrap_or_default(),
        )
    }
}

pub fn load_channels(path: &Path) -> anyhow::Result<Vec<ChannelConfig>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read channel registry {}", path.display()))?;
    let channels: Vec<ChannelConfig> = serde_json::from_str(&raw)
        .with_context(|| format!("invalid channel registry {}", path.display()))?;
    anyhow::ensure!(!channels.is_empty(), "channel registry is empty");
    Ok(channels)
}
