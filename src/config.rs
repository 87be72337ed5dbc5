//! Workspace configuration (`schoold.toml`) with environment overrides.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

pub const CONFIG_FILE_NAME: &str = "schoold.toml";

pub const ENV_CHAT_API_KEY: &str = "SCHOOLD_CHAT_API_KEY";
pub const ENV_CHAT_ENDPOINT: &str = "SCHOOLD_CHAT_ENDPOINT";
pub const ENV_CHAT_MODEL: &str = "SCHOOLD_CHAT_MODEL";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub chat: ChatConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_hours: default_ttl_hours(),
        }
    }
}

/// Generative-language endpoint settings.
///
/// The API key is masked in `Debug` output.
#[derive(Clone, Deserialize)]
pub struct ChatConfig {
    #[serde(default = "default_chat_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_chat_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// How many earlier messages are replayed to the model with each request.
    #[serde(default = "default_history_window")]
    pub history_window: usize,
}

impl std::fmt::Debug for ChatConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatConfig")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("timeout_secs", &self.timeout_secs)
            .field("history_window", &self.history_window)
            .finish()
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            endpoint: default_chat_endpoint(),
            model: default_chat_model(),
            api_key: None,
            timeout_secs: default_timeout_secs(),
            history_window: default_history_window(),
        }
    }
}

fn default_ttl_hours() -> i64 {
    12
}
fn default_chat_endpoint() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}
fn default_chat_model() -> String {
    "gemini-1.5-flash".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_history_window() -> usize {
    10
}

/// Resolve environment variable references like `${VAR_NAME}` in a string.
/// Substituted values are not scanned again.
fn resolve_env_vars(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        let Some(end) = rest[start..].find('}') else {
            break;
        };
        result.push_str(&rest[..start]);
        let var_name = &rest[start + 2..start + end];
        result.push_str(&std::env::var(var_name).unwrap_or_default());
        rest = &rest[start + end + 1..];
    }
    result.push_str(rest);
    result
}

pub fn parse_config(text: &str) -> Result<Config> {
    let mut config: Config = toml::from_str(text).context("invalid schoold.toml")?;
    config.chat.endpoint = resolve_env_vars(&config.chat.endpoint);
    config.chat.api_key = config
        .chat
        .api_key
        .as_deref()
        .map(resolve_env_vars)
        .filter(|k| !k.trim().is_empty());
    Ok(config)
}

/// Load `schoold.toml` from the workspace (if present) and apply env overrides.
pub fn load_config(workspace: &Path) -> Result<Config> {
    let path = workspace.join(CONFIG_FILE_NAME);
    let mut config = if path.is_file() {
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        parse_config(&text).with_context(|| format!("failed to parse config: {}", path.display()))?
    } else {
        Config::default()
    };
    apply_env_overrides(&mut config);
    if config.session.ttl_hours <= 0 {
        config.session.ttl_hours = default_ttl_hours();
    }
    Ok(config)
}

pub fn apply_env_overrides(config: &mut Config) {
    if let Ok(key) = std::env::var(ENV_CHAT_API_KEY) {
        if !key.trim().is_empty() {
            config.chat.api_key = Some(key);
        }
    }
    if let Ok(endpoint) = std::env::var(ENV_CHAT_ENDPOINT) {
        if !endpoint.trim().is_empty() {
            config.chat.endpoint = endpoint;
        }
    }
    if let Ok(model) = std::env::var(ENV_CHAT_MODEL) {
        if !model.trim().is_empty() {
            config.chat.model = model;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_sections_missing() {
        let config = parse_config("").expect("empty config");
        assert_eq!(config.session.ttl_hours, 12);
        assert_eq!(config.chat.history_window, 10);
        assert!(config.chat.api_key.is_none());
    }

    #[test]
    fn resolves_env_reference_in_api_key() {
        std::env::set_var("_SCHOOLD_TEST_KEY", "k-123");
        let config = parse_config(
            r#"
[chat]
api_key = "${_SCHOOLD_TEST_KEY}"
timeout_secs = 5
"#,
        )
        .expect("parse");
        assert_eq!(config.chat.api_key.as_deref(), Some("k-123"));
        assert_eq!(config.chat.timeout_secs, 5);
        std::env::remove_var("_SCHOOLD_TEST_KEY");
    }

    #[test]
    fn substituted_values_are_not_rescanned() {
        std::env::set_var("_SCHOOLD_TEST_LOOP", "x${_SCHOOLD_TEST_LOOP}y");
        let resolved = resolve_env_vars("a/${_SCHOOLD_TEST_LOOP}/${_SCHOOLD_TEST_UNSET}/b");
        assert_eq!(resolved, "a/x${_SCHOOLD_TEST_LOOP}y//b");
        assert_eq!(resolve_env_vars("open ${brace"), "open ${brace");
        std::env::remove_var("_SCHOOLD_TEST_LOOP");
    }

    #[test]
    fn debug_masks_api_key() {
        let chat = ChatConfig {
            api_key: Some("secret-value".into()),
            ..Default::default()
        };
        let shown = format!("{:?}", chat);
        assert!(!shown.contains("secret-value"));
        assert!(shown.contains("***"));
    }
}
