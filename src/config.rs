//! Configuration management for aiui.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::AdapterError;

pub const FALLBACK_MODEL: &str = "gpt-4o-2024-08-06";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// When false, provider I/O is bypassed and replies are echoed back.
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_fallback_model")]
    pub fallback_model: String,
    /// Delay between echoed characters in streaming echo mode.
    #[serde(default = "default_echo_delay_ms")]
    pub echo_delay_ms: u64,
    /// Persona document; the built-in persona is used when unset.
    #[serde(default)]
    pub persona_path: Option<PathBuf>,
}

fn bool_true() -> bool {
    true
}

fn default_fallback_model() -> String {
    FALLBACK_MODEL.to_string()
}

fn default_echo_delay_ms() -> u64 {
    10
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fallback_model: default_fallback_model(),
            echo_delay_ms: default_echo_delay_ms(),
            persona_path: None,
        }
    }
}

impl ChatConfig {
    pub fn echo_delay(&self) -> Duration {
        Duration::from_millis(self.echo_delay_ms)
    }
}

/// Connection settings for one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub api_base: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    /// Timeout for blocking requests. Streaming requests are bounded by
    /// the caller instead.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl ProviderConfig {
    /// Resolve the credential from the config file first, then the
    /// environment. Missing credentials surface at call time.
    pub fn api_key(&self, provider: &'static str) -> Result<String, AdapterError> {
        if let Some(key) = &self.api_key {
            if !key.is_empty() {
                return Ok(key.clone());
            }
        }
        if let Some(var) = &self.api_key_env {
            if let Ok(key) = std::env::var(var) {
                if !key.is_empty() {
                    return Ok(key);
                }
            }
        }
        Err(AdapterError::MissingCredential {
            provider,
            env: self.api_key_env.clone(),
        })
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default = "default_openai")]
    pub openai: ProviderConfig,
    #[serde(default = "default_gemini")]
    pub gemini: ProviderConfig,
    #[serde(default = "default_llama")]
    pub llama: ProviderConfig,
}

fn default_openai() -> ProviderConfig {
    ProviderConfig {
        api_base: "https://api.openai.com/v1".to_string(),
        api_key: None,
        api_key_env: Some("OPENAI_API_KEY".to_string()),
        temperature: None,
        timeout_secs: None,
    }
}

fn default_gemini() -> ProviderConfig {
    ProviderConfig {
        api_base: "https://generativelanguage.googleapis.com/v1beta/models".to_string(),
        api_key: None,
        api_key_env: Some("GEMINI_API_KEY".to_string()),
        temperature: Some(0.7),
        timeout_secs: None,
    }
}

fn default_llama() -> ProviderConfig {
    ProviderConfig {
        api_base: "http://localhost:8080/v1".to_string(),
        // llama.cpp ignores the value but some servers require the header
        api_key: Some("unused".to_string()),
        api_key_env: None,
        temperature: Some(0.7),
        timeout_secs: Some(120),
    }
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            openai: default_openai(),
            gemini: default_gemini(),
            llama: default_llama(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Models callers may request. Empty allows any model.
    #[serde(default)]
    pub allowed_models: Vec<String>,
    /// Bearer token to user id. Empty disables authentication.
    #[serde(default)]
    pub tokens: HashMap<String, String>,
}

fn default_bind() -> String {
    "127.0.0.1:3000".to_string()
}

fn default_heartbeat_secs() -> u64 {
    15
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            heartbeat_secs: default_heartbeat_secs(),
            allowed_models: Vec::new(),
            tokens: HashMap::new(),
        }
    }
}

impl ServerConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    pub fn model_allowed(&self, model: &str) -> bool {
        self.allowed_models.is_empty() || self.allowed_models.iter().any(|m| m == model)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_server_url")]
    pub server_url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_client_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_server_url() -> String {
    "http://127.0.0.1:3000".to_string()
}

fn default_client_timeout_secs() -> u64 {
    120
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            token: None,
            timeout_secs: default_client_timeout_secs(),
        }
    }
}

impl ClientConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl AppConfig {
    pub fn config_path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(".aiui").join("config.toml"))
    }

    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        let mut config = if config_path.exists() {
            Self::load_from(&config_path)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Apply environment overrides on top of the file configuration.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let disabled = |key: &str| lookup(key).is_some_and(|v| v.eq_ignore_ascii_case("false"));
        if disabled("AI_ENABLED") || disabled("OPENAI_ENABLED") {
            self.chat.enabled = false;
        }
        if let Some(model) = lookup("DEFAULT_MODEL").filter(|m| !m.is_empty()) {
            self.chat.fallback_model = model;
        }
        if let Some(url) = lookup("LLAMA_API_URL").filter(|u| !u.is_empty()) {
            self.providers.llama.api_base = url;
        }
        if let Some(bind) = lookup("AIUI_BIND").filter(|b| !b.is_empty()) {
            self.server.bind = bind;
        }
    }

    pub fn save_default() -> Result<PathBuf> {
        let config_path = Self::config_path()?;
        Self::write_default(&config_path)?;
        Ok(config_path)
    }

    pub fn write_default(path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }
        let content =
            toml::to_string_pretty(&Self::default()).context("Failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_round_trip_through_toml() {
        let text = toml::to_string_pretty(&AppConfig::default()).unwrap();
        let parsed: AppConfig = toml::from_str(&text).unwrap();
        assert!(parsed.chat.enabled);
        assert_eq!(parsed.chat.fallback_model, FALLBACK_MODEL);
        assert_eq!(parsed.providers.llama.timeout_secs, Some(120));
        assert_eq!(parsed.client.timeout_secs, 120);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[chat]\nenabled = false\n\n[server]\nallowed_models = [\"gpt-4o\"]\n",
        )
        .unwrap();
        let config = AppConfig::load_from(&path).unwrap();
        assert!(!config.chat.enabled);
        assert_eq!(config.chat.echo_delay_ms, 10);
        assert_eq!(config.providers.gemini.api_key_env.as_deref(), Some("GEMINI_API_KEY"));
        assert!(config.server.model_allowed("gpt-4o"));
        assert!(!config.server.model_allowed("gemini-pro"));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = AppConfig::default();
        config.apply_env(|key| match key {
            "OPENAI_ENABLED" => Some("false".to_string()),
            "DEFAULT_MODEL" => Some("llama-3-8b".to_string()),
            "LLAMA_API_URL" => Some("http://gpu:8080/v1".to_string()),
            _ => None,
        });
        assert!(!config.chat.enabled);
        assert_eq!(config.chat.fallback_model, "llama-3-8b");
        assert_eq!(config.providers.llama.api_base, "http://gpu:8080/v1");
    }

    #[test]
    fn test_enabled_unless_explicitly_false() {
        let mut config = AppConfig::default();
        config.apply_env(|key| (key == "AI_ENABLED").then(|| "true".to_string()));
        assert!(config.chat.enabled);
    }

    #[test]
    fn test_inline_key_wins() {
        let mut provider = default_openai();
        provider.api_key = Some("sk-inline".to_string());
        assert_eq!(provider.api_key("OpenAI").unwrap(), "sk-inline");
    }

    #[test]
    fn test_missing_key_names_env_var() {
        let mut provider = default_gemini();
        provider.api_key_env = Some("AIUI_TEST_SURELY_UNSET_KEY".to_string());
        let err = provider.api_key("Gemini").unwrap_err();
        assert!(err.to_string().contains("AIUI_TEST_SURELY_UNSET_KEY"));
    }

    #[test]
    fn test_missing_key_without_env_var() {
        let mut provider = default_gemini();
        provider.api_key = None;
        provider.api_key_env = None;
        let err = provider.api_key("Gemini").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Gemini API key not found: set api_key in the config file"
        );
    }
}
