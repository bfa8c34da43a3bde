use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{LangdagError, Result};
use crate::event::DEFAULT_EVENT_BUFFER;

/// Top-level LangDAG configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_path")]
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

fn default_storage_path() -> String { "~/.config/langdag/langdag.db".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Which provider to use: "anthropic" or "mock".
    #[serde(default = "default_provider")]
    pub default: String,
    #[serde(default)]
    pub anthropic: AnthropicConfig,
    #[serde(default)]
    pub mock: MockConfig,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            default: default_provider(),
            anthropic: AnthropicConfig::default(),
            mock: MockConfig::default(),
        }
    }
}

fn default_provider() -> String { "anthropic".to_string() }

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnthropicConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    /// Override for the API base URL (e.g. a proxy).
    #[serde(default)]
    pub base_url: Option<String>,
}

/// Response mode of the mock provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MockMode {
    #[default]
    Random,
    Echo,
    Fixed,
}

impl std::str::FromStr for MockMode {
    type Err = LangdagError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "random" => Ok(Self::Random),
            "echo" => Ok(Self::Echo),
            "fixed" => Ok(Self::Fixed),
            other => Err(LangdagError::Config(format!("unknown mock mode: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MockConfig {
    #[serde(default)]
    pub mode: MockMode,
    #[serde(default)]
    pub fixed_response: Option<String>,
    /// Delay before the first chunk.
    #[serde(default)]
    pub delay_ms: u64,
    /// Delay between chunks.
    #[serde(default)]
    pub chunk_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Capacity of the bounded event queue per prompt or run.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_model: default_model(),
            max_tokens: default_max_tokens(),
            event_buffer: default_event_buffer(),
        }
    }
}

fn default_model() -> String { "claude-sonnet-4-20250514".to_string() }
fn default_max_tokens() -> u32 { 4096 }
fn default_event_buffer() -> usize { DEFAULT_EVENT_BUFFER }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String { "info".to_string() }

impl AppConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| LangdagError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded)
            .map_err(|e| LangdagError::Config(e.to_string()))
    }

    /// Default config file location.
    pub fn default_path() -> PathBuf {
        match dirs_home() {
            Some(home) => home.join(".config").join("langdag").join("config.toml"),
            None => PathBuf::from("langdag.toml"),
        }
    }

    /// Apply `LANGDAG_*` / `ANTHROPIC_API_KEY` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_with(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup.
    pub fn apply_overrides_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("LANGDAG_STORAGE_PATH") {
            self.storage.path = path;
        }
        if let Some(provider) = lookup("LANGDAG_PROVIDER") {
            self.provider.default = provider;
        }
        if let Some(key) = lookup("ANTHROPIC_API_KEY") {
            self.provider.anthropic.api_key = Some(key);
        }
        if let Some(mode) = lookup("LANGDAG_MOCK_MODE") {
            self.provider.mock.mode = mode.parse()?;
        }
        if let Some(response) = lookup("LANGDAG_MOCK_RESPONSE") {
            self.provider.mock.fixed_response = Some(response);
        }
        Ok(())
    }

    /// Resolve the database path (expand ~).
    pub fn storage_path(&self) -> PathBuf {
        let path = &self.storage.path;
        if let Some(rest) = path.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return home.join(rest);
            }
        }
        PathBuf::from(path)
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Unset variables stay literal
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
