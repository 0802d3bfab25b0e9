//! Session configuration.
//!
//! Loaded from `~/.config/repolens/config.toml` (or an explicit path). Every
//! field has a default, so an empty or missing file is a valid configuration.
//!
//! ```toml
//! [llm]
//! provider = "gemini"
//! model = "gemini-2.5-flash"
//! api_key_env = "GEMINI_API_KEY"
//! max_turns = 25
//!
//! [github]
//! token_env = "GITHUB_TOKEN"
//!
//! [tools]
//! read_cap = 30000
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tools::DEFAULT_READ_CAP;

/// Default model when none is configured.
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";

/// Default cap on model turns per user message.
pub const DEFAULT_MAX_TURNS: u32 = 25;

/// Default GitHub API endpoint.
pub const DEFAULT_GITHUB_API: &str = "https://api.github.com";

/// Configuration loading error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub llm: LlmConfig,
    pub github: GitHubConfig,
    pub tools: ToolsConfig,
}

impl Config {
    /// Default config file location.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("repolens").join("config.toml"))
    }

    /// Parse configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Load configuration from a file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Load from `path` if given, else from the default location if it exists,
    /// else defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => {
                tracing::debug!(path = %path.display(), "loading config");
                Self::load(&path)
            }
            _ => Ok(Self::default()),
        }
    }
}

/// Model provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Provider type identifier (only "gemini" is built in).
    pub provider: String,

    /// Model identifier.
    pub model: String,

    /// API key (inline).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Environment variable holding the API key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// Base URL override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Sampling temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Maximum output tokens per turn.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,

    /// Maximum model turns per user message.
    pub max_turns: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "gemini".to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: None,
            api_key_env: None,
            base_url: None,
            temperature: None,
            max_output_tokens: None,
            max_turns: DEFAULT_MAX_TURNS,
        }
    }
}

impl LlmConfig {
    /// Set API key directly.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Set the model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Set the turn cap.
    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = max_turns;
        self
    }

    /// Resolve API key from config or environment.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = &self.api_key {
            return Some(key.clone());
        }
        if let Some(env_var) = &self.api_key_env {
            return std::env::var(env_var).ok();
        }
        let standard_env = match self.provider.as_str() {
            "gemini" => "GEMINI_API_KEY",
            _ => return None,
        };
        std::env::var(standard_env).ok()
    }
}

/// GitHub access configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitHubConfig {
    /// REST API base URL.
    pub api_base: String,

    /// Access token (inline).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Environment variable holding the token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,

    /// User-Agent header (required by the API).
    pub user_agent: String,

    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_GITHUB_API.to_string(),
            token: None,
            token_env: None,
            user_agent: concat!("repolens/", env!("CARGO_PKG_VERSION")).to_string(),
            timeout_secs: 30,
        }
    }
}

impl GitHubConfig {
    /// Set token directly.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Resolve the token from config or environment. Anonymous access if none.
    pub fn resolve_token(&self) -> Option<String> {
        if let Some(token) = &self.token {
            return Some(token.clone());
        }
        let env_var = self.token_env.as_deref().unwrap_or("GITHUB_TOKEN");
        std::env::var(env_var).ok().filter(|t| !t.is_empty())
    }
}

/// Tool behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Maximum characters returned by `read_file`.
    pub read_cap: usize,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            read_cap: DEFAULT_READ_CAP,
        }
    }
}
