use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Root configuration for mimi.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
#[derive(Default)]
pub struct Config {
    pub line: LineConfig,
    pub provider: ProviderConfig,
    pub models: ModelsConfig,
    pub history: HistoryConfig,
    pub make: MakeConfig,
    pub database: DatabaseConfig,
    pub gateway: GatewayConfig,
}

impl Config {
    /// API key for the completion service, if one is set.
    pub fn api_key(&self) -> Option<&str> {
        if self.provider.api_key.is_empty() {
            None
        } else {
            Some(&self.provider.api_key)
        }
    }

    /// `host:port` the HTTP service binds to.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.gateway.host, self.gateway.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LineConfig {
    pub channel_secret: String,
    pub channel_access_token: String,
    pub api_base: String,
    /// Host serving message content (images); LINE splits it from the bot API.
    pub data_api_base: String,
}

impl Default for LineConfig {
    fn default() -> Self {
        Self {
            channel_secret: String::new(),
            channel_access_token: String::new(),
            api_base: "https://api.line.me".to_string(),
            data_api_base: "https://api-data.line.me".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
#[derive(Default)]
pub struct ProviderConfig {
    pub api_key: String,
    pub api_base: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelsConfig {
    pub chat_model: String,
    pub vision_model: String,
    pub max_tokens: u32,
    pub temperature: f64,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            chat_model: "gpt-4.1-mini".to_string(),
            vision_model: "gpt-4o-mini".to_string(),
            max_tokens: 400,
            temperature: 0.7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HistoryConfig {
    pub window_hours: i64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { window_hours: 36 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
#[derive(Default)]
pub struct MakeConfig {
    /// Shared secret expected in the `x-api-key` header.
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseConfig {
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://mimi.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8787,
        }
    }
}

// ====== Config loading/saving ======

/// Load configuration from environment variables.
///
/// Priority:
/// 1. `MIMI_CONFIG` env var: full JSON config
/// 2. Individual env vars (merged on top of the file or defaults)
/// 3. File fallback (`~/.mimi/config.json` or `config_path`)
pub fn load_config_from_env(config_path: Option<&Path>) -> Config {
    if let Ok(json) = std::env::var("MIMI_CONFIG") {
        match serde_json::from_str::<Config>(&json) {
            Ok(config) => return config,
            Err(e) => {
                tracing::warn!("Failed to parse MIMI_CONFIG: {}", e);
            }
        }
    }

    let mut cfg = load_config(config_path);
    apply_env_overrides(&mut cfg, |name| std::env::var(name).ok());
    cfg
}

/// Overlay individual variables onto `cfg`. `lookup` resolves a variable name.
pub fn apply_env_overrides(cfg: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    // Completion service
    if let Some(v) = lookup("OPENAI_API_KEY") {
        cfg.provider.api_key = v;
    }
    if let Some(v) = lookup("OPENAI_API_BASE") {
        cfg.provider.api_base = Some(v);
    }
    if let Some(v) = lookup("MIMI_CHAT_MODEL") {
        cfg.models.chat_model = v;
    }
    if let Some(v) = lookup("MIMI_VISION_MODEL") {
        cfg.models.vision_model = v;
    }

    // LINE
    if let Some(v) = lookup("LINE_CHANNEL_ACCESS_TOKEN") {
        cfg.line.channel_access_token = v;
    }
    if let Some(v) = lookup("LINE_CHANNEL_SECRET") {
        cfg.line.channel_secret = v;
    }

    // Make.com shared secret
    if let Some(v) = lookup("API_KEY") {
        cfg.make.api_key = v;
    }

    if let Some(v) = lookup("DATABASE_URL") {
        cfg.database.url = v;
    }

    // Gateway
    if let Some(v) = lookup("MIMI_HOST") {
        cfg.gateway.host = v;
    }
    if let Some(v) = lookup("MIMI_PORT") {
        match v.parse::<u16>() {
            Ok(port) => cfg.gateway.port = port,
            Err(e) => tracing::warn!("Ignoring invalid MIMI_PORT {:?}: {}", v, e),
        }
    }
}

/// Get the default configuration file path.
pub fn get_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mimi")
        .join("config.json")
}

/// Load configuration from file or create default.
pub fn load_config(config_path: Option<&Path>) -> Config {
    let path = config_path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(get_config_path);

    if path.exists() {
        match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<Config>(&content) {
                Ok(config) => return config,
                Err(e) => {
                    tracing::warn!("Failed to parse config from {}: {}", path.display(), e);
                    tracing::warn!("Using default configuration.");
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read config from {}: {}", path.display(), e);
                tracing::warn!("Using default configuration.");
            }
        }
    }

    Config::default()
}

/// Write `config` as pretty JSON, creating parent directories as needed.
pub fn save_config(config: &Config, config_path: Option<&Path>) -> std::result::Result<(), ConfigError> {
    let path = config_path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(get_config_path);

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let mut json = serde_json::to_string_pretty(config)?;
    json.push('\n');
    std::fs::write(&path, json)?;
    tracing::debug!("Wrote config to {}", path.display());
    Ok(())
}
