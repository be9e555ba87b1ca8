//! Configuration management for the outbox engine

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub x: Option<XConfig>,
    pub bluesky: Option<BlueskyConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

/// OAuth2 application credentials for the X API. The user tokens
/// themselves live in the database, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XConfig {
    pub enabled: bool,
    pub client_id: String,
    pub client_secret: String,
    /// API base URL, overridable for tests.
    #[serde(default = "default_x_api_base")]
    pub api_base: String,
}

fn default_x_api_base() -> String {
    "https://api.x.com".to_string()
}

/// Bluesky account identity. The session tokens live in the database;
/// the app password here is only used for a full login when session
/// resumption fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlueskyConfig {
    pub enabled: bool,
    pub identifier: String,
    pub app_password: String,
    #[serde(default = "default_bluesky_service")]
    pub service: String,
}

fn default_bluesky_service() -> String {
    "https://bsky.social".to_string()
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let config: Config = toml::from_str(&content).map_err(ConfigError::ParseError)?;
        Ok(config)
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            database: DatabaseConfig {
                path: "~/.local/share/outbox/outbox.db".to_string(),
            },
            x: None,
            bluesky: None,
        }
    }
}

/// Resolve the configuration file path following XDG Base Directory spec
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("OUTBOX_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("outbox").join("config.toml"))
}

/// Resolve the data directory path following XDG Base Directory spec
pub fn resolve_data_path() -> Result<PathBuf> {
    let data_dir =
        dirs::data_dir().ok_or_else(|| ConfigError::MissingField("data directory".to_string()))?;

    Ok(data_dir.join("outbox"))
}
