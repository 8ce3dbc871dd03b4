use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level application configuration, loaded from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sprites: SpritesConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// SSH front-end settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// TCP bind address for the SSH listener.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Host key location. Empty selects the default under the user's SSH directory.
    #[serde(default)]
    pub host_key_path: PathBuf,

    /// Exec retry ceiling. Interactive shells are promoted to at least 10.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Deadline for bind and graceful-shutdown operations.
    #[serde(default = "default_socket_timeout_secs")]
    pub socket_timeout_secs: u64,

    /// SSH keepalive period. 0 disables keepalive.
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,

    /// Unanswered keepalives tolerated before the connection is closed.
    #[serde(default = "default_keepalive_max")]
    pub keepalive_max: u32,
}

/// Provider API settings. Token resolution may fall back to the user's
/// sprites config file when the token is not set here or in the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpritesConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,

    #[serde(default)]
    pub token: String,

    #[serde(default)]
    pub org: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

fn default_listen() -> String {
    "0.0.0.0:2222".to_string()
}

fn default_max_retries() -> u32 {
    5
}

fn default_socket_timeout_secs() -> u64 {
    10
}

fn default_keepalive_interval_secs() -> u64 {
    30
}

fn default_keepalive_max() -> u32 {
    1
}

fn default_api_url() -> String {
    "https://api.sprites.dev".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            host_key_path: PathBuf::new(),
            max_retries: default_max_retries(),
            socket_timeout_secs: default_socket_timeout_secs(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
            keepalive_max: default_keepalive_max(),
        }
    }
}

impl Default for SpritesConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            token: String::new(),
            org: String::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}
