//! Configuration management for the Relay gateway.
//!
//! Configuration lives in a single JSON file at `~/.relay/config.json`.
//!
//! # Configuration Priority
//!
//! 1. Environment variables (`RELAY_*` prefix)
//! 2. Explicit config file values
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! - `RELAY_BIND` → server.host
//! - `RELAY_PORT` → server.port
//! - `RELAY_SIGNING_SECRET` → chat.signing_secret
//! - `RELAY_CHAT_API_BASE` → chat.api_base
//! - `RELAY_STORE_ENDPOINT` → store.endpoint
//! - `RELAY_QUEUE_ENDPOINT` → queue.endpoint
//! - `RELAY_BOT_TOKEN` / `RELAY_BOT_ID` / `RELAY_BOT_USER_ID` → fallback_credential
//! - `RELAY_LOG_LEVEL` / `RELAY_LOG_FORMAT` → observability

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".relay"),
        |dirs| dirs.home_dir().join(".relay"),
    )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

/// HTTP server bind configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address. Default: "127.0.0.1" (local only)
    #[serde(default = "default_host")]
    pub host: String,

    /// Listen port
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    4460
}

/// Chat platform configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Shared secret used to verify inbound webhook signatures.
    #[serde(default)]
    pub signing_secret: String,

    /// Base URL of the chat platform Web API.
    #[serde(default = "default_chat_api_base")]
    pub api_base: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            signing_secret: String::new(),
            api_base: default_chat_api_base(),
        }
    }
}

fn default_chat_api_base() -> String {
    "https://slack.com/api".into()
}

/// Remote approval/installation store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Base URL of the approval store service.
    #[serde(default = "default_store_endpoint")]
    pub endpoint: String,

    /// Request timeout in seconds for store calls.
    #[serde(default = "default_store_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoint: default_store_endpoint(),
            timeout_secs: default_store_timeout_secs(),
        }
    }
}

fn default_store_endpoint() -> String {
    "http://127.0.0.1:4470".into()
}

fn default_store_timeout_secs() -> u64 {
    10
}

/// Message queue configuration for mention/DM hand-off.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Base URL of the message-queue service.
    #[serde(default = "default_queue_endpoint")]
    pub endpoint: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            endpoint: default_queue_endpoint(),
        }
    }
}

fn default_queue_endpoint() -> String {
    "http://127.0.0.1:4480".into()
}

/// Time windows and ceilings consumed by the gateway core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum tolerated webhook timestamp skew, in seconds (either direction).
    #[serde(default = "default_replay_window_secs")]
    pub replay_window_secs: i64,

    /// How long a resolved tenant credential may be served from cache.
    #[serde(default = "default_credential_ttl_secs")]
    pub credential_ttl_secs: i64,

    /// Interval between expiration sweeps, in seconds.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Accepted events per tenant per minute before further events are dropped.
    #[serde(default = "default_events_per_minute")]
    pub events_per_minute: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            replay_window_secs: default_replay_window_secs(),
            credential_ttl_secs: default_credential_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            events_per_minute: default_events_per_minute(),
        }
    }
}

fn default_replay_window_secs() -> i64 {
    300
}

fn default_credential_ttl_secs() -> i64 {
    300
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_events_per_minute() -> u32 {
    120
}

/// Statically configured bot credential used when no installation exists
/// for a tenant (single-tenant / back-compat deployments).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackCredential {
    pub bot_token: String,
    pub bot_id: String,
    pub bot_user_id: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Base log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Output format: "json" or "pretty"
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

/// Root configuration for the Relay gateway.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub chat: ChatConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    /// Optional static credential used when a tenant has no installation.
    #[serde(default)]
    pub fallback_credential: Option<FallbackCredential>,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl RelayConfig {
    /// Load configuration from the default path, applying environment overrides.
    ///
    /// A missing config file is not an error; defaults are used.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&config_path())?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from an explicit path, without environment overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Apply `RELAY_*` environment overrides on top of file values.
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("RELAY_BIND") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("RELAY_PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }
        if let Ok(secret) = std::env::var("RELAY_SIGNING_SECRET") {
            self.chat.signing_secret = secret;
        }
        if let Ok(base) = std::env::var("RELAY_CHAT_API_BASE") {
            self.chat.api_base = base;
        }
        if let Ok(endpoint) = std::env::var("RELAY_STORE_ENDPOINT") {
            self.store.endpoint = endpoint;
        }
        if let Ok(endpoint) = std::env::var("RELAY_QUEUE_ENDPOINT") {
            self.queue.endpoint = endpoint;
        }
        if let Ok(level) = std::env::var("RELAY_LOG_LEVEL") {
            self.observability.log_level = level;
        }
        if let Ok(format) = std::env::var("RELAY_LOG_FORMAT") {
            self.observability.log_format = format;
        }

        // A fallback credential from the environment needs all three parts.
        if let (Ok(token), Ok(bot_id), Ok(bot_user_id)) = (
            std::env::var("RELAY_BOT_TOKEN"),
            std::env::var("RELAY_BOT_ID"),
            std::env::var("RELAY_BOT_USER_ID"),
        ) {
            self.fallback_credential = Some(FallbackCredential {
                bot_token: token,
                bot_id,
                bot_user_id,
            });
        }
    }

    /// Persist the configuration to the given path as pretty JSON.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config dir {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config file {}", path.display()))
    }
}
