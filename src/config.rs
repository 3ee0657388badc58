//! Configuration management for linguagate.
//!
//! Loads settings from `~/.config/linguagate/config.toml` with `LINGUAGATE_*`
//! environment overrides.

use crate::auth::AuthPolicy;
use crate::gateway::GatewaySettings;
use crate::language::{parse_code_list, LanguageCode};
use crate::limiter::{AddressScope, QuotaTier};
use crate::registry::RegistryOptions;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_PIVOT: &str = "en";
pub const DEFAULT_KEY_REQ_LIMIT: u64 = 80;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Largest text accepted per request, in characters.
    #[serde(default)]
    pub char_limit: Option<usize>,
    /// Most texts accepted in one batched request.
    #[serde(default)]
    pub batch_limit: Option<usize>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    #[serde(default = "default_probe_text")]
    pub probe_text: String,
    /// Token for `/admin` routes. Admin routes are disabled without one.
    #[serde(default)]
    pub admin_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelsConfig {
    #[serde(default = "default_models_dir")]
    pub dir: PathBuf,
    /// Model index URL or path. Without one only the saved index is used.
    #[serde(default)]
    pub index_url: Option<String>,
    #[serde(default = "default_catalog_ttl_secs")]
    pub catalog_ttl_secs: u64,
    /// Language codes to install and load. Empty means all.
    #[serde(default)]
    pub load_only: Vec<String>,
    #[serde(default)]
    pub update_models: bool,
    #[serde(default = "default_pivot")]
    pub pivot: String,
    #[serde(default)]
    pub memory_budget_bytes: Option<u64>,
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
    #[serde(default = "default_worker_url")]
    pub worker_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthConfig {
    /// Require an API key on every request.
    #[serde(default)]
    pub require_key: bool,
    #[serde(default = "default_key_db")]
    pub key_db: PathBuf,
    /// Window for per-key limits.
    #[serde(default = "default_window_secs")]
    pub key_window_secs: u64,
    #[serde(default = "default_key_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Request limit given to keys issued without one.
    #[serde(default = "default_key_req_limit")]
    pub default_req_limit: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LimitsConfig {
    /// Requests per window for callers without a key. Unset means unlimited.
    #[serde(default)]
    pub req_limit: Option<u64>,
    /// Characters per window for callers without a key.
    #[serde(default)]
    pub char_limit: Option<u64>,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default)]
    pub address_scope: AddressScope,
    #[serde(default = "default_stripes")]
    pub stripes: usize,
    #[serde(default = "default_purge_interval_secs")]
    pub purge_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub verbosity: LogVerbosity,
    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiConfig {
    /// Take the client address from `X-Forwarded-For` when present.
    /// Turn off when the gateway is not behind a trusted proxy.
    #[serde(default = "default_true")]
    pub trust_forwarded_for: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogVerbosity {
    Minimal,
    #[default]
    Compact,
    Verbose,
}

// Default value functions
fn default_host() -> String { "127.0.0.1".to_string() }
fn default_port() -> u16 { DEFAULT_PORT }
fn default_request_timeout_secs() -> u64 { 30 }
fn default_probe_timeout_secs() -> u64 { 5 }
fn default_probe_text() -> String { "Hello".to_string() }
fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("linguagate")
}
fn default_models_dir() -> PathBuf { data_dir().join("models") }
fn default_catalog_ttl_secs() -> u64 { 3600 }
fn default_pivot() -> String { DEFAULT_PIVOT.to_string() }
fn default_drain_timeout_secs() -> u64 { 30 }
fn default_worker_url() -> String { "http://127.0.0.1:5001".to_string() }
fn default_key_db() -> PathBuf { data_dir().join("api_keys.db") }
fn default_window_secs() -> u64 { 60 }
fn default_key_cache_ttl_secs() -> u64 { 30 }
fn default_key_req_limit() -> u64 { DEFAULT_KEY_REQ_LIMIT }
fn default_stripes() -> usize { crate::limiter::DEFAULT_STRIPES }
fn default_purge_interval_secs() -> u64 { 60 }
fn default_level() -> String { "info".to_string() }
fn default_true() -> bool { true }

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            char_limit: None,
            batch_limit: None,
            request_timeout_secs: default_request_timeout_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            probe_text: default_probe_text(),
            admin_token: None,
        }
    }
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            dir: default_models_dir(),
            index_url: None,
            catalog_ttl_secs: default_catalog_ttl_secs(),
            load_only: Vec::new(),
            update_models: false,
            pivot: default_pivot(),
            memory_budget_bytes: None,
            drain_timeout_secs: default_drain_timeout_secs(),
            worker_url: default_worker_url(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            require_key: false,
            key_db: default_key_db(),
            key_window_secs: default_window_secs(),
            cache_ttl_secs: default_key_cache_ttl_secs(),
            default_req_limit: default_key_req_limit(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            req_limit: None,
            char_limit: None,
            window_secs: default_window_secs(),
            address_scope: AddressScope::default(),
            stripes: default_stripes(),
            purge_interval_secs: default_purge_interval_secs(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            trust_forwarded_for: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            verbosity: LogVerbosity::default(),
            json: false,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

impl Config {
    /// Get the default config file path.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("linguagate")
            .join("config.toml")
    }

    /// Load config from file, falling back to defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Self::default_path())
    }

    /// Load config from a specific path.
    pub fn load_from(path: PathBuf) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(&path) {
            Ok(content) => toml::from_str(&content).map_err(ConfigError::Parse),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(ConfigError::Io(e)),
        }
    }

    /// Apply environment variable overrides.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(host) = std::env::var("LINGUAGATE_HOST") {
            self.gateway.host = host;
        }
        if let Some(port) = env_parse("LINGUAGATE_PORT") {
            self.gateway.port = port;
        }
        if let Some(limit) = env_parse("LINGUAGATE_CHAR_LIMIT") {
            self.gateway.char_limit = Some(limit);
        }
        if let Some(limit) = env_parse("LINGUAGATE_BATCH_LIMIT") {
            self.gateway.batch_limit = Some(limit);
        }
        if let Ok(token) = std::env::var("LINGUAGATE_ADMIN_TOKEN") {
            self.gateway.admin_token = Some(token).filter(|t| !t.is_empty());
        }
        if let Ok(dir) = std::env::var("LINGUAGATE_MODELS_DIR") {
            self.models.dir = PathBuf::from(dir);
        }
        if let Ok(url) = std::env::var("LINGUAGATE_INDEX_URL") {
            self.models.index_url = Some(url);
        }
        if let Ok(codes) = std::env::var("LINGUAGATE_LOAD_ONLY") {
            self.models.load_only = codes
                .split(',')
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect();
        }
        if let Some(update) = env_flag("LINGUAGATE_UPDATE_MODELS") {
            self.models.update_models = update;
        }
        if let Ok(pivot) = std::env::var("LINGUAGATE_PIVOT") {
            self.models.pivot = pivot;
        }
        if let Ok(url) = std::env::var("LINGUAGATE_WORKER_URL") {
            self.models.worker_url = url;
        }
        if let Some(require) = env_flag("LINGUAGATE_API_KEYS") {
            self.auth.require_key = require;
        }
        if let Ok(path) = std::env::var("LINGUAGATE_KEY_DB") {
            self.auth.key_db = PathBuf::from(path);
        }
        if let Some(limit) = env_parse("LINGUAGATE_REQ_LIMIT") {
            self.limits.req_limit = Some(limit);
        }
        if let Some(limit) = env_parse("LINGUAGATE_WINDOW_CHAR_LIMIT") {
            self.limits.char_limit = Some(limit);
        }
        if let Some(secs) = env_parse("LINGUAGATE_WINDOW_SECS") {
            self.limits.window_secs = secs;
        }
        if let Some(trust) = env_flag("LINGUAGATE_TRUST_FORWARDED_FOR") {
            self.api.trust_forwarded_for = trust;
        }
        if let Ok(level) = std::env::var("LINGUAGATE_LOG_LEVEL") {
            self.logging.level = level;
        }
        self
    }

    /// Save config to file.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(Self::default_path())
    }

    /// Save config to a specific path.
    pub fn save_to(&self, path: PathBuf) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(ConfigError::Io)?;
        }
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        std::fs::write(&path, content).map_err(ConfigError::Io)
    }

    /// The install/load allowlist, if one is configured.
    pub fn allowlist(&self) -> Result<Option<Vec<LanguageCode>>, ConfigError> {
        if self.models.load_only.is_empty() {
            return Ok(None);
        }
        parse_code_list(&self.models.load_only.join(","))
            .map(Some)
            .map_err(|e| ConfigError::Invalid(format!("models.load_only: {}", e)))
    }

    pub fn registry_options(&self) -> Result<RegistryOptions, ConfigError> {
        Ok(RegistryOptions {
            models_dir: self.models.dir.clone(),
            allowlist: self.allowlist()?,
            update_models: self.models.update_models,
            memory_budget_bytes: self.models.memory_budget_bytes,
            drain_timeout: Duration::from_secs(self.models.drain_timeout_secs),
        })
    }

    /// Quota policy for the authenticator. Zero-length windows are rejected.
    pub fn auth_policy(&self) -> Result<AuthPolicy, ConfigError> {
        Ok(AuthPolicy {
            require_key: self.auth.require_key,
            anonymous: QuotaTier::new(
                self.limits.req_limit,
                self.limits.char_limit,
                window("limits.window_secs", self.limits.window_secs)?,
            ),
            key_window: window("auth.key_window_secs", self.auth.key_window_secs)?,
            address_scope: self.limits.address_scope,
        })
    }

    pub fn gateway_settings(&self) -> GatewaySettings {
        GatewaySettings {
            char_limit: self.gateway.char_limit,
            batch_limit: self.gateway.batch_limit,
            request_timeout: Duration::from_secs(self.gateway.request_timeout_secs),
            probe_timeout: Duration::from_secs(self.gateway.probe_timeout_secs),
            probe_text: self.gateway.probe_text.clone(),
        }
    }

    /// Where the last fetched model index is kept.
    pub fn saved_index_path(&self) -> PathBuf {
        self.models.dir.join("index.json")
    }
}

fn window(name: &str, secs: u64) -> Result<Duration, ConfigError> {
    if secs == 0 {
        return Err(ConfigError::Invalid(format!("{} must be at least 1", name)));
    }
    Ok(Duration::from_secs(secs))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(std::io::Error),
    #[error("Parse error: {0}")]
    Parse(toml::de::Error),
    #[error("Serialize error: {0}")]
    Serialize(toml::ser::Error),
    #[error("Invalid setting: {0}")]
    Invalid(String),
}
