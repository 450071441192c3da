//! Configuration for the resilient session client
//!
//! Loaded from a TOML file with three sections:
//!
//! ```toml
//! [session]
//! url = "mqtt://localhost:1883"
//! username_env = "SESSION_USERNAME"
//! password_env = "SESSION_PASSWORD"
//!
//! [reconnect]
//! base_delay_ms = 100
//! max_delay_ms = 30000
//! jitter = false
//!
//! [subscriptions]
//! selectors = ["sensors/+/temperature"]
//! ```
//!
//! Credentials are named by environment variable and resolved when a session
//! is opened, never stored in the file.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Top-level client configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    pub session: SessionSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    #[serde(default)]
    pub subscriptions: SubscriptionsSection,
}

/// Session section - server location, credentials, and timeouts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSection {
    /// Server URL (mqtt://, mqtts://, ws:// or wss://)
    pub url: String,
    /// Prefix for generated client identifiers
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,
    /// Environment variable containing the principal/username
    pub username_env: Option<String>,
    /// Environment variable containing the password
    pub password_env: Option<String>,
    /// Keep-alive interval in seconds
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Upper bound on initial connection establishment
    #[serde(default = "default_establishment_timeout")]
    pub establishment_timeout_secs: u64,
    /// Upper bound on a single acknowledged request (ping, subscribe, unsubscribe)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Topic used for the diagnostic round-trip
    #[serde(default = "default_diagnostic_topic")]
    pub diagnostic_topic: String,
}

fn default_client_id_prefix() -> String {
    "resilient-session".to_string()
}

fn default_keep_alive() -> u64 {
    60
}

fn default_establishment_timeout() -> u64 {
    10
}

/// Acknowledgment timeout used when no session config is at hand
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

fn default_request_timeout() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_diagnostic_topic() -> String {
    "diagnostics/ping".to_string()
}

impl SessionSection {
    /// Section pointing at `url` with every other field defaulted
    pub fn for_url<S: Into<String>>(url: S) -> Self {
        Self {
            url: url.into(),
            client_id_prefix: default_client_id_prefix(),
            username_env: None,
            password_env: None,
            keep_alive_secs: default_keep_alive(),
            establishment_timeout_secs: default_establishment_timeout(),
            request_timeout_secs: default_request_timeout(),
            diagnostic_topic: default_diagnostic_topic(),
        }
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn establishment_timeout(&self) -> Duration {
        Duration::from_secs(self.establishment_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Resolve the username from its environment variable
    pub fn username(&self) -> Option<String> {
        get_env_var_optional(self.username_env.as_ref())
    }

    /// Resolve the password from its environment variable
    pub fn password(&self) -> Option<String> {
        get_env_var_optional(self.password_env.as_ref())
    }
}

/// Reconnect section - backoff policy and retry ceiling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    /// Delay before the first retry, doubled on each further attempt
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    /// Ceiling for any single retry delay
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    /// Randomize each delay within [delay/2, delay]
    #[serde(default)]
    pub jitter: bool,
    /// Give up after this many consecutive retries (None = unlimited)
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

fn default_base_delay() -> u64 {
    100
}

fn default_max_delay() -> u64 {
    30_000
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            jitter: false,
            max_attempts: None, // Unlimited retries by default
        }
    }
}

impl ReconnectSection {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Validate reconnect settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_delay_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "reconnect.max_delay_ms must be greater than 0".to_string(),
            ));
        }
        if self.base_delay_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "reconnect.base_delay_ms must be greater than 0".to_string(),
            ));
        }
        if self.max_attempts == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "reconnect.max_attempts must be greater than 0 or omitted for unlimited"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

/// Subscriptions section - selectors registered at startup
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionsSection {
    #[serde(default)]
    pub selectors: Vec<String>,
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid server URL: {0}")]
    InvalidUrl(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ClientConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration for `url` with default reconnect settings
    pub fn for_url<S: Into<String>>(url: S) -> Self {
        Self {
            session: SessionSection::for_url(url),
            reconnect: ReconnectSection::default(),
            subscriptions: SubscriptionsSection::default(),
        }
    }

    /// Validate all sections
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_server_url(&self.session.url)?;
        self.reconnect.validate()?;

        if self.session.diagnostic_topic.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "session.diagnostic_topic must not be empty".to_string(),
            ));
        }

        if let Some(selector) = self
            .subscriptions
            .selectors
            .iter()
            .find(|selector| selector.trim().is_empty())
        {
            return Err(ConfigError::InvalidConfig(format!(
                "subscriptions.selectors contains an empty selector: {selector:?}"
            )));
        }

        Ok(())
    }
}

/// URL schemes a session can be opened over
pub const SUPPORTED_SCHEMES: &[&str] = &["mqtt", "tcp", "mqtts", "ssl", "ws", "wss"];

/// Parse and check a server URL
pub fn validate_server_url(url: &str) -> Result<Url, ConfigError> {
    let parsed = Url::parse(url).map_err(|e| ConfigError::InvalidUrl(format!("{url}: {e}")))?;
    if !SUPPORTED_SCHEMES.contains(&parsed.scheme()) {
        return Err(ConfigError::InvalidUrl(format!(
            "{url}: unsupported scheme '{}', expected one of {}",
            parsed.scheme(),
            SUPPORTED_SCHEMES.join(", ")
        )));
    }
    if parsed.host_str().is_none() {
        return Err(ConfigError::InvalidUrl(format!("{url}: missing host")));
    }
    Ok(parsed)
}

fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
    env_var_name.and_then(|name| std::env::var(name).ok())
}
