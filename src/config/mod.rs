//!
//! Configuration for Anthromux.
//!
//! A `Config` is assembled from overlays: built-in defaults at the
//! bottom, then the system TOML file, then the user TOML file (or one
//! named via `ANTHROMUX_CONFIG_FILE`), then `ANTHROMUX_*` environment
//! variables on top. A source only affects the fields it mentions.
//!
//! This file holds the sections and their defaults; `loader.rs` does the
//! overlay folding and `paths.rs` knows the well-known file locations.
//!
//! Authors:
//!   Jaro <yarenty@gmail.com>
//!
//! Copyright (c) 2026 SkyCorp

/* --- modules --------------------------------------------------------------------------------- */

pub mod loader;
pub mod paths;

/* --- uses ------------------------------------------------------------------------------------ */

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ProxyError, Result};

/* --- types ----------------------------------------------------------------------------------- */

///
/// Main application configuration structure.
///
/// Groups settings by concern; every section has serde defaults so a
/// partial TOML file is enough to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// OpenAI-compatible upstream configuration
    #[serde(default)]
    pub upstream: UpstreamConfig,
    /// Retry behavior for rate-limited upstream calls
    #[serde(default)]
    pub retry: RetryConfig,
    /// Streaming behavior configuration
    #[serde(default)]
    pub streaming: StreamingConfig,
    /// Duplicate-request coalescing configuration
    #[serde(default)]
    pub coalesce: CoalesceConfig,
    /// Ordered model name mappings applied to incoming requests
    #[serde(default)]
    pub model_mappings: Vec<ModelMapping>,
}

///
/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP server port number
    #[serde(default = "default_port")]
    pub port: u16,
    /// Application logging level
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,
}

///
/// OpenAI-compatible upstream configuration.
///
/// The proxy sends translated requests to `{base_url}/chat/completions`
/// with `Authorization: Bearer {api_key}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL of the upstream, without the `/chat/completions` suffix
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// API key sent as a bearer token
    #[serde(default)]
    pub api_key: String,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Read timeout in seconds; generous so idle-but-alive streams survive
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
}

///
/// Retry behavior for rate-limited upstream calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Whether to retry rate-limited calls at all
    #[serde(default = "default_retry_enabled")]
    pub enabled: bool,
    /// Maximum retry attempts after the initial call
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

///
/// Streaming configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Delay inserted between emitted events for terminal-UI clients,
    /// in milliseconds (0 disables pacing; clamped to 50)
    #[serde(default = "default_pacing_delay_ms")]
    pub pacing_delay_ms: u64,
}

///
/// Duplicate-request coalescing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoalesceConfig {
    /// How long a cached response stays replayable, in seconds
    #[serde(default = "default_coalesce_ttl_secs")]
    pub ttl_secs: u64,
    /// Upper bound on cached responses held at once
    #[serde(default = "default_coalesce_max_entries")]
    pub max_entries: u64,
}

///
/// A single model name mapping entry.
///
/// Requests arriving with the `anthropic` name are forwarded upstream
/// under the `openai` name; unknown names pass through unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMapping {
    /// Model name as the Anthropic-dialect client sends it
    pub anthropic: String,
    /// Model name the upstream expects
    pub openai: String,
}

///
/// Logging level enumeration.
///
/// Defines available log levels compatible with the tracing crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/* --- defaults -------------------------------------------------------------------------------- */

/// Default HTTP port
fn default_port() -> u16 {
    8080
}

/// Default logging level
fn default_log_level() -> LogLevel {
    LogLevel::Info
}

/// Default upstream base URL
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

/// Default connection timeout
fn default_connect_timeout_secs() -> u64 {
    10
}

/// Default read timeout
fn default_read_timeout_secs() -> u64 {
    60
}

/// Default retry behavior
fn default_retry_enabled() -> bool {
    true
}

/// Default maximum retry attempts
fn default_max_attempts() -> u32 {
    3
}

/// Default pacing delay (disabled)
fn default_pacing_delay_ms() -> u64 {
    0
}

/// Default coalescer TTL (5 minutes)
fn default_coalesce_ttl_secs() -> u64 {
    300
}

/// Default coalescer capacity
fn default_coalesce_max_entries() -> u64 {
    500
}

/** Hard ceiling on the read timeout in seconds */
const MAX_READ_TIMEOUT_SECS: u64 = 600;

/** Hard ceiling on the pacing delay in milliseconds */
const MAX_PACING_DELAY_MS: u64 = 50;

/* --- implementations --------------------------------------------------------------------- */

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            upstream: UpstreamConfig::default(),
            retry: RetryConfig::default(),
            streaming: StreamingConfig::default(),
            coalesce: CoalesceConfig::default(),
            model_mappings: Vec::new(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: default_port(), log_level: default_log_level() }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: String::new(),
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { enabled: default_retry_enabled(), max_attempts: default_max_attempts() }
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self { pacing_delay_ms: default_pacing_delay_ms() }
    }
}

impl Default for CoalesceConfig {
    fn default() -> Self {
        Self { ttl_secs: default_coalesce_ttl_secs(), max_entries: default_coalesce_max_entries() }
    }
}

impl Config {
    /// Load configuration from the standard hierarchy:
    /// 1. Environment variables (highest priority)
    /// 2. User config file (~/.config/anthromux/config.toml), or the file
    ///    named by ANTHROMUX_CONFIG_FILE when set (supports ~ expansion)
    /// 3. System config file (/etc/anthromux/config.toml)
    /// 4. Built-in defaults (lowest priority)
    ///
    /// # Returns
    /// * `Ok(Config)` - Successfully loaded configuration
    /// * `Err(ProxyError)` - Configuration loading or validation failed
    pub fn load() -> Result<Self> {
        let loader =
            loader::ConfigLoader::new().layer_file_if_present(paths::system_config_file())?;

        // An explicitly named config file must exist; the user location is
        // optional.
        let loader = match std::env::var("ANTHROMUX_CONFIG_FILE") {
            Ok(path) => loader.layer_file(paths::expand_path(&path)?)?,
            Err(_) => loader.layer_file_if_present(paths::user_config_file()?)?,
        };

        loader.layer_env()?.finish()
    }

    ///
    /// Validate the current configuration.
    ///
    /// # Returns
    /// * `Ok(())` - Configuration is valid
    /// * `Err(ProxyError)` - Configuration validation failed with details
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(ProxyError::Config(
                "server.port must be between 1 and 65535".to_string(),
            ));
        }

        if self.upstream.base_url.is_empty() {
            return Err(ProxyError::Config(
                "upstream.base_url is required.\n\
                 \n\
                 Set it in the config file:\n\
                   [upstream]\n\
                   base_url = \"https://api.openai.com/v1\"\n\
                 \n\
                 or via the environment:\n\
                   export ANTHROMUX_UPSTREAM_BASE_URL=https://api.openai.com/v1"
                    .to_string(),
            ));
        }

        if !self.upstream.base_url.starts_with("http://")
            && !self.upstream.base_url.starts_with("https://")
        {
            return Err(ProxyError::Config(format!(
                "upstream.base_url must start with http:// or https://, got '{}'",
                self.upstream.base_url
            )));
        }

        if self.upstream.api_key.is_empty() {
            return Err(ProxyError::Config(
                "upstream.api_key is required.\n\
                 \n\
                 Set it in the config file:\n\
                   [upstream]\n\
                   api_key = \"sk-...\"\n\
                 \n\
                 or via the environment:\n\
                   export ANTHROMUX_UPSTREAM_API_KEY=sk-..."
                    .to_string(),
            ));
        }

        for mapping in &self.model_mappings {
            if mapping.anthropic.is_empty() || mapping.openai.is_empty() {
                return Err(ProxyError::Config(
                    "model_mappings entries need both 'anthropic' and 'openai' names".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Connection timeout as a Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream.connect_timeout_secs)
    }

    /// Read timeout as a Duration, clamped to the 600 second ceiling
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream.read_timeout_secs.min(MAX_READ_TIMEOUT_SECS))
    }

    /// Pacing delay as a Duration, clamped to the 50 ms ceiling; None when disabled
    pub fn pacing_delay(&self) -> Option<Duration> {
        match self.streaming.pacing_delay_ms.min(MAX_PACING_DELAY_MS) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Coalescer TTL as a Duration
    pub fn coalesce_ttl(&self) -> Duration {
        Duration::from_secs(self.coalesce.ttl_secs)
    }

    /// Get configuration file example as TOML string
    ///
    /// Returns a well-documented example configuration file that users
    /// can use as a starting point for their own configuration.
    pub fn example_toml() -> &'static str {
        r#"# Anthromux Configuration
# This file should be placed at:
#   Linux/Unix: ~/.config/anthromux/config.toml
#   macOS: ~/Library/Application Support/anthromux/config.toml
#   Windows: %APPDATA%/anthromux/config.toml

[server]
# HTTP server port (default: 8080)
port = 8080

# Logging level: trace, debug, info, warn, error (default: info)
log_level = "info"

[upstream]
# OpenAI-compatible upstream; requests go to {base_url}/chat/completions
base_url = "https://api.openai.com/v1"
api_key = "sk-..."

# Connection / read timeouts in seconds (read is capped at 600)
connect_timeout_secs = 10
read_timeout_secs = 60

[retry]
# Retry rate-limited upstream calls with exponential backoff (default: true)
enabled = true

# Maximum retry attempts (default: 3)
max_attempts = 3

[streaming]
# Delay between streamed events for terminal-UI clients, in milliseconds
# (default: 0 = disabled, capped at 50)
pacing_delay_ms = 0

[coalesce]
# How long duplicate non-streaming requests replay the cached response
ttl_secs = 300
max_entries = 500

# Ordered model name mappings; unknown names pass through unchanged
[[model_mappings]]
anthropic = "claude-3-haiku-20240307"
openai = "gpt-4o-mini"

[[model_mappings]]
anthropic = "claude-3-5-sonnet-20241022"
openai = "gpt-4o"
"#
    }
}

impl LogLevel {
    /// Convert to tracing::Level for logging setup
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }

    /// Check if trace-level logging is enabled
    pub fn is_trace_enabled(self) -> bool {
        matches!(self, LogLevel::Trace | LogLevel::Debug)
    }

    /// Parse from string (case-insensitive)
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(ProxyError::Config(format!(
                "Invalid log level '{}'. Valid levels are: trace, debug, info, warn, error",
                s
            ))),
        }
    }
}
