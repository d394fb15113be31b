//!
//! Layered configuration loading for Anthromux.
//!
//! Every source - a TOML file or the process environment - is parsed into
//! a [`ConfigOverlay`] whose fields are all optional, and overlays are
//! folded onto the built-in defaults in ascending priority. A field a
//! source does not mention stays whatever the layers below made it, so
//! there is no guessing about whether a value was set explicitly.
//!
//! Priority order: defaults, then system file, then user file (or the
//! file named by `ANTHROMUX_CONFIG_FILE`), then `ANTHROMUX_*` environment
//! variables.
//!
//! Authors:
//!   Jaro <yarenty@gmail.com>
//!
//! Copyright (c) 2026 SkyCorp

/* --- uses ------------------------------------------------------------------------------------ */

use std::env;
use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;

use crate::config::{Config, LogLevel, ModelMapping};
use crate::error::{ProxyError, Result};

/* --- types ----------------------------------------------------------------------------------- */

///
/// A partial configuration parsed from a single source.
///
/// Sections and fields mirror [`Config`] but everything is optional;
/// `apply` writes only the fields the source actually provided.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ConfigOverlay {
    server: ServerOverlay,
    upstream: UpstreamOverlay,
    retry: RetryOverlay,
    streaming: StreamingOverlay,
    coalesce: CoalesceOverlay,
    model_mappings: Option<Vec<ModelMapping>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ServerOverlay {
    port: Option<u16>,
    log_level: Option<LogLevel>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct UpstreamOverlay {
    base_url: Option<String>,
    api_key: Option<String>,
    connect_timeout_secs: Option<u64>,
    read_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RetryOverlay {
    enabled: Option<bool>,
    max_attempts: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StreamingOverlay {
    pacing_delay_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CoalesceOverlay {
    ttl_secs: Option<u64>,
    max_entries: Option<u64>,
}

///
/// Folds configuration overlays onto the defaults.
///
/// Construction starts at [`Config::default`]; each `layer_*` call merges
/// one more source on top, and `finish` validates the result.
pub struct ConfigLoader {
    config: Config,
}

/* --- start of code -------------------------------------------------------------------------- */

impl ConfigOverlay {
    ///
    /// Write every provided field into a configuration.
    fn apply(self, config: &mut Config) {
        set(&mut config.server.port, self.server.port);
        set(&mut config.server.log_level, self.server.log_level);

        set(&mut config.upstream.base_url, self.upstream.base_url);
        set(&mut config.upstream.api_key, self.upstream.api_key);
        set(&mut config.upstream.connect_timeout_secs, self.upstream.connect_timeout_secs);
        set(&mut config.upstream.read_timeout_secs, self.upstream.read_timeout_secs);

        set(&mut config.retry.enabled, self.retry.enabled);
        set(&mut config.retry.max_attempts, self.retry.max_attempts);

        set(&mut config.streaming.pacing_delay_ms, self.streaming.pacing_delay_ms);

        set(&mut config.coalesce.ttl_secs, self.coalesce.ttl_secs);
        set(&mut config.coalesce.max_entries, self.coalesce.max_entries);

        set(&mut config.model_mappings, self.model_mappings);
    }

    ///
    /// Build the overlay described by the process environment.
    ///
    /// `ANTHROMUX_*` variables name the fields directly; the legacy
    /// `OPENAI_BASE_URL` / `OPENAI_API_KEY` names are honoured when the
    /// canonical variable is absent. Model mappings have no environment
    /// form; they come from files only.
    ///
    /// # Returns
    /// * `Ok(ConfigOverlay)` - overlay of all set variables
    /// * `Err(ProxyError)` - a variable was set to an unparseable value
    fn from_env() -> Result<Self> {
        Ok(Self {
            server: ServerOverlay {
                port: env_parsed("ANTHROMUX_SERVER_PORT")?,
                log_level: match env_string("ANTHROMUX_SERVER_LOG_LEVEL") {
                    Some(raw) => Some(LogLevel::from_str(&raw)?),
                    None => None,
                },
            },
            upstream: UpstreamOverlay {
                base_url: env_string("ANTHROMUX_UPSTREAM_BASE_URL")
                    .or_else(|| env_string("OPENAI_BASE_URL")),
                api_key: env_string("ANTHROMUX_UPSTREAM_API_KEY")
                    .or_else(|| env_string("OPENAI_API_KEY")),
                connect_timeout_secs: env_parsed("ANTHROMUX_UPSTREAM_CONNECT_TIMEOUT_SECS")?,
                read_timeout_secs: env_parsed("ANTHROMUX_UPSTREAM_READ_TIMEOUT_SECS")?,
            },
            retry: RetryOverlay {
                enabled: env_flag("ANTHROMUX_RETRY_ENABLED")?,
                max_attempts: env_parsed("ANTHROMUX_RETRY_MAX_ATTEMPTS")?,
            },
            streaming: StreamingOverlay {
                pacing_delay_ms: env_parsed("ANTHROMUX_STREAMING_PACING_DELAY_MS")?,
            },
            coalesce: CoalesceOverlay {
                ttl_secs: env_parsed("ANTHROMUX_COALESCE_TTL_SECS")?,
                max_entries: env_parsed("ANTHROMUX_COALESCE_MAX_ENTRIES")?,
            },
            model_mappings: None,
        })
    }
}

impl ConfigLoader {
    /// Start from the built-in defaults.
    pub fn new() -> Self {
        Self { config: Config::default() }
    }

    ///
    /// Layer a TOML file that must exist.
    ///
    /// # Arguments
    /// * `path` - configuration file to parse
    ///
    /// # Returns
    /// * `Ok(Self)` - file parsed and merged
    /// * `Err(ProxyError)` - file unreadable or not valid TOML
    pub fn layer_file<P: AsRef<Path>>(mut self, path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::Config(format!("Cannot read config file '{}': {}", path.display(), e))
        })?;

        let overlay: ConfigOverlay = toml::from_str(&contents).map_err(|e| {
            ProxyError::Config(format!("Cannot parse config file '{}': {}", path.display(), e))
        })?;

        tracing::debug!("Applied config layer from {}", path.display());
        overlay.apply(&mut self.config);
        Ok(self)
    }

    ///
    /// Layer a TOML file if it exists; a missing file is skipped.
    ///
    /// Used for the well-known system and user locations, which are both
    /// optional.
    pub fn layer_file_if_present<P: AsRef<Path>>(self, path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.is_file() {
            self.layer_file(path)
        } else {
            tracing::debug!("No config file at {}", path.display());
            Ok(self)
        }
    }

    ///
    /// Layer the process environment on top of everything so far.
    pub fn layer_env(mut self) -> Result<Self> {
        ConfigOverlay::from_env()?.apply(&mut self.config);
        Ok(self)
    }

    ///
    /// Validate and return the merged configuration.
    ///
    /// # Returns
    /// * `Ok(Config)` - valid, fully-layered configuration
    /// * `Err(ProxyError)` - validation failed
    pub fn finish(self) -> Result<Config> {
        self.config.validate()?;

        tracing::debug!(
            "Configuration ready: port={}, upstream={}, {} model mapping(s)",
            self.config.server.port,
            self.config.upstream.base_url,
            self.config.model_mappings.len()
        );

        Ok(self.config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/* --- helper functions ----------------------------------------------------------------------- */

/// Overwrite a slot when the overlay provided a value.
fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

/// A non-empty environment variable as a string.
fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.is_empty())
}

/// An environment variable parsed with `FromStr`; unset is `None`, set but
/// unparseable is an error.
fn env_parsed<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    match env_string(key) {
        None => Ok(None),
        Some(raw) => raw.parse().map(Some).map_err(|e| {
            ProxyError::Config(format!("Invalid {} value '{}': {}", key, raw, e))
        }),
    }
}

/// A boolean environment variable; accepts the usual spellings.
fn env_flag(key: &str) -> Result<Option<bool>> {
    let Some(raw) = env_string(key) else {
        return Ok(None);
    };
    match raw.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(Some(true)),
        "false" | "0" | "no" | "off" => Ok(Some(false)),
        _ => Err(ProxyError::Config(format!(
            "Invalid {} value '{}': expected true/false",
            key, raw
        ))),
    }
}
