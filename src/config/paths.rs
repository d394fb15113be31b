//!
//! Well-known configuration file locations.
//!
//! The proxy only ever reads configuration, so nothing here creates
//! directories; callers probe the returned paths and skip the ones that
//! do not exist. User paths come from the platform conventions via the
//! `directories` crate, system paths are fixed per OS.
//!
//! Authors:
//!   Jaro <yarenty@gmail.com>
//!
//! Copyright (c) 2026 SkyCorp

/* --- uses ------------------------------------------------------------------------------------ */

use std::path::PathBuf;

use directories::ProjectDirs;

use crate::error::{ProxyError, Result};

/* --- constants ------------------------------------------------------------------------------- */

/// Application name used in config paths
const APP_NAME: &str = "anthromux";
/// Configuration file name
const CONFIG_FILE: &str = "config.toml";

/* --- public functions ------------------------------------------------------------------------ */

///
/// The per-user configuration file.
///
/// Resolves to `~/.config/anthromux/config.toml` on Linux,
/// `~/Library/Application Support/anthromux/config.toml` on macOS, and
/// `%APPDATA%\anthromux\config.toml` on Windows. The file (and its
/// directory) need not exist.
///
/// # Returns
/// * `Ok(PathBuf)` - resolved path
/// * `Err(ProxyError)` - no home directory to resolve against
pub fn user_config_file() -> Result<PathBuf> {
    ProjectDirs::from("com", "SkyCorp", APP_NAME)
        .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
        .ok_or_else(|| {
            ProxyError::Config(
                "No home directory available to locate the user config file".to_string(),
            )
        })
}

///
/// The machine-wide configuration file.
///
/// `/etc/anthromux/config.toml` on Linux and other Unixes,
/// `/Library/Preferences/anthromux/config.toml` on macOS,
/// `%PROGRAMDATA%\anthromux\config.toml` on Windows.
pub fn system_config_file() -> PathBuf {
    let root = if cfg!(windows) {
        PathBuf::from(std::env::var("PROGRAMDATA").unwrap_or_else(|_| r"C:\ProgramData".into()))
    } else if cfg!(target_os = "macos") {
        PathBuf::from("/Library/Preferences")
    } else {
        PathBuf::from("/etc")
    };

    root.join(APP_NAME).join(CONFIG_FILE)
}

///
/// Expand `~` and `$VAR` references in a user-supplied path.
///
/// Used for `ANTHROMUX_CONFIG_FILE`, which users routinely write with a
/// tilde.
///
/// # Arguments
/// * `path` - path string as the user wrote it
///
/// # Returns
/// * `Ok(PathBuf)` - expanded path
/// * `Err(ProxyError)` - a referenced variable is unset or no home exists
pub fn expand_path(path: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(path)
        .map_err(|e| ProxyError::Config(format!("Cannot expand path '{}': {}", path, e)))?;
    Ok(PathBuf::from(expanded.as_ref()))
}
