//! User configuration
//!
//! Loaded from `$XDG_CONFIG_HOME/dirwatch/config.toml`, or from the file
//! named by `DIRWATCH_CONFIG`. Every field has a default, so a missing file
//! or a partial one is fine.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use watcher::MIN_BUFFER_SIZE;

/// Environment variable overriding the config file location
pub const CONFIG_ENV: &str = "DIRWATCH_CONFIG";

/// Largest accepted read buffer
pub const MAX_BUFFER_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub watcher: WatcherConfig,
    pub walk: WalkConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Event reader buffer size in bytes
    pub buffer_size: usize,
    /// Open event queues in non-blocking mode
    pub nonblocking: bool,
    /// Cap on live watches per queue
    pub watch_limit: Option<usize>,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            buffer_size: watcher::DEFAULT_BUFFER_SIZE,
            nonblocking: true,
            watch_limit: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalkConfig {
    /// Resolve a symlink given as the walk root
    pub follow_root_symlink: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Also write logs to this file
    pub log_file: Option<PathBuf>,
}

impl Config {
    /// Check every value against its documented range
    pub fn validate(&self) -> Result<()> {
        let size = self.watcher.buffer_size;
        if !(MIN_BUFFER_SIZE..=MAX_BUFFER_SIZE).contains(&size) {
            anyhow::bail!(
                "watcher.buffer_size must be between {} and {} bytes, got {}",
                MIN_BUFFER_SIZE,
                MAX_BUFFER_SIZE,
                size
            );
        }
        if self.watcher.watch_limit == Some(0) {
            anyhow::bail!("watcher.watch_limit must be at least 1");
        }
        Ok(())
    }
}

/// Location of the config file
pub fn config_file_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os(CONFIG_ENV) {
        return Some(PathBuf::from(path));
    }
    dirs::config_dir().map(|dir| dir.join("dirwatch").join("config.toml"))
}

/// Load the effective configuration
///
/// Returns the defaults when no file exists.
pub fn load() -> Result<Config> {
    match config_file_path() {
        Some(path) if path.exists() => load_from(&path),
        _ => Ok(Config::default()),
    }
}

/// Load and validate a specific file
pub fn load_from(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&text)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;
    Ok(config)
}

/// Annotated example file
pub fn example_config() -> String {
    format!(
        r#"[watcher]
# Event reader buffer in bytes ({min} - {max})
buffer_size = {buffer}
# Open event queues in non-blocking mode
nonblocking = true
# Cap on live watches per queue
# watch_limit = 8192

[walk]
# Resolve a symlink given as the root of `dw du`
follow_root_symlink = false

[logging]
# log_file = "/tmp/dirwatch.log"
"#,
        min = MIN_BUFFER_SIZE,
        max = MAX_BUFFER_SIZE,
        buffer = watcher::DEFAULT_BUFFER_SIZE,
    )
}
