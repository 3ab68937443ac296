//! Application configuration for crawltail.
//!
//! User config lives at `~/.crawltail/crawltail.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CrawlTailError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "crawltail.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".crawltail";

// ---------------------------------------------------------------------------
// Config structs (matching crawltail.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Tailing loop tuning.
    #[serde(default)]
    pub tail: TailSettings,

    /// Document store location.
    #[serde(default)]
    pub storage: StorageConfig,
}

/// `[tail]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TailSettings {
    /// How long a poller sleeps when its cursor has no further documents.
    #[serde(default = "default_idle_interval")]
    pub idle_interval_ms: u64,

    /// Pause after each delivered document (0 disables rate limiting).
    #[serde(default)]
    pub fetch_delay_ms: u64,

    /// Maximum documents fetched per cursor open.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for TailSettings {
    fn default() -> Self {
        Self {
            idle_interval_ms: default_idle_interval(),
            fetch_delay_ms: 0,
            batch_size: default_batch_size(),
        }
    }
}

fn default_idle_interval() -> u64 {
    1000
}
fn default_batch_size() -> usize {
    500
}

/// `[storage]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the libSQL database. Defaults to `~/.crawltail/crawltail.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<String>,
}

// ---------------------------------------------------------------------------
// Tail config (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime tailing configuration handed to pollers.
#[derive(Debug, Clone)]
pub struct TailConfig {
    /// Sleep between cursor re-opens when no new documents exist.
    pub idle_interval: Duration,
    /// Sleep after each delivered document.
    pub fetch_delay: Duration,
    /// Maximum documents fetched per cursor open.
    pub batch_size: usize,
}

impl Default for TailConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for TailConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            idle_interval: Duration::from_millis(config.tail.idle_interval_ms),
            fetch_delay: Duration::from_millis(config.tail.fetch_delay_ms),
            batch_size: config.tail.batch_size.max(1),
        }
    }
}

impl AppConfig {
    /// Resolve the database path, falling back to the config directory.
    pub fn database_path(&self) -> Result<PathBuf> {
        match &self.storage.database_path {
            Some(path) => Ok(PathBuf::from(path)),
            None => Ok(config_dir()?.join("crawltail.db")),
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.crawltail/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| CrawlTailError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.crawltail/crawltail.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| CrawlTailError::io(path, e))?;

    toml::from_str(&content).map_err(|e| {
        CrawlTailError::config(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| CrawlTailError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| CrawlTailError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| CrawlTailError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("idle_interval_ms"));
        assert!(toml_str.contains("batch_size"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.tail.idle_interval_ms, 1000);
        assert_eq!(parsed.tail.fetch_delay_ms, 0);
    }

    #[test]
    fn partial_config_uses_defaults() {
        let toml_str = r#"
[tail]
fetch_delay_ms = 25

[storage]
database_path = "/tmp/crawltail-test.db"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.tail.fetch_delay_ms, 25);
        assert_eq!(config.tail.idle_interval_ms, 1000);
        assert_eq!(
            config.database_path().unwrap(),
            PathBuf::from("/tmp/crawltail-test.db")
        );
    }

    #[test]
    fn tail_config_from_app_config() {
        let mut app = AppConfig::default();
        app.tail.batch_size = 0;
        let tail = TailConfig::from(&app);
        assert_eq!(tail.idle_interval, Duration::from_secs(1));
        assert_eq!(tail.fetch_delay, Duration::ZERO);
        assert_eq!(tail.batch_size, 1);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let path = std::env::temp_dir().join("crawltail-definitely-missing.toml");
        let err = load_config_from(&path).unwrap_err();
        assert!(matches!(err, CrawlTailError::Io { .. }));
    }
}
