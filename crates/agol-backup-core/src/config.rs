//! Configuration types for agol-backup components.
//!
//! Values resolve in layers: built-in defaults, then the optional TOML file,
//! then environment variables and command-line flags (applied by the CLI).

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::AppError;

/// Portal used when nothing else is configured.
pub const DEFAULT_PORTAL_URL: &str = "https://www.arcgis.com";

/// Upper bound on catalog items fetched per run. Larger catalogs lose the excess.
pub const MAX_ITEMS: usize = 1000;

/// HTTP client configuration for portal API calls.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub timeout: Duration,
    /// Applies to package downloads, which can be far larger than API responses.
    pub download_timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    /// Lifetime requested for session tokens. Expired tokens are renewed on demand.
    pub token_expiration: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            download_timeout: Duration::from_secs(600),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(500),
            token_expiration: Duration::from_secs(120 * 60),
        }
    }
}

/// Bounded exponential backoff used while waiting on export jobs.
#[derive(Debug, Clone, PartialEq)]
pub struct WaitPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: u32,
    /// Total time allowed before the wait is abandoned.
    pub timeout: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            multiplier: 2,
            timeout: Duration::from_secs(600),
        }
    }
}

impl WaitPolicy {
    /// Delay before the poll following one that waited `previous`.
    ///
    /// # Examples
    ///
    /// ```
    /// use agol_backup_core::WaitPolicy;
    /// use std::time::Duration;
    ///
    /// let policy = WaitPolicy::default();
    /// assert_eq!(policy.next_delay(Duration::from_secs(2)), Duration::from_secs(4));
    /// assert_eq!(policy.next_delay(Duration::from_secs(20)), Duration::from_secs(30));
    /// ```
    pub fn next_delay(&self, previous: Duration) -> Duration {
        previous
            .saturating_mul(self.multiplier.max(1))
            .min(self.max_delay)
    }
}

/// Contents of the optional `config.toml` file.
///
/// ```toml
/// portal_url = "https://www.arcgis.com"
/// username = "gis_admin"
/// output_dir = "/var/backups/agol"
///
/// [wait]
/// initial_delay_secs = 2
/// max_delay_secs = 30
/// timeout_secs = 600
/// ```
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub portal_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub output_dir: Option<PathBuf>,
    #[serde(default)]
    pub wait: WaitSection,
}

/// `[wait]` table of the configuration file.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WaitSection {
    pub initial_delay_secs: Option<u64>,
    pub max_delay_secs: Option<u64>,
    pub timeout_secs: Option<u64>,
}

impl WaitSection {
    /// Overlays the configured values on top of the defaults.
    pub fn to_policy(&self) -> WaitPolicy {
        let defaults = WaitPolicy::default();
        WaitPolicy {
            initial_delay: self
                .initial_delay_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.initial_delay),
            max_delay: self
                .max_delay_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.max_delay),
            multiplier: defaults.multiplier,
            timeout: self
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
        }
    }
}

/// Default location of the configuration file:
/// `<config_dir>/agol-backup/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("agol-backup").join("config.toml"))
}

/// Loads the configuration file.
///
/// With an explicit `path` the file must exist. Without one, the default
/// location is tried and a missing file yields an empty configuration.
pub fn load_config(path: Option<&Path>) -> Result<FileConfig, AppError> {
    let (path, required) = match path {
        Some(p) => (p.to_path_buf(), true),
        None => match default_config_path() {
            Some(p) => (p, false),
            None => return Ok(FileConfig::default()),
        },
    };

    if !path.exists() {
        if required {
            return Err(AppError::ConfigError(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        return Ok(FileConfig::default());
    }

    let content = std::fs::read_to_string(&path)?;
    toml::from_str(&content)
        .map_err(|e| AppError::ConfigError(format!("{}: {}", path.display(), e)))
}
