//! Persistent user defaults.
//!
//! Optional TOML file at `<config_dir>/darwin-vz-nix/config.toml`. Every key
//! is optional; explicit command-line flags always win.
//!
//! ```toml
//! cores = 8
//! memory = 16384
//! disk_size = "200G"
//! idle_timeout = 30
//! discovery_timeout = "3m"
//! state_dir = "/Volumes/fast/darwin-vz-nix"
//! ```

use crate::config::{self, APP_NAME};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings file name.
const SETTINGS_FILE: &str = "config.toml";

/// Default time to wait for the guest address.
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(120);

/// User defaults loaded from disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Default vCPU count.
    pub cores: Option<u32>,

    /// Default memory in MB.
    pub memory: Option<u64>,

    /// Default disk size.
    pub disk_size: Option<String>,

    /// Default idle timeout in minutes.
    pub idle_timeout: Option<u32>,

    /// Default guest discovery timeout (humantime syntax).
    pub discovery_timeout: Option<String>,

    /// State directory override.
    pub state_dir: Option<PathBuf>,
}

impl Settings {
    /// Default location of the settings file.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_NAME).join(SETTINGS_FILE))
    }

    /// Load settings from the default location.
    ///
    /// A missing file yields empty settings.
    pub fn load() -> Result<Self> {
        match Self::default_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load settings from `path`. A missing file yields empty settings.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(Error::SettingsLoad(format!("{}: {}", path.display(), e)));
            }
        };

        let settings: Settings = toml::from_str(&content)
            .map_err(|e| Error::SettingsLoad(format!("{}: {}", path.display(), e)))?;
        tracing::debug!(path = %path.display(), "loaded settings");
        Ok(settings)
    }

    /// State directory, falling back to the per-user default.
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(config::default_state_dir)
    }

    /// Discovery timeout, falling back to the built-in default.
    pub fn discovery_timeout(&self) -> Result<Duration> {
        match &self.discovery_timeout {
            Some(s) => humantime::parse_duration(s)
                .map_err(|e| Error::SettingsLoad(format!("discovery_timeout '{}': {}", s, e))),
            None => Ok(DEFAULT_DISCOVERY_TIMEOUT),
        }
    }
}
