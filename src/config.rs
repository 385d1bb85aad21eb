//! Configuration management for crank.
//!
//! Settings come from, lowest precedence first: built-in defaults, a TOML
//! file (`--config`, `CRANK_CONFIG`, or `<config dir>/crank/config.toml`),
//! environment variables, and command line flags.
//!
//! ```toml
//! socks_host = "127.0.0.1"
//! socks_port = 7321
//! connect_timeout = 10
//! countries = ["de", "fr", "us"]
//!
//! [tor]
//! binary = "/usr/bin/tor"
//!
//! [browser]
//! timeout = 45
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::browser::BrowserEngineConfig;
use crate::orchestrator::DEFAULT_CONNECT_TIMEOUT;
use crate::privacy::TorConfig;

/// Default SOCKS host for circuits.
pub const DEFAULT_SOCKS_HOST: &str = "127.0.0.1";

/// Default SOCKS port for circuits.
pub const DEFAULT_SOCKS_PORT: u16 = 7321;

/// Errors loading settings.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Application settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Host the circuit's SOCKS listener binds to.
    #[serde(default = "default_socks_host")]
    pub socks_host: String,

    /// Port the circuit's SOCKS listener binds to, reused for every country.
    #[serde(default = "default_socks_port")]
    pub socks_port: u16,

    /// Seconds to wait for a circuit before skipping the country.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// Alpha-2 codes to measure (default: all).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub countries: Vec<String>,

    /// Write the report as JSON here after a complete run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export: Option<PathBuf>,

    #[serde(default)]
    pub tor: TorConfig,

    #[serde(default)]
    pub browser: BrowserEngineConfig,
}

fn default_socks_host() -> String {
    DEFAULT_SOCKS_HOST.to_string()
}

fn default_socks_port() -> u16 {
    DEFAULT_SOCKS_PORT
}

fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT.as_secs()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            socks_host: default_socks_host(),
            socks_port: default_socks_port(),
            connect_timeout: default_connect_timeout(),
            countries: Vec::new(),
            export: None,
            tor: TorConfig::default(),
            browser: BrowserEngineConfig::default(),
        }
    }
}

impl Settings {
    /// Config file used when none is given explicitly.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("crank").join("config.toml"))
    }

    /// Load settings from `path`, or from the default location if it exists.
    ///
    /// An explicit path must exist; a missing default file just means
    /// defaults. Environment overrides are applied afterwards.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let settings = match path {
            Some(path) => Self::from_path(path)?,
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(path) => Self::from_path(&path)?,
                None => {
                    debug!("No config file found, using defaults");
                    Self::default()
                }
            },
        };

        Ok(settings.with_env_overrides())
    }

    /// Parse a config file.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        debug!("Loading config from {}", path.display());

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply environment variable overrides to nested sections.
    pub fn with_env_overrides(mut self) -> Self {
        self.tor = self.tor.with_env_overrides();
        self.browser = self.browser.with_env_overrides();
        self
    }

    /// Validate the configuration, returning an error if invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.socks_port == 0 {
            return Err(ConfigError::Invalid("socks_port must not be 0".to_string()));
        }
        if self.connect_timeout == 0 {
            return Err(ConfigError::Invalid(
                "connect_timeout must be at least 1 second".to_string(),
            ));
        }
        if self.browser.timeout == 0 {
            return Err(ConfigError::Invalid(
                "browser.timeout must be at least 1 second".to_string(),
            ));
        }
        self.tor.validate().map_err(ConfigError::Invalid)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }
}
