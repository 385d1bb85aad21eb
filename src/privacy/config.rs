//! Tor launch configuration.

use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// How to launch the local tor process for each circuit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TorConfig {
    /// Path to tor binary (default: search PATH for "tor")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<PathBuf>,

    /// Directory for Tor state, reused between circuits so the consensus
    /// cache survives (default: <cache dir>/crank/tor)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    /// Extra `torrc` options passed on the command line, e.g.
    /// `["UseBridges", "1"]`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,
}

impl TorConfig {
    /// Apply environment variable overrides.
    pub fn with_env_overrides(mut self) -> Self {
        // CRANK_TOR_BINARY - path to tor binary
        if let Ok(path) = env::var("CRANK_TOR_BINARY") {
            if !path.is_empty() {
                self.binary = Some(PathBuf::from(path));
            }
        }

        // CRANK_TOR_DATA_DIR - persistent tor state
        if let Ok(path) = env::var("CRANK_TOR_DATA_DIR") {
            if !path.is_empty() {
                self.data_dir = Some(PathBuf::from(path));
            }
        }

        self
    }

    /// Persistent data directory, if one is configured or derivable.
    ///
    /// `None` means every circuit gets a throwaway directory.
    pub fn persistent_data_dir(&self) -> Option<PathBuf> {
        self.data_dir
            .clone()
            .or_else(|| dirs::cache_dir().map(|dir| dir.join("crank").join("tor")))
    }

    /// Validate the configuration, returning an error if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.extra_args.len() % 2 != 0 {
            return Err(format!(
                "tor.extra_args must be option/value pairs, got {} entries",
                self.extra_args.len()
            ));
        }
        Ok(())
    }
}
