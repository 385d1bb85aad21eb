//! Browser engine configuration.
//!
//! Always compiled so settings files parse the same with or without the
//! `browser` feature.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Desktop Chrome user agent presented to the platform.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_14_5) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/77.0.3865.90 Safari/537.36";

/// Headless Chromium configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserEngineConfig {
    /// Run in headless mode (default: true).
    /// Set to false to watch what the platform renders.
    #[serde(default = "default_headless")]
    pub headless: bool,

    /// Chrome/Chromium executable (default: search common locations).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chrome_path: Option<PathBuf>,

    /// Page load timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// User agent override.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Inject stealth patches before navigation.
    #[serde(default = "default_stealth")]
    pub stealth: bool,

    /// Additional Chrome arguments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chrome_args: Vec<String>,

    /// Proxy server URL (e.g., "socks5://127.0.0.1:7321"). Set per probe.
    #[serde(skip)]
    pub proxy: Option<String>,
}

fn default_headless() -> bool {
    true
}

fn default_timeout() -> u64 {
    30
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

fn default_stealth() -> bool {
    true
}

impl Default for BrowserEngineConfig {
    fn default() -> Self {
        Self {
            headless: default_headless(),
            chrome_path: None,
            timeout: default_timeout(),
            user_agent: default_user_agent(),
            stealth: default_stealth(),
            chrome_args: Vec::new(),
            proxy: None,
        }
    }
}

impl BrowserEngineConfig {
    /// Apply environment variable overrides.
    pub fn with_env_overrides(mut self) -> Self {
        // CRANK_CHROME - path to chrome/chromium
        if let Ok(path) = env::var("CRANK_CHROME") {
            if !path.is_empty() {
                self.chrome_path = Some(PathBuf::from(path));
            }
        }

        // CRANK_HEADFUL=1 - show the browser window
        if env::var("CRANK_HEADFUL")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
        {
            self.headless = false;
        }

        self
    }

    /// Copy of this config routed through `proxy`.
    pub fn with_proxy(&self, proxy: impl Into<String>) -> Self {
        Self {
            proxy: Some(proxy.into()),
            ..self.clone()
        }
    }

    pub fn page_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: BrowserEngineConfig = toml::from_str("").unwrap();
        assert_eq!(config, BrowserEngineConfig::default());
        assert!(config.headless);
        assert_eq!(config.page_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_proxy_is_not_read_from_config() {
        let config: BrowserEngineConfig =
            toml::from_str("proxy = \"socks5://10.0.0.1:1080\"\ntimeout = 5").unwrap();
        assert_eq!(config.proxy, None);
        assert_eq!(config.timeout, 5);
    }

    #[test]
    fn test_with_proxy_keeps_other_settings() {
        let base = BrowserEngineConfig {
            timeout: 12,
            ..Default::default()
        };
        let routed = base.with_proxy("socks5://127.0.0.1:7321");
        assert_eq!(routed.proxy.as_deref(), Some("socks5://127.0.0.1:7321"));
        assert_eq!(routed.timeout, 12);
        assert_eq!(base.proxy, None);
    }
}
