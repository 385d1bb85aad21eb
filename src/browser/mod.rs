//! Headless Chromium renderer.
//!
//! Uses chromiumoxide (CDP) to render JavaScript-built pages such as search
//! results. Every fetcher launches its own browser so the `--proxy-server`
//! flag can differ between fetches.

mod config;
#[cfg(feature = "browser")]
mod stealth;

pub use config::{BrowserEngineConfig, DEFAULT_USER_AGENT};

#[cfg(feature = "browser")]
use std::path::{Path, PathBuf};

#[cfg(feature = "browser")]
use tracing::{debug, info, warn};

#[cfg(feature = "browser")]
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
#[cfg(feature = "browser")]
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, NavigateParams,
};
#[cfg(feature = "browser")]
use chromiumoxide::{Browser, BrowserConfig, Page};
#[cfg(feature = "browser")]
use futures::StreamExt;
#[cfg(feature = "browser")]
use tokio::task::JoinHandle;

/// Errors rendering a page.
#[derive(Debug, thiserror::Error)]
pub enum BrowserError {
    #[error("Chrome/Chromium not found: {0}")]
    NotFound(String),
    #[error("Failed to launch browser: {0}")]
    Launch(String),
    #[error("Navigation failed: {0}")]
    Navigation(String),
    #[error("Timed out after {0}s waiting for page")]
    Timeout(u64),
    #[error("DevTools protocol error: {0}")]
    Protocol(String),
    #[error("Browser support not compiled. Rebuild with: cargo build --features browser")]
    NotCompiled,
}

impl BrowserError {
    /// Failures caused by the network path rather than the local browser.
    pub fn is_network(&self) -> bool {
        matches!(self, BrowserError::Navigation(_) | BrowserError::Timeout(_))
    }
}

/// A rendered page.
#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub url: String,
    pub final_url: String,
    pub content: String,
}

/// Browser-based renderer.
#[cfg(feature = "browser")]
pub struct BrowserFetcher {
    config: BrowserEngineConfig,
    browser: Option<Browser>,
    handler: Option<JoinHandle<()>>,
}

#[cfg(feature = "browser")]
impl BrowserFetcher {
    /// Common Chrome executable paths to check.
    const CHROME_PATHS: &'static [&'static str] = &[
        // Linux
        "/usr/bin/google-chrome",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
        "/snap/bin/chromium",
        // macOS
        "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        "/Applications/Chromium.app/Contents/MacOS/Chromium",
        // Common install locations
        "/opt/google/chrome/google-chrome",
    ];

    pub fn new(config: BrowserEngineConfig) -> Self {
        Self {
            config,
            browser: None,
            handler: None,
        }
    }

    /// Find Chrome executable.
    fn find_chrome(&self) -> Result<PathBuf, BrowserError> {
        if let Some(ref path) = self.config.chrome_path {
            if path.exists() {
                return Ok(path.clone());
            }
            return Err(BrowserError::NotFound(format!(
                "configured path {} does not exist",
                path.display()
            )));
        }

        for path in Self::CHROME_PATHS {
            let p = Path::new(path);
            if p.exists() {
                debug!("Found Chrome at: {}", path);
                return Ok(p.to_path_buf());
            }
        }

        for cmd in [
            "google-chrome",
            "google-chrome-stable",
            "chromium",
            "chromium-browser",
        ] {
            if let Ok(path) = which::which(cmd) {
                debug!("Found Chrome in PATH: {}", path.display());
                return Ok(path);
            }
        }

        Err(BrowserError::NotFound(
            "install chromium or set browser.chrome_path in config".to_string(),
        ))
    }

    /// Launch the browser if not already running.
    async fn ensure_browser(&mut self) -> Result<(), BrowserError> {
        if self.browser.is_some() {
            return Ok(());
        }

        let chrome_path = self.find_chrome()?;
        info!(
            "Launching browser (headless={}, proxy={})",
            self.config.headless,
            self.config.proxy.as_deref().unwrap_or("none")
        );

        let mut builder = BrowserConfig::builder().chrome_executable(chrome_path);

        // with_head means NOT headless
        if !self.config.headless {
            builder = builder.with_head();
        }

        if let Some(ref proxy) = self.config.proxy {
            builder = builder.arg(format!("--proxy-server={}", proxy));
        }

        builder = builder
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-infobars")
            .arg("--disable-dev-shm-usage")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--disable-background-networking")
            .arg("--disable-sync")
            .arg("--disable-translate")
            .arg("--no-sandbox")
            .arg("--disable-gpu");

        for arg in &self.config.chrome_args {
            builder = builder.arg(arg);
        }

        let config = builder.build().map_err(BrowserError::Launch)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| BrowserError::Launch(e.to_string()))?;

        self.handler = Some(tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        }));
        self.browser = Some(browser);

        Ok(())
    }

    /// Render `url`, waiting until one of `wait_for` matches.
    ///
    /// Waiting also ends when the page redirects to another host, since the
    /// awaited content will not show up there. The whole navigation is
    /// bounded by the configured page timeout.
    pub async fn render(
        &mut self,
        url: &str,
        wait_for: &[&str],
    ) -> Result<RenderedPage, BrowserError> {
        self.ensure_browser().await?;

        let browser = self
            .browser
            .as_ref()
            .ok_or_else(|| BrowserError::Launch("browser not running".to_string()))?;

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| BrowserError::Protocol(e.to_string()))?;

        let timeout = self.config.page_timeout();
        let rendered = match tokio::time::timeout(
            timeout,
            self.navigate(&page, url, wait_for),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(BrowserError::Timeout(self.config.timeout)),
        };

        let _ = page.close().await;
        rendered
    }

    async fn navigate(
        &self,
        page: &Page,
        url: &str,
        wait_for: &[&str],
    ) -> Result<RenderedPage, BrowserError> {
        page.execute(SetUserAgentOverrideParams::new(
            self.config.user_agent.clone(),
        ))
        .await
        .map_err(|e| BrowserError::Protocol(e.to_string()))?;

        if self.config.stealth {
            for script in stealth::STEALTH_SCRIPTS {
                if let Err(e) = page
                    .execute(AddScriptToEvaluateOnNewDocumentParams::new(
                        script.to_string(),
                    ))
                    .await
                {
                    debug!("Stealth script injection skipped: {}", e);
                }
            }
        }

        info!("Navigating to {}", url);
        let nav_params = NavigateParams::builder()
            .url(url)
            .build()
            .map_err(|e| BrowserError::Navigation(format!("invalid URL: {}", e)))?;

        let navigation = page
            .execute(nav_params)
            .await
            .map_err(|e| BrowserError::Navigation(e.to_string()))?;

        // Proxy and DNS failures come back as net::ERR_* in errorText
        if let Some(ref error) = navigation.result.error_text {
            return Err(BrowserError::Navigation(error.clone()));
        }

        if !wait_for.is_empty() {
            debug!("Waiting for any of: {}", wait_for.join(", "));
            Self::wait_for_any(page, url, wait_for).await;
        }

        let final_url = page
            .url()
            .await
            .map_err(|e| BrowserError::Protocol(e.to_string()))?
            .unwrap_or_else(|| url.to_string());

        let content = page
            .content()
            .await
            .map_err(|e| BrowserError::Protocol(e.to_string()))?;

        Ok(RenderedPage {
            url: url.to_string(),
            final_url,
            content,
        })
    }

    async fn wait_for_any(page: &Page, url: &str, selectors: &[&str]) {
        loop {
            if let Ok(Some(current)) = page.url().await {
                if left_host(url, &current) {
                    debug!("Redirected to {}, not waiting further", current);
                    return;
                }
            }

            for selector in selectors {
                if page.find_element(*selector).await.is_ok() {
                    debug!("Found {}", selector);
                    return;
                }
            }

            tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        }
    }

    /// Close the browser and wait for the process to exit.
    pub async fn close(&mut self) {
        if let Some(mut browser) = self.browser.take() {
            if let Err(e) = browser.close().await {
                warn!("Failed to close browser: {}", e);
            }
            if let Err(e) = browser.wait().await {
                warn!("Failed to wait for browser exit: {}", e);
            }
        }
        if let Some(handler) = self.handler.take() {
            handler.abort();
        }
    }
}

/// Whether `current` is on a different host than `requested`.
///
/// Blank and unparseable URLs count as not having left yet.
#[cfg(feature = "browser")]
fn left_host(requested: &str, current: &str) -> bool {
    let host = |u: &str| url::Url::parse(u).ok()?.host_str().map(str::to_ascii_lowercase);
    match (host(requested), host(current)) {
        (Some(requested), Some(current)) => requested != current,
        _ => false,
    }
}

// Stub for when browser feature is disabled
#[cfg(not(feature = "browser"))]
pub struct BrowserFetcher {
    #[allow(dead_code)]
    config: BrowserEngineConfig,
}

#[cfg(not(feature = "browser"))]
impl BrowserFetcher {
    pub fn new(config: BrowserEngineConfig) -> Self {
        Self { config }
    }

    pub async fn render(
        &mut self,
        _url: &str,
        _wait_for: &[&str],
    ) -> Result<RenderedPage, BrowserError> {
        Err(BrowserError::NotCompiled)
    }

    pub async fn close(&mut self) {}
}
