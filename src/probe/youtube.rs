//! YouTube search rank probe.
//!
//! Renders the search results page in headless Chromium through the circuit
//! and ranks result entries by the channel that published them.

use async_trait::async_trait;
use scraper::{Html, Selector};
use tracing::{debug, warn};
use url::Url;

use super::{Platform, ProbeError, Rank, RankProbe};
use crate::browser::{BrowserEngineConfig, BrowserFetcher, RenderedPage};
use crate::privacy::ProxyEndpoint;

const YOUTUBE_BASE_URL: &str = "https://www.youtube.com/";

/// One result entry in the rendered listing.
const RESULT_SELECTOR: &str = "#dismissable";

/// Panel shown instead of entries when a search has no results.
const NO_RESULTS_SELECTOR: &str = "ytd-background-promo-renderer";

/// Channel link inside a result entry.
const CHANNEL_SELECTOR: &str = "#channel-name a.yt-simple-endpoint";

/// Build the search results URL for `query`.
pub fn search_url(query: &str) -> String {
    format!(
        "{}results?search_query={}",
        YOUTUBE_BASE_URL,
        urlencoding::encode(query)
    )
}

/// Channel URL of every result entry, in listing order.
///
/// Entries without a channel link keep their slot as `None` so positions
/// stay aligned with what the viewer sees.
pub fn parse_channel_urls(html: &str) -> Result<Vec<Option<String>>, ProbeError> {
    let document = Html::parse_document(html);

    let result_selector = Selector::parse(RESULT_SELECTOR)
        .map_err(|e| ProbeError::Parse(format!("Failed to parse selector: {:?}", e)))?;
    let channel_selector = Selector::parse(CHANNEL_SELECTOR)
        .map_err(|e| ProbeError::Parse(format!("Failed to parse selector: {:?}", e)))?;

    let channels: Vec<Option<String>> = document
        .select(&result_selector)
        .map(|entry| {
            entry
                .select(&channel_selector)
                .next()
                .and_then(|link| link.value().attr("href"))
                .and_then(normalize_channel_url)
        })
        .collect();

    debug!("Parsed {} result entries", channels.len());
    Ok(channels)
}

/// Canonical form of a channel URL: absolute, no `www.`, no trailing slash,
/// no query or fragment.
fn normalize_channel_url(href: &str) -> Option<String> {
    let base = Url::parse(YOUTUBE_BASE_URL).ok()?;
    let url = base.join(href.trim()).ok()?;

    let host = url.host_str()?.to_ascii_lowercase();
    let host = host
        .strip_prefix("www.")
        .or_else(|| host.strip_prefix("m."))
        .unwrap_or(host.as_str())
        .to_string();

    let path = url.path().trim_end_matches('/');
    Some(format!("https://{}{}", host, path))
}

/// Rank of the first entry published by `matcher`.
pub fn rank_of(channels: &[Option<String>], matcher: &str) -> Rank {
    let Some(matcher) = normalize_channel_url(matcher) else {
        return Rank::NotFound;
    };

    Rank::from_index(
        channels
            .iter()
            .position(|channel| channel.as_deref() == Some(matcher.as_str())),
    )
}

/// Fail when the browser landed on the cookie consent wall, which EU exits
/// get instead of results.
fn check_landing(final_url: &str) -> Result<(), ProbeError> {
    let consent = Url::parse(final_url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.starts_with("consent.")))
        .unwrap_or(false);

    if consent {
        return Err(ProbeError::Network(format!(
            "redirected to consent page {}",
            final_url
        )));
    }
    Ok(())
}

/// Rank of `matcher` on a rendered results page.
pub fn rank_page(page: &RenderedPage, matcher: &str) -> Result<Rank, ProbeError> {
    check_landing(&page.final_url)?;

    let channels = parse_channel_urls(&page.content)?;
    if channels.is_empty() {
        warn!("No result entries found on {}", page.final_url);
    }

    Ok(rank_of(&channels, matcher))
}

/// Ranks a channel in YouTube video search.
pub struct YouTubeProbe {
    browser: BrowserEngineConfig,
}

impl YouTubeProbe {
    pub fn new(browser: BrowserEngineConfig) -> Self {
        Self { browser }
    }
}

#[async_trait]
impl RankProbe for YouTubeProbe {
    fn platform(&self) -> Platform {
        Platform::YouTube
    }

    async fn probe(
        &self,
        endpoint: &ProxyEndpoint,
        query: &str,
        matcher: &str,
    ) -> Result<Rank, ProbeError> {
        let url = search_url(query);
        debug!("Encoded search URL: {}", url);

        let mut fetcher = BrowserFetcher::new(self.browser.with_proxy(endpoint.socks_url()));
        let rendered = fetcher
            .render(&url, &[RESULT_SELECTOR, NO_RESULTS_SELECTOR])
            .await;
        fetcher.close().await;

        let rank = rank_page(&rendered?, matcher)?;
        debug!("Rank: {}", rank.value());
        Ok(rank)
    }
}
