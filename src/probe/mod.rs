//! Platform rank probes.
//!
//! A probe performs one search on one platform through a circuit's proxy
//! endpoint and reports where the matcher landed. Probes never open
//! connections outside the endpoint they are given.

mod youtube;

use std::fmt;
use std::num::NonZeroUsize;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::browser::{BrowserEngineConfig, BrowserError};
use crate::privacy::ProxyEndpoint;

pub use youtube::{parse_channel_urls, rank_of, rank_page, YouTubeProbe};

/// Platforms a measurement can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// YouTube video search, matched by channel URL
    #[value(name = "youtube")]
    YouTube,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::YouTube => write!(f, "youtube"),
        }
    }
}

impl Platform {
    /// Build the probe for this platform.
    pub fn probe(self, browser: BrowserEngineConfig) -> Box<dyn RankProbe> {
        match self {
            Platform::YouTube => Box::new(YouTubeProbe::new(browser)),
        }
    }
}

/// Where the matcher appeared in one result listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rank {
    /// 1-based position.
    Found(NonZeroUsize),
    NotFound,
}

impl Rank {
    /// Rank from a 0-based index, if any.
    pub fn from_index(index: Option<usize>) -> Self {
        match index.and_then(|i| NonZeroUsize::new(i + 1)) {
            Some(position) => Rank::Found(position),
            None => Rank::NotFound,
        }
    }

    /// Numeric rank, 0 when not found.
    pub fn value(&self) -> usize {
        match self {
            Rank::Found(position) => position.get(),
            Rank::NotFound => 0,
        }
    }
}

/// Errors from a probe run.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    /// The platform could not be reached through the circuit.
    #[error("Network error: {0}")]
    Network(String),
    /// The local browser could not be launched or driven.
    #[error("Browser error: {0}")]
    Browser(String),
    /// The result page could not be interpreted.
    #[error("Parse error: {0}")]
    Parse(String),
}

impl ProbeError {
    pub fn is_network(&self) -> bool {
        matches!(self, ProbeError::Network(_))
    }
}

impl From<BrowserError> for ProbeError {
    fn from(e: BrowserError) -> Self {
        if e.is_network() {
            ProbeError::Network(e.to_string())
        } else {
            ProbeError::Browser(e.to_string())
        }
    }
}

/// Looks up the rank of a matcher for a query on one platform.
#[async_trait]
pub trait RankProbe: Send + Sync {
    fn platform(&self) -> Platform;

    /// Search for `query` through `endpoint` and locate `matcher`.
    async fn probe(
        &self,
        endpoint: &ProxyEndpoint,
        query: &str,
        matcher: &str,
    ) -> Result<Rank, ProbeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_from_index() {
        assert_eq!(Rank::from_index(Some(0)).value(), 1);
        assert_eq!(Rank::from_index(Some(2)).value(), 3);
        assert_eq!(Rank::from_index(None), Rank::NotFound);
        assert_eq!(Rank::NotFound.value(), 0);
    }

    #[test]
    fn test_browser_errors_map_to_probe_classes() {
        let err: ProbeError = BrowserError::Timeout(30).into();
        assert!(err.is_network());

        let err: ProbeError = BrowserError::NotFound("chromium".into()).into();
        assert!(matches!(err, ProbeError::Browser(_)));
        assert!(!err.is_network());
    }

    #[test]
    fn test_platform_builds_matching_probe() {
        let probe = Platform::YouTube.probe(BrowserEngineConfig::default());
        assert_eq!(probe.platform(), Platform::YouTube);
        assert_eq!(Platform::YouTube.to_string(), "youtube");
    }
}
