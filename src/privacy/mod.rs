//! Tor circuit management.
//!
//! A circuit is a Tor client whose exit is pinned to a single country and
//! whose SOCKS listener is the only way a probe reaches the platform being
//! measured.
//!
//! # Lifecycle
//!
//! `acquire` either returns a ready [`CircuitManager::Circuit`] or a
//! [`CircuitError`]. Whoever acquired a circuit must hand it back through
//! [`CircuitManager::release`] before acquiring the next one; the SOCKS port
//! and Tor data directory are shared between successive circuits.
//!
//! # Failure classes
//!
//! [`CircuitError::Unavailable`] is the expected outcome for countries
//! without a reachable exit and callers skip the country. Every other
//! variant points at the local environment (missing binary, port conflict,
//! broken data directory) and callers should stop.

mod config;
mod ctor;

use std::fmt;
use std::process::ExitStatus;
use std::time::Duration;

use async_trait::async_trait;

use crate::catalog::Country;

pub use config::TorConfig;
pub use ctor::{TorCircuit, TorCircuitManager};

/// Parameters for a single circuit attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitConfig {
    pub exit_country: Country,
    pub socks_host: String,
    pub socks_port: u16,
    pub connect_timeout: Duration,
}

impl CircuitConfig {
    /// The endpoint the circuit will listen on once ready.
    pub fn endpoint(&self) -> ProxyEndpoint {
        ProxyEndpoint::new(self.socks_host.clone(), self.socks_port)
    }
}

/// Local SOCKS5 endpoint of a ready circuit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
}

impl ProxyEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Proxy URL in the form browsers and HTTP clients accept.
    pub fn socks_url(&self) -> String {
        format!("socks5://{}:{}", self.host, self.port)
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Why a country had no usable circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnavailableReason {
    /// The circuit was not ready within the connect timeout.
    BootstrapTimeout,
    /// Tor reported no relay satisfies the exit constraint.
    NoExitNode,
    /// The circuit came up but the probe could not reach the platform through it.
    CircuitUnusable,
}

impl fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnavailableReason::BootstrapTimeout => write!(f, "bootstrap timed out"),
            UnavailableReason::NoExitNode => write!(f, "no exit node"),
            UnavailableReason::CircuitUnusable => write!(f, "circuit unusable"),
        }
    }
}

/// Errors acquiring a circuit.
#[derive(Debug, thiserror::Error)]
pub enum CircuitError {
    #[error("No circuit exiting in {country}: {reason}")]
    Unavailable {
        country: Country,
        reason: UnavailableReason,
    },
    #[error("Failed to launch tor: {0}")]
    Launch(String),
    #[error("SOCKS port {0} is already in use")]
    PortInUse(u16),
    #[error("tor exited before the circuit was ready ({status}): {log_tail}")]
    Exited { status: String, log_tail: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CircuitError {
    /// Whether this failure only means "skip this country".
    pub fn is_unavailable(&self) -> bool {
        matches!(self, CircuitError::Unavailable { .. })
    }

    pub(crate) fn exited(status: Option<ExitStatus>, log_tail: String) -> Self {
        let status = match status {
            Some(status) => status.to_string(),
            None => "unknown status".to_string(),
        };
        CircuitError::Exited { status, log_tail }
    }
}

/// A live circuit handle.
pub trait Circuit: Send {
    fn endpoint(&self) -> &ProxyEndpoint;
    fn exit_country(&self) -> &Country;
}

/// Provisions and tears down exit-pinned circuits.
#[async_trait]
pub trait CircuitManager: Send + Sync {
    type Circuit: Circuit;

    /// Establish a circuit exiting in `config.exit_country`.
    ///
    /// Must not fall back to an unconstrained exit and must give up after
    /// `config.connect_timeout` with [`CircuitError::Unavailable`].
    async fn acquire(&self, config: &CircuitConfig) -> Result<Self::Circuit, CircuitError>;

    /// Tear the circuit down. Never fails; problems are logged.
    async fn release(&self, circuit: Self::Circuit);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::lookup;

    #[test]
    fn test_endpoint_from_config() {
        let config = CircuitConfig {
            exit_country: lookup("NL").unwrap(),
            socks_host: "127.0.0.1".to_string(),
            socks_port: 7321,
            connect_timeout: Duration::from_secs(10),
        };

        let endpoint = config.endpoint();
        assert_eq!(endpoint.socks_url(), "socks5://127.0.0.1:7321");
        assert_eq!(endpoint.to_string(), "127.0.0.1:7321");
    }

    #[test]
    fn test_only_unavailable_is_skippable() {
        let nl = lookup("NL").unwrap();
        assert!(CircuitError::Unavailable {
            country: nl,
            reason: UnavailableReason::NoExitNode
        }
        .is_unavailable());
        assert!(!CircuitError::PortInUse(7321).is_unavailable());
        assert!(!CircuitError::Launch("missing".into()).is_unavailable());
        assert!(!CircuitError::exited(None, String::new()).is_unavailable());
    }
}
