//! C-Tor circuit integration.
//!
//! Each circuit is a dedicated `tor` process whose exits are restricted to a
//! single country with `ExitNodes {cc}` and `StrictNodes 1`.
//!
//! # How it works
//!
//! 1. We write a torrc pinning the exit country and the SOCKS listener
//! 2. We spawn tor with that torrc and read its notice log from stdout
//! 3. The circuit is ready once tor logs `Bootstrapped 100%`
//! 4. If that does not happen within the connect timeout the country is
//!    reported unavailable and the process is killed
//! 5. Release kills the process and waits for it to exit so the next circuit
//!    can bind the same port and lock the same data directory

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::{
    Circuit, CircuitConfig, CircuitError, CircuitManager, ProxyEndpoint, TorConfig,
    UnavailableReason,
};
use crate::catalog::Country;

/// Name of the generated torrc inside the data directory.
const TORRC_NAME: &str = "crank-torrc";

/// Log lines kept for error reports.
const LOG_TAIL_LINES: usize = 8;

/// Launches one tor process per circuit.
pub struct TorCircuitManager {
    config: TorConfig,
    tor_binary: PathBuf,
}

impl TorCircuitManager {
    /// Find the tor binary in PATH or at a specific location.
    pub fn find_tor_binary(config: &TorConfig) -> Option<PathBuf> {
        // Check explicit path first
        if let Some(ref path) = config.binary {
            if path.exists() {
                return Some(path.clone());
            }
        }

        let candidates = if cfg!(windows) {
            vec!["tor.exe", "Tor\\tor.exe"]
        } else {
            vec!["tor", "/usr/bin/tor", "/usr/local/bin/tor", "/opt/homebrew/bin/tor"]
        };

        for candidate in candidates {
            if let Ok(path) = which::which(candidate) {
                return Some(path);
            }
        }

        None
    }

    /// Create a manager, failing if no tor binary can be found.
    pub fn new(config: TorConfig) -> Result<Self, CircuitError> {
        let tor_binary = Self::find_tor_binary(&config).ok_or_else(|| {
            CircuitError::Launch(
                "Tor binary not found. Install tor or set tor.binary in config.".to_string(),
            )
        })?;

        info!("Using tor binary: {}", tor_binary.display());

        Ok(Self { config, tor_binary })
    }

    /// Generate a torrc for a single exit-pinned circuit.
    fn generate_torrc(config: &CircuitConfig, data_dir: &Path, extra_args: &[String]) -> String {
        let mut torrc = format!(
            r#"# crank circuit for {country}
# Auto-generated - do not edit manually

DataDirectory {data_dir}
SocksPort {socks_host}:{socks_port}

# Exit pinning
ExitNodes {exit_spec}
StrictNodes 1

# Exit together with crank
__OwningControllerProcess {pid}

# Logging
Log notice stdout
SafeLogging 1
"#,
            country = config.exit_country,
            data_dir = data_dir.display(),
            socks_host = config.socks_host,
            socks_port = config.socks_port,
            exit_spec = config.exit_country.exit_spec(),
            pid = std::process::id(),
        );

        for pair in extra_args.chunks(2) {
            if let [key, value] = pair {
                torrc.push_str(&format!("{} {}\n", key, value));
            }
        }

        torrc
    }

    /// Pick the data directory for the next circuit.
    ///
    /// Returns the scratch directory guard when no persistent directory is
    /// available; it must outlive the tor process.
    fn prepare_data_dir(&self) -> Result<(PathBuf, Option<TempDir>), CircuitError> {
        if let Some(dir) = self.config.persistent_data_dir() {
            fs::create_dir_all(&dir)?;

            // Tor refuses data directories readable by others
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))?;
            }

            return Ok((dir, None));
        }

        let scratch = tempfile::Builder::new().prefix("crank-tor-").tempdir()?;
        Ok((scratch.path().to_path_buf(), Some(scratch)))
    }

    /// Kill the process and wait for it, logging rather than failing.
    async fn shutdown(circuit: &mut TorCircuit) {
        let Some(mut process) = circuit.process.take() else {
            return;
        };

        match process.try_wait() {
            Ok(Some(status)) => {
                debug!("tor for {} already exited ({})", circuit.country.code, status);
                return;
            }
            Ok(None) => {}
            Err(e) => warn!("Could not poll tor for {}: {}", circuit.country.code, e),
        }

        match process.kill().await {
            Ok(()) => debug!("tor for {} stopped", circuit.country.code),
            Err(e) => warn!("Failed to stop tor for {}: {}", circuit.country.code, e),
        }
    }
}

#[async_trait]
impl CircuitManager for TorCircuitManager {
    type Circuit = TorCircuit;

    async fn acquire(&self, config: &CircuitConfig) -> Result<TorCircuit, CircuitError> {
        let (data_dir, scratch) = self.prepare_data_dir()?;

        let torrc_path = data_dir.join(TORRC_NAME);
        let torrc = Self::generate_torrc(config, &data_dir, &self.config.extra_args);
        fs::write(&torrc_path, torrc)?;

        debug!("Tor config: {}", torrc_path.display());

        let mut process = Command::new(&self.tor_binary)
            .arg("-f")
            .arg(&torrc_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                CircuitError::Launch(format!("{}: {}", self.tor_binary.display(), e))
            })?;

        let stdout = process.stdout.take();

        let mut circuit = TorCircuit {
            process: Some(process),
            endpoint: config.endpoint(),
            country: config.exit_country,
            _scratch: scratch,
        };

        let Some(stdout) = stdout else {
            Self::shutdown(&mut circuit).await;
            return Err(CircuitError::Launch("tor stdout was not captured".to_string()));
        };

        let mut lines = LogReader::new(stdout);
        let mut log = BootstrapLog::default();

        let waited =
            tokio::time::timeout(config.connect_timeout, wait_for_bootstrap(&mut lines, &mut log))
                .await;

        match waited {
            Ok(Ok(Bootstrap::Ready)) => {
                info!("Circuit ready via {} on {}", config.exit_country, circuit.endpoint);

                // Tor keeps logging; drain the pipe so it never blocks.
                let code = config.exit_country.code;
                tokio::spawn(async move {
                    while let Ok(Some(line)) = lines.next_line().await {
                        debug!("tor[{}]: {}", code, line);
                    }
                });

                Ok(circuit)
            }
            Ok(Ok(Bootstrap::Exited)) => {
                let status = match circuit.process.as_mut() {
                    Some(process) => process.wait().await.ok(),
                    None => None,
                };
                circuit.process = None;

                if log.port_conflict {
                    Err(CircuitError::PortInUse(config.socks_port))
                } else {
                    Err(CircuitError::exited(status, log.tail()))
                }
            }
            Ok(Err(e)) => {
                Self::shutdown(&mut circuit).await;
                Err(CircuitError::Io(e))
            }
            Err(_) => {
                Self::shutdown(&mut circuit).await;

                let reason = if log.exit_shortage {
                    UnavailableReason::NoExitNode
                } else {
                    UnavailableReason::BootstrapTimeout
                };
                debug!(
                    "Circuit via {} not ready after {:?}: {}",
                    config.exit_country, config.connect_timeout, reason
                );

                Err(CircuitError::Unavailable {
                    country: config.exit_country,
                    reason,
                })
            }
        }
    }

    async fn release(&self, mut circuit: TorCircuit) {
        Self::shutdown(&mut circuit).await;
    }
}

/// A running tor process pinned to one exit country.
pub struct TorCircuit {
    process: Option<Child>,
    endpoint: ProxyEndpoint,
    country: Country,
    _scratch: Option<TempDir>,
}

impl Circuit for TorCircuit {
    fn endpoint(&self) -> &ProxyEndpoint {
        &self.endpoint
    }

    fn exit_country(&self) -> &Country {
        &self.country
    }
}

impl Drop for TorCircuit {
    fn drop(&mut self) {
        if let Some(ref mut process) = self.process {
            warn!("tor for {} dropped without release, killing", self.country.code);
            let _ = process.start_kill();
        }
    }
}

enum Bootstrap {
    Ready,
    Exited,
}

/// What tor said while bootstrapping.
#[derive(Debug, Default)]
struct BootstrapLog {
    exit_shortage: bool,
    port_conflict: bool,
    tail: VecDeque<String>,
}

impl BootstrapLog {
    fn record(&mut self, line: &str) {
        match classify_line(line) {
            LogLine::ExitShortage => self.exit_shortage = true,
            LogLine::PortConflict => self.port_conflict = true,
            _ => {}
        }

        if self.tail.len() == LOG_TAIL_LINES {
            self.tail.pop_front();
        }
        self.tail.push_back(line.to_string());
    }

    fn tail(&self) -> String {
        self.tail.iter().cloned().collect::<Vec<_>>().join(" | ")
    }
}

#[derive(Debug, PartialEq, Eq)]
enum LogLine {
    Bootstrapped,
    ExitShortage,
    PortConflict,
    Other,
}

fn classify_line(line: &str) -> LogLine {
    let lower = line.to_ascii_lowercase();

    if line.contains("Bootstrapped 100%") {
        LogLine::Bootstrapped
    } else if lower.contains("address already in use") || lower.contains("could not bind") {
        LogLine::PortConflict
    } else if lower.contains("failed to find node for hop")
        || lower.contains("exit routers seem to be running")
        || lower.contains("unrecognized country code")
    {
        LogLine::ExitShortage
    } else {
        LogLine::Other
    }
}

/// Line reader over tor's stdout that tolerates invalid UTF-8.
struct LogReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LogReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            buf: Vec::new(),
        }
    }

    async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        self.buf.clear();
        if self.inner.read_until(b'\n', &mut self.buf).await? == 0 {
            return Ok(None);
        }

        let line = String::from_utf8_lossy(&self.buf);
        Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
    }
}

async fn wait_for_bootstrap<R: AsyncRead + Unpin>(
    lines: &mut LogReader<R>,
    log: &mut BootstrapLog,
) -> std::io::Result<Bootstrap> {
    while let Some(line) = lines.next_line().await? {
        // Strict exit pinning makes tor warn a lot, so everything stays at debug
        debug!("tor: {}", line);

        log.record(&line);
        if classify_line(&line) == LogLine::Bootstrapped {
            return Ok(Bootstrap::Ready);
        }
    }

    Ok(Bootstrap::Exited)
}
