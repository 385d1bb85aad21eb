//! TorCircuitManager against stand-in `tor` executables.
//!
//! Each test writes a small shell script that prints what a real tor would
//! log for the scenario, then drives acquire/release through it.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::Mutex;

use crank::catalog::lookup;
use crank::privacy::{Circuit, TorCircuitManager, TorConfig, UnavailableReason};
use crank::report::ReportSink;
use crank::{
    CircuitConfig, CircuitError, CircuitManager, CountryCatalog, MeasurementOrchestrator,
    MeasurementReport, MeasurementRequest, Platform, ProbeError, ProxyEndpoint, Rank, RankProbe,
    RankResult,
};

/// Writing and exec'ing scripts from parallel tests can hit ETXTBSY.
fn serial() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

const READY: &str = r#"echo "$$" > "$(dirname "$2")/tor.pid"
echo "Oct 17 14:20:00.000 [notice] Bootstrapped 0% (starting): Starting"
echo "Oct 17 14:20:01.000 [notice] Bootstrapped 100% (done): Done"
exec sleep 30
"#;

const HANG: &str = r#"echo "Oct 17 14:20:00.000 [notice] Bootstrapped 5% (conn): Connecting to a relay"
exec sleep 30
"#;

const NO_EXIT: &str = r#"echo "Oct 17 14:20:00.000 [notice] Bootstrapped 90% (ap_handshake_done): Handshake finished with a relay to build circuits"
echo "Oct 17 14:20:01.000 [warn] Failed to find node for hop #3 of our path. Discarding this circuit."
exec sleep 30
"#;

const PORT_TAKEN: &str = r#"echo "Oct 17 14:20:00.000 [warn] Could not bind to 127.0.0.1:7321: Address already in use. Is Tor already running?"
echo "Oct 17 14:20:00.000 [err] Failed to bind one of the listener ports."
exit 1
"#;

const BAD_CONFIG: &str = r#"echo "Oct 17 14:20:00.000 [err] Reading config failed--see warnings above."
exit 1
"#;

struct Fixture {
    dir: TempDir,
    manager: TorCircuitManager,
}

impl Fixture {
    fn new(script: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("tor");
        std::fs::write(&binary, format!("#!/bin/sh\n{}", script)).unwrap();
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();

        let config = TorConfig {
            binary: Some(binary),
            data_dir: Some(dir.path().join("data")),
            extra_args: Vec::new(),
        };
        let manager = TorCircuitManager::new(config).unwrap();

        Self { dir, manager }
    }

    fn data_dir(&self) -> PathBuf {
        self.dir.path().join("data")
    }
}

fn circuit_config(code: &str, timeout: Duration) -> CircuitConfig {
    CircuitConfig {
        exit_country: lookup(code).unwrap(),
        socks_host: "127.0.0.1".to_string(),
        socks_port: 7321,
        connect_timeout: timeout,
    }
}

fn process_alive(pid_file: &Path) -> bool {
    let pid = std::fs::read_to_string(pid_file).unwrap();
    std::process::Command::new("kill")
        .arg("-0")
        .arg(pid.trim())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[tokio::test]
async fn test_acquire_ready_circuit_and_release() {
    let _guard = serial().lock().await;
    let fixture = Fixture::new(READY);

    let circuit = fixture
        .manager
        .acquire(&circuit_config("DE", Duration::from_secs(5)))
        .await
        .unwrap();

    assert_eq!(circuit.endpoint(), &ProxyEndpoint::new("127.0.0.1", 7321));
    assert_eq!(circuit.exit_country().code, "DE");

    let torrc = std::fs::read_to_string(fixture.data_dir().join("crank-torrc")).unwrap();
    assert!(torrc.contains("ExitNodes {de}"));
    assert!(torrc.contains("StrictNodes 1"));

    let pid_file = fixture.data_dir().join("tor.pid");
    assert!(process_alive(&pid_file));

    fixture.manager.release(circuit).await;
    assert!(!process_alive(&pid_file));
}

#[tokio::test]
async fn test_acquire_times_out_as_unavailable() {
    let _guard = serial().lock().await;
    let fixture = Fixture::new(HANG);

    let started = Instant::now();
    let err = fixture
        .manager
        .acquire(&circuit_config("IS", Duration::from_millis(300)))
        .await
        .err()
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(err.is_unavailable());
    assert!(matches!(
        err,
        CircuitError::Unavailable {
            reason: UnavailableReason::BootstrapTimeout,
            ..
        }
    ));
}

#[tokio::test]
async fn test_exit_shortage_reported_as_no_exit_node() {
    let _guard = serial().lock().await;
    let fixture = Fixture::new(NO_EXIT);

    let err = fixture
        .manager
        .acquire(&circuit_config("KP", Duration::from_millis(300)))
        .await
        .err()
        .unwrap();

    assert!(matches!(
        err,
        CircuitError::Unavailable {
            reason: UnavailableReason::NoExitNode,
            ..
        }
    ));
}

#[tokio::test]
async fn test_port_conflict_is_fatal() {
    let _guard = serial().lock().await;
    let fixture = Fixture::new(PORT_TAKEN);

    let err = fixture
        .manager
        .acquire(&circuit_config("FR", Duration::from_secs(5)))
        .await
        .err()
        .unwrap();

    assert!(!err.is_unavailable());
    assert!(matches!(err, CircuitError::PortInUse(7321)));
}

#[tokio::test]
async fn test_early_exit_is_fatal_with_log_tail() {
    let _guard = serial().lock().await;
    let fixture = Fixture::new(BAD_CONFIG);

    let err = fixture
        .manager
        .acquire(&circuit_config("FR", Duration::from_secs(5)))
        .await
        .err()
        .unwrap();

    match err {
        CircuitError::Exited { log_tail, .. } => {
            assert!(log_tail.contains("Reading config failed"))
        }
        other => panic!("expected Exited, got {:?}", other),
    }
}

/// Probe that checks it was handed the circuit's endpoint.
struct EndpointProbe;

#[async_trait]
impl RankProbe for EndpointProbe {
    fn platform(&self) -> Platform {
        Platform::YouTube
    }

    async fn probe(
        &self,
        endpoint: &ProxyEndpoint,
        _query: &str,
        _matcher: &str,
    ) -> Result<Rank, ProbeError> {
        assert_eq!(endpoint.socks_url(), "socks5://127.0.0.1:7321");
        Ok(Rank::from_index(Some(1)))
    }
}

struct Discard;

impl ReportSink for Discard {
    fn render(&mut self, _report: &MeasurementReport) {}
}

#[tokio::test]
async fn test_sweep_reuses_port_across_countries() {
    let _guard = serial().lock().await;
    let fixture = Fixture::new(READY);
    let catalog = CountryCatalog::select(&["ch", "de", "nl"]).unwrap();

    let orchestrator = MeasurementOrchestrator::new(fixture.manager, Box::new(EndpointProbe), catalog);
    let request = MeasurementRequest {
        query: "query".to_string(),
        matcher: "/@matcher".to_string(),
        socks_host: "127.0.0.1".to_string(),
        socks_port: 7321,
        connect_timeout: Duration::from_secs(5),
    };

    let report = orchestrator.run(&request, &mut Discard).await.unwrap();

    assert_eq!(report.len(), 3);
    assert!(report
        .entries()
        .iter()
        .all(|e| e.result.rank() == Some(2) && matches!(e.result, RankResult::Rank(_))));

    // The last circuit was torn down too
    let pid_file = fixture.dir.path().join("data").join("tor.pid");
    assert!(!process_alive(&pid_file));
}
