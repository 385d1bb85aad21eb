//! Command line interface.
//!
//! Parses flags, layers them over the loaded settings and wires the Tor
//! circuit manager, the platform probe and the report sinks into one
//! measurement run.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use crate::catalog::CountryCatalog;
use crate::config::Settings;
use crate::orchestrator::{MeasurementOrchestrator, MeasurementRequest};
use crate::privacy::TorCircuitManager;
use crate::probe::Platform;
use crate::report::{JsonExport, ReportSink, TerminalChart};

#[derive(Parser, Debug)]
#[command(name = "crank")]
#[command(about = "Measure how a search ranking changes across Tor exit countries")]
#[command(version)]
pub struct Cli {
    /// Platform to query
    #[arg(short, long, value_enum)]
    pub platform: Platform,

    /// Search query (e.g. a video title)
    #[arg(short, long)]
    pub query: String,

    /// Result to rank (e.g. a channel URL)
    #[arg(short, long)]
    pub matcher: String,

    /// SOCKS host for the Tor circuit
    #[arg(short = 's', long, env = "CRANK_SOCKS_PROXY")]
    pub socks_proxy: Option<String>,

    /// SOCKS port for the Tor circuit
    #[arg(short = 'o', long, env = "CRANK_SOCKS_PORT")]
    pub socks_port: Option<u16>,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,

    /// Config file path (overrides auto-discovery)
    #[arg(short, long, env = "CRANK_CONFIG")]
    pub config: Option<PathBuf>,

    /// Only measure these countries (comma-separated alpha-2 codes)
    #[arg(long, value_delimiter = ',')]
    pub countries: Vec<String>,

    /// Seconds to wait for a circuit before skipping a country
    #[arg(long)]
    pub connect_timeout: Option<u64>,

    /// Seconds to wait for the results page to load
    #[arg(long)]
    pub probe_timeout: Option<u64>,

    /// Path to the tor executable
    #[arg(long)]
    pub tor_binary: Option<PathBuf>,

    /// Write the report as JSON to this file
    #[arg(long)]
    pub export: Option<PathBuf>,

    /// Do not draw the rank chart
    #[arg(long)]
    pub no_chart: bool,
}

/// Short flags that take a value.
const VALUE_SHORTS: &[char] = &['p', 'q', 'm', 's', 'o', 'c'];

/// Check if debug mode is enabled (for early logging setup).
pub fn is_debug() -> bool {
    debug_requested(std::env::args().skip(1))
}

/// Scan raw arguments for `-d`/`--debug`, including clustered short flags
/// like `-dq`, without mistaking option values for flags.
fn debug_requested<I, S>(args: I) -> bool
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut takes_value = false;
    for arg in args {
        let arg = arg.as_ref();
        if std::mem::take(&mut takes_value) && !arg.starts_with('-') {
            continue;
        }
        if arg == "--" {
            return false;
        }
        if arg == "--debug" {
            return true;
        }
        if arg.starts_with("--") {
            continue;
        }
        let Some(shorts) = arg.strip_prefix('-') else {
            continue;
        };

        for (i, flag) in shorts.char_indices() {
            if flag == 'd' {
                return true;
            }
            if VALUE_SHORTS.contains(&flag) {
                // The value is the rest of this argument or the next one
                takes_value = i + flag.len_utf8() == shorts.len();
                break;
            }
        }
    }
    false
}

impl Cli {
    /// Loaded settings with command line flags applied on top.
    pub fn settings(&self) -> anyhow::Result<Settings> {
        let mut settings = Settings::load(self.config.as_deref())?;
        self.apply_to(&mut settings);
        settings.validate()?;
        Ok(settings)
    }

    fn apply_to(&self, settings: &mut Settings) {
        if let Some(ref host) = self.socks_proxy {
            settings.socks_host = host.clone();
        }
        if let Some(port) = self.socks_port {
            settings.socks_port = port;
        }
        if !self.countries.is_empty() {
            settings.countries = self.countries.clone();
        }
        if let Some(secs) = self.connect_timeout {
            settings.connect_timeout = secs;
        }
        if let Some(secs) = self.probe_timeout {
            settings.browser.timeout = secs;
        }
        if let Some(ref path) = self.tor_binary {
            settings.tor.binary = Some(path.clone());
        }
        if let Some(ref path) = self.export {
            settings.export = Some(path.clone());
        }
    }

    fn sinks(&self, settings: &Settings) -> Vec<Box<dyn ReportSink>> {
        let mut sinks: Vec<Box<dyn ReportSink>> = Vec::new();
        if !self.no_chart {
            sinks.push(Box::new(TerminalChart::stdout()));
        }
        if let Some(ref path) = settings.export {
            sinks.push(Box::new(JsonExport::new(path)));
        }
        sinks
    }
}

/// Parse arguments and run one measurement.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = cli.settings()?;

    let catalog = if settings.countries.is_empty() {
        CountryCatalog::all()
    } else {
        CountryCatalog::select(&settings.countries)?
    };

    let circuits = TorCircuitManager::new(settings.tor.clone())
        .context("Tor is required to pin exit countries")?;
    let probe = cli.platform.probe(settings.browser.clone());

    let request = MeasurementRequest {
        query: cli.query.clone(),
        matcher: cli.matcher.clone(),
        socks_host: settings.socks_host.clone(),
        socks_port: settings.socks_port,
        connect_timeout: settings.connect_timeout(),
    };

    info!(
        "Measuring {} across {} countries",
        cli.platform,
        catalog.len()
    );

    let mut sinks = cli.sinks(&settings);
    MeasurementOrchestrator::new(circuits, probe, catalog)
        .run(&request, &mut sinks)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["crank"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_original_flags() {
        let cli = parse(&[
            "-p", "youtube", "-q", "some video", "-m", "https://www.youtube.com/@chan", "-s",
            "10.0.0.2", "-o", "9150", "-d",
        ]);

        assert_eq!(cli.platform, Platform::YouTube);
        assert_eq!(cli.query, "some video");
        assert_eq!(cli.matcher, "https://www.youtube.com/@chan");
        assert_eq!(cli.socks_proxy.as_deref(), Some("10.0.0.2"));
        assert_eq!(cli.socks_port, Some(9150));
        assert!(cli.debug);
    }

    #[test]
    fn test_debug_detection() {
        assert!(debug_requested(["-p", "youtube", "-d"]));
        assert!(debug_requested(["--debug", "-q", "x"]));
        assert!(debug_requested(["-dq", "some video"]));
        assert!(!debug_requested(["-q", "x", "-pd"]));
        assert!(!debug_requested(["-m", "d", "-q", "dd"]));
        assert!(!debug_requested(["-qd"]));
        assert!(!debug_requested(["--query", "x", "--", "-d"]));
        assert!(!debug_requested(["-p", "youtube"]));
    }

    #[test]
    fn test_required_flags() {
        assert!(Cli::try_parse_from(["crank", "-q", "x", "-m", "y"]).is_err());
        assert!(Cli::try_parse_from(["crank", "-p", "youtube", "-m", "y"]).is_err());
        assert!(Cli::try_parse_from(["crank", "-p", "bing", "-q", "x", "-m", "y"]).is_err());
    }

    #[test]
    fn test_flags_override_settings() {
        let cli = parse(&[
            "-p",
            "youtube",
            "-q",
            "q",
            "-m",
            "m",
            "--countries",
            "de,fr",
            "--connect-timeout",
            "20",
            "--probe-timeout",
            "60",
            "--tor-binary",
            "/opt/tor",
            "--export",
            "out.json",
            "-o",
            "9999",
        ]);

        let mut settings = Settings::default();
        cli.apply_to(&mut settings);

        assert_eq!(settings.countries, vec!["de", "fr"]);
        assert_eq!(settings.connect_timeout, 20);
        assert_eq!(settings.browser.timeout, 60);
        assert_eq!(settings.tor.binary, Some(PathBuf::from("/opt/tor")));
        assert_eq!(settings.export, Some(PathBuf::from("out.json")));
        assert_eq!(settings.socks_port, 9999);
        assert_eq!(settings.socks_host, "127.0.0.1");
    }

    #[test]
    fn test_unset_flags_keep_settings() {
        let cli = parse(&["-p", "youtube", "-q", "q", "-m", "m"]);
        let mut settings = Settings {
            socks_port: 9150,
            countries: vec!["us".to_string()],
            ..Default::default()
        };
        cli.apply_to(&mut settings);

        assert_eq!(settings.socks_port, 9150);
        assert_eq!(settings.countries, vec!["us"]);
    }

    #[test]
    fn test_sinks_follow_flags() {
        let cli = parse(&["-p", "youtube", "-q", "q", "-m", "m", "--no-chart"]);
        assert!(cli.sinks(&Settings::default()).is_empty());

        let cli = parse(&["-p", "youtube", "-q", "q", "-m", "m"]);
        let settings = Settings {
            export: Some(PathBuf::from("report.json")),
            ..Default::default()
        };
        assert_eq!(cli.sinks(&settings).len(), 2);
    }
}
