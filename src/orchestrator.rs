//! Per-country measurement sweep.
//!
//! The orchestrator walks the catalog one country at a time. For each
//! country it acquires an exit-pinned circuit, runs the probe through it,
//! releases the circuit and records the outcome. Unavailable countries are
//! skipped; any other failure stops the sweep.

use std::time::Duration;

use tracing::{debug, error, info, info_span, Instrument, Span};

use crate::catalog::{Country, CountryCatalog};
use crate::privacy::{
    Circuit, CircuitConfig, CircuitError, CircuitManager, UnavailableReason,
};
use crate::probe::{ProbeError, RankProbe};
use crate::report::{MeasurementReport, RankResult, ReportSink};

/// Default circuit acquisition bound.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// What to measure and where the SOCKS listener lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeasurementRequest {
    pub query: String,
    pub matcher: String,
    pub socks_host: String,
    pub socks_port: u16,
    pub connect_timeout: Duration,
}

impl MeasurementRequest {
    fn circuit_config(&self, country: Country) -> CircuitConfig {
        CircuitConfig {
            exit_country: country,
            socks_host: self.socks_host.clone(),
            socks_port: self.socks_port,
            connect_timeout: self.connect_timeout,
        }
    }
}

/// Why a country stopped the sweep.
#[derive(Debug, thiserror::Error)]
pub enum AbortCause {
    #[error(transparent)]
    Circuit(#[from] CircuitError),
    #[error(transparent)]
    Probe(#[from] ProbeError),
}

/// A sweep that stopped before the end of the catalog.
///
/// `partial` holds every country measured so far, ending with the failing
/// country's [`RankResult::Error`] entry.
#[derive(Debug, thiserror::Error)]
#[error("Measurement aborted at {country}: {cause}")]
pub struct MeasurementAborted {
    pub country: Country,
    #[source]
    pub cause: AbortCause,
    pub partial: MeasurementReport,
}

/// How one country ended.
enum Step {
    Recorded(RankResult),
    Fatal(AbortCause),
}

/// Drives circuits and a probe across the catalog.
pub struct MeasurementOrchestrator<C: CircuitManager> {
    circuits: C,
    probe: Box<dyn RankProbe>,
    catalog: CountryCatalog,
    span: Span,
}

impl<C: CircuitManager> MeasurementOrchestrator<C> {
    pub fn new(circuits: C, probe: Box<dyn RankProbe>, catalog: CountryCatalog) -> Self {
        Self {
            circuits,
            probe,
            catalog,
            span: info_span!("measurement"),
        }
    }

    /// Log under `span` instead of the default `measurement` span.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn circuits(&self) -> &C {
        &self.circuits
    }

    /// Measure every catalog country in order, then hand the report to `sink`.
    ///
    /// The sink is not called when the sweep aborts.
    pub async fn run(
        &self,
        request: &MeasurementRequest,
        sink: &mut dyn ReportSink,
    ) -> Result<MeasurementReport, MeasurementAborted> {
        let report = self.sweep(request).instrument(self.span.clone()).await?;

        debug!(parent: &self.span, "Results:\n{:#?}", report.entries());
        sink.render(&report);

        Ok(report)
    }

    async fn sweep(
        &self,
        request: &MeasurementRequest,
    ) -> Result<MeasurementReport, MeasurementAborted> {
        let mut report =
            MeasurementReport::new(self.probe.platform(), &request.query, &request.matcher);

        debug!("Using platform: {}", self.probe.platform());
        debug!("Using query: {}", request.query);
        debug!("Using matcher: {}", request.matcher);
        debug!("Using SOCKS proxy: {}:{}", request.socks_host, request.socks_port);

        let total = self.catalog.len();
        for (index, country) in self.catalog.iter().enumerate() {
            info!("Querying via {} [{}/{}]...", country, index + 1, total);

            let step = self
                .measure(request, *country)
                .instrument(info_span!("country", code = country.code))
                .await;

            match step {
                Step::Recorded(result) => {
                    report.record(*country, result);
                }
                Step::Fatal(cause) => {
                    error!("Failed to query via {}: {}", country, cause);
                    report.record(*country, RankResult::Error(cause.to_string()));
                    report.finish();
                    return Err(MeasurementAborted {
                        country: *country,
                        cause,
                        partial: report,
                    });
                }
            }
        }

        report.finish();
        info!(
            "Measured {} of {} countries ({} unavailable)",
            report.measured().count(),
            total,
            report.unavailable().count()
        );
        Ok(report)
    }

    /// Acquire, probe and release for one country.
    async fn measure(&self, request: &MeasurementRequest, country: Country) -> Step {
        let config = request.circuit_config(country);

        let circuit = match self.circuits.acquire(&config).await {
            Ok(circuit) => circuit,
            Err(CircuitError::Unavailable { reason, .. }) => {
                info!("No Tor exit in {} ({}), skipping...", country, reason);
                return Step::Recorded(RankResult::Unavailable(reason));
            }
            Err(e) => return Step::Fatal(e.into()),
        };

        let probed = self
            .probe
            .probe(circuit.endpoint(), &request.query, &request.matcher)
            .await;

        // Release before looking at the outcome so every path tears down
        self.circuits.release(circuit).await;

        match probed {
            Ok(rank) => {
                info!("{}: rank {}", country, rank.value());
                Step::Recorded(rank.into())
            }
            Err(e) if e.is_network() => {
                info!("Circuit via {} could not reach the platform ({}), skipping...", country, e);
                Step::Recorded(RankResult::Unavailable(UnavailableReason::CircuitUnusable))
            }
            Err(e) => Step::Fatal(e.into()),
        }
    }
}
