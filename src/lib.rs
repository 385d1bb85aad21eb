//! crank - measure how a search ranking changes across Tor exit countries.
//!
//! For every country in the catalog crank starts a Tor client whose exits
//! are pinned to that country, runs a platform search through it, and
//! records where the matcher ranked. Countries without a usable exit are
//! skipped; anything else stops the run.

pub mod browser;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod orchestrator;
pub mod privacy;
pub mod probe;
pub mod report;

pub use catalog::{Country, CountryCatalog};
pub use orchestrator::{MeasurementAborted, MeasurementOrchestrator, MeasurementRequest};
pub use privacy::{CircuitConfig, CircuitError, CircuitManager, ProxyEndpoint};
pub use probe::{Platform, ProbeError, Rank, RankProbe};
pub use report::{MeasurementReport, RankResult, ReportSink};
