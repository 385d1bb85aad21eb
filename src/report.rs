//! Measurement reports and the sinks that present them.

use std::fmt;
use std::io::{self, Write};
use std::num::NonZeroUsize;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use console::style;
use serde::Serialize;
use tracing::{info, warn};

use crate::catalog::Country;
use crate::privacy::UnavailableReason;
use crate::probe::{Platform, Rank};

/// Outcome recorded for one country.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum RankResult {
    /// Matcher found at this 1-based position.
    Rank(NonZeroUsize),
    /// Matcher absent from the results.
    NotFound,
    /// Country skipped: no usable exit.
    Unavailable(UnavailableReason),
    /// The run aborted while measuring this country.
    Error(String),
}

impl RankResult {
    /// Numeric rank as plotted: position, or 0 when not found.
    pub fn rank(&self) -> Option<usize> {
        match self {
            RankResult::Rank(position) => Some(position.get()),
            RankResult::NotFound => Some(0),
            RankResult::Unavailable(_) | RankResult::Error(_) => None,
        }
    }

    pub fn is_measured(&self) -> bool {
        self.rank().is_some()
    }
}

impl From<Rank> for RankResult {
    fn from(rank: Rank) -> Self {
        match rank {
            Rank::Found(position) => RankResult::Rank(position),
            Rank::NotFound => RankResult::NotFound,
        }
    }
}

impl fmt::Display for RankResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RankResult::Rank(position) => write!(f, "#{}", position),
            RankResult::NotFound => write!(f, "not found"),
            RankResult::Unavailable(reason) => write!(f, "unavailable ({})", reason),
            RankResult::Error(detail) => write!(f, "error: {}", detail),
        }
    }
}

/// One row of a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportEntry {
    pub country: Country,
    pub result: RankResult,
}

/// Country → result mapping in catalog order.
#[derive(Debug, Clone, Serialize)]
pub struct MeasurementReport {
    pub platform: Platform,
    pub query: String,
    pub matcher: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    entries: Vec<ReportEntry>,
}

impl MeasurementReport {
    pub fn new(platform: Platform, query: impl Into<String>, matcher: impl Into<String>) -> Self {
        Self {
            platform,
            query: query.into(),
            matcher: matcher.into(),
            started_at: Utc::now(),
            finished_at: None,
            entries: Vec::new(),
        }
    }

    /// Append a result. A country already present is left untouched and
    /// `false` is returned.
    pub(crate) fn record(&mut self, country: Country, result: RankResult) -> bool {
        if self.get(country.code).is_some() {
            return false;
        }
        self.entries.push(ReportEntry { country, result });
        true
    }

    pub(crate) fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn entries(&self) -> &[ReportEntry] {
        &self.entries
    }

    /// Result for a country code (case-insensitive).
    pub fn get(&self, code: &str) -> Option<&RankResult> {
        self.entries
            .iter()
            .find(|e| e.country.code.eq_ignore_ascii_case(code))
            .map(|e| &e.result)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Countries that produced a rank or a confirmed absence.
    pub fn measured(&self) -> impl Iterator<Item = &ReportEntry> {
        self.entries.iter().filter(|e| e.result.is_measured())
    }

    /// Countries skipped for lack of a usable exit.
    pub fn unavailable(&self) -> impl Iterator<Item = &ReportEntry> {
        self.entries
            .iter()
            .filter(|e| matches!(e.result, RankResult::Unavailable(_)))
    }
}

/// Consumes a finished report. Rendering problems stay inside the sink.
pub trait ReportSink {
    fn render(&mut self, report: &MeasurementReport);
}

impl ReportSink for Vec<Box<dyn ReportSink>> {
    fn render(&mut self, report: &MeasurementReport) {
        for sink in self.iter_mut() {
            sink.render(report);
        }
    }
}

/// Width of the longest bar in characters.
const BAR_WIDTH: usize = 40;

/// Horizontal bar chart of ranks, one row per measured country.
pub struct TerminalChart<W: Write = io::Stdout> {
    out: W,
}

impl TerminalChart {
    pub fn stdout() -> Self {
        Self { out: io::stdout() }
    }
}

impl<W: Write> TerminalChart<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn draw(&mut self, report: &MeasurementReport) -> io::Result<()> {
        writeln!(
            self.out,
            "{} rank of {} for {:?}",
            style(report.platform).bold(),
            style(&report.matcher).cyan(),
            report.query
        )?;

        let max_rank = report
            .measured()
            .filter_map(|e| e.result.rank())
            .max()
            .unwrap_or(0);
        let name_width = report
            .measured()
            .map(|e| e.country.name.chars().count())
            .max()
            .unwrap_or(0);

        for entry in report.measured() {
            let name = format!("{:<width$}", entry.country.name, width = name_width);
            match entry.result {
                RankResult::Rank(position) => {
                    let len = (position.get() * BAR_WIDTH).div_ceil(max_rank.max(1));
                    writeln!(
                        self.out,
                        "{} {} {} {}",
                        entry.country.code,
                        name,
                        style("█".repeat(len)).green(),
                        position
                    )?;
                }
                _ => {
                    writeln!(
                        self.out,
                        "{} {} {}",
                        entry.country.code,
                        name,
                        style("not found").dim()
                    )?;
                }
            }
        }

        let skipped: Vec<&str> = report.unavailable().map(|e| e.country.code).collect();
        if !skipped.is_empty() {
            writeln!(
                self.out,
                "{}",
                style(format!(
                    "{} unavailable: {}",
                    skipped.len(),
                    skipped.join(", ")
                ))
                .dim()
            )?;
        }

        self.out.flush()
    }
}

impl<W: Write> ReportSink for TerminalChart<W> {
    fn render(&mut self, report: &MeasurementReport) {
        if let Err(e) = self.draw(report) {
            warn!("Failed to draw rank chart: {}", e);
        }
    }
}

/// Writes the report as pretty-printed JSON.
pub struct JsonExport {
    path: PathBuf,
}

impl JsonExport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn write(&self, report: &MeasurementReport) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(report)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&self.path, json)?;
        Ok(())
    }
}

impl ReportSink for JsonExport {
    fn render(&mut self, report: &MeasurementReport) {
        match self.write(report) {
            Ok(()) => info!("Report written to {}", self.path.display()),
            Err(e) => warn!("Failed to write report to {}: {}", self.path.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::lookup;

    fn rank(n: usize) -> RankResult {
        RankResult::Rank(NonZeroUsize::new(n).unwrap())
    }

    fn sample_report() -> MeasurementReport {
        let mut report = MeasurementReport::new(Platform::YouTube, "query", "/@matcher");
        report.record(lookup("BR").unwrap(), rank(3));
        report.record(lookup("DE").unwrap(), RankResult::NotFound);
        report.record(
            lookup("KP").unwrap(),
            RankResult::Unavailable(UnavailableReason::NoExitNode),
        );
        report.record(lookup("US").unwrap(), rank(6));
        report.finish();
        report
    }

    #[test]
    fn test_record_rejects_duplicates() {
        let mut report = MeasurementReport::new(Platform::YouTube, "q", "m");
        let us = lookup("US").unwrap();
        assert!(report.record(us, rank(1)));
        assert!(!report.record(us, RankResult::NotFound));
        assert_eq!(report.len(), 1);
        assert_eq!(report.get("us"), Some(&rank(1)));
    }

    #[test]
    fn test_rank_values() {
        assert_eq!(rank(4).rank(), Some(4));
        assert_eq!(RankResult::NotFound.rank(), Some(0));
        assert_eq!(
            RankResult::Unavailable(UnavailableReason::BootstrapTimeout).rank(),
            None
        );
        assert_eq!(RankResult::from(Rank::NotFound), RankResult::NotFound);
    }

    #[test]
    fn test_chart_lists_measured_and_summarizes_unavailable() {
        let mut chart = TerminalChart::new(Vec::new());
        chart.render(&sample_report());
        let output = console::strip_ansi_codes(&String::from_utf8(chart.into_inner()).unwrap())
            .to_string();

        let lines: Vec<&str> = output.lines().collect();
        assert!(lines[0].contains("youtube rank of /@matcher"));
        assert!(lines[1].starts_with("BR Brazil"));
        assert!(lines[1].ends_with(" 3"));
        assert!(lines[2].starts_with("DE Germany"));
        assert!(lines[2].contains("not found"));
        assert!(lines[3].starts_with("US United States of America"));
        assert!(lines[4].contains("1 unavailable: KP"));

        // Longest bar belongs to the worst rank
        let bar = |line: &str| line.matches('█').count();
        assert_eq!(bar(lines[3]), BAR_WIDTH);
        assert_eq!(bar(lines[1]), BAR_WIDTH / 2);
    }

    #[test]
    fn test_json_export_round_trips_statuses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("report.json");

        JsonExport::new(&path).render(&sample_report());

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let entries = value["entries"].as_array().unwrap();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0]["country"]["code"], "BR");
        assert_eq!(entries[0]["result"]["status"], "rank");
        assert_eq!(entries[0]["result"]["detail"], 3);
        assert_eq!(entries[1]["result"]["status"], "not_found");
        assert_eq!(entries[2]["result"]["detail"], "no_exit_node");
        assert_eq!(value["platform"], "youtube");
    }
}
