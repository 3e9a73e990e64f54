use std::io::{self, Write};

use serde::Serialize;

use crate::app::{BatchResult, FetchResult, LocationsResult, ProgressEvent, ProgressSink};
use crate::resolver::{AvailabilityReport, ReportSummary, VariableStatus};
use crate::transfer::{FileState, TransferOutcome};

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Text,
    Json,
}

pub struct JsonOutput;

#[derive(Serialize)]
struct LocateOutput<'a> {
    #[serde(flatten)]
    report: &'a AvailabilityReport,
    summary: ReportSummary,
}

impl JsonOutput {
    pub fn print_locations(result: &LocationsResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_report(report: &AvailabilityReport) -> io::Result<()> {
        Self::print_json(&LocateOutput {
            report,
            summary: report.summary(),
        })
    }

    pub fn print_fetch(result: &FetchResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Plain-text tables on stdout; per-file progress on stderr.
pub struct TextOutput;

impl TextOutput {
    pub fn print_locations(result: &LocationsResult) -> io::Result<()> {
        let mut out = io::stdout().lock();
        writeln!(out, "{:<16} {:<24} {:>8}  ROOT", "LOCATION", "HOST", "FILES")?;
        for entry in &result.locations {
            writeln!(
                out,
                "{:<16} {:<24} {:>8}  {}",
                entry.id, entry.host, entry.files, entry.root
            )?;
        }
        Ok(())
    }

    pub fn print_report(report: &AvailabilityReport) -> io::Result<()> {
        let mut out = io::stdout().lock();
        for variable in &report.variables {
            match &variable.status {
                VariableStatus::Unknown => {
                    writeln!(out, "{}  unknown variable", variable.variable)?;
                }
                VariableStatus::Resolved { dates, .. } => {
                    for date in dates {
                        let locations = date
                            .locations
                            .iter()
                            .map(|id| id.as_str())
                            .collect::<Vec<_>>()
                            .join(",");
                        match &date.path {
                            Some(path) => writeln!(
                                out,
                                "{}  {}  {}  {}",
                                variable.variable, date.date, path, locations
                            )?,
                            None => writeln!(
                                out,
                                "{}  {}  not found (expected {})",
                                variable.variable, date.date, date.expected
                            )?,
                        }
                    }
                }
            }
        }
        writeln!(out)?;
        write_summary(&mut out, &report.summary())
    }

    pub fn print_fetch(result: &FetchResult) -> io::Result<()> {
        let mut out = io::stdout().lock();
        for variable in &result.unknown_variables {
            writeln!(out, "unknown variable: {variable}")?;
        }
        for variable in &result.missing_variables {
            writeln!(out, "not archived in range: {variable}")?;
        }
        for batch in &result.batches {
            match batch {
                BatchResult::Planned {
                    location,
                    host,
                    files,
                } => {
                    writeln!(out, "# {location} ({host}), dry run")?;
                    for file in files {
                        let action = if file.present { "skip" } else { "copy" };
                        writeln!(out, "{action}  {}  <- {}", file.path, file.remote_path)?;
                    }
                }
                BatchResult::Completed(summary) => {
                    writeln!(out, "# {} ({})", summary.location, summary.host)?;
                    for file in &summary.files {
                        match &file.outcome {
                            TransferOutcome::Copied => writeln!(out, "done     {}", file.path)?,
                            TransferOutcome::Skipped => writeln!(out, "skipped  {}", file.path)?,
                            TransferOutcome::Failed { reason } => {
                                writeln!(out, "failed   {}  {reason}", file.path)?
                            }
                        }
                    }
                    writeln!(
                        out,
                        "copied {}, skipped {}, failed {}",
                        summary.copied(),
                        summary.skipped(),
                        summary.failed()
                    )?;
                }
                BatchResult::Unreachable {
                    location,
                    host,
                    reason,
                    settled,
                    untried,
                } => {
                    writeln!(
                        out,
                        "# {location} ({host}) unreachable, {untried} file(s) not tried"
                    )?;
                    writeln!(out, "  {reason}")?;
                    for file in settled {
                        match &file.outcome {
                            TransferOutcome::Failed { reason } => {
                                writeln!(out, "failed   {}  {reason}", file.path)?
                            }
                            _ => writeln!(out, "skipped  {}", file.path)?,
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

fn write_summary(out: &mut impl Write, summary: &ReportSummary) -> io::Result<()> {
    writeln!(out, "{:<16} {:<44} {:>8}", "VAR.CODE", "VARIABLE", "FILES")?;
    for variable in &summary.variables {
        let code = variable.grib1.as_deref().unwrap_or("-");
        if variable.known {
            let counts = format!("{}/{}", variable.found, variable.expected);
            writeln!(out, "{code:<16} {:<44} {counts:>8}", variable.variable)?;
        } else {
            writeln!(out, "{code:<16} {:<44} {:>8}", variable.variable, "unknown")?;
        }
    }
    writeln!(out, "{} of {} files found", summary.found, summary.expected)?;

    if !summary.missing_variables.is_empty() {
        writeln!(out, "{} variable(s) missing:", summary.missing_variables.len())?;
        for variable in &summary.missing_variables {
            writeln!(out, "  {variable}")?;
        }
    }
    if !summary.unknown_variables.is_empty() {
        writeln!(out, "{} variable(s) unknown:", summary.unknown_variables.len())?;
        for variable in &summary.unknown_variables {
            writeln!(out, "  {variable}")?;
        }
    }

    if summary.coverage.is_empty() {
        return Ok(());
    }
    writeln!(out)?;
    writeln!(out, "found/expected dates per month")?;
    write!(out, "{:<5}|", "")?;
    for month in 1..=12 {
        write!(out, " {month:>7}")?;
    }
    writeln!(out)?;
    writeln!(out, "-----+{}", "-".repeat(12 * 8))?;
    for row in &summary.coverage {
        write!(out, "{:<5}|", row.year)?;
        for (found, expected) in row.found.iter().zip(&row.expected) {
            if *expected == 0 {
                write!(out, " {:>7}", "")?;
            } else {
                write!(out, " {:>7}", format!("{found}/{expected}"))?;
            }
        }
        writeln!(out)?;
    }
    Ok(())
}

impl ProgressSink for TextOutput {
    fn event(&self, event: ProgressEvent) {
        let finished = matches!(
            event.state,
            Some(FileState::Done | FileState::Failed | FileState::Skipped)
        );
        if !finished {
            return;
        }
        let (Some(state), Some(path)) = (event.state, event.path) else {
            return;
        };
        let elapsed = event
            .elapsed
            .map(|elapsed| format!(" [{:.1}s]", elapsed.as_secs_f64()))
            .unwrap_or_default();
        eprintln!("{state:<8} {path}{elapsed}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::{MonthCoverage, VariableSummary};

    #[test]
    fn summary_lists_codes_missing_variables_and_months() {
        let mut found = [0; 12];
        let mut expected = [0; 12];
        found[0] = 1;
        expected[0] = 2;
        let summary = ReportSummary {
            variables: vec![
                VariableSummary {
                    variable: "air_temperature_at_2_metres".parse().unwrap(),
                    grib1: Some("11_105_2_0".to_string()),
                    known: true,
                    found: 1,
                    expected: 2,
                },
                VariableSummary {
                    variable: "snow".parse().unwrap(),
                    grib1: None,
                    known: true,
                    found: 0,
                    expected: 2,
                },
            ],
            unknown_variables: Vec::new(),
            missing_variables: vec!["snow".parse().unwrap()],
            found: 1,
            expected: 4,
            coverage: vec![MonthCoverage {
                year: 1990,
                found,
                expected,
            }],
        };

        let mut buf = Vec::new();
        write_summary(&mut buf, &summary).unwrap();
        let text = String::from_utf8(buf).unwrap();

        assert!(text.contains("11_105_2_0"));
        assert!(text.contains("1 of 4 files found"));
        assert!(text.contains("1 variable(s) missing:\n  snow\n"));
        assert!(text.lines().any(|line| line.starts_with("1990 |") && line.contains("1/2")));
    }
}
