use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{Datelike, NaiveDate};
use serde::Serialize;
use tracing::{debug, info};

use crate::aggregate::GlobalIndex;
use crate::catalog::Catalog;
use crate::domain::{DateRange, Granularity, LocationId, VariableName, VariableRequest};
use crate::matcher::Matcher;
use crate::mera;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DateAvailability {
    pub date: NaiveDate,
    pub path: Option<String>,
    pub expected: String,
    pub locations: Vec<LocationId>,
    pub preferred: Option<LocationId>,
}

impl DateAvailability {
    pub fn is_found(&self) -> bool {
        self.path.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum VariableStatus {
    /// Not in the catalog: misspelled or unsupported, as opposed to absent
    /// from the archive.
    Unknown,
    Resolved {
        granularity: Granularity,
        dates: Vec<DateAvailability>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VariableReport {
    pub variable: VariableName,
    #[serde(flatten)]
    pub status: VariableStatus,
}

impl VariableReport {
    pub fn dates(&self) -> &[DateAvailability] {
        match &self.status {
            VariableStatus::Unknown => &[],
            VariableStatus::Resolved { dates, .. } => dates,
        }
    }

    pub fn found_count(&self) -> usize {
        self.dates().iter().filter(|date| date.is_found()).count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AvailabilityReport {
    pub range: DateRange,
    pub variables: Vec<VariableReport>,
}

impl AvailabilityReport {
    pub fn unknown_variables(&self) -> Vec<&VariableName> {
        self.variables
            .iter()
            .filter(|report| matches!(report.status, VariableStatus::Unknown))
            .map(|report| &report.variable)
            .collect()
    }

    /// Variables with no file at all in the range.
    pub fn missing_variables(&self) -> Vec<&VariableName> {
        self.variables
            .iter()
            .filter(|report| {
                matches!(report.status, VariableStatus::Resolved { .. })
                    && report.found_count() == 0
            })
            .map(|report| &report.variable)
            .collect()
    }

    /// Found paths held by `location`, in report order, without repeats.
    pub fn files_at(&self, location: &LocationId) -> Vec<String> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut files: Vec<String> = Vec::new();
        for date in self.variables.iter().flat_map(VariableReport::dates) {
            let Some(path) = &date.path else {
                continue;
            };
            if date.locations.contains(location) && seen.insert(path) {
                files.push(path.clone());
            }
        }
        files
    }

    /// Found paths grouped by their preferred location, groups ordered by
    /// first appearance.
    pub fn plan_by_preferred(&self) -> Vec<(LocationId, Vec<String>)> {
        let mut slots: HashMap<&LocationId, usize> = HashMap::new();
        let mut seen: HashSet<&str> = HashSet::new();
        let mut plan: Vec<(LocationId, Vec<String>)> = Vec::new();
        for date in self.variables.iter().flat_map(VariableReport::dates) {
            let (Some(path), Some(preferred)) = (&date.path, &date.preferred) else {
                continue;
            };
            // A path has one preferred location, so one set covers every group.
            if !seen.insert(path) {
                continue;
            }
            let slot = *slots.entry(preferred).or_insert_with(|| {
                plan.push((preferred.clone(), Vec::new()));
                plan.len() - 1
            });
            plan[slot].1.push(path.clone());
        }
        plan
    }

    pub fn found_count(&self) -> usize {
        self.variables.iter().map(VariableReport::found_count).sum()
    }

    pub fn expected_count(&self) -> usize {
        self.variables.iter().map(|report| report.dates().len()).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VariableSummary {
    pub variable: VariableName,
    /// `iop_itl_lev_tri` when the name follows the MERA convention.
    pub grib1: Option<String>,
    pub known: bool,
    pub found: usize,
    pub expected: usize,
}

/// Found and expected file dates for one year, January first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonthCoverage {
    pub year: i32,
    pub found: [usize; 12],
    pub expected: [usize; 12],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportSummary {
    pub variables: Vec<VariableSummary>,
    pub unknown_variables: Vec<VariableName>,
    pub missing_variables: Vec<VariableName>,
    pub found: usize,
    pub expected: usize,
    pub coverage: Vec<MonthCoverage>,
}

impl AvailabilityReport {
    /// Per-variable counts, the variables with nothing archived, and a
    /// year by month count of found dates across all variables.
    pub fn summary(&self) -> ReportSummary {
        let variables = self
            .variables
            .iter()
            .map(|report| VariableSummary {
                variable: report.variable.clone(),
                grib1: mera::grib1_id(report.variable.as_str()).map(|id| id.to_string()),
                known: !matches!(report.status, VariableStatus::Unknown),
                found: report.found_count(),
                expected: report.dates().len(),
            })
            .collect();

        let mut years: BTreeMap<i32, MonthCoverage> = BTreeMap::new();
        for date in self.variables.iter().flat_map(VariableReport::dates) {
            let year = date.date.year();
            let month = date.date.month0() as usize;
            let row = years.entry(year).or_insert_with(|| MonthCoverage {
                year,
                found: [0; 12],
                expected: [0; 12],
            });
            row.expected[month] += 1;
            if date.is_found() {
                row.found[month] += 1;
            }
        }

        ReportSummary {
            variables,
            unknown_variables: self.unknown_variables().into_iter().cloned().collect(),
            missing_variables: self.missing_variables().into_iter().cloned().collect(),
            found: self.found_count(),
            expected: self.expected_count(),
            coverage: years.into_values().collect(),
        }
    }
}

/// Drives the matcher over a variable list and a date range.
pub struct Resolver<'a> {
    catalog: &'a Catalog,
    index: &'a GlobalIndex,
}

impl<'a> Resolver<'a> {
    pub fn new(catalog: &'a Catalog, index: &'a GlobalIndex) -> Self {
        Self { catalog, index }
    }

    pub fn resolve(&self, request: &VariableRequest) -> AvailabilityReport {
        let matcher = Matcher::new(self.catalog, self.index);
        let mut variables = Vec::with_capacity(request.variables.len());

        for variable in &request.variables {
            let Some(pattern) = self.catalog.lookup(variable) else {
                debug!(variable = %variable, "variable not in catalog");
                variables.push(VariableReport {
                    variable: variable.clone(),
                    status: VariableStatus::Unknown,
                });
                continue;
            };

            let granularity = pattern.granularity();
            let dates = request
                .range
                .expand(granularity)
                .into_iter()
                .map(|date| {
                    let found = matcher.match_pattern(&pattern, variable, date);
                    DateAvailability {
                        date,
                        preferred: found.locations.first().cloned(),
                        path: found.path,
                        expected: found.expected,
                        locations: found.locations,
                    }
                })
                .collect::<Vec<_>>();

            debug!(
                variable = %variable,
                granularity = %granularity,
                found = dates.iter().filter(|date| date.is_found()).count(),
                expected = dates.len(),
                "resolved variable"
            );
            variables.push(VariableReport {
                variable: variable.clone(),
                status: VariableStatus::Resolved { granularity, dates },
            });
        }

        let report = AvailabilityReport {
            range: request.range,
            variables,
        };
        info!(
            found = report.found_count(),
            expected = report.expected_count(),
            unknown = report.unknown_variables().len(),
            "resolution finished"
        );
        report
    }
}
