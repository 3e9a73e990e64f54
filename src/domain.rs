use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::XferError;

/// Identifier of one storage location (a drive or a remote account).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocationId(String);

impl LocationId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl FromStr for LocationId {
    type Err = XferError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim();
        let is_valid = !normalized.is_empty()
            && normalized
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'));
        if !is_valid {
            return Err(XferError::InvalidLocation(value.to_string()));
        }
        Ok(Self(normalized.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VariableName(String);

impl VariableName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VariableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl FromStr for VariableName {
    type Err = XferError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim();
        let is_valid = !normalized.is_empty()
            && !normalized
                .chars()
                .any(|ch| ch.is_whitespace() || matches!(ch, '/' | '{' | '}'));
        if !is_valid {
            return Err(XferError::InvalidVariable(value.to_string()));
        }
        Ok(Self(normalized.to_string()))
    }
}

/// Time resolution at which a variable's files are split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Daily,
    #[default]
    Monthly,
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Granularity::Daily => write!(f, "daily"),
            Granularity::Monthly => write!(f, "monthly"),
        }
    }
}

/// Inclusive range of calendar days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, XferError> {
        if end < start {
            return Err(XferError::InvalidDateRange(format!("{start}_{end}")));
        }
        Ok(Self { start, end })
    }

    /// Dates at which files of the given granularity exist within the range.
    ///
    /// Monthly files are keyed by the first day of every month the range
    /// touches; daily files by every day of the range, both ends included.
    pub fn expand(&self, granularity: Granularity) -> Vec<NaiveDate> {
        match granularity {
            Granularity::Daily => self
                .start
                .iter_days()
                .take_while(|day| *day <= self.end)
                .collect(),
            Granularity::Monthly => {
                let mut months = Vec::new();
                let mut cursor = first_of_month(self.start);
                while cursor <= self.end {
                    months.push(cursor);
                    match next_month(cursor) {
                        Some(next) => cursor = next,
                        None => break,
                    }
                }
                months
            }
        }
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.start, self.end)
    }
}

impl FromStr for DateRange {
    type Err = XferError;

    /// Accepts `START_END` or a single bound, each `YYYY-MM` or `YYYY-MM-DD`.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let (start, end) = match trimmed.split_once('_') {
            Some((start, end)) => (start, end),
            None => (trimmed, trimmed),
        };
        let invalid = || XferError::InvalidDateRange(value.to_string());
        let start = parse_bound(start, Bound::Start).ok_or_else(invalid)?;
        let end = parse_bound(end, Bound::End).ok_or_else(invalid)?;
        Self::new(start, end)
    }
}

#[derive(Clone, Copy)]
enum Bound {
    Start,
    End,
}

fn parse_bound(value: &str, bound: Bound) -> Option<NaiveDate> {
    let value = value.trim();
    if let Ok(day) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Some(day);
    }
    let (year, month) = value.split_once('-')?;
    if month.len() != 2 {
        return None;
    }
    let first = NaiveDate::from_ymd_opt(year.parse().ok()?, month.parse().ok()?, 1)?;
    match bound {
        Bound::Start => Some(first),
        Bound::End => next_month(first)?.pred_opt(),
    }
}

fn first_of_month(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

fn next_month(date: NaiveDate) -> Option<NaiveDate> {
    if date.month() == 12 {
        NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1)
    }
}

/// Variables to look up over one date range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableRequest {
    pub variables: Vec<VariableName>,
    pub range: DateRange,
}

impl VariableRequest {
    pub fn new(variables: Vec<VariableName>, range: DateRange) -> Self {
        Self { variables, range }
    }
}
