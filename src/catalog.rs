use std::borrow::Cow;
use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate};
use regex::Regex;

use crate::domain::{Granularity, VariableName};
use crate::error::XferError;
use crate::mera::MeraConvention;

const PLACEHOLDER: &str = r"\{([A-Za-z_][A-Za-z0-9_]*)\}";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Variable,
    Year,
    Month,
    Day,
}

/// One naming convention, e.g. `m05/{yyyy}/{mm}/{var}_{yyyy}_{mm}.grb`.
///
/// Entry-specific fields are substituted when the template is built, so
/// rendering only depends on the variable and the date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl PathTemplate {
    pub fn parse(template: &str, fields: &BTreeMap<String, String>) -> Result<Self, XferError> {
        let invalid = |reason: String| XferError::InvalidTemplate {
            template: template.to_string(),
            reason,
        };
        if template.trim().is_empty() {
            return Err(invalid("empty template".to_string()));
        }
        if template.starts_with('/') {
            return Err(invalid("template must be relative".to_string()));
        }
        let placeholder = Regex::new(PLACEHOLDER).map_err(|err| invalid(err.to_string()))?;

        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut cursor = 0;
        for caps in placeholder.captures_iter(template) {
            let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let chunk = &template[cursor..whole.start()];
            if chunk.contains(['{', '}']) {
                return Err(invalid("unbalanced braces".to_string()));
            }
            literal.push_str(chunk);
            cursor = whole.end();
            let segment = match name.as_str() {
                "var" => Segment::Variable,
                "yyyy" => Segment::Year,
                "mm" => Segment::Month,
                "dd" => Segment::Day,
                other => match fields.get(other) {
                    Some(value) => {
                        literal.push_str(value);
                        continue;
                    }
                    None => return Err(invalid(format!("unknown placeholder {{{other}}}"))),
                },
            };
            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            segments.push(segment);
        }
        let tail = &template[cursor..];
        if tail.contains(['{', '}']) {
            return Err(invalid("unbalanced braces".to_string()));
        }
        literal.push_str(tail);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            source: template.to_string(),
            segments,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn uses_day(&self) -> bool {
        self.segments.contains(&Segment::Day)
    }

    pub fn render(&self, variable: &VariableName, date: NaiveDate) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Variable => out.push_str(variable.as_str()),
                Segment::Year => out.push_str(&format!("{:04}", date.year())),
                Segment::Month => out.push_str(&format!("{:02}", date.month())),
                Segment::Day => out.push_str(&format!("{:02}", date.day())),
            }
        }
        out
    }
}

/// How the archive names the files of one variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivePathPattern {
    granularity: Granularity,
    candidates: Vec<PathTemplate>,
}

impl ArchivePathPattern {
    /// `candidates` are tried in order; the first one is the current
    /// convention, later ones are legacy spellings.
    pub fn new(granularity: Granularity, candidates: Vec<PathTemplate>) -> Result<Self, XferError> {
        if candidates.is_empty() {
            return Err(XferError::InvalidConfig(
                "naming pattern needs at least one template".to_string(),
            ));
        }
        if granularity == Granularity::Monthly {
            if let Some(daily) = candidates.iter().find(|template| template.uses_day()) {
                return Err(XferError::InvalidTemplate {
                    template: daily.source().to_string(),
                    reason: "{dd} in a monthly pattern".to_string(),
                });
            }
        }
        Ok(Self {
            granularity,
            candidates,
        })
    }

    pub fn from_templates(
        granularity: Granularity,
        templates: &[String],
        fields: &BTreeMap<String, String>,
    ) -> Result<Self, XferError> {
        let candidates = templates
            .iter()
            .map(|template| PathTemplate::parse(template, fields))
            .collect::<Result<Vec<_>, XferError>>()?;
        Self::new(granularity, candidates)
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    pub fn templates(&self) -> &[PathTemplate] {
        &self.candidates
    }

    /// Candidate relative paths for one date, in preference order.
    pub fn candidate_paths<'a>(
        &'a self,
        variable: &'a VariableName,
        date: NaiveDate,
    ) -> impl Iterator<Item = String> + 'a {
        self.candidates
            .iter()
            .map(move |template| template.render(variable, date))
    }
}

/// Read-only variable catalog handed to the matcher and resolver.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    entries: BTreeMap<VariableName, ArchivePathPattern>,
    mera: Option<MeraConvention>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(mut self, variable: VariableName, pattern: ArchivePathPattern) -> Self {
        self.insert(variable, pattern);
        self
    }

    pub fn with_mera(mut self, convention: MeraConvention) -> Self {
        self.mera = Some(convention);
        self
    }

    pub fn insert(&mut self, variable: VariableName, pattern: ArchivePathPattern) {
        self.entries.insert(variable, pattern);
    }

    /// Explicit entries win over the built-in MERA convention.
    pub fn lookup(&self, variable: &VariableName) -> Option<Cow<'_, ArchivePathPattern>> {
        if let Some(pattern) = self.entries.get(variable) {
            return Some(Cow::Borrowed(pattern));
        }
        self.mera
            .as_ref()
            .and_then(|mera| mera.pattern_for(variable))
            .map(Cow::Owned)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.mera.is_none()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn render_monthly_template() {
        let template =
            PathTemplate::parse("m05/{yyyy}/{mm}/{var}_{yyyy}_{mm}.grb", &BTreeMap::new())
                .unwrap();
        let var: VariableName = "t2m".parse().unwrap();
        assert_eq!(
            template.render(&var, date(1990, 1, 1)),
            "m05/1990/01/t2m_1990_01.grb"
        );
    }

    #[test]
    fn fields_are_substituted() {
        let fields = BTreeMap::from([("stream".to_string(), "ANALYSIS".to_string())]);
        let template = PathTemplate::parse("{var}_{yyyy}{mm}{dd}_{stream}", &fields).unwrap();
        let var: VariableName = "tp".parse().unwrap();
        assert_eq!(template.render(&var, date(2000, 2, 9)), "tp_20000209_ANALYSIS");
        assert!(template.uses_day());
    }

    #[test]
    fn unknown_placeholder_rejected() {
        let err = PathTemplate::parse("{var}_{level}", &BTreeMap::new()).unwrap_err();
        assert_matches!(err, XferError::InvalidTemplate { reason, .. } if reason.contains("level"));
    }

    #[test]
    fn unbalanced_brace_rejected() {
        let err = PathTemplate::parse("{var}_{yyyy", &BTreeMap::new()).unwrap_err();
        assert_matches!(err, XferError::InvalidTemplate { .. });
    }

    #[test]
    fn monthly_pattern_rejects_day_placeholder() {
        let err = ArchivePathPattern::from_templates(
            Granularity::Monthly,
            &["{var}_{yyyy}{mm}{dd}".to_string()],
            &BTreeMap::new(),
        )
        .unwrap_err();
        assert_matches!(err, XferError::InvalidTemplate { .. });
    }

    #[test]
    fn candidates_keep_listed_order() {
        let pattern = ArchivePathPattern::from_templates(
            Granularity::Monthly,
            &["new/{var}_{yyyy}{mm}".to_string(), "old/{var}{yyyy}{mm}".to_string()],
            &BTreeMap::new(),
        )
        .unwrap();
        let var: VariableName = "t2m".parse().unwrap();
        let paths: Vec<_> = pattern.candidate_paths(&var, date(1990, 5, 1)).collect();
        assert_eq!(paths, vec!["new/t2m_199005", "old/t2m199005"]);
    }
}
