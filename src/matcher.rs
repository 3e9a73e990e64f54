use chrono::NaiveDate;

use crate::aggregate::GlobalIndex;
use crate::catalog::{ArchivePathPattern, Catalog};
use crate::domain::{LocationId, VariableName};
use crate::error::XferError;

/// Outcome of matching one (variable, date) pair against the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathMatch {
    /// Path that exists in the index, when one of the candidates does.
    pub path: Option<String>,
    /// First candidate, reported when nothing matched.
    pub expected: String,
    /// Locations holding `path`, first-seen first.
    pub locations: Vec<LocationId>,
}

impl PathMatch {
    pub fn is_found(&self) -> bool {
        self.path.is_some()
    }
}

pub struct Matcher<'a> {
    catalog: &'a Catalog,
    index: &'a GlobalIndex,
}

impl<'a> Matcher<'a> {
    pub fn new(catalog: &'a Catalog, index: &'a GlobalIndex) -> Self {
        Self { catalog, index }
    }

    pub fn match_variable(
        &self,
        variable: &VariableName,
        date: NaiveDate,
    ) -> Result<PathMatch, XferError> {
        let pattern = self
            .catalog
            .lookup(variable)
            .ok_or_else(|| XferError::UnknownVariable(variable.to_string()))?;
        Ok(self.match_pattern(&pattern, variable, date))
    }

    /// Tries every candidate convention in order; the first that exists in
    /// the index wins.
    pub fn match_pattern(
        &self,
        pattern: &ArchivePathPattern,
        variable: &VariableName,
        date: NaiveDate,
    ) -> PathMatch {
        let mut expected = None;
        for candidate in pattern.candidate_paths(variable, date) {
            if self.index.contains(&candidate) {
                let locations = self.index.locations_of(&candidate).to_vec();
                return PathMatch {
                    expected: expected.unwrap_or_else(|| candidate.clone()),
                    path: Some(candidate),
                    locations,
                };
            }
            expected.get_or_insert(candidate);
        }
        PathMatch {
            path: None,
            expected: expected.unwrap_or_default(),
            locations: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use assert_matches::assert_matches;

    use super::*;
    use crate::domain::Granularity;
    use crate::index::LocationIndex;

    fn index(listings: &[&str]) -> GlobalIndex {
        GlobalIndex::from_locations(
            listings
                .iter()
                .map(|text| LocationIndex::parse(text, None).unwrap().index),
        )
    }

    fn catalog() -> Catalog {
        let pattern = ArchivePathPattern::from_templates(
            Granularity::Monthly,
            &[
                "m05/{yyyy}/{mm}/{var}_{yyyy}_{mm}.grb".to_string(),
                "legacy/{var}{yyyy}{mm}.grb".to_string(),
            ],
            &BTreeMap::new(),
        )
        .unwrap();
        Catalog::new().with_entry("t2m".parse().unwrap(), pattern)
    }

    fn jan_1990() -> NaiveDate {
        NaiveDate::from_ymd_opt(1990, 1, 1).unwrap()
    }

    #[test]
    fn legacy_spelling_is_found() {
        let global = index(&["#!HOSTNAME=hostA\n#!MERAROOT=/a\nlegacy/t2m199001.grb\n"]);
        let catalog = catalog();
        let matcher = Matcher::new(&catalog, &global);
        let found = matcher
            .match_variable(&"t2m".parse().unwrap(), jan_1990())
            .unwrap();
        assert_eq!(found.path.as_deref(), Some("legacy/t2m199001.grb"));
        assert_eq!(found.expected, "m05/1990/01/t2m_1990_01.grb");
        assert_eq!(found.locations.len(), 1);
    }

    #[test]
    fn first_convention_wins_when_both_exist() {
        let global = index(&[
            "#!HOSTNAME=hostA\n#!MERAROOT=/a\nlegacy/t2m199001.grb\n",
            "#!HOSTNAME=hostB\n#!MERAROOT=/b\nm05/1990/01/t2m_1990_01.grb\n",
        ]);
        let catalog = catalog();
        let matcher = Matcher::new(&catalog, &global);
        let found = matcher
            .match_variable(&"t2m".parse().unwrap(), jan_1990())
            .unwrap();
        assert_eq!(found.path.as_deref(), Some("m05/1990/01/t2m_1990_01.grb"));
        assert_eq!(found.locations[0].as_str(), "hostB");
    }

    #[test]
    fn absent_path_is_not_an_error() {
        let global = index(&["#!HOSTNAME=hostA\n#!MERAROOT=/a\nother.grb\n"]);
        let catalog = catalog();
        let matcher = Matcher::new(&catalog, &global);
        let missing = matcher
            .match_variable(&"t2m".parse().unwrap(), jan_1990())
            .unwrap();
        assert!(!missing.is_found());
        assert!(missing.locations.is_empty());
        assert_eq!(missing.expected, "m05/1990/01/t2m_1990_01.grb");
    }

    #[test]
    fn unknown_variable_is_distinct() {
        let global = GlobalIndex::new();
        let catalog = catalog();
        let matcher = Matcher::new(&catalog, &global);
        let err = matcher
            .match_variable(&"tp".parse().unwrap(), jan_1990())
            .unwrap_err();
        assert_matches!(err, XferError::UnknownVariable(name) if name == "tp");
    }
}
