use std::collections::{BTreeMap, HashMap};

use crate::domain::LocationId;
use crate::index::LocationIndex;

/// Every known archive path mapped to the locations holding it, in the
/// order the locations were first added.
#[derive(Debug, Clone, Default)]
pub struct GlobalIndex {
    paths: BTreeMap<String, Vec<LocationId>>,
    locations: Vec<LocationIndex>,
    by_id: HashMap<LocationId, usize>,
}

impl GlobalIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_locations<I>(locations: I) -> Self
    where
        I: IntoIterator<Item = LocationIndex>,
    {
        let mut global = Self::new();
        for location in locations {
            global.add(location);
        }
        global
    }

    /// Adds one location. A location whose id is already present keeps its
    /// original slot in the preference order and absorbs the new paths.
    pub fn add(&mut self, location: LocationIndex) {
        let id = location.id().clone();
        for path in location.paths() {
            let holders = self.paths.entry(path.clone()).or_default();
            if !holders.contains(&id) {
                holders.push(id.clone());
            }
        }
        match self.by_id.get(&id) {
            Some(&slot) => self.locations[slot].absorb(location),
            None => {
                self.by_id.insert(id, self.locations.len());
                self.locations.push(location);
            }
        }
    }

    /// Locations holding `path`, first-seen first. Empty when unknown.
    pub fn locations_of(&self, path: &str) -> &[LocationId] {
        self.paths.get(path).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, path: &str) -> bool {
        self.paths.contains_key(path)
    }

    pub fn location(&self, id: &LocationId) -> Option<&LocationIndex> {
        self.by_id.get(id).map(|&slot| &self.locations[slot])
    }

    /// Contributing locations in discovery order.
    pub fn locations(&self) -> &[LocationIndex] {
        &self.locations
    }

    /// A view restricted to the single location `id`.
    pub fn only(&self, id: &LocationId) -> Option<GlobalIndex> {
        self.location(id)
            .map(|location| GlobalIndex::from_locations([location.clone()]))
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location(id: &str, paths: &[&str]) -> LocationIndex {
        let mut text = format!("#!LOCATION={id}\n#!HOSTNAME={id}.host\n#!MERAROOT=/{id}\n");
        for path in paths {
            text.push_str(path);
            text.push('\n');
        }
        LocationIndex::parse(&text, None).unwrap().index
    }

    #[test]
    fn shared_paths_keep_discovery_order() {
        let global = GlobalIndex::from_locations([
            location("b", &["x.grb", "y.grb"]),
            location("a", &["y.grb"]),
        ]);
        let holders: Vec<_> = global
            .locations_of("y.grb")
            .iter()
            .map(|id| id.as_str())
            .collect();
        assert_eq!(holders, vec!["b", "a"]);
        assert_eq!(global.locations_of("x.grb").len(), 1);
        assert!(global.locations_of("z.grb").is_empty());
    }

    #[test]
    fn empty_input_gives_empty_index() {
        let global = GlobalIndex::from_locations(Vec::new());
        assert!(global.is_empty());
        assert!(global.locations().is_empty());
    }

    #[test]
    fn restrict_to_one_location() {
        let global = GlobalIndex::from_locations([
            location("a", &["x.grb"]),
            location("b", &["x.grb", "y.grb"]),
        ]);
        let id = "b".parse().unwrap();
        let only_b = global.only(&id).unwrap();
        assert_eq!(only_b.locations().len(), 1);
        assert_eq!(only_b.locations_of("x.grb"), &[id]);
    }
}
