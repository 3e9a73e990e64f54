//! Per-location file listings.
//!
//! A listing starts with `#!KEY=VALUE` directives (`HOSTNAME`, `MERAROOT`,
//! optionally `LOCATION`) followed by one archive-relative path per line.
//! Blank lines and `#` comments are ignored anywhere.

use std::collections::BTreeSet;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::{debug, warn};

use crate::domain::LocationId;
use crate::error::XferError;

const DIRECTIVE_MARKER: &str = "#!";
const COMMENT_MARKER: char = '#';
const LISTING_PREFIX: &str = "merafiles_";

/// Files known to exist at one storage location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationIndex {
    id: LocationId,
    hostname: String,
    root_path: String,
    paths: BTreeSet<String>,
}

impl LocationIndex {
    pub fn id(&self) -> &LocationId {
        &self.id
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn root_path(&self) -> &str {
        &self.root_path
    }

    pub fn paths(&self) -> &BTreeSet<String> {
        &self.paths
    }

    pub fn contains(&self, path: &str) -> bool {
        self.paths.contains(path)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Absolute path of an archive file on the location's host.
    pub fn remote_path(&self, relative: &str) -> String {
        format!(
            "{}/{}",
            self.root_path.trim_end_matches('/'),
            relative.trim_start_matches('/')
        )
    }

    pub(crate) fn absorb(&mut self, other: LocationIndex) {
        self.paths.extend(other.paths);
    }

    /// Serializes the index back into the listing format.
    pub fn to_listing(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("{DIRECTIVE_MARKER}LOCATION={}\n", self.id));
        out.push_str(&format!("{DIRECTIVE_MARKER}HOSTNAME={}\n", self.hostname));
        out.push_str(&format!("{DIRECTIVE_MARKER}MERAROOT={}\n", self.root_path));
        for path in &self.paths {
            out.push_str(path);
            out.push('\n');
        }
        out
    }

    /// Parses one listing.
    ///
    /// `fallback_id` names the location when the listing carries no
    /// `LOCATION` directive; without either, the hostname is used.
    pub fn parse(text: &str, fallback_id: Option<&str>) -> Result<ParsedIndex, XferError> {
        let label = error_label(text, fallback_id);
        let malformed = |reason: String| XferError::MalformedIndex {
            location: label.clone(),
            reason,
        };

        let mut hostname: Option<String> = None;
        let mut root_path: Option<String> = None;
        let mut explicit_id: Option<String> = None;
        let mut seen_directive = false;
        let mut seen_path = false;
        let mut paths = BTreeSet::new();
        let mut warnings = Vec::new();

        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }

            if let Some(body) = line.strip_prefix(DIRECTIVE_MARKER) {
                if seen_path {
                    return Err(malformed(format!(
                        "line {line_no}: directive after path entries"
                    )));
                }
                let (key, value) = body.split_once('=').ok_or_else(|| {
                    malformed(format!("line {line_no}: directive without '='"))
                })?;
                let key = key.trim().to_ascii_uppercase();
                let value = value.trim();
                if value.is_empty() {
                    return Err(malformed(format!("line {line_no}: empty {key} directive")));
                }
                match key.as_str() {
                    "HOSTNAME" => hostname = Some(value.to_string()),
                    "MERAROOT" => root_path = Some(value.to_string()),
                    "LOCATION" => explicit_id = Some(value.to_string()),
                    other => debug!(directive = other, "ignoring unknown index directive"),
                }
                seen_directive = true;
                continue;
            }

            if line.starts_with(COMMENT_MARKER) {
                continue;
            }

            if !seen_directive {
                return Err(malformed(format!(
                    "line {line_no}: path entry before any directive"
                )));
            }
            seen_path = true;

            let path = normalize_path(line);
            if !paths.insert(path.clone()) {
                warn!(location = %label, path = %path, line = line_no, "duplicate path in index");
                warnings.push(IndexWarning::DuplicatePath {
                    location: label.clone(),
                    path,
                    line: line_no,
                });
            }
        }

        let hostname =
            hostname.ok_or_else(|| malformed("missing HOSTNAME directive".to_string()))?;
        let root_path =
            root_path.ok_or_else(|| malformed("missing MERAROOT directive".to_string()))?;
        let id = explicit_id
            .as_deref()
            .or(fallback_id)
            .unwrap_or(hostname.as_str())
            .parse::<LocationId>()
            .map_err(|err| malformed(err.to_string()))?;

        Ok(ParsedIndex {
            index: LocationIndex {
                id,
                hostname,
                root_path,
                paths,
            },
            warnings,
        })
    }

    /// Parses a concatenation of listings, such as an `allmerafiles.txt`
    /// export, splitting at every directive that follows a path entry.
    /// Each chunk succeeds or fails on its own.
    pub fn parse_concatenated(
        text: &str,
        fallback_id: Option<&str>,
    ) -> Vec<Result<ParsedIndex, XferError>> {
        let chunks = split_listings(text);
        let single = chunks.len() == 1;
        let mut roots: Vec<(LocationId, String)> = Vec::with_capacity(chunks.len());
        let mut parsed = Vec::with_capacity(chunks.len());
        for (position, chunk) in chunks.iter().enumerate() {
            let fallback = if single { fallback_id } else { None };
            let mut entry = match Self::parse(chunk, fallback) {
                Ok(entry) => entry,
                Err(err) => {
                    parsed.push(Err(err));
                    continue;
                }
            };
            let clash = roots
                .iter()
                .any(|(id, root)| *id == entry.index.id && *root != entry.index.root_path);
            if clash {
                let renamed = match format!("{}-{}", entry.index.id, position + 1)
                    .parse::<LocationId>()
                {
                    Ok(renamed) => renamed,
                    Err(err) => {
                        parsed.push(Err(err));
                        continue;
                    }
                };
                warn!(
                    location = %entry.index.id,
                    renamed = %renamed,
                    "listing reuses a location id with a different root"
                );
                entry.index.id = renamed;
            }
            roots.push((entry.index.id.clone(), entry.index.root_path.clone()));
            parsed.push(Ok(entry));
        }
        parsed
    }
}

/// A parsed listing plus the non-fatal problems found in it.
#[derive(Debug, Clone)]
pub struct ParsedIndex {
    pub index: LocationIndex,
    pub warnings: Vec<IndexWarning>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IndexWarning {
    DuplicatePath {
        location: String,
        path: String,
        line: usize,
    },
}

/// Result of loading several listing files.
#[derive(Debug, Default)]
pub struct IndexLoad {
    pub indices: Vec<LocationIndex>,
    pub warnings: Vec<IndexWarning>,
    /// Listings that failed to parse; other locations still load.
    pub rejected: Vec<XferError>,
}

impl IndexLoad {
    fn merge(&mut self, other: IndexLoad) {
        self.indices.extend(other.indices);
        self.warnings.extend(other.warnings);
        self.rejected.extend(other.rejected);
    }
}

pub struct IndexLoader;

impl IndexLoader {
    /// Loads one listing file. An unreadable file or a malformed chunk is
    /// recorded in `rejected`; the other chunks of the file still load.
    pub fn load_file(path: &Utf8Path) -> IndexLoad {
        let mut load = IndexLoad::default();
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(_) => {
                let err = XferError::IndexRead(path.as_std_path().to_path_buf());
                warn!(file = %path, error = %err, "skipping index");
                load.rejected.push(err);
                return load;
            }
        };
        let fallback = listing_location(path);
        for entry in LocationIndex::parse_concatenated(&content, fallback.as_deref()) {
            match entry {
                Ok(entry) => {
                    debug!(
                        location = %entry.index.id(),
                        files = entry.index.len(),
                        "loaded index"
                    );
                    load.warnings.extend(entry.warnings);
                    load.indices.push(entry.index);
                }
                Err(err) => {
                    warn!(file = %path, error = %err, "skipping listing");
                    load.rejected.push(err);
                }
            }
        }
        load
    }

    /// Loads every listing, keeping going past malformed ones.
    pub fn load_files(paths: &[Utf8PathBuf]) -> IndexLoad {
        let mut load = IndexLoad::default();
        for path in paths {
            load.merge(Self::load_file(path));
        }
        load
    }

    /// Listing files (`merafiles_*.txt`) of an index directory, sorted by name.
    pub fn discover(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, XferError> {
        let entries = fs::read_dir(dir.as_std_path())
            .map_err(|_| XferError::IndexRead(dir.as_std_path().to_path_buf()))?;
        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| XferError::Filesystem(err.to_string()))?;
            let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) else {
                continue;
            };
            let is_listing = path
                .file_name()
                .map(|name| name.starts_with(LISTING_PREFIX) && name.ends_with(".txt"))
                .unwrap_or(false);
            if is_listing && path.is_file() {
                files.push(path);
            }
        }
        if files.is_empty() {
            return Err(XferError::NoIndices(dir.as_std_path().to_path_buf()));
        }
        files.sort();
        Ok(files)
    }
}

/// Location id implied by a listing file name: `merafiles_reaext03.txt` → `reaext03`.
pub fn listing_location(path: &Utf8Path) -> Option<String> {
    let stem = path.file_stem()?;
    let id = stem.strip_prefix(LISTING_PREFIX).unwrap_or(stem);
    (!id.is_empty()).then(|| id.to_string())
}

/// Name used in errors about a listing: its `LOCATION`, the file-derived id
/// or its `HOSTNAME`, whichever is known first.
fn error_label(text: &str, fallback_id: Option<&str>) -> String {
    let directive = |wanted: &str| {
        text.lines()
            .filter_map(|line| line.trim().strip_prefix(DIRECTIVE_MARKER))
            .filter_map(|body| body.split_once('='))
            .map(|(key, value)| (key.trim(), value.trim()))
            .find(|(key, value)| key.eq_ignore_ascii_case(wanted) && !value.is_empty())
            .map(|(_, value)| value.to_string())
    };
    directive("LOCATION")
        .or_else(|| fallback_id.map(str::to_string))
        .or_else(|| directive("HOSTNAME"))
        .unwrap_or_else(|| "<unnamed>".to_string())
}

fn normalize_path(line: &str) -> String {
    let mut path = line.trim();
    while let Some(rest) = path.strip_prefix("./") {
        path = rest;
    }
    path.to_string()
}

fn split_listings(text: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut has_paths = false;
    for line in text.lines() {
        let trimmed = line.trim();
        let is_directive = trimmed.starts_with(DIRECTIVE_MARKER);
        if is_directive && has_paths {
            chunks.push(std::mem::take(&mut current));
            has_paths = false;
        }
        if !is_directive && !trimmed.is_empty() && !trimmed.starts_with(COMMENT_MARKER) {
            has_paths = true;
        }
        current.push_str(line);
        current.push('\n');
    }
    if !current.trim().is_empty() || chunks.is_empty() {
        chunks.push(current);
    }
    chunks
}
