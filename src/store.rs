use std::fs;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use tempfile::{Builder, NamedTempFile};

use crate::error::{FetchError, XferError};

/// Local mirror of the archive: `<root>/<relative path from the index>`.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: Utf8PathBuf,
}

impl LocalStore {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    /// `<user data dir>/mera-xfer/archive`.
    pub fn default_root() -> Result<Utf8PathBuf, XferError> {
        BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(dirs.data_dir().join("mera-xfer").join("archive")).ok()
            })
            .ok_or_else(|| XferError::Filesystem("unable to resolve data directory".to_string()))
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Local destination of an archive-relative path. Absolute paths and
    /// `..` components are refused so nothing lands outside the root.
    pub fn target_path(&self, relative: &str) -> Result<Utf8PathBuf, FetchError> {
        let relative = Utf8Path::new(relative);
        let escapes = relative
            .components()
            .any(|component| {
                !matches!(component, Utf8Component::Normal(_) | Utf8Component::CurDir)
            });
        if escapes || relative.as_str().is_empty() {
            return Err(FetchError::DestinationWrite(format!(
                "path escapes the local root: {relative}"
            )));
        }
        Ok(self.root.join(relative))
    }

    /// A local copy counts as present when it is a non-empty regular file.
    pub fn is_present(&self, relative: &str) -> bool {
        self.target_path(relative)
            .ok()
            .and_then(|path| fs::metadata(path.as_std_path()).ok())
            .map(|meta| meta.is_file() && meta.len() > 0)
            .unwrap_or(false)
    }

    /// Scratch file next to `target`, so the final rename stays on one
    /// filesystem.
    pub fn staging_file(&self, target: &Utf8Path) -> Result<NamedTempFile, FetchError> {
        let parent = target
            .parent()
            .ok_or_else(|| FetchError::DestinationWrite(format!("invalid destination {target}")))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| FetchError::DestinationWrite(format!("{parent}: {err}")))?;
        Builder::new()
            .prefix(".mera-xfer")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| FetchError::DestinationWrite(format!("{parent}: {err}")))
    }

    /// Moves a completed download into place.
    pub fn commit(staged: NamedTempFile, target: &Utf8Path) -> Result<(), FetchError> {
        staged
            .persist(target.as_std_path())
            .map(|_| ())
            .map_err(|err| FetchError::DestinationWrite(format!("{target}: {}", err.error)))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn store() -> (tempfile::TempDir, LocalStore) {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        (temp, LocalStore::new(root))
    }

    #[test]
    fn layout_mirrors_relative_path() {
        let (_temp, store) = store();
        let target = store.target_path("mera/11/105/2/0/MERA_PRODYEAR_2017_09").unwrap();
        assert!(target.starts_with(store.root()));
        assert!(target.ends_with("mera/11/105/2/0/MERA_PRODYEAR_2017_09"));
    }

    #[test]
    fn escaping_paths_are_refused() {
        let (_temp, store) = store();
        assert_matches!(store.target_path("../etc/passwd"), Err(FetchError::DestinationWrite(_)));
        assert_matches!(store.target_path("/etc/passwd"), Err(FetchError::DestinationWrite(_)));
    }

    #[test]
    fn empty_files_are_not_present() {
        let (_temp, store) = store();
        let target = store.target_path("a/b.grb").unwrap();
        std::fs::create_dir_all(target.parent().unwrap()).unwrap();
        std::fs::write(&target, b"").unwrap();
        assert!(!store.is_present("a/b.grb"));
        std::fs::write(&target, b"GRIB").unwrap();
        assert!(store.is_present("a/b.grb"));
    }

    #[test]
    fn staged_file_commits_into_place() {
        let (_temp, store) = store();
        let target = store.target_path("x/y/z.grb").unwrap();
        let staged = store.staging_file(&target).unwrap();
        std::fs::write(staged.path(), b"data").unwrap();
        LocalStore::commit(staged, &target).unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"data");
    }
}
