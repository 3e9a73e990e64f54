use std::time::Duration;

use serde::Serialize;
use tracing::warn;

use crate::aggregate::GlobalIndex;
use crate::catalog::Catalog;
use crate::domain::{LocationId, VariableName, VariableRequest};
use crate::error::XferError;
use crate::resolver::{AvailabilityReport, Resolver};
use crate::store::LocalStore;
use crate::transfer::{
    BatchAborted, FileReport, FileState, Orchestrator, PlannedFile, TransferOptions,
    TransferSummary,
};
use crate::transport::Transport;

#[derive(Debug, Clone, Serialize)]
pub struct LocationsResult {
    pub locations: Vec<LocationEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LocationEntry {
    pub id: LocationId,
    pub host: String,
    pub root: String,
    pub files: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchResult {
    pub dry_run: bool,
    pub unknown_variables: Vec<VariableName>,
    pub missing_variables: Vec<VariableName>,
    pub batches: Vec<BatchResult>,
}

impl FetchResult {
    pub fn failed_files(&self) -> usize {
        self.batches
            .iter()
            .map(|batch| match batch {
                BatchResult::Completed(summary) => summary.failed(),
                BatchResult::Unreachable { settled, .. } => {
                    settled.iter().filter(|file| file.is_failed()).count()
                }
                BatchResult::Planned { .. } => 0,
            })
            .sum()
    }

    pub fn total_files(&self) -> usize {
        self.batches
            .iter()
            .map(|batch| match batch {
                BatchResult::Planned { files, .. } => files.len(),
                BatchResult::Completed(summary) => summary.files.len(),
                BatchResult::Unreachable {
                    settled, untried, ..
                } => settled.len() + untried,
            })
            .sum()
    }

    pub fn unreachable(&self) -> impl Iterator<Item = &BatchResult> {
        self.batches
            .iter()
            .filter(|batch| matches!(batch, BatchResult::Unreachable { .. }))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchResult {
    Planned {
        location: LocationId,
        host: String,
        files: Vec<PlannedFile>,
    },
    Completed(TransferSummary),
    /// The session could not be opened. Files settled before that point
    /// (already present locally) are kept; the rest were never tried.
    Unreachable {
        location: LocationId,
        host: String,
        reason: String,
        settled: Vec<FileReport>,
        untried: usize,
    },
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub path: Option<String>,
    pub state: Option<FileState>,
    pub elapsed: Option<Duration>,
}

impl ProgressEvent {
    pub fn phase(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            path: None,
            state: None,
            elapsed: None,
        }
    }
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

pub struct App<T: Transport> {
    catalog: Catalog,
    index: GlobalIndex,
    store: LocalStore,
    transport: T,
    options: TransferOptions,
}

impl<T: Transport> App<T> {
    pub fn new(
        catalog: Catalog,
        index: GlobalIndex,
        store: LocalStore,
        transport: T,
        options: TransferOptions,
    ) -> Self {
        Self {
            catalog,
            index,
            store,
            transport,
            options,
        }
    }

    pub fn index(&self) -> &GlobalIndex {
        &self.index
    }

    pub fn locations(&self) -> LocationsResult {
        LocationsResult {
            locations: self
                .index
                .locations()
                .iter()
                .map(|location| LocationEntry {
                    id: location.id().clone(),
                    host: location.hostname().to_string(),
                    root: location.root_path().to_string(),
                    files: location.len(),
                })
                .collect(),
        }
    }

    /// Availability of every requested (variable, date), optionally looking
    /// at a single location only.
    pub fn locate(
        &self,
        request: &VariableRequest,
        location: Option<&LocationId>,
        sink: &dyn ProgressSink,
    ) -> Result<AvailabilityReport, XferError> {
        sink.event(ProgressEvent::phase(format!(
            "phase=Resolve; {} variable(s) over {}",
            request.variables.len(),
            request.range
        )));
        match location {
            Some(id) => {
                let scoped = self
                    .index
                    .only(id)
                    .ok_or_else(|| XferError::UnknownLocation(id.to_string()))?;
                Ok(Resolver::new(&self.catalog, &scoped).resolve(request))
            }
            None => Ok(Resolver::new(&self.catalog, &self.index).resolve(request)),
        }
    }

    /// Resolves the request and copies every found file. Without a location,
    /// each file comes from its preferred location and one batch runs per
    /// location.
    pub fn fetch(
        &self,
        request: &VariableRequest,
        location: Option<&LocationId>,
        dry_run: bool,
        sink: &dyn ProgressSink,
    ) -> Result<FetchResult, XferError> {
        let report = self.locate(request, location, sink)?;
        let plan = report.plan_by_preferred();
        let orchestrator = Orchestrator::new(&self.transport, &self.store, self.options.clone());

        let mut batches = Vec::with_capacity(plan.len());
        for (id, files) in plan {
            let target = self
                .index
                .location(&id)
                .ok_or_else(|| XferError::UnknownLocation(id.to_string()))?;

            if dry_run {
                batches.push(BatchResult::Planned {
                    location: id.clone(),
                    host: target.hostname().to_string(),
                    files: orchestrator.plan(target, &files),
                });
                continue;
            }

            sink.event(ProgressEvent::phase(format!(
                "phase=Transfer; {} file(s) from {id} ({})",
                files.len(),
                target.hostname()
            )));
            match orchestrator.run(target, &files, sink) {
                Ok(summary) => batches.push(BatchResult::Completed(summary)),
                Err(BatchAborted {
                    error: err @ XferError::Connection { .. },
                    settled,
                    untried,
                }) => {
                    warn!(location = %id, error = %err, untried, "batch abandoned");
                    batches.push(BatchResult::Unreachable {
                        location: id.clone(),
                        host: target.hostname().to_string(),
                        reason: err.to_string(),
                        settled,
                        untried,
                    });
                }
                Err(aborted) => return Err(aborted.error),
            }
        }

        Ok(FetchResult {
            dry_run,
            unknown_variables: report.unknown_variables().into_iter().cloned().collect(),
            missing_variables: report.missing_variables().into_iter().cloned().collect(),
            batches,
        })
    }

    /// Every loaded location as one concatenated listing.
    pub fn export(&self) -> String {
        self.index
            .locations()
            .iter()
            .map(|location| location.to_listing())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::sync::Mutex;

    use assert_matches::assert_matches;
    use camino::Utf8PathBuf;

    use super::*;
    use crate::catalog::ArchivePathPattern;
    use crate::domain::Granularity;
    use crate::error::FetchError;
    use crate::index::LocationIndex;
    use crate::output::JsonOutput;
    use crate::transfer::TransferOutcome;
    use crate::transport::RemoteSession;

    #[derive(Default)]
    struct MockTransport {
        connects: Mutex<Vec<String>>,
    }

    struct MockSession;

    impl Transport for MockTransport {
        type Session = MockSession;

        fn connect(&self, location: &LocationIndex) -> Result<MockSession, XferError> {
            self.connects
                .lock()
                .unwrap()
                .push(location.id().to_string());
            if location.hostname() == "down" {
                return Err(XferError::Connection {
                    location: location.id().to_string(),
                    host: location.hostname().to_string(),
                    message: "no route to host".to_string(),
                });
            }
            Ok(MockSession)
        }
    }

    impl RemoteSession for MockSession {
        fn fetch(&mut self, _: &str, dest: &Path, _: Duration) -> Result<(), FetchError> {
            std::fs::write(dest, b"GRIB").unwrap();
            Ok(())
        }

        fn close(&mut self) -> Result<(), XferError> {
            Ok(())
        }
    }

    fn app(root: Utf8PathBuf) -> App<MockTransport> {
        let pattern = ArchivePathPattern::from_templates(
            Granularity::Monthly,
            &["{var}_{yyyy}{mm}".to_string()],
            &BTreeMap::new(),
        )
        .unwrap();
        let catalog = Catalog::new().with_entry("t2m".parse().unwrap(), pattern);
        let index = GlobalIndex::from_locations([
            LocationIndex::parse("#!HOSTNAME=up\n#!MERAROOT=/a\nt2m_199001\n", Some("a"))
                .unwrap()
                .index,
            LocationIndex::parse("#!HOSTNAME=down\n#!MERAROOT=/b\nt2m_199002\n", Some("b"))
                .unwrap()
                .index,
        ]);
        App::new(
            catalog,
            index,
            LocalStore::new(root),
            MockTransport::default(),
            TransferOptions::default(),
        )
    }

    fn request() -> VariableRequest {
        VariableRequest::new(
            vec!["t2m".parse().unwrap(), "nope".parse().unwrap()],
            "1990-01_1990-02".parse().unwrap(),
        )
    }

    #[test]
    fn unreachable_location_does_not_stop_other_batches() {
        let temp = tempfile::tempdir().unwrap();
        let app = app(Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap());

        let result = app.fetch(&request(), None, false, &JsonOutput).unwrap();

        assert_eq!(result.batches.len(), 2);
        assert_matches!(
            &result.batches[0],
            BatchResult::Completed(summary) if summary.copied() == 1
        );
        assert_matches!(&result.batches[1], BatchResult::Unreachable { untried: 1, .. });
        assert_eq!(result.unknown_variables, vec!["nope".parse::<VariableName>().unwrap()]);
        assert_eq!(result.unreachable().count(), 1);
    }

    #[test]
    fn dry_run_never_connects() {
        let temp = tempfile::tempdir().unwrap();
        let app = app(Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap());

        let result = app.fetch(&request(), None, true, &JsonOutput).unwrap();

        assert!(app.transport.connects.lock().unwrap().is_empty());
        assert_eq!(result.total_files(), 2);
        assert_matches!(
            &result.batches[0],
            BatchResult::Planned { files, .. } if !files[0].present
        );
    }

    #[test]
    fn unknown_location_is_an_error() {
        let temp = tempfile::tempdir().unwrap();
        let app = app(Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap());
        let err = app
            .locate(&request(), Some(&"zzz".parse().unwrap()), &JsonOutput)
            .unwrap_err();
        assert_matches!(err, XferError::UnknownLocation(_));
    }

    #[test]
    fn unreachable_batch_keeps_files_settled_before_connecting() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join("t2m_199002"), b"GRIB").unwrap();
        let mut app = app(Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap());
        let request = VariableRequest::new(
            vec!["t2m".parse().unwrap()],
            "1990-02_1990-03".parse().unwrap(),
        );
        app.index.add(
            LocationIndex::parse("#!HOSTNAME=down\n#!MERAROOT=/b\nt2m_199003\n", Some("b"))
                .unwrap()
                .index,
        );

        let result = app.fetch(&request, None, false, &JsonOutput).unwrap();

        assert_eq!(result.batches.len(), 1);
        assert_matches!(
            &result.batches[0],
            BatchResult::Unreachable { settled, untried: 1, .. }
                if settled.len() == 1 && settled[0].outcome == TransferOutcome::Skipped
        );
        assert_eq!(result.total_files(), 2);
        assert_eq!(result.failed_files(), 0);
    }
}
