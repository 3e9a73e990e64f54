use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use camino::Utf8Path;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::app::{ProgressEvent, ProgressSink};
use crate::domain::LocationId;
use crate::error::{FetchError, XferError};
use crate::index::LocationIndex;
use crate::store::LocalStore;
use crate::transport::{SessionGuard, Transport};

#[derive(Debug, Clone)]
pub struct TransferOptions {
    /// Attempts per file, counting the first one.
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
    /// Base delay between attempts; the n-th retry waits `n * retry_delay`.
    pub retry_delay: Duration,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout: Duration::from_secs(600),
            retry_delay: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    Pending,
    Skipped,
    Connecting,
    Transferring,
    Done,
    Failed,
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FileState::Pending => "pending",
            FileState::Skipped => "skipped",
            FileState::Connecting => "connecting",
            FileState::Transferring => "transferring",
            FileState::Done => "done",
            FileState::Failed => "failed",
        };
        f.pad(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TransferOutcome {
    Copied,
    /// A non-empty local copy already existed.
    Skipped,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileReport {
    pub path: String,
    pub local_path: Option<String>,
    #[serde(flatten)]
    pub outcome: TransferOutcome,
    pub attempts: u32,
}

impl FileReport {
    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, TransferOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferSummary {
    pub location: LocationId,
    pub host: String,
    pub local_root: String,
    pub files: Vec<FileReport>,
}

impl TransferSummary {
    pub fn copied(&self) -> usize {
        self.count(|outcome| matches!(outcome, TransferOutcome::Copied))
    }

    pub fn skipped(&self) -> usize {
        self.count(|outcome| matches!(outcome, TransferOutcome::Skipped))
    }

    pub fn failed(&self) -> usize {
        self.count(|outcome| matches!(outcome, TransferOutcome::Failed { .. }))
    }

    fn count(&self, predicate: impl Fn(&TransferOutcome) -> bool) -> usize {
        self.files
            .iter()
            .filter(|file| predicate(&file.outcome))
            .count()
    }
}

/// What a batch would do, without touching the remote side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedFile {
    pub path: String,
    pub remote_path: String,
    pub local_path: Option<String>,
    pub present: bool,
}

/// A batch that stopped because its session could not be opened.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct BatchAborted {
    pub error: XferError,
    /// Reports of the files settled before the connection was needed.
    pub settled: Vec<FileReport>,
    /// Files never tried, counting the one that needed the connection.
    pub untried: usize,
}

/// Copies one batch of indexed files from a single location into the local
/// store over one session.
pub struct Orchestrator<'a, T: Transport> {
    transport: &'a T,
    store: &'a LocalStore,
    options: TransferOptions,
}

impl<'a, T: Transport> Orchestrator<'a, T> {
    pub fn new(transport: &'a T, store: &'a LocalStore, options: TransferOptions) -> Self {
        Self {
            transport,
            store,
            options,
        }
    }

    pub fn plan(&self, location: &LocationIndex, paths: &[String]) -> Vec<PlannedFile> {
        paths
            .iter()
            .map(|path| PlannedFile {
                path: path.clone(),
                remote_path: location.remote_path(path),
                local_path: self.store.target_path(path).ok().map(|p| p.to_string()),
                present: self.store.is_present(path),
            })
            .collect()
    }

    /// Runs the batch. Only a failure to open the session is returned as an
    /// error; per-file failures end up in the summary.
    pub fn run(
        &self,
        location: &LocationIndex,
        paths: &[String],
        sink: &dyn ProgressSink,
    ) -> Result<TransferSummary, BatchAborted> {
        info!(
            location = %location.id(),
            host = location.hostname(),
            files = paths.len(),
            "batch started"
        );
        let started = Instant::now();
        let mut session: Option<SessionGuard<T::Session>> = None;
        let mut files = Vec::with_capacity(paths.len());

        for (position, path) in paths.iter().enumerate() {
            match self.transfer_file(location, path, &mut session, sink, started) {
                Ok(report) => files.push(report),
                Err(error) => {
                    return Err(BatchAborted {
                        error,
                        settled: files,
                        untried: paths.len() - position,
                    });
                }
            }
        }

        if let Some(session) = session {
            if let Err(err) = session.release() {
                warn!(location = %location.id(), error = %err, "session close failed");
            }
        }

        let summary = TransferSummary {
            location: location.id().clone(),
            host: location.hostname().to_string(),
            local_root: self.store.root().to_string(),
            files,
        };
        info!(
            location = %summary.location,
            copied = summary.copied(),
            skipped = summary.skipped(),
            failed = summary.failed(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "batch finished"
        );
        Ok(summary)
    }

    fn transfer_file(
        &self,
        location: &LocationIndex,
        path: &str,
        session: &mut Option<SessionGuard<T::Session>>,
        sink: &dyn ProgressSink,
        started: Instant,
    ) -> Result<FileReport, XferError> {
        emit(sink, path, FileState::Pending, started);

        let target = match self.store.target_path(path) {
            Ok(target) => target,
            Err(err) => {
                emit(sink, path, FileState::Failed, started);
                return Ok(FileReport {
                    path: path.to_string(),
                    local_path: None,
                    outcome: TransferOutcome::Failed {
                        reason: err.to_string(),
                    },
                    attempts: 0,
                });
            }
        };

        if self.store.is_present(path) {
            debug!(path, "local copy present");
            emit(sink, path, FileState::Skipped, started);
            return Ok(FileReport {
                path: path.to_string(),
                local_path: Some(target.to_string()),
                outcome: TransferOutcome::Skipped,
                attempts: 0,
            });
        }

        let mut guard = match session.take() {
            Some(guard) => guard,
            None => {
                emit(sink, path, FileState::Connecting, started);
                let opened = self.transport.connect(location)?;
                SessionGuard::new(opened, location.id().clone())
            }
        };

        let remote_path = location.remote_path(path);
        let max_attempts = self.options.max_attempts.max(1);
        let mut attempts = 0u32;
        let outcome = loop {
            attempts += 1;
            emit(sink, path, FileState::Transferring, started);
            match self.attempt(&mut guard, &remote_path, &target) {
                Ok(()) => break TransferOutcome::Copied,
                Err(err) if err.is_transient() && attempts < max_attempts => {
                    warn!(
                        path,
                        attempt = attempts,
                        error = %err,
                        "transfer attempt failed, retrying"
                    );
                    thread::sleep(self.options.retry_delay * attempts);
                }
                Err(err) => {
                    warn!(path, attempts, error = %err, "transfer failed");
                    break TransferOutcome::Failed {
                        reason: err.to_string(),
                    };
                }
            }
        };
        *session = Some(guard);

        let state = match outcome {
            TransferOutcome::Failed { .. } => FileState::Failed,
            _ => FileState::Done,
        };
        emit(sink, path, state, started);
        Ok(FileReport {
            path: path.to_string(),
            local_path: Some(target.to_string()),
            outcome,
            attempts,
        })
    }

    fn attempt(
        &self,
        guard: &mut SessionGuard<T::Session>,
        remote_path: &str,
        target: &Utf8Path,
    ) -> Result<(), FetchError> {
        let staged = self.store.staging_file(target)?;
        guard.fetch(remote_path, staged.path(), self.options.attempt_timeout)?;
        LocalStore::commit(staged, target)
    }
}

fn emit(sink: &dyn ProgressSink, path: &str, state: FileState, started: Instant) {
    sink.event(ProgressEvent {
        message: format!("{state} {path}"),
        path: Some(path.to_string()),
        state: Some(state),
        elapsed: Some(started.elapsed()),
    });
}
