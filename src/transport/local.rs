use std::fs::File;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use tracing::warn;

use crate::error::{FetchError, XferError};
use crate::index::LocationIndex;
use crate::transport::{RemoteSession, Transport};

/// The location's archive root is mounted on this host.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalTransport;

pub struct LocalSession {
    root: PathBuf,
}

impl Transport for LocalTransport {
    type Session = LocalSession;

    fn connect(&self, location: &LocationIndex) -> Result<Self::Session, XferError> {
        let root = PathBuf::from(location.root_path());
        if !root.is_dir() {
            return Err(XferError::Connection {
                location: location.id().to_string(),
                host: location.hostname().to_string(),
                message: format!("archive root {} is not mounted here", root.display()),
            });
        }
        Ok(LocalSession { root })
    }
}

impl RemoteSession for LocalSession {
    /// Copies on a worker thread so a hung mount or a FIFO cannot stall the
    /// batch. On timeout the worker is abandoned; it only ever writes to the
    /// already-open staging handle.
    fn fetch(
        &mut self,
        remote_path: &str,
        destination: &Path,
        timeout: Duration,
    ) -> Result<(), FetchError> {
        let source_path = PathBuf::from(remote_path);
        if !source_path.starts_with(&self.root) {
            return Err(FetchError::Rejected(format!(
                "{remote_path} is outside {}",
                self.root.display()
            )));
        }
        let dest = File::create(destination).map_err(|err| {
            FetchError::DestinationWrite(format!("{}: {err}", destination.display()))
        })?;

        let (tx, rx) = mpsc::channel();
        let label = remote_path.to_string();
        thread::spawn(move || {
            let _ = tx.send(copy_file(&source_path, &label, dest));
        });

        match rx.recv_timeout(timeout) {
            Ok(result) => result.map_err(|err| match err {
                FetchError::DestinationWrite(reason) => {
                    FetchError::DestinationWrite(format!("{}: {reason}", destination.display()))
                }
                other => other,
            }),
            Err(RecvTimeoutError::Timeout) => {
                warn!(path = remote_path, "local copy timed out, abandoning worker");
                Err(FetchError::Timeout(timeout.as_secs()))
            }
            Err(RecvTimeoutError::Disconnected) => Err(FetchError::Transient(format!(
                "{remote_path}: copy worker exited early"
            ))),
        }
    }

    fn close(&mut self) -> Result<(), XferError> {
        Ok(())
    }
}

fn copy_file(source_path: &Path, label: &str, mut dest: File) -> Result<(), FetchError> {
    let mut source = File::open(source_path).map_err(|err| classify_source(label, err))?;
    io::copy(&mut source, &mut dest)
        .map_err(|err| FetchError::Transient(format!("{label}: {err}")))?;
    dest.sync_all()
        .map_err(|err| FetchError::DestinationWrite(err.to_string()))
}

fn classify_source(remote_path: &str, err: io::Error) -> FetchError {
    match err.kind() {
        ErrorKind::NotFound => FetchError::MissingOnRemote(remote_path.to_string()),
        ErrorKind::PermissionDenied => FetchError::Rejected(format!("{remote_path}: {err}")),
        _ => FetchError::Transient(format!("{remote_path}: {err}")),
    }
}
