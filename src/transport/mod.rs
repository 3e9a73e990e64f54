//! Ways of reaching a storage location.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::domain::LocationId;
use crate::error::{FetchError, XferError};
use crate::index::LocationIndex;

pub mod ftp;
pub mod local;
pub mod ssh;

pub use ftp::{FtpOptions, FtpTransport};
pub use local::LocalTransport;
pub use ssh::{SshOptions, SshTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Ssh,
    Ftp,
    Local,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Ssh => write!(f, "ssh"),
            TransportKind::Ftp => write!(f, "ftp"),
            TransportKind::Local => write!(f, "local"),
        }
    }
}

pub trait Transport {
    type Session: RemoteSession;

    /// Opens one session to the host holding `location`. Failing here is
    /// fatal for the whole batch.
    fn connect(&self, location: &LocationIndex) -> Result<Self::Session, XferError>;
}

pub trait RemoteSession {
    /// Copies the remote file at `remote_path` to `destination`, giving up
    /// after `timeout`.
    fn fetch(
        &mut self,
        remote_path: &str,
        destination: &Path,
        timeout: Duration,
    ) -> Result<(), FetchError>;

    fn close(&mut self) -> Result<(), XferError>;
}

/// Holds an open session for one batch and closes it exactly once, either
/// through [`SessionGuard::release`] or on drop.
pub struct SessionGuard<S: RemoteSession> {
    session: Option<S>,
    location: LocationId,
}

impl<S: RemoteSession> SessionGuard<S> {
    pub fn new(session: S, location: LocationId) -> Self {
        info!(location = %location, "session opened");
        Self {
            session: Some(session),
            location,
        }
    }

    pub fn fetch(
        &mut self,
        remote_path: &str,
        destination: &Path,
        timeout: Duration,
    ) -> Result<(), FetchError> {
        match self.session.as_mut() {
            Some(session) => session.fetch(remote_path, destination, timeout),
            None => Err(FetchError::Transient("session already closed".to_string())),
        }
    }

    pub fn release(mut self) -> Result<(), XferError> {
        self.close_inner()
    }

    fn close_inner(&mut self) -> Result<(), XferError> {
        match self.session.take() {
            Some(mut session) => {
                info!(location = %self.location, "session closed");
                session.close()
            }
            None => Ok(()),
        }
    }
}

impl<S: RemoteSession> Drop for SessionGuard<S> {
    fn drop(&mut self) {
        if let Err(err) = self.close_inner() {
            warn!(location = %self.location, error = %err, "failed to close session");
        }
    }
}
