use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum XferError {
    #[error("malformed index for location {location}: {reason}")]
    MalformedIndex { location: String, reason: String },

    #[error("failed to read index file at {0}")]
    IndexRead(PathBuf),

    #[error("no index files found in {0}")]
    NoIndices(PathBuf),

    #[error("invalid location identifier: {0}")]
    InvalidLocation(String),

    #[error("unknown location: {0}")]
    UnknownLocation(String),

    #[error("unknown variable: {0}")]
    UnknownVariable(String),

    #[error("invalid variable name: {0}")]
    InvalidVariable(String),

    #[error("invalid date or date range: {0}")]
    InvalidDateRange(String),

    #[error("invalid path template {template}: {reason}")]
    InvalidTemplate { template: String, reason: String },

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("cannot connect to {location} ({host}): {message}")]
    Connection {
        location: String,
        host: String,
        message: String,
    },

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("{failed} of {total} files failed to transfer")]
    IncompleteTransfer { failed: usize, total: usize },
}

/// Failure of a single file transfer attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("attempt timed out after {0}s")]
    Timeout(u64),

    #[error("missing on remote: {0}")]
    MissingOnRemote(String),

    #[error("rejected by remote: {0}")]
    Rejected(String),

    #[error("cannot write destination: {0}")]
    DestinationWrite(String),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient(_) | FetchError::Timeout(_))
    }
}
