//! FTP transport.
//!
//! One login per batch. A transfer that breaks mid-stream drops the control
//! connection; the next attempt logs in again.

use std::fs::File;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::time::{Duration, Instant};

use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream, Status};
use tracing::{debug, warn};

use crate::domain::LocationId;
use crate::error::{FetchError, XferError};
use crate::index::LocationIndex;
use crate::transport::{RemoteSession, Transport};

pub const PASSWORD_ENV: &str = "MERA_XFER_FTP_PASSWORD";
const DEFAULT_PORT: u16 = 21;
const ANONYMOUS_USER: &str = "anonymous";
const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct FtpOptions {
    /// Defaults to an anonymous login.
    pub user: Option<String>,
    pub password: Option<String>,
    pub connect_timeout: Duration,
}

impl Default for FtpOptions {
    fn default() -> Self {
        Self {
            user: None,
            password: std::env::var(PASSWORD_ENV).ok(),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FtpTransport {
    options: FtpOptions,
}

impl FtpTransport {
    pub fn new(options: FtpOptions) -> Self {
        Self { options }
    }
}

#[derive(Debug, Clone)]
struct Login {
    addr: SocketAddr,
    user: String,
    password: String,
    timeout: Duration,
}

impl Login {
    fn open(&self) -> Result<FtpStream, FtpError> {
        let mut stream = FtpStream::connect_timeout(self.addr, self.timeout)?;
        stream.login(self.user.as_str(), self.password.as_str())?;
        stream.transfer_type(FileType::Binary)?;
        Ok(stream)
    }
}

impl Transport for FtpTransport {
    type Session = FtpSession;

    fn connect(&self, location: &LocationIndex) -> Result<Self::Session, XferError> {
        let connection_error = |message: String| XferError::Connection {
            location: location.id().to_string(),
            host: location.hostname().to_string(),
            message,
        };

        let addr =
            resolve(location.hostname()).map_err(|err| connection_error(err.to_string()))?;
        let login = Login {
            addr,
            user: self
                .options
                .user
                .clone()
                .unwrap_or_else(|| ANONYMOUS_USER.to_string()),
            password: self.options.password.clone().unwrap_or_default(),
            timeout: self.options.connect_timeout,
        };
        debug!(host = location.hostname(), user = %login.user, "ftp login");
        let stream = login.open().map_err(|err| connection_error(err.to_string()))?;

        Ok(FtpSession {
            location: location.id().clone(),
            host: location.hostname().to_string(),
            login,
            stream: Some(stream),
        })
    }
}

pub struct FtpSession {
    location: LocationId,
    host: String,
    login: Login,
    stream: Option<FtpStream>,
}

impl RemoteSession for FtpSession {
    fn fetch(
        &mut self,
        remote_path: &str,
        destination: &Path,
        timeout: Duration,
    ) -> Result<(), FetchError> {
        let mut stream = match self.stream.take() {
            Some(stream) => stream,
            None => {
                debug!(location = %self.location, "ftp login after a broken transfer");
                self.login
                    .open()
                    .map_err(|err| FetchError::Transient(format!("ftp login: {err}")))?
            }
        };
        let result = retrieve(&mut stream, remote_path, destination, timeout);
        match &result {
            Ok(()) | Err(FetchError::MissingOnRemote(_) | FetchError::Rejected(_)) => {
                self.stream = Some(stream);
            }
            Err(err) => {
                warn!(location = %self.location, error = %err, "dropping ftp connection");
            }
        }
        result
    }

    fn close(&mut self) -> Result<(), XferError> {
        let Some(mut stream) = self.stream.take() else {
            return Ok(());
        };
        stream.quit().map_err(|err| XferError::Connection {
            location: self.location.to_string(),
            host: self.host.clone(),
            message: format!("QUIT failed: {err}"),
        })
    }
}

fn retrieve(
    stream: &mut FtpStream,
    remote_path: &str,
    destination: &Path,
    timeout: Duration,
) -> Result<(), FetchError> {
    stream
        .get_ref()
        .set_read_timeout(Some(timeout))
        .map_err(|err| FetchError::Transient(err.to_string()))?;
    let mut data = stream
        .retr_as_stream(remote_path)
        .map_err(|err| classify_ftp_failure(remote_path, err))?;
    data.get_ref()
        .set_read_timeout(Some(timeout))
        .map_err(|err| FetchError::Transient(err.to_string()))?;

    let mut dest = File::create(destination).map_err(|err| {
        FetchError::DestinationWrite(format!("{}: {err}", destination.display()))
    })?;
    copy_with_deadline(&mut data, &mut dest, timeout).map_err(|err| match err {
        FetchError::DestinationWrite(reason) => {
            FetchError::DestinationWrite(format!("{}: {reason}", destination.display()))
        }
        other => other,
    })?;
    stream
        .finalize_retr_stream(data)
        .map_err(|err| classify_ftp_failure(remote_path, err))?;
    dest.sync_all()
        .map_err(|err| FetchError::DestinationWrite(format!("{}: {err}", destination.display())))
}

/// Copies until EOF, failing once `timeout` has passed since the start.
fn copy_with_deadline(
    source: &mut impl Read,
    dest: &mut impl Write,
    timeout: Duration,
) -> Result<u64, FetchError> {
    let started = Instant::now();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        let read = match source.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) if matches!(err.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                return Err(FetchError::Timeout(timeout.as_secs()));
            }
            Err(err) => return Err(FetchError::Transient(err.to_string())),
        };
        dest.write_all(&buf[..read])
            .map_err(|err| FetchError::DestinationWrite(err.to_string()))?;
        total += read as u64;
        if started.elapsed() > timeout {
            return Err(FetchError::Timeout(timeout.as_secs()));
        }
    }
}

pub fn classify_ftp_failure(remote_path: &str, err: FtpError) -> FetchError {
    match err {
        FtpError::UnexpectedResponse(response) => match response.status {
            Status::FileUnavailable => FetchError::MissingOnRemote(remote_path.to_string()),
            Status::NotLoggedIn => FetchError::Rejected(format!("{remote_path}: not logged in")),
            status => {
                FetchError::Transient(format!("{remote_path}: unexpected reply {status:?}"))
            }
        },
        other => FetchError::Transient(format!("{remote_path}: {other}")),
    }
}

/// `host` or `host:port`; the port defaults to 21.
fn resolve(host: &str) -> io::Result<SocketAddr> {
    let mut addrs = match host.rsplit_once(':') {
        Some((_, port)) if port.parse::<u16>().is_ok() => host.to_socket_addrs()?,
        _ => (host, DEFAULT_PORT).to_socket_addrs()?,
    };
    addrs
        .next()
        .ok_or_else(|| io::Error::new(ErrorKind::NotFound, format!("no address for {host}")))
}
