//! OpenSSH-backed transport.
//!
//! One control master is started per batch and every `scp` rides on its
//! socket, so authentication happens once.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tracing::debug;

use crate::domain::LocationId;
use crate::error::{FetchError, XferError};
use crate::index::LocationIndex;
use crate::transport::{RemoteSession, Transport};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone)]
pub struct SshOptions {
    pub user: Option<String>,
    pub connect_timeout: Duration,
    /// Refuse password prompts; keys or an agent must be available.
    pub batch_mode: bool,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            user: None,
            connect_timeout: Duration::from_secs(30),
            batch_mode: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SshTransport {
    ssh: PathBuf,
    scp: PathBuf,
    options: SshOptions,
}

impl SshTransport {
    pub fn new(options: SshOptions) -> Result<Self, XferError> {
        let ssh = find_in_path("ssh").ok_or_else(|| XferError::MissingTool("ssh".to_string()))?;
        let scp = find_in_path("scp").ok_or_else(|| XferError::MissingTool("scp".to_string()))?;
        Ok(Self { ssh, scp, options })
    }

    fn target(&self, host: &str) -> String {
        match &self.options.user {
            Some(user) => format!("{user}@{host}"),
            None => host.to_string(),
        }
    }

    fn common_options(&self) -> Vec<String> {
        vec![
            "-o".to_string(),
            format!("BatchMode={}", if self.options.batch_mode { "yes" } else { "no" }),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.options.connect_timeout.as_secs().max(1)),
        ]
    }
}

impl Transport for SshTransport {
    type Session = SshSession;

    fn connect(&self, location: &LocationIndex) -> Result<Self::Session, XferError> {
        let connection_error = |message: String| XferError::Connection {
            location: location.id().to_string(),
            host: location.hostname().to_string(),
            message,
        };

        let dir = tempfile::Builder::new()
            .prefix("mera-xfer-ssh")
            .tempdir()
            .map_err(|err| XferError::Filesystem(err.to_string()))?;
        let socket = dir.path().join("control.sock");
        let stderr_log = dir.path().join("stderr.log");
        let target = self.target(location.hostname());

        let mut args = vec![
            "-M".to_string(),
            "-S".to_string(),
            socket.to_string_lossy().to_string(),
            "-o".to_string(),
            "ControlPersist=yes".to_string(),
            "-f".to_string(),
            "-N".to_string(),
        ];
        args.extend(self.common_options());
        args.push(target.clone());

        debug!(host = %target, "starting ssh control master");
        let deadline = self.options.connect_timeout + Duration::from_secs(5);
        let status = run_cmd(&self.ssh, &args, &stderr_log, deadline)
            .map_err(|err| connection_error(err.to_string()))?;
        match status {
            Some(status) if status.success() => {}
            Some(_) => return Err(connection_error(read_log(&stderr_log))),
            None => return Err(connection_error("timed out while connecting".to_string())),
        }

        Ok(SshSession {
            location: location.id().clone(),
            host: location.hostname().to_string(),
            ssh: self.ssh.clone(),
            scp: self.scp.clone(),
            target,
            socket,
            stderr_log,
            common: self.common_options(),
            _dir: dir,
        })
    }
}

pub struct SshSession {
    location: LocationId,
    host: String,
    ssh: PathBuf,
    scp: PathBuf,
    target: String,
    socket: PathBuf,
    stderr_log: PathBuf,
    common: Vec<String>,
    _dir: TempDir,
}

impl SshSession {
    fn control_path(&self) -> String {
        format!("ControlPath={}", self.socket.to_string_lossy())
    }
}

impl RemoteSession for SshSession {
    fn fetch(
        &mut self,
        remote_path: &str,
        destination: &Path,
        timeout: Duration,
    ) -> Result<(), FetchError> {
        let mut args = vec!["-q".to_string(), "-o".to_string(), self.control_path()];
        args.extend(self.common.iter().cloned());
        args.push(format!("{}:{remote_path}", self.target));
        args.push(destination.to_string_lossy().to_string());

        let status = run_cmd(&self.scp, &args, &self.stderr_log, timeout)
            .map_err(|err| FetchError::Transient(format!("cannot run scp: {err}")))?;
        match status {
            Some(status) if status.success() => Ok(()),
            Some(_) => Err(classify_scp_failure(remote_path, &read_log(&self.stderr_log))),
            None => Err(FetchError::Timeout(timeout.as_secs())),
        }
    }

    fn close(&mut self) -> Result<(), XferError> {
        let args = vec![
            "-S".to_string(),
            self.socket.to_string_lossy().to_string(),
            "-O".to_string(),
            "exit".to_string(),
            self.target.clone(),
        ];
        let status = run_cmd(&self.ssh, &args, &self.stderr_log, Duration::from_secs(10))
            .map_err(|err| XferError::Filesystem(err.to_string()))?;
        match status {
            Some(status) if status.success() => Ok(()),
            _ => Err(close_error(&self.location, &self.host, &self.stderr_log)),
        }
    }
}

fn close_error(location: &LocationId, host: &str, stderr_log: &Path) -> XferError {
    XferError::Connection {
        location: location.to_string(),
        host: host.to_string(),
        message: format!("control master did not exit: {}", read_log(stderr_log)),
    }
}

/// Maps scp diagnostics onto retryable and final failures. Anything not
/// recognised is treated as a network hiccup.
pub fn classify_scp_failure(remote_path: &str, stderr: &str) -> FetchError {
    let lowered = stderr.to_ascii_lowercase();
    if lowered.contains("no such file") || lowered.contains("not a regular file") {
        FetchError::MissingOnRemote(remote_path.to_string())
    } else if lowered.contains("permission denied")
        || lowered.contains("host key verification failed")
        || lowered.contains("authentication")
    {
        FetchError::Rejected(stderr.trim().to_string())
    } else if lowered.contains("no space left") || lowered.contains("read-only file system") {
        FetchError::DestinationWrite(stderr.trim().to_string())
    } else if stderr.trim().is_empty() {
        FetchError::Transient(format!("scp failed for {remote_path}"))
    } else {
        FetchError::Transient(stderr.trim().to_string())
    }
}

/// Runs `program`, sending stderr to `stderr_log`. Returns `None` when the
/// process had to be killed after `timeout`.
fn run_cmd(
    program: &Path,
    args: &[String],
    stderr_log: &Path,
    timeout: Duration,
) -> std::io::Result<Option<ExitStatus>> {
    let log = File::create(stderr_log)?;
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::from(log))
        .spawn()?;

    let started = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if started.elapsed() >= timeout {
            child.kill()?;
            child.wait()?;
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn read_log(path: &Path) -> String {
    fs::read_to_string(path)
        .map(|text| text.trim().to_string())
        .unwrap_or_default()
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.exists() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.exists() {
            return Some(plain);
        }
    }
    None
}
