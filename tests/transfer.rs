use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use mera_xfer::app::{ProgressEvent, ProgressSink};
use mera_xfer::error::{FetchError, XferError};
use mera_xfer::index::LocationIndex;
use mera_xfer::store::LocalStore;
use mera_xfer::transfer::{FileState, Orchestrator, TransferOptions, TransferOutcome};
use mera_xfer::transport::{LocalTransport, RemoteSession, Transport};

#[derive(Default)]
struct Counters {
    connects: Mutex<usize>,
    closes: Mutex<usize>,
    fetches: Mutex<Vec<String>>,
}

struct FlakyTransport {
    counters: Arc<Counters>,
    /// Remote path that always fails with a transient error.
    broken: Option<String>,
    refuse_connect: bool,
}

struct FlakySession {
    counters: Arc<Counters>,
    broken: Option<String>,
}

impl Transport for FlakyTransport {
    type Session = FlakySession;

    fn connect(&self, location: &LocationIndex) -> Result<FlakySession, XferError> {
        *self.counters.connects.lock().unwrap() += 1;
        if self.refuse_connect {
            return Err(XferError::Connection {
                location: location.id().to_string(),
                host: location.hostname().to_string(),
                message: "Permission denied (publickey)".to_string(),
            });
        }
        Ok(FlakySession {
            counters: self.counters.clone(),
            broken: self.broken.clone(),
        })
    }
}

impl RemoteSession for FlakySession {
    fn fetch(&mut self, remote: &str, dest: &Path, _timeout: Duration) -> Result<(), FetchError> {
        self.counters.fetches.lock().unwrap().push(remote.to_string());
        if self.broken.as_deref() == Some(remote) {
            return Err(FetchError::Timeout(1));
        }
        std::fs::write(dest, remote.as_bytes()).unwrap();
        Ok(())
    }

    fn close(&mut self) -> Result<(), XferError> {
        *self.counters.closes.lock().unwrap() += 1;
        Ok(())
    }
}

#[derive(Default)]
struct Recorder {
    states: Mutex<Vec<(String, FileState)>>,
}

impl ProgressSink for Recorder {
    fn event(&self, event: ProgressEvent) {
        if let (Some(path), Some(state)) = (event.path, event.state) {
            self.states.lock().unwrap().push((path, state));
        }
    }
}

impl Recorder {
    fn count(&self, wanted: FileState) -> usize {
        self.states
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, state)| *state == wanted)
            .count()
    }
}

fn location() -> LocationIndex {
    let mut listing = "#!HOSTNAME=reaserve\n#!MERAROOT=/mnt/reaext03\n".to_string();
    for month in 1..=10 {
        listing.push_str(&format!("mera/11/105/2/0/MERA_PRODYEAR_1990_{month:02}\n"));
    }
    LocationIndex::parse(&listing, Some("reaext03")).unwrap().index
}

fn batch() -> Vec<String> {
    location().paths().iter().cloned().collect()
}

fn options() -> TransferOptions {
    TransferOptions {
        max_attempts: 3,
        attempt_timeout: Duration::from_secs(5),
        retry_delay: Duration::from_millis(1),
    }
}

fn store(temp: &tempfile::TempDir) -> LocalStore {
    LocalStore::new(Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap())
}

#[test]
fn one_failure_does_not_abort_the_batch() {
    let temp = tempfile::tempdir().unwrap();
    let store = store(&temp);
    let counters = Arc::new(Counters::default());
    let broken = "/mnt/reaext03/mera/11/105/2/0/MERA_PRODYEAR_1990_04".to_string();
    let transport = FlakyTransport {
        counters: counters.clone(),
        broken: Some(broken.clone()),
        refuse_connect: false,
    };
    let sink = Recorder::default();

    let summary = Orchestrator::new(&transport, &store, options())
        .run(&location(), &batch(), &sink)
        .unwrap();

    assert_eq!(summary.files.len(), 10);
    assert_eq!(summary.copied(), 9);
    assert_eq!(summary.failed(), 1);
    let failed = summary.files.iter().find(|file| file.is_failed()).unwrap();
    assert_eq!(failed.path, "mera/11/105/2/0/MERA_PRODYEAR_1990_04");
    assert_eq!(failed.attempts, 3);
    assert_matches!(failed.outcome, TransferOutcome::Failed { .. });

    assert_eq!(*counters.connects.lock().unwrap(), 1);
    assert_eq!(*counters.closes.lock().unwrap(), 1);
    let fetches = counters.fetches.lock().unwrap();
    assert_eq!(fetches.iter().filter(|remote| **remote == broken).count(), 3);
    assert_eq!(sink.count(FileState::Done) + sink.count(FileState::Failed), 10);
    assert!(!temp.path().join("mera/11/105/2/0/MERA_PRODYEAR_1990_04").exists());
}

#[test]
fn rerun_skips_everything_without_connecting() {
    let temp = tempfile::tempdir().unwrap();
    let store = store(&temp);
    let counters = Arc::new(Counters::default());
    let transport = FlakyTransport {
        counters: counters.clone(),
        broken: None,
        refuse_connect: false,
    };

    let first = Orchestrator::new(&transport, &store, options())
        .run(&location(), &batch(), &Recorder::default())
        .unwrap();
    assert_eq!(first.copied(), 10);

    let sink = Recorder::default();
    let second = Orchestrator::new(&transport, &store, options())
        .run(&location(), &batch(), &sink)
        .unwrap();
    assert_eq!(second.skipped(), 10);
    assert_eq!(sink.count(FileState::Transferring), 0);
    assert_eq!(sink.count(FileState::Connecting), 0);
    assert_eq!(*counters.connects.lock().unwrap(), 1);
}

#[test]
fn connection_failure_is_fatal() {
    let temp = tempfile::tempdir().unwrap();
    let store = store(&temp);
    let counters = Arc::new(Counters::default());
    let transport = FlakyTransport {
        counters: counters.clone(),
        broken: None,
        refuse_connect: true,
    };

    let aborted = Orchestrator::new(&transport, &store, options())
        .run(&location(), &batch(), &Recorder::default())
        .unwrap_err();
    assert_matches!(aborted.error, XferError::Connection { .. });
    assert!(aborted.settled.is_empty());
    assert_eq!(aborted.untried, 10);
    assert!(counters.fetches.lock().unwrap().is_empty());
}

#[test]
fn connection_failure_keeps_already_skipped_files() {
    let temp = tempfile::tempdir().unwrap();
    let store = store(&temp);
    let present = temp.path().join("mera/11/105/2/0");
    std::fs::create_dir_all(&present).unwrap();
    for month in ["01", "02", "03"] {
        std::fs::write(present.join(format!("MERA_PRODYEAR_1990_{month}")), b"GRIB").unwrap();
    }
    let counters = Arc::new(Counters::default());
    let transport = FlakyTransport {
        counters: counters.clone(),
        broken: None,
        refuse_connect: true,
    };

    let aborted = Orchestrator::new(&transport, &store, options())
        .run(&location(), &batch(), &Recorder::default())
        .unwrap_err();

    assert_eq!(aborted.settled.len(), 3);
    assert!(
        aborted
            .settled
            .iter()
            .all(|file| file.outcome == TransferOutcome::Skipped)
    );
    assert_eq!(aborted.untried, 7);
    assert_eq!(*counters.connects.lock().unwrap(), 1);
}

#[test]
fn interrupted_download_leaves_no_partial_file() {
    let temp = tempfile::tempdir().unwrap();
    let store = store(&temp);
    let counters = Arc::new(Counters::default());
    let transport = FlakyTransport {
        counters,
        broken: Some("/mnt/reaext03/mera/11/105/2/0/MERA_PRODYEAR_1990_01".to_string()),
        refuse_connect: false,
    };
    let paths = vec!["mera/11/105/2/0/MERA_PRODYEAR_1990_01".to_string()];

    Orchestrator::new(&transport, &store, options())
        .run(&location(), &paths, &Recorder::default())
        .unwrap();

    let dir = temp.path().join("mera/11/105/2/0");
    let leftovers: Vec<_> = std::fs::read_dir(dir).unwrap().collect();
    assert!(leftovers.is_empty());
}

#[cfg(unix)]
#[test]
fn stuck_local_source_fails_within_the_attempt_timeout() {
    let remote = tempfile::tempdir().unwrap();
    let local = tempfile::tempdir().unwrap();
    let fifo = remote.path().join("stuck.grb");
    let made = std::process::Command::new("mkfifo").arg(&fifo).status();
    if !made.map(|status| status.success()).unwrap_or(false) {
        return;
    }
    let listing = format!(
        "#!HOSTNAME=localhost\n#!MERAROOT={}\nstuck.grb\n",
        remote.path().display()
    );
    let location = LocationIndex::parse(&listing, Some("disk")).unwrap().index;
    let store = store(&local);
    let options = TransferOptions {
        max_attempts: 1,
        attempt_timeout: Duration::from_millis(300),
        retry_delay: Duration::from_millis(1),
    };

    let started = std::time::Instant::now();
    let summary = Orchestrator::new(&LocalTransport, &store, options)
        .run(&location, &["stuck.grb".to_string()], &Recorder::default())
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(summary.failed(), 1);
    assert_matches!(
        &summary.files[0].outcome,
        TransferOutcome::Failed { reason } if reason.contains("timed out")
    );
    assert!(!store.is_present("stuck.grb"));
    let leftovers: Vec<_> = std::fs::read_dir(local.path()).unwrap().collect();
    assert!(leftovers.is_empty());

    drop(std::fs::OpenOptions::new().write(true).open(&fifo));
}
