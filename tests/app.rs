use std::collections::BTreeMap;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use mera_xfer::aggregate::GlobalIndex;
use mera_xfer::app::{App, BatchResult};
use mera_xfer::catalog::{ArchivePathPattern, Catalog};
use mera_xfer::domain::{Granularity, VariableRequest};
use mera_xfer::index::LocationIndex;
use mera_xfer::output::JsonOutput;
use mera_xfer::store::LocalStore;
use mera_xfer::transfer::{TransferOptions, TransferOutcome};
use mera_xfer::transport::LocalTransport;

struct Fixture {
    _remote: tempfile::TempDir,
    local: tempfile::TempDir,
    app: App<LocalTransport>,
}

fn fixture() -> Fixture {
    let remote = tempfile::tempdir().unwrap();
    let local = tempfile::tempdir().unwrap();

    let files = ["m05/1990/01/t2m_1990_01.grb", "m05/1990/02/t2m_1990_02.grb"];
    let mut listing = format!("#!HOSTNAME=localhost\n#!MERAROOT={}\n", remote.path().display());
    for file in files {
        let path = remote.path().join(file);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, format!("GRIB {file}")).unwrap();
        listing.push_str(file);
        listing.push('\n');
    }
    // Indexed but gone from the disk.
    listing.push_str("m05/1990/03/t2m_1990_03.grb\n");

    let index = GlobalIndex::from_locations([LocationIndex::parse(&listing, Some("disk1"))
        .unwrap()
        .index]);
    let pattern = ArchivePathPattern::from_templates(
        Granularity::Monthly,
        &["m05/{yyyy}/{mm}/{var}_{yyyy}_{mm}.grb".to_string()],
        &BTreeMap::new(),
    )
    .unwrap();
    let catalog = Catalog::new().with_entry("t2m".parse().unwrap(), pattern);
    let store = LocalStore::new(Utf8PathBuf::from_path_buf(local.path().to_path_buf()).unwrap());
    let options = TransferOptions {
        retry_delay: std::time::Duration::from_millis(1),
        ..TransferOptions::default()
    };

    Fixture {
        _remote: remote,
        local,
        app: App::new(catalog, index, store, LocalTransport, options),
    }
}

fn request() -> VariableRequest {
    VariableRequest::new(vec!["t2m".parse().unwrap()], "1990-01_1990-04".parse().unwrap())
}

#[test]
fn fetch_copies_into_mirrored_layout() {
    let fixture = fixture();

    let result = fixture.app.fetch(&request(), None, false, &JsonOutput).unwrap();

    assert_eq!(result.batches.len(), 1);
    let BatchResult::Completed(summary) = &result.batches[0] else {
        panic!("expected a completed batch");
    };
    assert_eq!(summary.copied(), 2);
    assert_eq!(summary.failed(), 1);
    let missing = summary
        .files
        .iter()
        .find(|file| file.path.ends_with("t2m_1990_03.grb"))
        .unwrap();
    assert_matches!(&missing.outcome, TransferOutcome::Failed { reason } if reason.contains("missing"));
    assert_eq!(missing.attempts, 1);

    let copied = fixture.local.path().join("m05/1990/01/t2m_1990_01.grb");
    assert_eq!(
        std::fs::read_to_string(copied).unwrap(),
        "GRIB m05/1990/01/t2m_1990_01.grb"
    );
    assert_eq!(result.failed_files(), 1);
}

#[test]
fn second_fetch_skips_present_files() {
    let fixture = fixture();
    fixture.app.fetch(&request(), None, false, &JsonOutput).unwrap();

    let again = fixture.app.fetch(&request(), None, false, &JsonOutput).unwrap();
    let BatchResult::Completed(summary) = &again.batches[0] else {
        panic!("expected a completed batch");
    };
    assert_eq!(summary.skipped(), 2);
    assert_eq!(summary.copied(), 0);
}

#[test]
fn locate_reports_per_date() {
    let fixture = fixture();
    let report = fixture
        .app
        .locate(&request(), Some(&"disk1".parse().unwrap()), &JsonOutput)
        .unwrap();
    assert_eq!(report.expected_count(), 4);
    assert_eq!(report.found_count(), 3);

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["variables"][0]["status"], "resolved");
    assert_eq!(json["variables"][0]["dates"][0]["preferred"], "disk1");
}

#[test]
fn export_reloads_to_the_same_locations() {
    let fixture = fixture();
    let listing = fixture.app.export();
    let parsed = LocationIndex::parse_concatenated(&listing, None)
        .into_iter()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(parsed.len(), 1);
    assert_eq!(parsed[0].index.id().as_str(), "disk1");
    assert_eq!(parsed[0].index.len(), 3);
    assert_eq!(fixture.app.locations().locations[0].files, 3);
}
