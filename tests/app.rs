use std::fs;
use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use chrono::NaiveDate;
use zip::write::SimpleFileOptions;

use govdata_ingest::app::{App, IngestOptions, ProgressEvent, RecordingSink};
use govdata_ingest::cancel::CancelToken;
use govdata_ingest::config::{Config, ConfigLoader, ResolvedConfig};
use govdata_ingest::domain::{DatasetKey, DatasetState, FamilyName, FamilySelector, Layout};
use govdata_ingest::error::IngestError;
use govdata_ingest::retriever::{ArchiveSource, TransferObserver};
use govdata_ingest::snapshot::{Cadence, SnapshotStamp};
use govdata_ingest::store::Store;

fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut buf = Vec::new();
    {
        let mut zip = zip::ZipWriter::new(Cursor::new(&mut buf));
        for (name, content) in entries {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(content).unwrap();
        }
        zip.finish().unwrap();
    }
    buf
}

/// Weekly RCRAInfo layout: one nested zip per table, split into parts.
fn hd_archive() -> Vec<u8> {
    let handler = zip_bytes(&[
        ("HD_HANDLER_1.csv", b"Handler ID,Facility Name\nTX1,Acme\nTX2,Bolt\n"),
        ("HD_HANDLER_2.csv", b"handler_id,facility_name\nCA3,Core\n"),
    ]);
    let naics = zip_bytes(&[("HD_NAICS.csv", b"Handler ID,NAICS Code\nTX1,332813\n")]);
    zip_bytes(&[("HD_HANDLER.zip", &handler), ("HD_NAICS.zip", &naics)])
}

fn air_archive() -> Vec<u8> {
    zip_bytes(&[
        ("ICIS-AIR_FACILITIES.csv", b"PGM_SYS_ID,FACILITY_NAME\nA1,Plant\nA2,Mill\n"),
        ("ICIS-AIR_POLLUTANTS.csv", b"PGM_SYS_ID,POLLUTANT_CODE\nA1,CO\n"),
    ])
}

/// Serves fixture archives by URL file name and records every call.
#[derive(Default)]
struct FixtureSource {
    archives: Vec<(&'static str, Vec<u8>)>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl FixtureSource {
    fn with(mut self, name: &'static str, bytes: Vec<u8>) -> Self {
        self.archives.push((name, bytes));
        self
    }

    fn call_log(&self) -> Arc<Mutex<Vec<String>>> {
        self.calls.clone()
    }
}

impl ArchiveSource for FixtureSource {
    fn fetch(
        &self,
        url: &str,
        destination: &Path,
        observer: TransferObserver<'_>,
        _cancel: &CancelToken,
    ) -> Result<u64, IngestError> {
        self.calls.lock().unwrap().push(url.to_string());
        let Some((_, bytes)) = self.archives.iter().find(|(name, _)| url.ends_with(name)) else {
            return Err(IngestError::RetrievalStatus {
                url: url.to_string(),
                status: 404,
            });
        };
        fs::create_dir_all(destination.parent().unwrap()).unwrap();
        fs::write(destination, bytes).unwrap();
        let len = bytes.len() as u64;
        observer(len, Some(len));
        Ok(len)
    }
}

fn config(root: &Path) -> ResolvedConfig {
    let json = format!(
        r#"{{
          "data_root": "{data}",
          "store_root": "{db}",
          "families": [
            {{
              "name": "rcrainfo",
              "store": "rcrainfo.duckdb",
              "layout": "subdirectories",
              "datasets": {{
                "ce": "https://example.test/CSV-{{date}}/CE.zip",
                "hd": "https://example.test/CSV-{{date}}/HD.zip"
              }}
            }},
            {{
              "name": "echo",
              "store": "echo.duckdb",
              "layout": "file_per_table",
              "datasets": {{ "air": "https://example.test/ICIS-AIR_downloads.zip" }}
            }}
          ]
        }}"#,
        data = root.join("raw").display(),
        db = root.join("db").display(),
    );
    let config: Config = serde_json::from_str(&json).unwrap();
    ConfigLoader::resolve_config(config).unwrap()
}

fn stamp() -> SnapshotStamp {
    Cadence::default().stamp_for(NaiveDate::from_ymd_opt(2025, 6, 4).unwrap())
}

fn key(raw: &str) -> DatasetKey {
    raw.parse().unwrap()
}

fn rcrainfo() -> FamilySelector {
    FamilySelector::Named(FamilyName::new("rcrainfo"))
}

#[test]
fn ingest_loads_both_layouts() {
    let temp = tempfile::tempdir().unwrap();
    let source = FixtureSource::default()
        .with("HD.zip", hd_archive())
        .with("ICIS-AIR_downloads.zip", air_archive());
    let app = App::new(config(temp.path()), source);
    let sink = RecordingSink::default();

    let report = app
        .ingest(
            &FamilySelector::All,
            &[key("hd"), key("air")],
            &stamp(),
            &IngestOptions::default(),
            &sink,
        )
        .unwrap();

    assert!(!report.has_failures());
    assert_eq!(report.datasets.len(), 2);
    assert_eq!(report.tables_ingested, 4);
    assert_eq!(report.total_rows, 3 + 1 + 2 + 1);

    let hd = &report.datasets[0];
    assert_eq!(hd.state, DatasetState::Loaded);
    assert_eq!(hd.url, "https://example.test/CSV-2025-06-02T03-00-00-0400/HD.zip");
    let tables = hd.tables.iter().map(|t| t.table.as_str()).collect::<Vec<_>>();
    assert_eq!(tables, vec!["hd_handler", "hd_naics"]);
    assert_eq!(hd.tables[0].rows, 3);
    assert_eq!(hd.tables[0].columns, vec!["handler_id", "facility_name"]);

    let store = app.store();
    let rcra = app.config().family(&FamilyName::new("rcrainfo")).unwrap();
    let listed = store.list_tables(rcra).unwrap();
    assert_eq!(listed.len(), 2);
    let echo = app.config().family(&FamilyName::new("echo")).unwrap();
    let listed = store.list_tables(echo).unwrap();
    let names = listed.iter().map(|t| t.name.as_str()).collect::<Vec<_>>();
    assert_eq!(names, vec!["icis_air_facilities", "icis_air_pollutants"]);

    // Nothing of the raw side survives a successful run.
    assert!(!store.archive_path(&key("hd")).exists());
    assert!(!store.extraction_dir(&key("hd"), &stamp()).exists());

    let finished = sink
        .events()
        .into_iter()
        .filter(|event| matches!(event, ProgressEvent::Finished { failed: false, .. }))
        .count();
    assert_eq!(finished, 2);
    assert!(
        sink.events()
            .iter()
            .any(|event| matches!(event, ProgressEvent::Transfer { .. }))
    );
}

#[test]
fn one_failure_does_not_stop_the_batch() {
    let temp = tempfile::tempdir().unwrap();
    let source = FixtureSource::default().with("HD.zip", hd_archive());
    let calls = source.call_log();
    let app = App::new(config(temp.path()), source);

    let report = app
        .ingest(
            &rcrainfo(),
            &[],
            &stamp(),
            &IngestOptions::default(),
            &RecordingSink::default(),
        )
        .unwrap();

    assert!(report.has_failures());
    assert_eq!(report.failed, 1);
    let ce = &report.datasets[0];
    assert_eq!(ce.dataset, "ce");
    assert_eq!(ce.state, DatasetState::Failed);
    assert_eq!(ce.failed_after, Some(DatasetState::Pending));
    assert_eq!(ce.error.as_ref().unwrap().kind, "retrieval");

    let hd = &report.datasets[1];
    assert_eq!(hd.state, DatasetState::Loaded);
    assert_eq!(hd.rows, 4);
    assert_eq!(calls.lock().unwrap().len(), 2);
}

#[test]
fn skip_download_without_archive_makes_no_fetch() {
    let temp = tempfile::tempdir().unwrap();
    let source = FixtureSource::default().with("HD.zip", hd_archive());
    let calls = source.call_log();
    let app = App::new(config(temp.path()), source);
    let options = IngestOptions {
        skip_download: true,
        ..IngestOptions::default()
    };

    let report = app
        .ingest(&rcrainfo(), &[key("hd")], &stamp(), &options, &RecordingSink::default())
        .unwrap();

    let hd = &report.datasets[0];
    assert_eq!(hd.state, DatasetState::Failed);
    assert_eq!(hd.error.as_ref().unwrap().kind, "missing_archive");
    assert_eq!(hd.bytes_downloaded, None);
    assert!(calls.lock().unwrap().is_empty());
}

#[test]
fn skip_download_reuses_local_archive() {
    let temp = tempfile::tempdir().unwrap();
    let config = config(temp.path());
    let store = Store::from_config(&config);
    let archive = store.archive_path(&key("hd"));
    fs::create_dir_all(archive.parent().unwrap()).unwrap();
    fs::write(&archive, hd_archive()).unwrap();

    let source = FixtureSource::default();
    let calls = source.call_log();
    let app = App::new(config, source);
    let options = IngestOptions {
        skip_download: true,
        keep_archive: true,
        keep_extracted: true,
    };
    let report = app
        .ingest(&rcrainfo(), &[key("hd")], &stamp(), &options, &RecordingSink::default())
        .unwrap();

    assert!(!report.has_failures());
    assert_eq!(report.datasets[0].rows, 4);
    assert!(calls.lock().unwrap().is_empty());
    assert!(archive.exists());
    assert!(
        store
            .extraction_dir(&key("hd"), &stamp())
            .join("HD_HANDLER/HD_HANDLER_1.csv")
            .exists()
    );
}

#[test]
fn expansion_failure_keeps_archive_for_retry() {
    let temp = tempfile::tempdir().unwrap();
    let source = FixtureSource::default().with("HD.zip", b"not a zip at all".to_vec());
    let app = App::new(config(temp.path()), source);

    let report = app
        .ingest(
            &rcrainfo(),
            &[key("hd")],
            &stamp(),
            &IngestOptions::default(),
            &RecordingSink::default(),
        )
        .unwrap();

    let hd = &report.datasets[0];
    assert_eq!(hd.error.as_ref().unwrap().kind, "expansion");
    assert_eq!(hd.failed_after, Some(DatasetState::Downloaded));
    assert!(app.store().archive_path(&key("hd")).exists());
    assert!(!app.store().extraction_dir(&key("hd"), &stamp()).exists());
}

#[test]
fn unknown_key_fails_before_any_fetch() {
    let temp = tempfile::tempdir().unwrap();
    let source = FixtureSource::default();
    let calls = source.call_log();
    let app = App::new(config(temp.path()), source);

    let err = app
        .ingest(
            &FamilySelector::All,
            &[key("hd"), key("nope")],
            &stamp(),
            &IngestOptions::default(),
            &RecordingSink::default(),
        )
        .unwrap_err();
    assert_matches!(err, IngestError::UnknownDataset(ref k) if k == "nope");
    assert!(calls.lock().unwrap().is_empty());
}

#[test]
fn cancelled_run_attempts_nothing() {
    let temp = tempfile::tempdir().unwrap();
    let cancel = CancelToken::new();
    cancel.cancel();
    let source = FixtureSource::default().with("HD.zip", hd_archive());
    let calls = source.call_log();
    let app = App::new(config(temp.path()), source).with_cancel(cancel);

    let report = app
        .ingest(
            &rcrainfo(),
            &[],
            &stamp(),
            &IngestOptions::default(),
            &RecordingSink::default(),
        )
        .unwrap();

    assert_eq!(report.failed, 2);
    assert!(
        report
            .datasets
            .iter()
            .all(|d| d.error.as_ref().unwrap().kind == "cancelled")
    );
    assert!(calls.lock().unwrap().is_empty());
}

#[test]
fn plan_resolves_urls_and_paths() {
    let temp = tempfile::tempdir().unwrap();
    let app = App::new(config(temp.path()), FixtureSource::default());

    let plan = app.plan(&FamilySelector::All, &[], &stamp()).unwrap();
    assert_eq!(plan.stamp, "2025-06-02T03-00-00-0400");
    assert_eq!(plan.entries.len(), 3);

    let hd = plan.entries.iter().find(|e| e.dataset == "hd").unwrap();
    assert_eq!(hd.layout, Layout::Subdirectories);
    assert_eq!(hd.url, "https://example.test/CSV-2025-06-02T03-00-00-0400/HD.zip");
    let raw = Utf8PathBuf::from_path_buf(temp.path().join("raw")).unwrap();
    assert_eq!(hd.archive_path, raw.join("hd/hd.zip").as_str());
    assert_eq!(
        hd.extraction_dir,
        raw.join("hd/2025-06-02T03-00-00-0400").as_str()
    );
    assert!(hd.store_path.ends_with("rcrainfo.duckdb"));

    let air = plan.entries.iter().find(|e| e.dataset == "air").unwrap();
    assert_eq!(air.layout, Layout::FilePerTable);

    // Planning touches nothing on disk.
    assert!(!temp.path().join("raw").exists());
}
