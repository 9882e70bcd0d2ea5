use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use duckdb::Connection;
use serde::Serialize;

use crate::cancel::CancelToken;
use crate::config::{DatasetDescriptor, FamilyConfig, ResolvedConfig};
use crate::domain::{DatasetKey, DatasetState, FamilySelector, Layout};
use crate::error::IngestError;
use crate::fs_util::{self, ExtractionWorkspace};
use crate::loader::{LoadReport, TableLoader};
use crate::retriever::ArchiveSource;
use crate::schema::{claim_unique, normalize};
use crate::snapshot::SnapshotStamp;
use crate::store::{Store, TableSummary};

#[derive(Debug, Clone, Default)]
pub struct IngestOptions {
    pub skip_download: bool,
    pub keep_archive: bool,
    pub keep_extracted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorSummary {
    pub kind: String,
    pub message: String,
}

impl From<&IngestError> for ErrorSummary {
    fn from(err: &IngestError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DatasetOutcome {
    pub family: String,
    pub dataset: String,
    pub stamp: String,
    pub url: String,
    pub state: DatasetState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_after: Option<DatasetState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_downloaded: Option<u64>,
    pub tables: Vec<LoadReport>,
    pub rows: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorSummary>,
    pub elapsed_ms: u128,
}

impl DatasetOutcome {
    fn pending(family: &FamilyConfig, descriptor: &DatasetDescriptor, stamp: &SnapshotStamp) -> Self {
        Self {
            family: family.name.to_string(),
            dataset: descriptor.key.to_string(),
            stamp: stamp.to_string(),
            url: stamp.apply(&descriptor.url_template),
            state: DatasetState::Pending,
            failed_after: None,
            bytes_downloaded: None,
            tables: Vec::new(),
            rows: 0,
            error: None,
            elapsed_ms: 0,
        }
    }

    fn fail(&mut self, err: &IngestError) {
        self.failed_after = Some(self.state);
        self.state = DatasetState::Failed;
        self.error = Some(ErrorSummary::from(err));
    }

    pub fn is_failed(&self) -> bool {
        self.state == DatasetState::Failed
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub stamp: String,
    pub datasets: Vec<DatasetOutcome>,
    pub tables_ingested: usize,
    pub total_rows: u64,
    pub failed: usize,
}

impl IngestReport {
    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanEntry {
    pub family: String,
    pub dataset: String,
    pub layout: Layout,
    pub url: String,
    pub archive_path: String,
    pub extraction_dir: String,
    pub store_path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanResult {
    pub stamp: String,
    pub entries: Vec<PlanEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FamilyTables {
    pub family: String,
    pub store_path: String,
    pub tables: Vec<TableSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TablesResult {
    pub families: Vec<FamilyTables>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileGroup {
    pub table: String,
    pub files: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub enum ProgressEvent {
    State {
        dataset: String,
        state: DatasetState,
        message: String,
    },
    Transfer {
        dataset: String,
        written: u64,
        total: Option<u64>,
    },
    Table {
        dataset: String,
        table: String,
        rows: u64,
    },
    Finished {
        dataset: String,
        failed: bool,
        message: String,
        elapsed: Duration,
    },
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

pub struct App<S: ArchiveSource> {
    config: ResolvedConfig,
    store: Store,
    source: S,
    cancel: CancelToken,
}

impl<S: ArchiveSource> App<S> {
    pub fn new(config: ResolvedConfig, source: S) -> Self {
        let store = Store::from_config(&config);
        Self {
            config,
            store,
            source,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn current_stamp(&self) -> SnapshotStamp {
        self.config.cadence.current()
    }

    pub fn plan(
        &self,
        selector: &FamilySelector,
        keys: &[DatasetKey],
        stamp: &SnapshotStamp,
    ) -> Result<PlanResult, IngestError> {
        let selection = self.config.select(selector, keys)?;
        let mut entries = Vec::new();
        for (family, datasets) in selection {
            for descriptor in datasets {
                entries.push(PlanEntry {
                    family: family.name.to_string(),
                    dataset: descriptor.key.to_string(),
                    layout: descriptor.layout,
                    url: stamp.apply(&descriptor.url_template),
                    archive_path: self.store.archive_path(&descriptor.key).to_string(),
                    extraction_dir: self
                        .store
                        .extraction_dir(&descriptor.key, stamp)
                        .to_string(),
                    store_path: self.store.family_store_path(family).to_string(),
                });
            }
        }
        Ok(PlanResult {
            stamp: stamp.to_string(),
            entries,
        })
    }

    pub fn tables(&self, selector: &FamilySelector) -> Result<TablesResult, IngestError> {
        let selection = self.config.select(selector, &[])?;
        let families = selection
            .into_iter()
            .map(|(family, _)| {
                Ok(FamilyTables {
                    family: family.name.to_string(),
                    store_path: self.store.family_store_path(family).to_string(),
                    tables: self.store.list_tables(family)?,
                })
            })
            .collect::<Result<Vec<_>, IngestError>>()?;
        Ok(TablesResult { families })
    }

    pub fn ingest(
        &self,
        selector: &FamilySelector,
        keys: &[DatasetKey],
        stamp: &SnapshotStamp,
        options: &IngestOptions,
        sink: &dyn ProgressSink,
    ) -> Result<IngestReport, IngestError> {
        let selection = self.config.select(selector, keys)?;
        self.store.ensure_roots()?;

        let mut outcomes = Vec::new();
        for (family, datasets) in selection {
            tracing::info!(family = %family.name, datasets = datasets.len(), "ingesting family");
            let mut conn = match self.store.open_family(family) {
                Ok(conn) => Some(conn),
                Err(err) => {
                    tracing::error!(family = %family.name, "{err}");
                    for descriptor in &datasets {
                        let mut outcome = DatasetOutcome::pending(family, descriptor, stamp);
                        outcome.fail(&err);
                        self.finish(&outcome, sink);
                        outcomes.push(outcome);
                    }
                    None
                }
            };
            let Some(conn) = conn.as_mut() else {
                continue;
            };

            for descriptor in datasets {
                let started = Instant::now();
                let mut outcome = DatasetOutcome::pending(family, descriptor, stamp);
                let result = match self.cancel.check() {
                    Ok(()) => self.run_dataset(conn, descriptor, stamp, options, sink, &mut outcome),
                    Err(err) => Err(err),
                };
                if let Err(err) = result {
                    outcome.fail(&err);
                }
                outcome.elapsed_ms = started.elapsed().as_millis();
                self.finish(&outcome, sink);
                outcomes.push(outcome);
            }
        }

        let tables_ingested = outcomes
            .iter()
            .flat_map(|outcome| outcome.tables.iter())
            .filter(|table| table.replaced)
            .count();
        let total_rows = outcomes.iter().map(|outcome| outcome.rows).sum();
        let failed = outcomes.iter().filter(|outcome| outcome.is_failed()).count();
        tracing::info!(tables_ingested, total_rows, failed, "ingestion finished");

        Ok(IngestReport {
            stamp: stamp.to_string(),
            datasets: outcomes,
            tables_ingested,
            total_rows,
            failed,
        })
    }

    fn run_dataset(
        &self,
        conn: &mut Connection,
        descriptor: &DatasetDescriptor,
        stamp: &SnapshotStamp,
        options: &IngestOptions,
        sink: &dyn ProgressSink,
        outcome: &mut DatasetOutcome,
    ) -> Result<(), IngestError> {
        let key = &descriptor.key;
        let archive = self.store.archive_path(key);
        let archive = archive.as_std_path();
        tracing::info!(dataset = %key, %stamp, "snapshot resolved");

        if options.skip_download {
            if !archive.exists() {
                return Err(IngestError::MissingArchive(archive.to_path_buf()));
            }
            self.state(sink, key, DatasetState::Pending, "validating local archive");
            fs_util::validate_zip(archive)?;
        } else {
            self.state(
                sink,
                key,
                DatasetState::Pending,
                &format!("downloading {}", outcome.url),
            );
            let dataset = key.to_string();
            let observer = |written: u64, total: Option<u64>| {
                sink.event(ProgressEvent::Transfer {
                    dataset: dataset.clone(),
                    written,
                    total,
                });
            };
            let bytes = self
                .source
                .fetch(&outcome.url, archive, &observer, &self.cancel)?;
            outcome.bytes_downloaded = Some(bytes);
        }
        outcome.state = DatasetState::Downloaded;

        let mut workspace =
            ExtractionWorkspace::create(self.store.extraction_dir(key, stamp).as_std_path())?;
        self.state(sink, key, DatasetState::Downloaded, "expanding archive");
        let nested = fs_util::expand(archive, workspace.path(), &self.cancel)?;
        tracing::debug!(dataset = %key, nested, "archive expanded");
        outcome.state = DatasetState::Expanded;

        let groups = discover_groups(workspace.path(), key, descriptor.layout)?;
        self.state(
            sink,
            key,
            DatasetState::Expanded,
            &format!("loading {} file groups", groups.len()),
        );
        let mut loader = TableLoader::new(conn, self.cancel.clone());
        for group in &groups {
            let report = loader.load(&group.files, &group.table)?;
            if report.replaced {
                sink.event(ProgressEvent::Table {
                    dataset: key.to_string(),
                    table: report.table.clone(),
                    rows: report.rows,
                });
            }
            outcome.rows += report.rows;
            outcome.tables.push(report);
        }
        outcome.state = DatasetState::Loaded;

        if options.keep_extracted {
            workspace.keep();
        }
        drop(workspace);
        if !options.keep_archive {
            fs::remove_file(archive).map_err(|err| IngestError::Filesystem(err.to_string()))?;
        }
        Ok(())
    }

    fn state(&self, sink: &dyn ProgressSink, key: &DatasetKey, state: DatasetState, message: &str) {
        tracing::debug!(dataset = %key, %state, "{message}");
        sink.event(ProgressEvent::State {
            dataset: key.to_string(),
            state,
            message: message.to_string(),
        });
    }

    fn finish(&self, outcome: &DatasetOutcome, sink: &dyn ProgressSink) {
        let loaded = outcome.tables.iter().filter(|t| t.replaced).count();
        let message = match &outcome.error {
            None => {
                tracing::info!(
                    dataset = %outcome.dataset,
                    tables = loaded,
                    rows = outcome.rows,
                    "dataset loaded"
                );
                format!("{loaded} tables, {} rows", outcome.rows)
            }
            Some(error) => {
                tracing::error!(
                    dataset = %outcome.dataset,
                    kind = %error.kind,
                    "dataset failed: {}",
                    error.message
                );
                format!("{}: {}", error.kind, error.message)
            }
        };
        sink.event(ProgressEvent::Finished {
            dataset: outcome.dataset.clone(),
            failed: outcome.is_failed(),
            message,
            elapsed: Duration::from_millis(u64::try_from(outcome.elapsed_ms).unwrap_or(u64::MAX)),
        });
    }
}

fn csv_files(dir: &Path) -> Result<Vec<PathBuf>, IngestError> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(|err| IngestError::Filesystem(err.to_string()))? {
        let path = entry
            .map_err(|err| IngestError::Filesystem(err.to_string()))?
            .path();
        if path.is_file() && fs_util::has_extension(&path, "csv") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn subdirectories(dir: &Path) -> Result<Vec<PathBuf>, IngestError> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(dir).map_err(|err| IngestError::Filesystem(err.to_string()))? {
        let path = entry
            .map_err(|err| IngestError::Filesystem(err.to_string()))?
            .path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn unloaded_root_files(root: &Path, dirs: &[PathBuf]) -> Result<Vec<PathBuf>, IngestError> {
    if dirs.is_empty() {
        return Ok(Vec::new());
    }
    csv_files(root)
}

fn table_name(taken: &mut HashSet<String>, raw: &str, fallback: &str) -> String {
    let mut name = normalize(raw);
    if name.is_empty() {
        name = normalize(fallback);
    }
    claim_unique(taken, &name)
}

pub fn discover_groups(
    root: &Path,
    key: &DatasetKey,
    layout: Layout,
) -> Result<Vec<FileGroup>, IngestError> {
    let mut taken = HashSet::new();
    let mut groups = Vec::new();
    match layout {
        Layout::Subdirectories => {
            let dirs = subdirectories(root)?;
            let stray = unloaded_root_files(root, &dirs)?;
            if !stray.is_empty() {
                let names = stray
                    .iter()
                    .filter_map(|path| path.file_name())
                    .map(|name| name.to_string_lossy().into_owned())
                    .collect::<Vec<_>>();
                tracing::warn!(
                    dataset = %key,
                    files = %names.join(", "),
                    "csv files beside table directories are not loaded"
                );
            }
            if dirs.is_empty() {
                groups.push(FileGroup {
                    table: table_name(&mut taken, key.as_str(), "dataset"),
                    files: csv_files(root)?,
                });
            }
            for dir in dirs {
                let raw = dir
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default();
                groups.push(FileGroup {
                    table: table_name(&mut taken, &raw, key.as_str()),
                    files: csv_files(&dir)?,
                });
            }
        }
        Layout::FilePerTable => {
            for path in fs_util::walk_dir(root)? {
                if !path.is_file() || !fs_util::has_extension(&path, "csv") {
                    continue;
                }
                let stem = path
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let table = table_name(&mut taken, &stem, key.as_str());
                if table != normalize(&stem) {
                    tracing::warn!(
                        file = %path.display(),
                        table = %table,
                        "duplicate table name, suffixed"
                    );
                }
                groups.push(FileGroup {
                    table,
                    files: vec![path],
                });
            }
        }
    }
    Ok(groups)
}

#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl ProgressSink for RecordingSink {
    fn event(&self, event: ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "a\n1\n").unwrap();
    }

    #[test]
    fn subdirectories_become_tables() {
        let temp = tempfile::tempdir().unwrap();
        touch(&temp.path().join("HD_HANDLER/b.csv"));
        touch(&temp.path().join("HD_HANDLER/a.CSV"));
        touch(&temp.path().join("HD_HANDLER/readme.txt"));
        touch(&temp.path().join("HD Reporting/x.csv"));
        let key: DatasetKey = "hd".parse().unwrap();

        let groups = discover_groups(temp.path(), &key, Layout::Subdirectories).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].table, "hd_reporting");
        assert_eq!(groups[1].table, "hd_handler");
        assert_eq!(groups[1].files.len(), 2);
        assert!(groups[1].files[0].ends_with("a.CSV"));
    }

    #[test]
    fn root_csv_beside_subdirectories_is_reported_not_loaded() {
        let temp = tempfile::tempdir().unwrap();
        touch(&temp.path().join("HD_HANDLER/a.csv"));
        touch(&temp.path().join("manifest.csv"));
        let key: DatasetKey = "hd".parse().unwrap();

        let groups = discover_groups(temp.path(), &key, Layout::Subdirectories).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].table, "hd_handler");

        let dirs = subdirectories(temp.path()).unwrap();
        let stray = unloaded_root_files(temp.path(), &dirs).unwrap();
        assert_eq!(stray, vec![temp.path().join("manifest.csv")]);
        assert!(unloaded_root_files(temp.path(), &[]).unwrap().is_empty());
    }

    #[test]
    fn flat_tree_is_one_group_named_after_dataset() {
        let temp = tempfile::tempdir().unwrap();
        touch(&temp.path().join("one.csv"));
        touch(&temp.path().join("two.csv"));
        let key: DatasetKey = "fa".parse().unwrap();

        let groups = discover_groups(temp.path(), &key, Layout::Subdirectories).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].table, "fa");
        assert_eq!(groups[0].files.len(), 2);
    }

    #[test]
    fn file_per_table_suffixes_duplicate_stems() {
        let temp = tempfile::tempdir().unwrap();
        touch(&temp.path().join("2024/ICIS-AIR_FACILITIES.csv"));
        touch(&temp.path().join("2025/icis air facilities.csv"));
        touch(&temp.path().join("ICIS-AIR_POLLUTANTS.csv"));
        let key: DatasetKey = "air".parse().unwrap();

        let groups = discover_groups(temp.path(), &key, Layout::FilePerTable).unwrap();
        let names = groups.iter().map(|g| g.table.as_str()).collect::<Vec<_>>();
        assert_eq!(
            names,
            vec![
                "icis_air_facilities",
                "icis_air_facilities_2",
                "icis_air_pollutants"
            ]
        );
    }
}
