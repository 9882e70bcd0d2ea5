use std::fs::File;
use std::path::{Path, PathBuf};

use csv::{ByteRecord, ReaderBuilder};
use duckdb::{Connection, appender_params_from_iter};
use serde::Serialize;

use crate::cancel::CancelToken;
use crate::error::IngestError;
use crate::schema::{Collision, ColumnMapping, quote_ident};

const CANCEL_CHECK_ROWS: u64 = 8192;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub table: String,
    pub files: usize,
    pub rows: u64,
    pub columns: Vec<String>,
    pub replaced: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub collisions: Vec<Collision>,
}

pub struct TableLoader<'a> {
    conn: &'a mut Connection,
    cancel: CancelToken,
}

impl<'a> TableLoader<'a> {
    pub fn new(conn: &'a mut Connection, cancel: CancelToken) -> Self {
        Self { conn, cancel }
    }

    // One transaction per table: on error the previous table stays as it was.
    pub fn load(&mut self, files: &[PathBuf], table: &str) -> Result<LoadReport, IngestError> {
        let Some(first) = files.first() else {
            tracing::debug!(table, "empty file group, table left untouched");
            return Ok(LoadReport {
                table: table.to_string(),
                files: 0,
                rows: 0,
                columns: Vec::new(),
                replaced: false,
                collisions: Vec::new(),
            });
        };

        let headers = read_header(first, table)?;
        let mapping = ColumnMapping::from_headers(&headers);
        if mapping.is_empty() {
            return Err(IngestError::load(
                table,
                format!("{} has no readable columns", first.display()),
            ));
        }
        for collision in mapping.collisions() {
            tracing::warn!(
                table,
                raw = %collision.raw,
                canonical = %collision.canonical,
                assigned = %collision.assigned,
                "column name collision"
            );
        }

        let tx = self
            .conn
            .transaction()
            .map_err(|err| IngestError::load(table, err))?;
        tx.execute_batch(&mapping.create_table_sql(table))
            .map_err(|err| IngestError::load(table, err))?;

        let mut appended = 0u64;
        {
            let mut appender = tx
                .appender(table)
                .map_err(|err| IngestError::load(table, err))?;
            for file in files {
                appended += append_file(&mut appender, file, table, &mapping, &self.cancel)?;
            }
            appender
                .flush()
                .map_err(|err| IngestError::load(table, err))?;
        }

        let rows: i64 = tx
            .query_row(
                &format!("SELECT COUNT(*) FROM {}", quote_ident(table)),
                [],
                |row| row.get(0),
            )
            .map_err(|err| IngestError::load(table, err))?;
        let rows = u64::try_from(rows).unwrap_or_default();
        if rows != appended {
            return Err(IngestError::load(
                table,
                format!("appended {appended} rows but table holds {rows}"),
            ));
        }
        self.cancel.check()?;
        tx.commit().map_err(|err| IngestError::load(table, err))?;

        tracing::info!(table, rows, files = files.len(), "table replaced");
        Ok(LoadReport {
            table: table.to_string(),
            files: files.len(),
            rows,
            columns: mapping.columns().to_vec(),
            replaced: true,
            collisions: mapping.collisions().to_vec(),
        })
    }
}

fn open_reader(path: &Path, table: &str) -> Result<csv::Reader<File>, IngestError> {
    let file = File::open(path)
        .map_err(|err| IngestError::load(table, format!("open {}: {err}", path.display())))?;
    Ok(ReaderBuilder::new().has_headers(true).from_reader(file))
}

fn decode_record(record: &ByteRecord) -> Vec<String> {
    record
        .iter()
        .map(|field| String::from_utf8_lossy(field).into_owned())
        .collect()
}

fn read_header(path: &Path, table: &str) -> Result<Vec<String>, IngestError> {
    let mut reader = open_reader(path, table)?;
    let headers = reader
        .byte_headers()
        .map_err(|err| IngestError::load(table, format!("{}: {err}", path.display())))?;
    let headers = decode_record(headers);
    if headers.iter().all(|header| header.trim().is_empty()) {
        return Ok(Vec::new());
    }
    Ok(headers)
}

fn append_file(
    appender: &mut duckdb::Appender<'_>,
    path: &Path,
    table: &str,
    mapping: &ColumnMapping,
    cancel: &CancelToken,
) -> Result<u64, IngestError> {
    let mut reader = open_reader(path, table)?;
    let headers = reader
        .byte_headers()
        .map_err(|err| IngestError::load(table, format!("{}: {err}", path.display())))?;
    let headers = decode_record(headers);
    if headers.len() != mapping.width() {
        return Err(IngestError::load(
            table,
            format!(
                "{} has {} columns, expected {}",
                path.display(),
                headers.len(),
                mapping.width()
            ),
        ));
    }
    if !mapping.matches(&headers) {
        tracing::warn!(
            table,
            file = %path.display(),
            expected = %mapping.raw().join(","),
            found = %headers.join(","),
            "header differs from the first file, mapping columns by position"
        );
    }

    let mut rows = 0u64;
    let mut record = ByteRecord::new();
    loop {
        let more = reader
            .read_byte_record(&mut record)
            .map_err(|err| IngestError::load(table, format!("{}: {err}", path.display())))?;
        if !more {
            break;
        }
        let fields = decode_record(&record);
        appender
            .append_row(appender_params_from_iter(
                fields
                    .iter()
                    .map(|field| (!field.is_empty()).then_some(field.as_str())),
            ))
            .map_err(|err| IngestError::load(table, format!("{}: {err}", path.display())))?;
        rows += 1;
        if rows % CANCEL_CHECK_ROWS == 0 {
            cancel.check()?;
        }
    }
    tracing::debug!(table, file = %path.display(), rows, "file appended");
    Ok(rows)
}
