use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use duckdb::Connection;
use serde::Serialize;

use crate::config::{FamilyConfig, ResolvedConfig};
use crate::domain::DatasetKey;
use crate::error::IngestError;
use crate::schema::quote_ident;
use crate::snapshot::SnapshotStamp;

#[derive(Debug, Clone)]
pub struct Store {
    data_root: Utf8PathBuf,
    store_root: Utf8PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableSummary {
    pub name: String,
    pub rows: u64,
    pub columns: u64,
}

impl Store {
    pub fn from_config(config: &ResolvedConfig) -> Self {
        Self::new_with_paths(config.data_root.clone(), config.store_root.clone())
    }

    pub fn new_with_paths(data_root: Utf8PathBuf, store_root: Utf8PathBuf) -> Self {
        Self {
            data_root,
            store_root,
        }
    }

    pub fn data_root(&self) -> &Utf8Path {
        &self.data_root
    }

    pub fn store_root(&self) -> &Utf8Path {
        &self.store_root
    }

    pub fn dataset_dir(&self, key: &DatasetKey) -> Utf8PathBuf {
        self.data_root.join(key.as_str())
    }

    pub fn archive_path(&self, key: &DatasetKey) -> Utf8PathBuf {
        self.dataset_dir(key).join(format!("{key}.zip"))
    }

    pub fn extraction_dir(&self, key: &DatasetKey, stamp: &SnapshotStamp) -> Utf8PathBuf {
        self.dataset_dir(key).join(stamp.as_str())
    }

    pub fn family_store_path(&self, family: &FamilyConfig) -> Utf8PathBuf {
        self.store_root.join(&family.store_file)
    }

    pub fn ensure_roots(&self) -> Result<(), IngestError> {
        for root in [&self.data_root, &self.store_root] {
            fs::create_dir_all(root.as_std_path())
                .map_err(|err| IngestError::Filesystem(format!("create {root}: {err}")))?;
        }
        Ok(())
    }

    pub fn open_family(&self, family: &FamilyConfig) -> Result<Connection, IngestError> {
        let path = self.family_store_path(family);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| IngestError::Filesystem(format!("create {parent}: {err}")))?;
        }
        Connection::open(path.as_std_path())
            .map_err(|err| IngestError::Store(format!("open {path}: {err}")))
    }

    pub fn list_tables(&self, family: &FamilyConfig) -> Result<Vec<TableSummary>, IngestError> {
        if !self.family_store_path(family).as_std_path().exists() {
            return Ok(Vec::new());
        }
        let conn = self.open_family(family)?;
        list_tables(&conn)
    }
}

pub fn list_tables(conn: &Connection) -> Result<Vec<TableSummary>, IngestError> {
    let mut stmt = conn
        .prepare(
            "SELECT t.table_name, COUNT(c.column_name) \
             FROM information_schema.tables t \
             LEFT JOIN information_schema.columns c \
               ON c.table_schema = t.table_schema AND c.table_name = t.table_name \
             WHERE t.table_schema = 'main' AND t.table_type = 'BASE TABLE' \
             GROUP BY t.table_name ORDER BY t.table_name",
        )
        .map_err(|err| IngestError::Store(err.to_string()))?;
    let tables = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })
        .map_err(|err| IngestError::Store(err.to_string()))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| IngestError::Store(err.to_string()))?;

    tables
        .into_iter()
        .map(|(name, columns)| {
            let rows: i64 = conn
                .query_row(
                    &format!("SELECT COUNT(*) FROM {}", quote_ident(&name)),
                    [],
                    |row| row.get(0),
                )
                .map_err(|err| IngestError::Store(err.to_string()))?;
            Ok(TableSummary {
                name,
                rows: u64::try_from(rows).unwrap_or_default(),
                columns: u64::try_from(columns).unwrap_or_default(),
            })
        })
        .collect()
}
