use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum IngestError {
    #[error("unknown dataset family: {0}")]
    #[diagnostic(help("configured families are listed by `govdata plan`"))]
    UnknownFamily(String),

    #[error("unknown dataset key: {0}")]
    #[diagnostic(help("configured dataset keys are listed by `govdata plan`"))]
    UnknownDataset(String),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("download of {url} failed: {message}")]
    Retrieval { url: String, message: String },

    #[error("download of {url} returned status {status}")]
    RetrievalStatus { url: String, status: u16 },

    #[error("failed to expand archive {archive}: {message}")]
    Expansion { archive: PathBuf, message: String },

    #[error("failed to load table {table}: {message}")]
    Load { table: String, message: String },

    #[error("archive not found locally: {0}")]
    #[diagnostic(help("run without --skip-download to fetch it"))]
    MissingArchive(PathBuf),

    #[error("analytical store error: {0}")]
    Store(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("cancelled")]
    Cancelled,
}

impl IngestError {
    pub fn kind(&self) -> &'static str {
        match self {
            IngestError::UnknownFamily(_)
            | IngestError::UnknownDataset(_)
            | IngestError::Configuration(_)
            | IngestError::ConfigRead(_)
            | IngestError::ConfigParse(_) => "configuration",
            IngestError::Retrieval { .. } | IngestError::RetrievalStatus { .. } => "retrieval",
            IngestError::Expansion { .. } => "expansion",
            IngestError::Load { .. } => "load",
            IngestError::MissingArchive(_) => "missing_archive",
            IngestError::Store(_) => "store",
            IngestError::Filesystem(_) => "filesystem",
            IngestError::Cancelled => "cancelled",
        }
    }

    pub fn is_configuration(&self) -> bool {
        self.kind() == "configuration"
    }

    pub(crate) fn expansion(archive: &std::path::Path, message: impl ToString) -> Self {
        IngestError::Expansion {
            archive: archive.to_path_buf(),
            message: message.to_string(),
        }
    }

    pub(crate) fn load(table: &str, message: impl ToString) -> Self {
        IngestError::Load {
            table: table.to_string(),
            message: message.to_string(),
        }
    }
}
