use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum DromaError {
    #[error("invalid dataset id: {0}")]
    InvalidDatasetId(String),

    #[error("invalid molecular type: {0}")]
    InvalidMolecularType(String),

    #[error("invalid data type: {0}")]
    InvalidDataType(String),

    #[error("operation {0} requires a molecular type")]
    MissingMolecularType(String),

    #[error("dataset not loaded: {0}")]
    #[diagnostic(help("load the dataset first, then retry"))]
    DatasetNotFound(String),

    #[error("database file not found: {0}")]
    SourceNotFound(String),

    #[error("no R runtime attached")]
    #[diagnostic(help("install R and make Rscript available on PATH, or set `rscript` in the config"))]
    BridgeUnavailable,

    #[error("{context}: {message}")]
    RuntimeFailure { context: String, message: String },

    #[error("no usable values to audit: {0}")]
    EmptyData(String),

    #[error("no cached data found for key: {0}")]
    CacheEntryNotFound(String),

    #[error("cached artifact cannot be exported: {0}")]
    NotExportable(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("internal state lock poisoned: {0}")]
    StatePoisoned(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    NotFound,
    BridgeUnavailable,
    RuntimeFailure,
    EmptyData,
    InvalidInput,
    Internal,
}

impl DromaError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            DromaError::DatasetNotFound(_)
            | DromaError::SourceNotFound(_)
            | DromaError::CacheEntryNotFound(_) => ErrorCategory::NotFound,
            DromaError::BridgeUnavailable => ErrorCategory::BridgeUnavailable,
            DromaError::RuntimeFailure { .. } => ErrorCategory::RuntimeFailure,
            DromaError::EmptyData(_) => ErrorCategory::EmptyData,
            DromaError::InvalidDatasetId(_)
            | DromaError::InvalidMolecularType(_)
            | DromaError::InvalidDataType(_)
            | DromaError::MissingMolecularType(_)
            | DromaError::NotExportable(_)
            | DromaError::ConfigRead(_)
            | DromaError::ConfigParse(_) => ErrorCategory::InvalidInput,
            DromaError::Filesystem(_) | DromaError::StatePoisoned(_) => ErrorCategory::Internal,
        }
    }
}
