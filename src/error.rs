use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

use crate::window::WindowRejection;

#[derive(Debug, Error, Diagnostic)]
pub enum KiraError {
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("invalid dataset kind: {0}")]
    InvalidDatasetKind(String),

    #[error("missing config file kira-cg.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid config: {0}")]
    ConfigInvalid(String),

    #[error("unreadable input {path}: {reason}")]
    InputUnreadable { path: PathBuf, reason: String },

    #[error("atlas unavailable: {0}")]
    AtlasUnavailable(String),

    #[error("trial window rejected: {0}")]
    TrialWindowInvalid(WindowRejection),

    #[error("dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("time series extraction failed: {0}")]
    Extraction(String),

    #[error("time series extraction exceeded {secs}s")]
    ExtractionTimeout { secs: u64 },

    #[error("no label available: {0}")]
    LabelUnavailable(String),

    #[error("invalid matrix: {0}")]
    InvalidMatrix(String),

    #[error("invalid record {path}: {reason}")]
    InvalidRecord { path: PathBuf, reason: String },

    #[error("output directory not writable: {0}")]
    OutputUnwritable(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl KiraError {
    pub fn unreadable(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        KiraError::InputUnreadable {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}
