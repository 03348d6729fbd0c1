use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Violations of the archive sink contract, plus I/O failures of the destination.
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Archive state error: {0}")]
    State(String),

    #[error("Archive I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Entry {name} declared {declared} bytes but {written} were written")]
    SizeMismatch {
        name: String,
        declared: u64,
        written: u64,
    },

    #[error("Archive already closed")]
    Closed,
}

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Failed to create staged archive {path}: {cause}")]
    StageCreate {
        path: PathBuf,
        #[source]
        cause: std::io::Error,
    },

    #[error("Failed to close staged archive {path}: {cause}")]
    StageClose {
        path: PathBuf,
        #[source]
        cause: ArchiveError,
    },

    #[error("Source {source_id}: failed to read {path}: {cause}")]
    SourceRead {
        source_id: String,
        path: PathBuf,
        #[source]
        cause: std::io::Error,
    },

    #[error("Source {source_id}: fetch failed: {reason}")]
    SourceFetch { source_id: String, reason: String },

    #[error("Source {source_id}: timed out after {after:?}")]
    SourceTimeout { source_id: String, after: Duration },

    #[error("Source {source_id}: {cause}")]
    Archive {
        source_id: String,
        #[source]
        cause: ArchiveError,
    },

    #[error("Upload rejected for {object}: {reason}")]
    UploadAuth { object: String, reason: String },

    #[error("Upload of {object} failed: {reason}")]
    UploadTransfer { object: String, reason: String },

    #[error("Interrupted by {0}")]
    Interrupted(&'static str),
}

pub type Result<T> = std::result::Result<T, BackupError>;
