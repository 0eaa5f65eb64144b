//! Error types for the snapshot and recovery workflow.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    /// Data store or application did not answer after bounded retries.
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Manifest missing, unreadable, or inconsistent with the archive layout.
    #[error("Corrupt archive: {0}")]
    CorruptArchive(String),

    /// The operator declined a destructive confirmation.
    #[error("Operation declined by operator")]
    PreconditionDeclined,

    /// Ancillary metadata could not be collected. Never fatal.
    #[error("Diagnostic collection failed: {0}")]
    DiagnosticCollectionFailed(String),

    #[error("Command `{command}` failed with exit code {code}: {stderr}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("Archive not found: {0}")]
    ArchiveNotFound(String),

    #[error("Archive already exists: {0}")]
    ArchiveExists(String),

    #[error("Invalid archive name: {0}")]
    InvalidName(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl BackupError {
    /// Process exit code for this error.
    ///
    /// Precondition failures and declined confirmations exit with 1, failures
    /// of a workflow step exit with 2.
    pub fn exit_code(&self) -> i32 {
        match self {
            BackupError::ServiceUnavailable(_)
            | BackupError::PreconditionDeclined
            | BackupError::ArchiveNotFound(_)
            | BackupError::ArchiveExists(_)
            | BackupError::InvalidName(_)
            | BackupError::Config(_) => 1,
            _ => 2,
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
