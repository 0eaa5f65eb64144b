//! Snapshot workflows.
//!
//! Both directions run strictly in sequence: every step waits for its
//! external command before the next one starts. Neither takes a lock; the
//! operator must not run two of them against the same deployment at once.

pub mod capture;
pub mod recover;

pub use capture::{Capture, CaptureReport};
pub use recover::{AppStateOutcome, OpenedArchive, Recovery, RecoveryReport};

use crate::utils::{BackupError, Result};

/// Service-local directory a capture dumps into.
fn service_dump_dir(name: &str) -> String {
    format!("/tmp/stack-backup-{name}")
}

/// Service-local directory a recovery copies the export into.
fn service_restore_dir(name: &str) -> String {
    format!("/tmp/stack-restore-{name}")
}

/// Run blocking archive I/O off the async runtime.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BackupError::Io(std::io::Error::other(e)))?
}
