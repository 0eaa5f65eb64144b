//! Utility modules for the snapshot tool.

pub mod errors;
pub mod logger;
pub mod prompt;
pub mod retry;

pub use errors::{BackupError, Result};
