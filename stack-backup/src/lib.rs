//! Stack Backup Library
//!
//! Point-in-time snapshots of a compose deployment running a MongoDB data
//! store and a Metabase analytics application, and full-replacement recovery
//! from those snapshots.

pub mod appstate;
pub mod archive;
pub mod config;
pub mod executor;
pub mod import;
pub mod orchestrator;
pub mod shutdown;
pub mod store;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::BackupError;
pub use utils::Result;
