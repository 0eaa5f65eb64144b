//! Paths inside an archive. These are a compatibility contract with existing
//! archives; do not rename.

use std::path::{Path, PathBuf};

pub const MANIFEST: &str = "backup_info.txt";

/// Parent of the per-database export directories.
pub const STRUCTURED_DIR: &str = "mongodb/backup";

pub const USERS: &str = "mongodb/users/users.json";

pub const APPSTATE: &str = "metabase_data.tar.gz";

pub const ENV_COPY: &str = "env_backup";

pub const COMPOSE_COPY: &str = "docker-compose_backup.yml";

pub fn database_dir(root: &Path, database: &str) -> PathBuf {
    root.join(STRUCTURED_DIR).join(database)
}
