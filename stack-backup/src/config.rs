//! Configuration for the snapshot tool.
//!
//! Loads an optional TOML file, then applies environment overrides (a `.env`
//! file in the working directory is read first). Defaults match the compose
//! deployment: a `mongodb` service and a `metabase` service backed by the
//! `metabase_data` volume.

use crate::archive::ArchiveFormat;
use crate::utils::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub mongo: MongoConfig,

    #[serde(default)]
    pub appstate: AppStateConfig,

    #[serde(default)]
    pub archive: ArchiveConfig,

    #[serde(default)]
    pub compose: ComposeConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoConfig {
    /// Compose service running the data store
    #[serde(default = "default_mongo_service")]
    pub service: String,

    /// Host the native tools connect to, as seen from inside the service
    #[serde(default = "default_mongo_host")]
    pub host: String,

    #[serde(default = "default_mongo_port")]
    pub port: u16,

    #[serde(default = "default_mongo_username")]
    pub username: String,

    #[serde(default = "default_mongo_password")]
    pub password: String,

    /// Logical database captured and restored
    #[serde(default = "default_mongo_database")]
    pub database: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppStateConfig {
    /// Compose service of the analytics application
    #[serde(default = "default_appstate_service")]
    pub service: String,

    /// Volume holding the application state. Empty disables application-state handling.
    #[serde(default = "default_appstate_volume")]
    pub volume: String,

    /// Base URL of the application, polled at `/api/health` after a restore.
    /// Empty disables the health poll.
    #[serde(default = "default_health_url")]
    pub health_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Directory archives are written to and resolved from
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,

    /// Outer archive compression (gzip, zstd)
    #[serde(default)]
    pub compression: ArchiveFormat,

    /// Compression level; the format's default when unset
    #[serde(default)]
    pub compression_level: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposeConfig {
    /// Directory holding the compose project
    #[serde(default = "default_project_dir")]
    pub project_dir: PathBuf,

    /// Compose file, relative to the project directory
    #[serde(default = "default_compose_file")]
    pub compose_file: PathBuf,

    /// Environment file copied into archives for reference
    #[serde(default = "default_env_file")]
    pub env_file: PathBuf,

    /// Container CLI binary
    #[serde(default = "default_docker_bin")]
    pub docker_bin: String,

    /// Image used for one-off volume helper containers
    #[serde(default = "default_helper_image")]
    pub helper_image: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Data store liveness polling during recovery
    #[serde(default = "default_store_retry")]
    pub store: RetryPolicy,

    /// Application health polling after a state restore
    #[serde(default = "default_health_retry")]
    pub health: RetryPolicy,
}

/// Fixed-interval retry with an attempt cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_mongo_service() -> String {
    "mongodb".to_string()
}

fn default_mongo_host() -> String {
    "localhost".to_string()
}

fn default_mongo_port() -> u16 {
    27017
}

fn default_mongo_username() -> String {
    "admin".to_string()
}

fn default_mongo_password() -> String {
    "password123".to_string()
}

fn default_mongo_database() -> String {
    "mongodb".to_string()
}

fn default_appstate_service() -> String {
    "metabase".to_string()
}

fn default_appstate_volume() -> String {
    "metabase_data".to_string()
}

fn default_health_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("./backups")
}

fn default_project_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_compose_file() -> PathBuf {
    PathBuf::from("docker-compose.yml")
}

fn default_env_file() -> PathBuf {
    PathBuf::from(".env")
}

fn default_docker_bin() -> String {
    "docker".to_string()
}

fn default_helper_image() -> String {
    "alpine:3".to_string()
}

fn default_store_retry() -> RetryPolicy {
    RetryPolicy {
        attempts: 30,
        interval_ms: 2000,
    }
}

fn default_health_retry() -> RetryPolicy {
    RetryPolicy {
        attempts: 30,
        interval_ms: 2000,
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for MongoConfig {
    fn default() -> Self {
        Self {
            service: default_mongo_service(),
            host: default_mongo_host(),
            port: default_mongo_port(),
            username: default_mongo_username(),
            password: default_mongo_password(),
            database: default_mongo_database(),
        }
    }
}

impl Default for AppStateConfig {
    fn default() -> Self {
        Self {
            service: default_appstate_service(),
            volume: default_appstate_volume(),
            health_url: default_health_url(),
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            backup_dir: default_backup_dir(),
            compression: ArchiveFormat::default(),
            compression_level: None,
        }
    }
}

impl Default for ComposeConfig {
    fn default() -> Self {
        Self {
            project_dir: default_project_dir(),
            compose_file: default_compose_file(),
            env_file: default_env_file(),
            docker_bin: default_docker_bin(),
            helper_image: default_helper_image(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            store: default_store_retry(),
            health: default_health_retry(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl RetryPolicy {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Config {
    /// Load configuration: TOML file (if given), then `.env`, then process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        let _ = dotenvy::dotenv();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| BackupError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("MONGO_SERVICE") {
            self.mongo.service = v;
        }
        if let Some(v) = lookup("MONGO_HOST") {
            self.mongo.host = v;
        }
        if let Some(v) = lookup("MONGO_PORT") {
            self.mongo.port = v
                .parse()
                .map_err(|_| BackupError::Config(format!("MONGO_PORT is not a port: {v}")))?;
        }
        if let Some(v) = lookup("MONGO_ROOT_USERNAME") {
            self.mongo.username = v;
        }
        if let Some(v) = lookup("MONGO_ROOT_PASSWORD") {
            self.mongo.password = v;
        }
        if let Some(v) = lookup("MONGO_DATABASE") {
            self.mongo.database = v;
        }
        if let Some(v) = lookup("METABASE_SERVICE") {
            self.appstate.service = v;
        }
        if let Some(v) = lookup("METABASE_VOLUME") {
            self.appstate.volume = v;
        }
        if let Some(v) = lookup("METABASE_URL") {
            self.appstate.health_url = v;
        }
        if let Some(v) = lookup("BACKUP_DIR") {
            self.archive.backup_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("BACKUP_COMPRESSION") {
            self.archive.compression = v.parse()?;
        }
        if let Some(v) = lookup("COMPOSE_PROJECT_DIR") {
            self.compose.project_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("COMPOSE_FILE") {
            self.compose.compose_file = PathBuf::from(v);
        }
        if let Some(v) = lookup("LOG_LEVEL") {
            self.log.level = v;
        }
        Ok(())
    }

    /// Application-state settings, if an application volume is configured.
    pub fn appstate(&self) -> Option<&AppStateConfig> {
        if self.appstate.volume.trim().is_empty() {
            None
        } else {
            Some(&self.appstate)
        }
    }
}
