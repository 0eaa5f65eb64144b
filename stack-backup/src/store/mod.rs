//! Data store operations.
//!
//! Every operation runs one of the store's own command-line tools inside the
//! data store service through the orchestrator, so the host needs nothing but
//! the container CLI.

pub mod scripts;

use crate::config::MongoConfig;
use crate::orchestrator::{argv, ExecOutput, Orchestrator};
use crate::utils::{BackupError, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Database holding the store's users and roles.
pub const ADMIN_DATABASE: &str = "admin";

/// Document count of one collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionCount {
    pub name: String,
    pub count: u64,
}

/// Index to create on a single field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexSpec<'a> {
    pub field: &'a str,
    pub unique: bool,
    pub sparse: bool,
}

impl<'a> IndexSpec<'a> {
    pub fn field(field: &'a str) -> Self {
        Self {
            field,
            unique: false,
            sparse: false,
        }
    }
}

/// Client for the document store running in a compose service.
pub struct MongoStore<'a, O> {
    orchestrator: &'a O,
    config: &'a MongoConfig,
}

impl<'a, O: Orchestrator> MongoStore<'a, O> {
    pub fn new(orchestrator: &'a O, config: &'a MongoConfig) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    pub fn service(&self) -> &str {
        &self.config.service
    }

    fn connection_args(&self) -> Vec<String> {
        argv([
            "--host".to_string(),
            self.config.host.clone(),
            "--port".to_string(),
            self.config.port.to_string(),
            "--username".to_string(),
            self.config.username.clone(),
            "--password".to_string(),
            self.config.password.clone(),
            "--authenticationDatabase".to_string(),
            ADMIN_DATABASE.to_string(),
        ])
    }

    fn tool_command(&self, tool: &str, args: &[&str]) -> Vec<String> {
        let mut cmd = vec![tool.to_string()];
        cmd.extend(self.connection_args());
        cmd.extend(args.iter().map(|a| a.to_string()));
        cmd
    }

    async fn run(&self, command: Vec<String>) -> Result<ExecOutput> {
        self.orchestrator
            .exec(self.service(), &command)
            .await?
            .check(&command)
    }

    /// Evaluate a shell script against `database` and return its trimmed stdout.
    pub async fn eval(&self, database: &str, script: &str) -> Result<String> {
        let cmd = self.tool_command("mongosh", &["--quiet", "--eval", script, database]);
        let output = self.run(cmd).await?;
        Ok(output.stdout.trim().to_string())
    }

    /// Lightweight liveness probe.
    pub async fn ping(&self) -> Result<()> {
        match self.eval(ADMIN_DATABASE, scripts::PING).await {
            Ok(out) if out.lines().last().map(str::trim) == Some("1") => Ok(()),
            Ok(out) => Err(BackupError::ServiceUnavailable(format!(
                "{} answered ping with {:?}",
                self.service(),
                out
            ))),
            Err(e) => Err(BackupError::ServiceUnavailable(format!(
                "{} did not answer ping: {}",
                self.service(),
                e
            ))),
        }
    }

    /// Export `database` into `out_dir` inside the service (`out_dir/<database>/...`).
    ///
    /// An empty database still yields an (empty) export directory.
    pub async fn dump(&self, database: &str, out_dir: &str) -> Result<()> {
        let db_dir = format!("{}/{}", out_dir.trim_end_matches('/'), database);
        self.run(argv(["mkdir", "-p", db_dir.as_str()])).await?;

        let cmd = self.tool_command("mongodump", &["--db", database, "--out", out_dir]);
        let output = self.run(cmd).await?;
        debug!("mongodump: {}", output.stderr.trim());
        Ok(())
    }

    /// Import an export directory (one database) into `database`.
    pub async fn restore(&self, database: &str, dump_dir: &str) -> Result<()> {
        let cmd = self.tool_command("mongorestore", &["--db", database, dump_dir]);
        let output = self.run(cmd).await?;
        debug!("mongorestore: {}", output.stderr.trim());
        Ok(())
    }

    pub async fn drop_database(&self, database: &str) -> Result<()> {
        self.eval(database, scripts::DROP_DATABASE).await?;
        Ok(())
    }

    /// Document counts for every collection in `database`, sorted by name.
    pub async fn collection_counts(&self, database: &str) -> Result<Vec<CollectionCount>> {
        let out = self.eval(database, scripts::COLLECTION_COUNTS).await?;
        let json = out.lines().last().unwrap_or("[]");
        Ok(serde_json::from_str(json)?)
    }

    /// Distinct string values of `field` in a collection.
    pub async fn distinct_strings(
        &self,
        database: &str,
        collection: &str,
        field: &str,
    ) -> Result<Vec<String>> {
        let out = self
            .eval(database, &scripts::distinct(collection, field))
            .await?;
        let json = out.lines().last().unwrap_or("[]");
        Ok(serde_json::from_str(json)?)
    }

    /// Users and roles, credentials excluded, as a JSON array.
    pub async fn export_users(&self) -> Result<String> {
        self.eval(ADMIN_DATABASE, scripts::EXPORT_USERS).await
    }

    /// Load a JSON array file (inside the service) into a collection.
    pub async fn import_json_array(
        &self,
        database: &str,
        collection: &str,
        file: &str,
        drop: bool,
    ) -> Result<()> {
        let mut args = vec![
            "--db",
            database,
            "--collection",
            collection,
            "--file",
            file,
            "--jsonArray",
        ];
        if drop {
            args.push("--drop");
        }
        let cmd = self.tool_command("mongoimport", &args);
        let output = self.run(cmd).await?;
        debug!("mongoimport: {}", output.stderr.trim());
        Ok(())
    }

    pub async fn create_indexes(
        &self,
        database: &str,
        collection: &str,
        indexes: &[IndexSpec<'_>],
    ) -> Result<()> {
        for index in indexes {
            self.eval(database, &scripts::create_index(collection, index))
                .await?;
        }
        Ok(())
    }

    /// Remove a path inside the service.
    pub async fn remove_path(&self, path: &str) -> Result<()> {
        self.run(argv(["rm", "-rf", path])).await?;
        Ok(())
    }
}
