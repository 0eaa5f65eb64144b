//! Snapshot capture.

use super::{blocking, service_dump_dir};
use crate::appstate::AppState;
use crate::archive::{self, layout, ArchiveFormat, Classification, CollectionInventory, Manifest, StagingDir};
use crate::config::Config;
use crate::orchestrator::Orchestrator;
use crate::store::MongoStore;
use crate::utils::{BackupError, Result};
use chrono::{Local, Utc};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

/// Capture execution result
#[derive(Debug, Clone)]
pub struct CaptureReport {
    pub name: String,
    pub path: PathBuf,
    pub classification: Classification,
    pub database: String,
    pub collections: Vec<CollectionInventory>,
    pub archive_bytes: u64,
    pub warnings: Vec<String>,
    pub duration_secs: u64,
}

impl fmt::Display for CaptureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Archive:   {}", self.path.display())?;
        writeln!(f, "Type:      {}", self.classification)?;
        writeln!(f, "Database:  {}", self.database)?;
        for c in &self.collections {
            writeln!(f, "  {:<32} {:>12} bytes", c.name, c.bytes)?;
        }
        writeln!(f, "Size:      {} bytes", self.archive_bytes)?;
        writeln!(f, "Duration:  {}s", self.duration_secs)?;
        for w in &self.warnings {
            writeln!(f, "Warning:   {w}")?;
        }
        Ok(())
    }
}

/// Notes and warnings gathered from non-essential collection steps.
#[derive(Default)]
struct Diagnostics {
    notes: Vec<String>,
    warnings: Vec<String>,
}

impl Diagnostics {
    fn record<T>(&mut self, what: &str, result: Result<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                let failure = BackupError::DiagnosticCollectionFailed(e.to_string());
                warn!("{}: {}", what, failure);
                self.warnings.push(format!("{what}: {failure}"));
                None
            }
        }
    }
}

pub struct Capture<'a, O> {
    orchestrator: &'a O,
    config: &'a Config,
}

impl<'a, O: Orchestrator> Capture<'a, O> {
    pub fn new(orchestrator: &'a O, config: &'a Config) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    /// Capture the configured database (and application state, if configured)
    /// into `destination/<name>.<ext>`.
    ///
    /// On error no archive file exists at the destination. The staging tree
    /// is removed on every exit path, including when this future is dropped.
    pub async fn run(&self, name: Option<&str>, destination: &Path) -> Result<CaptureReport> {
        let start_time = Instant::now();
        let name = match name {
            Some(name) => name.to_string(),
            None => archive::timestamped_name(Local::now()),
        };
        archive::validate_name(&name)?;

        let format = self.config.archive.compression;
        let dest = destination.join(format.file_name(&name));
        if let Some(existing) = ArchiveFormat::ALL
            .iter()
            .map(|f| destination.join(f.file_name(&name)))
            .find(|p| p.exists())
        {
            return Err(BackupError::ArchiveExists(existing.display().to_string()));
        }

        let database = self.config.mongo.database.clone();
        let store = MongoStore::new(self.orchestrator, &self.config.mongo);

        info!("Checking {} is reachable", store.service());
        store.ping().await?;

        info!("Starting capture {} of database {}", name, database);
        fs::create_dir_all(destination)?;
        archive::clear_partial(&dest)?;
        let staging = StagingDir::create(destination, &name)?;
        let root = staging.path().join(&name);
        fs::create_dir_all(&root)?;

        // 1-2. database export
        let service_dir = service_dump_dir(&name);
        let exported = self.export_database(&store, &database, &service_dir, &root).await;
        if let Err(e) = store.remove_path(&service_dir).await {
            warn!("Failed to remove {} in {}: {}", service_dir, store.service(), e);
        }
        exported?;

        // 3. application state
        let classification = match self.config.appstate() {
            Some(appstate_config) => {
                let appstate = AppState::new(self.orchestrator, appstate_config);
                info!("Capturing application state from volume {}", appstate_config.volume);
                let size = appstate.capture(&root).await?;
                info!("Application state captured ({} bytes)", size);
                Classification::Combined
            }
            None => Classification::StructuredOnly,
        };

        // 4. diagnostics
        let diagnostics = self.collect_diagnostics(&store, &root).await;

        // 5. manifest, last
        let collections = inventory(&layout::database_dir(&root, &database))?;
        let mut notes = diagnostics.notes;
        notes.extend(diagnostics.warnings.iter().cloned());
        let manifest = Manifest {
            backup_name: name.clone(),
            capture_id: Uuid::new_v4(),
            created_at: Utc::now(),
            classification,
            database: database.clone(),
            store_address: format!("{}:{}", self.config.mongo.host, self.config.mongo.port),
            source_host: source_host(),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            collections: collections.clone(),
            notes,
        };
        manifest.write_to(&root)?;

        // 6. compress and publish
        info!("Compressing archive to {}", dest.display());
        let level = self.config.archive.compression_level;
        let archive_bytes = {
            let (root, name, dest) = (root.clone(), name.clone(), dest.clone());
            blocking(move || archive::pack(&root, &name, &dest, format, level)).await?
        };
        drop(staging);

        let report = CaptureReport {
            name,
            path: dest,
            classification,
            database,
            collections,
            archive_bytes,
            warnings: diagnostics.warnings,
            duration_secs: start_time.elapsed().as_secs(),
        };
        info!(
            "Capture complete: {} ({}, {} bytes)",
            report.path.display(),
            report.classification,
            report.archive_bytes
        );
        Ok(report)
    }

    async fn export_database(
        &self,
        store: &MongoStore<'_, O>,
        database: &str,
        service_dir: &str,
        root: &Path,
    ) -> Result<()> {
        // leftovers of an interrupted run would end up in the export
        store.remove_path(service_dir).await?;

        info!("Exporting database {} inside {}", database, store.service());
        store.dump(database, service_dir).await?;

        let target = layout::database_dir(root, database);
        info!("Copying export to {}", target.display());
        self.orchestrator
            .copy_from(store.service(), &format!("{service_dir}/{database}"), &target)
            .await
    }

    async fn collect_diagnostics(&self, store: &MongoStore<'_, O>, root: &Path) -> Diagnostics {
        let mut diagnostics = Diagnostics::default();

        let users = store.export_users().await.and_then(|json| {
            let path = root.join(layout::USERS);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, pretty_json(&json))?;
            Ok(())
        });
        diagnostics.record("users.json", users);

        let compose = &self.config.compose;
        for (source, copy) in [
            (&compose.env_file, layout::ENV_COPY),
            (&compose.compose_file, layout::COMPOSE_COPY),
        ] {
            let source = compose.project_dir.join(source);
            let copied = fs::copy(&source, root.join(copy))
                .map(|_| ())
                .map_err(|e| BackupError::Io(std::io::Error::new(e.kind(), format!("{}: {}", source.display(), e))));
            diagnostics.record(copy, copied);
        }

        if let Some(appstate_config) = self.config.appstate() {
            let appstate = AppState::new(self.orchestrator, appstate_config);
            if let Some(info) = diagnostics.record("volume inspect", appstate.inspect().await) {
                diagnostics.notes.push(format!(
                    "appstate_volume: {} (driver {}, mountpoint {})",
                    info.name, info.driver, info.mountpoint
                ));
            }
        }

        diagnostics
    }
}

/// Per-collection sizes of a database export, sorted by collection name.
fn inventory(export_dir: &Path) -> Result<Vec<CollectionInventory>> {
    let mut collections = Vec::new();
    for entry in walkdir::WalkDir::new(export_dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| BackupError::Io(e.into()))?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("bson") {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        collections.push(CollectionInventory {
            name: name.to_string(),
            bytes: entry.metadata().map_err(|e| BackupError::Io(e.into()))?.len(),
        });
    }
    collections.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(collections)
}

fn pretty_json(raw: &str) -> String {
    serde_json::from_str::<serde_json::Value>(raw)
        .and_then(|v| serde_json::to_string_pretty(&v))
        .unwrap_or_else(|_| raw.to_string())
}

fn source_host() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}
