//! Snapshot recovery.
//!
//! Recovery is full replacement: the target database is dropped and rebuilt
//! from the archive, and a combined archive also replaces the application
//! volume. Opening an archive is read-only and can be done on its own to
//! inspect or verify it.

use super::{blocking, service_restore_dir};
use crate::appstate::AppState;
use crate::archive::{self, layout, ArchiveSource, Classification, Manifest};
use crate::config::Config;
use crate::orchestrator::Orchestrator;
use crate::store::{CollectionCount, MongoStore};
use crate::utils::retry::poll;
use crate::utils::{BackupError, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{info, warn};

/// An archive that has been extracted and checked against its manifest.
pub struct OpenedArchive {
    pub manifest: Manifest,
    pub source: ArchiveSource,
    root: PathBuf,
    _extracted: Option<TempDir>,
}

impl OpenedArchive {
    pub fn name(&self) -> &str {
        &self.manifest.backup_name
    }

    /// Root of the archive tree (where `backup_info.txt` lives).
    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// What happened to the application state during a recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppStateOutcome {
    /// The archive holds no application state.
    NotIncluded,
    /// The archive holds application state but no volume is configured.
    Skipped,
    /// Volume replaced. `healthy` is `None` when no health URL is configured.
    Restored { healthy: Option<bool> },
}

#[derive(Debug, Clone)]
pub struct RecoveryReport {
    pub archive: String,
    pub database: String,
    pub classification: Classification,
    pub collections: Vec<CollectionCount>,
    pub appstate: AppStateOutcome,
    pub warnings: Vec<String>,
}

impl RecoveryReport {
    pub fn total_documents(&self) -> u64 {
        self.collections.iter().map(|c| c.count).sum()
    }
}

impl fmt::Display for RecoveryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Archive:   {} ({})", self.archive, self.classification)?;
        writeln!(f, "Database:  {}", self.database)?;
        writeln!(
            f,
            "Restored:  {} collection(s), {} document(s)",
            self.collections.len(),
            self.total_documents()
        )?;
        for c in &self.collections {
            writeln!(f, "  {:<32} {:>10}", c.name, c.count)?;
        }
        let appstate = match self.appstate {
            AppStateOutcome::NotIncluded => "not in archive",
            AppStateOutcome::Skipped => "skipped",
            AppStateOutcome::Restored { healthy: Some(true) } => "restored, healthy",
            AppStateOutcome::Restored { healthy: Some(false) } => "restored, not healthy",
            AppStateOutcome::Restored { healthy: None } => "restored, health unknown",
        };
        writeln!(f, "App state: {appstate}")?;
        for w in &self.warnings {
            writeln!(f, "Warning:   {w}")?;
        }
        Ok(())
    }
}

pub struct Recovery<'a, O> {
    orchestrator: &'a O,
    config: &'a Config,
}

impl<'a, O: Orchestrator> Recovery<'a, O> {
    pub fn new(orchestrator: &'a O, config: &'a Config) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    /// Resolve, extract and validate an archive. Touches nothing live.
    pub async fn open(&self, reference: &str) -> Result<OpenedArchive> {
        let source = archive::resolve(reference, &self.config.archive.backup_dir)?;

        let (root, extracted) = match &source {
            ArchiveSource::File { path, .. } => {
                info!("Extracting {}", path.display());
                let dir = tempfile::Builder::new().prefix("stack-restore-").tempdir()?;
                let (archive_path, into) = (path.clone(), dir.path().to_path_buf());
                let root = blocking(move || {
                    archive::unpack(&archive_path, &into)?;
                    archive::find_root(&into)
                })
                .await?;
                (root, Some(dir))
            }
            ArchiveSource::Directory(path) => (path.clone(), None),
        };

        let manifest = Manifest::read_from(&root)?;
        manifest.validate_layout(&root)?;
        info!(
            "Archive {} is valid ({}, database {}, created {})",
            manifest.backup_name, manifest.classification, manifest.database, manifest.created_at
        );

        Ok(OpenedArchive {
            manifest,
            source,
            root,
            _extracted: extracted,
        })
    }

    /// Resolve, validate and restore in one call.
    pub async fn recover(&self, reference: &str, confirm: bool) -> Result<RecoveryReport> {
        let archive = self.open(reference).await?;
        self.restore(&archive, confirm).await
    }

    /// Replace the live database (and application state, for combined
    /// archives) with the archive's contents. Does nothing unless `confirm`.
    pub async fn restore(&self, archive: &OpenedArchive, confirm: bool) -> Result<RecoveryReport> {
        if !confirm {
            warn!("Restore of {} not confirmed; nothing changed", archive.name());
            return Err(BackupError::PreconditionDeclined);
        }

        let database = &self.config.mongo.database;
        let store = MongoStore::new(self.orchestrator, &self.config.mongo);
        let mut warnings = Vec::new();

        // 1. store reachable, starting it if needed
        self.ensure_store(&store).await?;

        // 2. full replacement
        info!("Dropping database {}", database);
        store.drop_database(database).await?;

        // 3. import, cleaning the in-service copy on both paths
        let service_dir = service_restore_dir(archive.name());
        let imported = self.import_database(&store, archive, &service_dir).await;
        if let Err(e) = store.remove_path(&service_dir).await {
            warn!("Failed to remove {} in {}: {}", service_dir, store.service(), e);
            warnings.push(format!("could not remove {service_dir} in {}: {e}", store.service()));
        }
        imported?;

        // 4. application state
        let appstate = self.restore_appstate(archive, &mut warnings).await?;

        // 5. verification counts
        let collections = match store.collection_counts(database).await {
            Ok(counts) => counts,
            Err(e) => {
                warn!("Could not read post-restore counts: {}", e);
                warnings.push(format!("post-restore counts unavailable: {e}"));
                Vec::new()
            }
        };

        let report = RecoveryReport {
            archive: archive.name().to_string(),
            database: database.clone(),
            classification: archive.manifest.classification,
            collections,
            appstate,
            warnings,
        };
        info!(
            "Recovery complete: {} collection(s), {} document(s) in {}",
            report.collections.len(),
            report.total_documents(),
            report.database
        );
        Ok(report)
    }

    async fn ensure_store(&self, store: &MongoStore<'_, O>) -> Result<()> {
        if store.ping().await.is_ok() {
            return Ok(());
        }

        if self.orchestrator.is_running(store.service()).await? {
            warn!("{} is running but not answering, waiting for it", store.service());
        } else {
            warn!("{} is not running, starting it", store.service());
            self.orchestrator.start(store.service()).await?;
        }

        let policy = self.config.retry.store;
        match poll(policy, store.service(), || store.ping()).await {
            Some(attempt) => {
                info!("{} reachable after {} attempt(s)", store.service(), attempt);
                Ok(())
            }
            None => Err(BackupError::ServiceUnavailable(format!(
                "{} not reachable after {} attempts",
                store.service(),
                policy.attempts
            ))),
        }
    }

    async fn import_database(
        &self,
        store: &MongoStore<'_, O>,
        archive: &OpenedArchive,
        service_dir: &str,
    ) -> Result<()> {
        let source_db = &archive.manifest.database;
        let export = layout::database_dir(archive.root(), source_db);
        let service_path = format!("{service_dir}/{source_db}");

        store.remove_path(service_dir).await?;

        info!("Copying export of {} into {}", source_db, store.service());
        self.orchestrator
            .copy_to(&export, store.service(), &service_path)
            .await?;

        info!("Importing into database {}", self.config.mongo.database);
        store.restore(&self.config.mongo.database, &service_path).await
    }

    async fn restore_appstate(
        &self,
        archive: &OpenedArchive,
        warnings: &mut Vec<String>,
    ) -> Result<AppStateOutcome> {
        if !archive.manifest.classification.includes_appstate() {
            return Ok(AppStateOutcome::NotIncluded);
        }

        let Some(appstate_config) = self.config.appstate() else {
            warn!("Archive includes application state but no volume is configured; skipping");
            warnings.push("application state in archive was not restored: no volume configured".into());
            return Ok(AppStateOutcome::Skipped);
        };

        let appstate = AppState::new(self.orchestrator, appstate_config);
        info!("Replacing application state in volume {}", appstate_config.volume);
        appstate.replace(archive.root()).await?;

        let healthy = match appstate.wait_healthy(self.config.retry.health).await {
            Ok(healthy) => healthy,
            Err(e) => {
                warn!("Health check could not run: {}", e);
                Some(false)
            }
        };
        match healthy {
            Some(true) => {}
            Some(false) => warnings.push(format!(
                "{} did not report healthy; verify it manually",
                appstate.service()
            )),
            None => warnings.push(format!(
                "no health URL configured; verify {} manually",
                appstate.service()
            )),
        }
        Ok(AppStateOutcome::Restored { healthy })
    }
}
