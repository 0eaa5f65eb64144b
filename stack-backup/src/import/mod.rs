//! CSV imports into the data store.
//!
//! Rows are turned into JSON documents on the host, staged as one JSON array
//! file, copied into the data store service and loaded with `mongoimport`.

pub mod clockodo;
pub mod deals;

use crate::config::Config;
use crate::executor::blocking;
use crate::orchestrator::Orchestrator;
use crate::store::MongoStore;
use crate::utils::{BackupError, Result};
use chrono::{NaiveDateTime, SecondsFormat, Utc};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportKind {
    Deals,
    Clockodo,
}

impl ImportKind {
    pub fn default_collection(&self) -> &'static str {
        match self {
            ImportKind::Deals => deals::DEFAULT_COLLECTION,
            ImportKind::Clockodo => clockodo::DEFAULT_COLLECTION,
        }
    }

    fn transform(&self, path: &Path) -> Result<Transformed> {
        let reader = BufReader::new(File::open(path)?);
        let now = Utc::now();
        match self {
            ImportKind::Deals => deals::transform(reader, now),
            ImportKind::Clockodo => clockodo::transform(reader, now),
        }
    }
}

impl fmt::Display for ImportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ImportKind::Deals => "deals",
            ImportKind::Clockodo => "clockodo",
        })
    }
}

impl FromStr for ImportKind {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "deals" => Ok(ImportKind::Deals),
            "clockodo" => Ok(ImportKind::Clockodo),
            other => Err(BackupError::Config(format!(
                "unknown import kind '{other}' (expected deals or clockodo)"
            ))),
        }
    }
}

/// Documents produced from one CSV file.
#[derive(Debug, Default)]
pub struct Transformed {
    pub documents: Vec<Value>,
    pub skipped: usize,
    pub warnings: Vec<String>,
}

/// Field of `record` under `header`, empty when the column is absent.
fn cell<'r>(headers: &[String], record: &'r csv::StringRecord, header: &str) -> &'r str {
    headers
        .iter()
        .position(|h| h == header)
        .and_then(|i| record.get(i))
        .unwrap_or("")
}

/// A naive UTC timestamp as an Extended JSON date.
pub fn extended_date(dt: NaiveDateTime) -> Value {
    json!({ "$date": dt.and_utc().to_rfc3339_opts(SecondsFormat::Millis, true) })
}

#[derive(Debug, Clone)]
pub struct ImportReport {
    pub kind: ImportKind,
    pub database: String,
    pub collection: String,
    pub imported: usize,
    pub skipped: usize,
    pub total: u64,
    pub warnings: Vec<String>,
}

impl fmt::Display for ImportReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Import:     {} into {}.{}", self.kind, self.database, self.collection)?;
        writeln!(f, "Imported:   {}", self.imported)?;
        writeln!(f, "Skipped:    {}", self.skipped)?;
        writeln!(f, "Collection: {} document(s)", self.total)?;
        if !self.warnings.is_empty() {
            writeln!(f, "Warnings:   {}", self.warnings.len())?;
        }
        Ok(())
    }
}

pub struct Importer<'a, O> {
    orchestrator: &'a O,
    config: &'a Config,
    database: &'a str,
}

impl<'a, O: Orchestrator> Importer<'a, O> {
    pub fn new(orchestrator: &'a O, config: &'a Config) -> Self {
        Self {
            orchestrator,
            config,
            database: &config.mongo.database,
        }
    }

    /// Import into `database` instead of the configured one.
    pub fn database(mut self, database: &'a str) -> Self {
        self.database = database;
        self
    }

    /// Import `csv_path` into `collection` (or the kind's default). With
    /// `replace` the collection is emptied first, which needs `confirm`.
    pub async fn run(
        &self,
        kind: ImportKind,
        csv_path: &Path,
        collection: Option<&str>,
        replace: bool,
        confirm: bool,
    ) -> Result<ImportReport> {
        if replace && !confirm {
            return Err(BackupError::PreconditionDeclined);
        }
        let database = self.database;
        let collection = collection.unwrap_or(kind.default_collection());
        let store = MongoStore::new(self.orchestrator, &self.config.mongo);

        info!("Reading {} export {}", kind, csv_path.display());
        let path = csv_path.to_path_buf();
        let mut transformed = blocking(move || kind.transform(&path)).await?;

        store.ping().await?;

        if kind == ImportKind::Deals && !replace {
            let existing: HashSet<String> = store
                .distinct_strings(database, collection, "deal_id")
                .await?
                .into_iter()
                .collect();
            let before = transformed.documents.len();
            transformed
                .documents
                .retain(|doc| deals::deal_id(doc).map_or(true, |id| !existing.contains(id)));
            let already = before - transformed.documents.len();
            if already > 0 {
                info!("{} deal(s) already in {}, skipping", already, collection);
                transformed.skipped += already;
            }
        }

        let imported = transformed.documents.len();
        if imported > 0 || replace {
            self.load(&store, collection, transformed.documents, replace)
                .await?;
        } else {
            warn!("Nothing to import");
        }

        if kind == ImportKind::Deals {
            info!("Creating indexes on {}", collection);
            store
                .create_indexes(database, collection, deals::INDEXES)
                .await?;
        }

        let total = store
            .collection_counts(database)
            .await?
            .into_iter()
            .find(|c| c.name == collection)
            .map(|c| c.count)
            .unwrap_or(0);

        let report = ImportReport {
            kind,
            database: database.to_string(),
            collection: collection.to_string(),
            imported,
            skipped: transformed.skipped,
            total,
            warnings: transformed.warnings,
        };
        info!(
            "Import complete: {} imported, {} skipped, {} in {}",
            report.imported, report.skipped, report.total, report.collection
        );
        Ok(report)
    }

    async fn load(
        &self,
        store: &MongoStore<'_, O>,
        collection: &str,
        documents: Vec<Value>,
        replace: bool,
    ) -> Result<()> {
        let staged = blocking(move || stage(&documents)).await?;
        let service_file = format!("/tmp/stack-import-{collection}.json");

        self.orchestrator
            .copy_to(staged.path(), store.service(), &service_file)
            .await?;
        let imported = store
            .import_json_array(self.database, collection, &service_file, replace)
            .await;
        if let Err(e) = store.remove_path(&service_file).await {
            warn!("Failed to remove {} in {}: {}", service_file, store.service(), e);
        }
        imported
    }
}

/// Write documents to a temporary JSON array file.
fn stage(documents: &[Value]) -> Result<tempfile::NamedTempFile> {
    let file = tempfile::Builder::new()
        .prefix("stack-import-")
        .suffix(".json")
        .tempfile()?;
    let mut writer = BufWriter::new(file.as_file());
    serde_json::to_writer(&mut writer, documents)?;
    writer.flush()?;
    drop(writer);
    Ok(file)
}

/// Resolve a CSV path, failing early if it does not exist.
pub fn csv_path(path: &Path) -> Result<PathBuf> {
    if path.is_file() {
        Ok(path.to_path_buf())
    } else {
        Err(BackupError::Config(format!(
            "CSV file not found: {}",
            path.display()
        )))
    }
}
