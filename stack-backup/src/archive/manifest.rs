//! Archive manifest (`backup_info.txt`).
//!
//! Plain `key: value` lines so an operator can read it with `cat`. Keys that
//! repeat (`collection`, `note`) accumulate. Unknown keys are ignored so older
//! tools can read newer manifests.

use super::layout;
use crate::utils::{BackupError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

/// What an archive contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Database export only.
    StructuredOnly,
    /// Database export plus the application-state tarball.
    Combined,
}

impl Classification {
    pub fn tag(&self) -> &'static str {
        match self {
            Classification::StructuredOnly => "structured-only",
            Classification::Combined => "combined",
        }
    }

    pub fn includes_appstate(&self) -> bool {
        matches!(self, Classification::Combined)
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Classification {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "structured-only" => Ok(Classification::StructuredOnly),
            "combined" => Ok(Classification::Combined),
            other => Err(BackupError::CorruptArchive(format!(
                "unknown archive type `{other}`"
            ))),
        }
    }
}

/// One collection in the structured export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionInventory {
    pub name: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub backup_name: String,
    pub capture_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub classification: Classification,
    pub database: String,
    pub store_address: String,
    pub source_host: String,
    pub tool_version: String,
    pub collections: Vec<CollectionInventory>,
    pub notes: Vec<String>,
}

impl Manifest {
    pub fn render(&self) -> String {
        let mut out = String::new();
        let mut line = |key: &str, value: &str| {
            out.push_str(key);
            out.push_str(": ");
            out.push_str(value);
            out.push('\n');
        };

        line("backup_name", &self.backup_name);
        line("capture_id", &self.capture_id.to_string());
        line(
            "created_at",
            &self.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        line("type", self.classification.tag());
        line("database", &self.database);
        line("store_address", &self.store_address);
        line("source_host", &self.source_host);
        line("tool_version", &self.tool_version);
        for c in &self.collections {
            line("collection", &format!("{} ({} bytes)", c.name, c.bytes));
        }
        for note in &self.notes {
            line("note", note);
        }
        out
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut backup_name = None;
        let mut capture_id = None;
        let mut created_at = None;
        let mut classification = None;
        let mut database = None;
        let mut store_address = String::new();
        let mut source_host = String::new();
        let mut tool_version = String::new();
        let mut collections = Vec::new();
        let mut notes = Vec::new();

        for raw in text.lines() {
            let raw = raw.trim();
            if raw.is_empty() || raw.starts_with('#') {
                continue;
            }
            let Some((key, value)) = raw.split_once(':') else {
                return Err(corrupt(format!("malformed manifest line `{raw}`")));
            };
            let value = value.trim();

            match key.trim() {
                "backup_name" => backup_name = Some(value.to_string()),
                "capture_id" => {
                    capture_id = Some(
                        Uuid::parse_str(value)
                            .map_err(|e| corrupt(format!("bad capture_id: {e}")))?,
                    )
                }
                "created_at" => {
                    created_at = Some(
                        DateTime::parse_from_rfc3339(value)
                            .map_err(|e| corrupt(format!("bad created_at: {e}")))?
                            .with_timezone(&Utc),
                    )
                }
                "type" => classification = Some(value.parse::<Classification>()?),
                "database" => database = Some(value.to_string()),
                "store_address" => store_address = value.to_string(),
                "source_host" => source_host = value.to_string(),
                "tool_version" => tool_version = value.to_string(),
                "collection" => collections.push(parse_inventory(value)?),
                "note" => notes.push(value.to_string()),
                _ => {}
            }
        }

        let backup_name = backup_name.ok_or_else(|| missing("backup_name"))?;
        let database = database.ok_or_else(|| missing("database"))?;
        // both end up in filesystem paths, on the host and inside the service
        for (key, value) in [("backup_name", &backup_name), ("database", &database)] {
            super::validate_name(value).map_err(|e| corrupt(format!("bad {key}: {e}")))?;
        }

        Ok(Manifest {
            backup_name,
            capture_id: capture_id.unwrap_or_else(Uuid::nil),
            created_at: created_at.ok_or_else(|| missing("created_at"))?,
            classification: classification.ok_or_else(|| missing("type"))?,
            database,
            store_address,
            source_host,
            tool_version,
            collections,
            notes,
        })
    }

    /// Read the manifest at the root of an extracted archive.
    pub fn read_from(root: &Path) -> Result<Self> {
        let path = root.join(layout::MANIFEST);
        if !path.is_file() {
            return Err(corrupt(format!(
                "{} is missing; the archive is incomplete",
                layout::MANIFEST
            )));
        }
        Self::parse(&std::fs::read_to_string(path)?)
    }

    pub fn write_to(&self, root: &Path) -> Result<()> {
        std::fs::write(root.join(layout::MANIFEST), self.render())?;
        Ok(())
    }

    /// Check that the tree under `root` is what the manifest claims.
    pub fn validate_layout(&self, root: &Path) -> Result<()> {
        let export = layout::database_dir(root, &self.database);
        if !export.is_dir() {
            return Err(corrupt(format!(
                "database export {} is missing",
                export.strip_prefix(root).unwrap_or(&export).display()
            )));
        }

        let has_appstate = root.join(layout::APPSTATE).is_file();
        match (self.classification, has_appstate) {
            (Classification::Combined, false) => Err(corrupt(format!(
                "manifest says {} but {} is missing",
                self.classification,
                layout::APPSTATE
            ))),
            (Classification::StructuredOnly, true) => Err(corrupt(format!(
                "manifest says {} but {} is present",
                self.classification,
                layout::APPSTATE
            ))),
            _ => Ok(()),
        }
    }
}

fn parse_inventory(value: &str) -> Result<CollectionInventory> {
    let bad = || corrupt(format!("bad collection entry `{value}`"));
    let (name, rest) = value.rsplit_once(" (").ok_or_else(bad)?;
    let bytes = rest
        .strip_suffix(" bytes)")
        .and_then(|n| n.parse().ok())
        .ok_or_else(bad)?;
    Ok(CollectionInventory {
        name: name.to_string(),
        bytes,
    })
}

fn corrupt(msg: String) -> BackupError {
    BackupError::CorruptArchive(msg)
}

fn missing(key: &str) -> BackupError {
    corrupt(format!("manifest has no `{key}`"))
}
