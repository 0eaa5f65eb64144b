//! Archive files: naming, packing, extraction, listing and retention.
//!
//! An archive is a single compressed tar of one `<name>/` directory. Writers
//! go through a `.partial` file that is renamed into place only after the
//! stream is complete, so a file named `<name>.tar.gz` is always whole.

pub mod layout;
pub mod manifest;

use crate::utils::{BackupError, Result};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};

pub use manifest::{Classification, CollectionInventory, Manifest};

const PARTIAL_SUFFIX: &str = "partial";
const STAGING_PREFIX: &str = ".staging-";

/// Outer archive compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveFormat {
    #[default]
    Gzip,
    Zstd,
}

impl ArchiveFormat {
    pub const ALL: [ArchiveFormat; 2] = [ArchiveFormat::Gzip, ArchiveFormat::Zstd];

    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveFormat::Gzip => "tar.gz",
            ArchiveFormat::Zstd => "tar.zst",
        }
    }

    pub fn default_level(&self) -> i32 {
        match self {
            ArchiveFormat::Gzip => 6,
            ArchiveFormat::Zstd => 3,
        }
    }

    /// Detect the format from a file name.
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        Self::ALL
            .into_iter()
            .find(|f| name.ends_with(&format!(".{}", f.extension())))
    }

    /// File name for an archive called `name`.
    pub fn file_name(&self, name: &str) -> String {
        format!("{}.{}", name, self.extension())
    }
}

impl FromStr for ArchiveFormat {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gzip" | "gz" => Ok(ArchiveFormat::Gzip),
            "zstd" | "zst" => Ok(ArchiveFormat::Zstd),
            other => Err(BackupError::Config(format!(
                "unknown compression `{other}` (expected gzip or zstd)"
            ))),
        }
    }
}

/// Default archive name for a capture started at `now`.
pub fn timestamped_name(now: DateTime<Local>) -> String {
    format!("backup_{}", now.format("%Y%m%d_%H%M%S"))
}

/// Archive names become directory and file names; keep them to one path component.
pub fn validate_name(name: &str) -> Result<()> {
    let bad = |why: &str| Err(BackupError::InvalidName(format!("`{name}` {why}")));
    if name.trim().is_empty() {
        return bad("is empty");
    }
    if name == "." || name == ".." || name.starts_with('.') {
        return bad("must not start with a dot");
    }
    if name.contains('/') || name.contains('\\') || name.contains('\0') {
        return bad("must not contain path separators");
    }
    Ok(())
}

/// Compress `source_dir` into `dest` as a tar whose single top-level entry is `name/`.
///
/// Writes `dest.partial` first and renames on success; the partial file is
/// removed on failure.
pub fn pack(
    source_dir: &Path,
    name: &str,
    dest: &Path,
    format: ArchiveFormat,
    level: Option<i32>,
) -> Result<u64> {
    let partial = partial_path(dest);
    let level = level.unwrap_or_else(|| format.default_level());

    match write_archive(source_dir, name, &partial, format, level) {
        Ok(()) => {
            fs::rename(&partial, dest)?;
            Ok(fs::metadata(dest)?.len())
        }
        Err(e) => {
            let _ = fs::remove_file(&partial);
            Err(e)
        }
    }
}

fn write_archive(
    source_dir: &Path,
    name: &str,
    path: &Path,
    format: ArchiveFormat,
    level: i32,
) -> Result<()> {
    let writer = BufWriter::new(File::create(path)?);

    let writer = match format {
        ArchiveFormat::Gzip => {
            let level = flate2::Compression::new(level.clamp(0, 9) as u32);
            let encoder = flate2::write::GzEncoder::new(writer, level);
            append_tree(encoder, source_dir, name)?.finish()?
        }
        ArchiveFormat::Zstd => {
            let encoder = zstd::Encoder::new(writer, level)?;
            append_tree(encoder, source_dir, name)?.finish()?
        }
    };

    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(())
}

fn append_tree<W: Write>(writer: W, source_dir: &Path, name: &str) -> Result<W> {
    let mut builder = tar::Builder::new(writer);
    builder.follow_symlinks(false);
    builder.append_dir_all(name, source_dir)?;
    Ok(builder.into_inner()?)
}

/// Extract an archive file into `into`.
pub fn unpack(archive: &Path, into: &Path) -> Result<()> {
    let format = ArchiveFormat::from_path(archive).ok_or_else(|| {
        BackupError::CorruptArchive(format!("{} is not a known archive format", archive.display()))
    })?;
    let reader = BufReader::new(File::open(archive)?);

    let decoder: Box<dyn Read> = match format {
        ArchiveFormat::Gzip => Box::new(flate2::read::GzDecoder::new(reader)),
        ArchiveFormat::Zstd => Box::new(zstd::Decoder::with_buffer(reader)?),
    };

    tar::Archive::new(decoder).unpack(into).map_err(|e| {
        BackupError::CorruptArchive(format!("failed to extract {}: {}", archive.display(), e))
    })
}

/// Locate the archive root in an extraction directory: either the directory
/// itself (manifest at top level) or its single subdirectory.
pub fn find_root(extracted: &Path) -> Result<PathBuf> {
    if extracted.join(layout::MANIFEST).is_file() {
        return Ok(extracted.to_path_buf());
    }

    let mut dirs = fs::read_dir(extracted)?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .map(|e| e.path());

    match (dirs.next(), dirs.next()) {
        (Some(root), None) => Ok(root),
        _ => Err(BackupError::CorruptArchive(
            "archive must contain exactly one top-level directory".into(),
        )),
    }
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(".");
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

/// Where an archive reference points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveSource {
    File { path: PathBuf, format: ArchiveFormat },
    Directory(PathBuf),
}

impl ArchiveSource {
    pub fn path(&self) -> &Path {
        match self {
            ArchiveSource::File { path, .. } => path,
            ArchiveSource::Directory(path) => path,
        }
    }
}

/// Resolve a path or bare archive name. Bare names are looked up in
/// `backup_dir` as `<name>.tar.gz`, `<name>.tar.zst`, then `<name>/`.
pub fn resolve(reference: &str, backup_dir: &Path) -> Result<ArchiveSource> {
    let direct = PathBuf::from(reference);
    if direct.exists() {
        return source_for(direct);
    }

    let name = reference.trim_end_matches('/');
    for format in ArchiveFormat::ALL {
        let candidate = backup_dir.join(format.file_name(name));
        if candidate.is_file() {
            return Ok(ArchiveSource::File {
                path: candidate,
                format,
            });
        }
    }
    let dir = backup_dir.join(name);
    if dir.is_dir() {
        return Ok(ArchiveSource::Directory(dir));
    }

    Err(BackupError::ArchiveNotFound(reference.to_string()))
}

fn source_for(path: PathBuf) -> Result<ArchiveSource> {
    if path.is_dir() {
        return Ok(ArchiveSource::Directory(path));
    }
    match ArchiveFormat::from_path(&path) {
        Some(format) => Ok(ArchiveSource::File { path, format }),
        None => Err(BackupError::CorruptArchive(format!(
            "{} is not a .tar.gz or .tar.zst archive",
            path.display()
        ))),
    }
}

/// An archive found in the backup directory.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    pub name: String,
    pub source: ArchiveSource,
    pub size: u64,
    pub modified: DateTime<Local>,
}

/// Archives in `dir`, newest first. In-progress and staging entries are skipped.
pub fn list(dir: &Path) -> Result<Vec<ArchiveEntry>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_name = entry.file_name().to_string_lossy().to_string();
        if file_name.starts_with('.') || file_name.ends_with(PARTIAL_SUFFIX) {
            continue;
        }

        let metadata = entry.metadata()?;
        let (name, source) = if metadata.is_dir() {
            if !path.join(layout::MANIFEST).is_file() {
                continue;
            }
            (file_name.clone(), ArchiveSource::Directory(path.clone()))
        } else {
            let Some(format) = ArchiveFormat::from_path(&path) else {
                continue;
            };
            let stem = file_name
                .strip_suffix(&format!(".{}", format.extension()))
                .unwrap_or(&file_name)
                .to_string();
            (stem, ArchiveSource::File { path: path.clone(), format })
        };

        let size = if metadata.is_dir() {
            dir_size(&path)
        } else {
            metadata.len()
        };

        entries.push(ArchiveEntry {
            name,
            source,
            size,
            modified: metadata.modified()?.into(),
        });
    }

    entries.sort_by(|a, b| {
        b.modified
            .cmp(&a.modified)
            .then_with(|| b.name.cmp(&a.name))
    });
    Ok(entries)
}

fn dir_size(path: &Path) -> u64 {
    walkdir::WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter_map(|e| e.metadata().ok())
        .filter(|m| m.is_file())
        .map(|m| m.len())
        .sum()
}

/// Archives beyond the newest `keep`, i.e. what a prune would delete.
pub fn prune_candidates(dir: &Path, keep: usize) -> Result<Vec<ArchiveEntry>> {
    Ok(list(dir)?.into_iter().skip(keep).collect())
}

/// Delete archives. Callers confirm with the operator first.
pub fn remove(entries: &[ArchiveEntry]) -> Result<usize> {
    let mut removed = 0;
    for entry in entries {
        match &entry.source {
            ArchiveSource::File { path, .. } => fs::remove_file(path)?,
            ArchiveSource::Directory(path) => fs::remove_dir_all(path)?,
        }
        info!("Removed archive {}", entry.name);
        removed += 1;
    }
    Ok(removed)
}

/// Scratch directory in the destination that is removed when dropped.
///
/// Holds the uncompressed archive tree during a capture. Dropping it on any
/// exit path (error, early return, cancelled future) removes the tree.
pub struct StagingDir {
    path: PathBuf,
}

impl StagingDir {
    pub fn create(parent: &Path, name: &str) -> Result<Self> {
        let path = parent.join(format!("{STAGING_PREFIX}{name}"));
        if path.exists() {
            warn!("Removing stale staging directory {}", path.display());
            fs::remove_dir_all(&path)?;
        }
        fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        match fs::remove_dir_all(&self.path) {
            Ok(()) => debug!("Removed staging directory {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove staging directory {}: {}", self.path.display(), e),
        }
    }
}

/// Remove a leftover `.partial` file for `dest` from an interrupted capture.
pub fn clear_partial(dest: &Path) -> Result<()> {
    let partial = partial_path(dest);
    if partial.exists() {
        warn!("Removing leftover partial archive {}", partial.display());
        fs::remove_file(partial)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn sample_tree(root: &Path) {
        fs::create_dir_all(root.join("mongodb/backup/financedb")).unwrap();
        fs::write(root.join("mongodb/backup/financedb/transactions.bson"), b"\x16\0\0\0").unwrap();
        fs::write(root.join(layout::MANIFEST), "type: structured-only\n").unwrap();
    }

    #[test]
    fn test_timestamped_name() {
        let at = Local.with_ymd_and_hms(2026, 10, 18, 9, 5, 7).unwrap();
        assert_eq!(timestamped_name(at), "backup_20261018_090507");
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("backup_20261018_090507").is_ok());
        assert!(validate_name("before-upgrade").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("..").is_err());
        assert!(validate_name(".hidden").is_err());
        assert!(validate_name("a/b").is_err());
    }

    #[test]
    fn test_format_detection() {
        assert_eq!(
            ArchiveFormat::from_path(Path::new("/b/x.tar.gz")),
            Some(ArchiveFormat::Gzip)
        );
        assert_eq!(
            ArchiveFormat::from_path(Path::new("x.tar.zst")),
            Some(ArchiveFormat::Zstd)
        );
        assert_eq!(ArchiveFormat::from_path(Path::new("x.tar.gz.partial")), None);
        assert_eq!(ArchiveFormat::from_path(Path::new("x.zip")), None);
        assert_eq!("ZSTD".parse::<ArchiveFormat>().unwrap(), ArchiveFormat::Zstd);
        assert!("lz4".parse::<ArchiveFormat>().is_err());
    }

    #[test]
    fn test_pack_and_unpack_both_formats() {
        for format in ArchiveFormat::ALL {
            let work = TempDir::new().unwrap();
            let tree = work.path().join("tree");
            sample_tree(&tree);

            let dest = work.path().join(format.file_name("snap"));
            let size = pack(&tree, "snap", &dest, format, None).unwrap();
            assert!(size > 0);
            assert!(!partial_path(&dest).exists());

            let out = work.path().join("out");
            fs::create_dir_all(&out).unwrap();
            unpack(&dest, &out).unwrap();

            let root = find_root(&out).unwrap();
            assert_eq!(root, out.join("snap"));
            assert_eq!(
                fs::read(root.join("mongodb/backup/financedb/transactions.bson")).unwrap(),
                b"\x16\0\0\0"
            );
        }
    }

    #[test]
    fn test_pack_failure_leaves_nothing() {
        let work = TempDir::new().unwrap();
        let dest = work.path().join("snap.tar.gz");
        let result = pack(&work.path().join("missing"), "snap", &dest, ArchiveFormat::Gzip, None);
        assert!(result.is_err());
        assert!(!dest.exists());
        assert!(!partial_path(&dest).exists());
    }

    #[test]
    fn test_unpack_garbage_is_corrupt() {
        let work = TempDir::new().unwrap();
        let dest = work.path().join("snap.tar.gz");
        fs::write(&dest, b"not an archive").unwrap();
        assert!(matches!(
            unpack(&dest, work.path()),
            Err(BackupError::CorruptArchive(_))
        ));
    }

    #[test]
    fn test_resolve_by_name_and_path() {
        let work = TempDir::new().unwrap();
        fs::write(work.path().join("a.tar.zst"), b"").unwrap();
        sample_tree(&work.path().join("b"));

        let a = resolve("a", work.path()).unwrap();
        assert_eq!(a.path(), work.path().join("a.tar.zst"));

        let b = resolve("b", work.path()).unwrap();
        assert!(matches!(b, ArchiveSource::Directory(_)));

        let direct = work.path().join("a.tar.zst");
        assert!(resolve(direct.to_str().unwrap(), Path::new("/nonexistent")).is_ok());

        assert!(matches!(
            resolve("c", work.path()),
            Err(BackupError::ArchiveNotFound(_))
        ));
    }

    #[test]
    fn test_list_skips_partial_and_staging() {
        let work = TempDir::new().unwrap();
        fs::write(work.path().join("one.tar.gz"), b"1").unwrap();
        fs::write(work.path().join("two.tar.gz.partial"), b"2").unwrap();
        fs::create_dir_all(work.path().join(".staging-two")).unwrap();
        fs::write(work.path().join("notes.txt"), b"").unwrap();
        fs::create_dir_all(work.path().join("empty-dir")).unwrap();
        sample_tree(&work.path().join("three"));

        let names: Vec<_> = list(work.path())
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"one".to_string()));
        assert!(names.contains(&"three".to_string()));
    }

    #[test]
    fn test_list_missing_dir_is_empty() {
        assert!(list(Path::new("/definitely/not/here")).unwrap().is_empty());
    }

    #[test]
    fn test_prune_keeps_newest() {
        let work = TempDir::new().unwrap();
        for (i, name) in ["old", "mid", "new"].iter().enumerate() {
            let path = work.path().join(format!("{name}.tar.gz"));
            fs::write(&path, b"x").unwrap();
            let mtime = std::time::SystemTime::UNIX_EPOCH
                + std::time::Duration::from_secs(1_700_000_000 + i as u64 * 60);
            File::options()
                .write(true)
                .open(&path)
                .unwrap()
                .set_modified(mtime)
                .unwrap();
        }

        let doomed = prune_candidates(work.path(), 1).unwrap();
        let names: Vec<_> = doomed.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["mid", "old"]);

        assert_eq!(remove(&doomed).unwrap(), 2);
        assert!(work.path().join("new.tar.gz").exists());
        assert!(!work.path().join("old.tar.gz").exists());
    }

    #[test]
    fn test_staging_dir_removed_on_drop() {
        let work = TempDir::new().unwrap();
        let path = {
            let staging = StagingDir::create(work.path(), "snap").unwrap();
            fs::write(staging.path().join("f"), b"x").unwrap();
            staging.path().to_path_buf()
        };
        assert!(!path.exists());
    }
}
