//! Stack Backup - Main entry point
//!
//! Capture and recover snapshots of the MongoDB + Metabase compose stack.

use anyhow::Result;
use clap::{Parser, Subcommand};
use stack_backup::archive::{self, ArchiveEntry};
use stack_backup::executor::{OpenedArchive, Recovery};
use stack_backup::import::{self, ImportKind, Importer};
use stack_backup::orchestrator::compose::ComposeOrchestrator;
use stack_backup::shutdown::{self, Signal};
use stack_backup::utils::{self, prompt};
use stack_backup::{executor::Capture, BackupError, Config};
use std::future::Future;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Capture a snapshot of the data store (and application state)
    Capture {
        /// Archive name (default: backup_YYYYMMDD_HHMMSS)
        #[arg(short, long)]
        name: Option<String>,

        /// Directory to write the archive to (default: backup dir)
        #[arg(short, long, value_name = "DIR")]
        dest: Option<PathBuf>,
    },

    /// Replace the live deployment with a snapshot
    Recover {
        /// Archive path or name; lists available archives when omitted
        archive: Option<String>,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// List archives, newest first
    List,

    /// Check an archive without touching the deployment
    Verify {
        archive: String,
    },

    /// Delete all but the newest archives
    Prune {
        /// Number of archives to keep
        #[arg(long)]
        keep: usize,

        #[arg(short, long)]
        yes: bool,
    },

    /// Import a CSV export (deals or clockodo) into the data store
    Import {
        kind: ImportKind,

        csv: PathBuf,

        /// Target database (default: configured database)
        #[arg(short, long)]
        database: Option<String>,

        /// Target collection (default depends on kind)
        #[arg(long)]
        collection: Option<String>,

        /// Empty the collection before importing
        #[arg(long)]
        replace: bool,

        #[arg(short, long)]
        yes: bool,
    },
}

impl Command {
    /// Operation name for operator-facing messages.
    fn label(&self) -> &'static str {
        match self {
            Command::Capture { .. } => "Capture",
            Command::Recover { .. } => "Recovery",
            Command::List => "Listing",
            Command::Verify { .. } => "Verification",
            Command::Prune { .. } => "Prune",
            Command::Import { .. } => "Import",
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("interrupted by {0:?}")]
struct Interrupted(Signal);

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let label = args.command.label();

    match run(args).await {
        Ok(code) => ExitCode::from(code),
        Err(e) if declined(&e) => {
            println!("{label} cancelled; nothing was changed");
            ExitCode::from(exit_code(&e))
        }
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("Error: {e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}

fn declined(e: &anyhow::Error) -> bool {
    matches!(
        e.downcast_ref::<BackupError>(),
        Some(BackupError::PreconditionDeclined)
    )
}

fn exit_code(e: &anyhow::Error) -> u8 {
    if let Some(Interrupted(signal)) = e.downcast_ref::<Interrupted>() {
        return signal.exit_code() as u8;
    }
    e.downcast_ref::<BackupError>()
        .map_or(2, BackupError::exit_code) as u8
}

async fn run(args: Args) -> Result<u8> {
    let config = Config::load(args.config.as_deref())?;

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!("stack-backup v{}", env!("CARGO_PKG_VERSION"));

    let orchestrator = ComposeOrchestrator::new(&config.compose);

    match args.command {
        Command::Capture { name, dest } => {
            let dest = dest.unwrap_or_else(|| config.archive.backup_dir.clone());
            let capture = Capture::new(&orchestrator, &config);
            let report = interruptible(capture.run(name.as_deref(), &dest)).await?;
            println!("\nCapture complete\n{report}");
        }

        Command::Recover { archive: None, .. } => {
            print_archives(&config, &archive::list(&config.archive.backup_dir)?);
            eprintln!("\nSpecify an archive to recover from.");
            return Ok(1);
        }

        Command::Recover {
            archive: Some(reference),
            yes,
        } => {
            let recovery = Recovery::new(&orchestrator, &config);
            let opened = recovery.open(&reference).await?;
            print_opened(&opened, &config);

            let question = if opened.manifest.classification.includes_appstate() && config.appstate().is_some() {
                format!(
                    "Database '{}' and the application data will be replaced.",
                    config.mongo.database
                )
            } else {
                format!("Database '{}' will be replaced.", config.mongo.database)
            };
            let confirmed = assume_yes(yes) || prompt::confirm(&question)?;

            let report = interruptible(recovery.restore(&opened, confirmed)).await?;
            println!("\nRecovery complete\n{report}");
        }

        Command::List => {
            print_archives(&config, &archive::list(&config.archive.backup_dir)?);
        }

        Command::Verify { archive } => {
            let opened = Recovery::new(&orchestrator, &config).open(&archive).await?;
            print_opened(&opened, &config);
            println!("Archive is valid");
        }

        Command::Prune { keep, yes } => {
            let doomed = archive::prune_candidates(&config.archive.backup_dir, keep)?;
            if doomed.is_empty() {
                println!("Nothing to prune (keeping {keep})");
                return Ok(0);
            }
            for entry in &doomed {
                println!("  {}", entry.name);
            }
            let question = format!("{} archive(s) will be deleted.", doomed.len());
            if !(assume_yes(yes) || prompt::confirm(&question)?) {
                return Err(BackupError::PreconditionDeclined.into());
            }
            let removed = archive::remove(&doomed)?;
            println!("Removed {removed} archive(s)");
        }

        Command::Import {
            kind,
            csv,
            database,
            collection,
            replace,
            yes,
        } => {
            let csv = import::csv_path(&csv)?;
            let database = database.as_deref().unwrap_or(&config.mongo.database);
            let target = collection.as_deref().unwrap_or(kind.default_collection());
            let confirmed = !replace
                || assume_yes(yes)
                || prompt::confirm(&format!(
                    "Collection '{database}.{target}' will be emptied before the import."
                ))?;

            let importer = Importer::new(&orchestrator, &config).database(database);
            let report =
                interruptible(importer.run(kind, &csv, collection.as_deref(), replace, confirmed))
                    .await?;
            println!("\nImport complete\n{report}");
        }
    }

    Ok(0)
}

/// Run a workflow until it finishes or a termination signal arrives. On a
/// signal the workflow future is dropped before returning.
async fn interruptible<T, F>(work: F) -> Result<T>
where
    F: Future<Output = stack_backup::Result<T>>,
{
    let outcome = tokio::select! {
        result = work => Ok(result),
        signal = shutdown::wait_for_signal() => Err(signal),
    };
    match outcome {
        Ok(result) => Ok(result?),
        Err(signal) => Err(Interrupted(signal?).into()),
    }
}

fn assume_yes(flag: bool) -> bool {
    flag || std::env::var("STACK_BACKUP_ASSUME_YES")
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

fn print_archives(config: &Config, entries: &[ArchiveEntry]) {
    if entries.is_empty() {
        println!("No archives in {}", config.archive.backup_dir.display());
        return;
    }
    println!("Archives in {}:", config.archive.backup_dir.display());
    for entry in entries {
        println!(
            "  {:<32} {:>12} bytes  {}",
            entry.name,
            entry.size,
            entry.modified.format("%Y-%m-%d %H:%M:%S")
        );
    }
}

fn print_opened(opened: &OpenedArchive, config: &Config) {
    let manifest = &opened.manifest;
    println!("Archive:   {} ({})", manifest.backup_name, opened.source.path().display());
    println!("Type:      {}", manifest.classification);
    println!("Created:   {}", manifest.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!(
        "Database:  {} -> {}",
        manifest.database, config.mongo.database
    );
    for c in &manifest.collections {
        println!("  {:<32} {:>12} bytes", c.name, c.bytes);
    }
}
