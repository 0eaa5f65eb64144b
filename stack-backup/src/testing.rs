//! In-process stand-in for the compose deployment.
//!
//! Emulates the data store's command-line tools over an in-memory document
//! map, and gives every service and volume a directory under one temp dir so
//! copies and helper containers behave like the real thing.

use crate::appstate;
use crate::archive::{self, layout, ArchiveFormat};
use crate::config::{Config, RetryPolicy};
use crate::orchestrator::{describe_command, ExecOutput, Orchestrator, VolumeInfo, VolumeMount};
use crate::store::scripts;
use crate::utils::{BackupError, Result};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::TempDir;

type Database = BTreeMap<String, Vec<Value>>;

#[derive(Default)]
struct State {
    running: HashSet<String>,
    databases: BTreeMap<String, Database>,
    failing_tools: HashSet<String>,
    calls: Vec<String>,
    starts: usize,
    stall_copies: bool,
}

pub struct FakeStack {
    root: TempDir,
    state: Mutex<State>,
}

fn ok(stdout: impl Into<String>) -> Result<ExecOutput> {
    Ok(ExecOutput {
        stdout: stdout.into(),
        stderr: String::new(),
        exit_code: 0,
    })
}

fn fail(code: i32, stderr: impl Into<String>) -> Result<ExecOutput> {
    Ok(ExecOutput {
        stdout: String::new(),
        stderr: stderr.into(),
        exit_code: code,
    })
}

fn flag<'a>(command: &'a [String], name: &str) -> Option<&'a str> {
    let pos = command.iter().position(|a| a == name)?;
    command.get(pos + 1).map(String::as_str)
}

/// The JSON string literal passed right after `call` in a generated script.
fn script_arg(script: &str, call: &str) -> String {
    script
        .split_once(call)
        .and_then(|(_, rest)| rest.split_once(')'))
        .and_then(|(arg, _)| serde_json::from_str(arg).ok())
        .unwrap_or_default()
}

fn copy_tree(from: &Path, to: &Path) -> std::io::Result<()> {
    if from.is_file() {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(from, to)?;
        return Ok(());
    }
    for entry in walkdir::WalkDir::new(from) {
        let entry = entry?;
        let rel = entry.path().strip_prefix(from).expect("walk stays under root");
        let dest = to.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest)?;
        } else {
            fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}

impl FakeStack {
    pub fn new() -> Self {
        let root = TempDir::new().expect("temp dir");
        let stack = Self {
            root,
            state: Mutex::new(State::default()),
        };
        {
            let mut state = stack.state.lock().unwrap();
            state.running.insert("mongodb".into());
            state.running.insert("metabase".into());
        }
        fs::create_dir_all(stack.volume_dir("metabase_data")).unwrap();
        fs::create_dir_all(stack.project_dir()).unwrap();
        stack
    }

    /// Configuration pointing at this stack, with fast retries and no health URL.
    pub fn config(&self) -> Config {
        let mut config = Config::default();
        config.mongo.database = "financedb".into();
        config.appstate.health_url = String::new();
        config.archive.backup_dir = self.root.path().join("backups");
        config.compose.project_dir = self.project_dir();
        config.retry.store = RetryPolicy {
            attempts: 3,
            interval_ms: 1,
        };
        config.retry.health = RetryPolicy {
            attempts: 1,
            interval_ms: 1,
        };
        config
    }

    pub fn project_dir(&self) -> PathBuf {
        self.root.path().join("project")
    }

    pub fn volume_dir(&self, volume: &str) -> PathBuf {
        self.root.path().join("volumes").join(volume)
    }

    pub fn service_path(&self, service: &str, path: &str) -> PathBuf {
        self.root
            .path()
            .join("services")
            .join(service)
            .join(path.trim_start_matches('/'))
    }

    pub fn write_volume_file(&self, volume: &str, rel: &str, contents: &[u8]) {
        let path = self.volume_dir(volume).join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    /// Insert `n` generated documents into `database.collection`.
    pub fn seed(&self, database: &str, collection: &str, n: usize) {
        let docs = (0..n)
            .map(|i| json!({ "_id": i, "amount": (i as f64) * 10.5, "memo": format!("txn {i}") }))
            .collect();
        self.insert(database, collection, docs);
    }

    pub fn insert(&self, database: &str, collection: &str, docs: Vec<Value>) {
        let mut state = self.state.lock().unwrap();
        state
            .databases
            .entry(database.to_string())
            .or_default()
            .entry(collection.to_string())
            .or_default()
            .extend(docs);
    }

    pub fn documents(&self, database: &str, collection: &str) -> Vec<Value> {
        let state = self.state.lock().unwrap();
        state
            .databases
            .get(database)
            .and_then(|db| db.get(collection))
            .cloned()
            .unwrap_or_default()
    }

    pub fn total_documents(&self, database: &str) -> usize {
        let state = self.state.lock().unwrap();
        state
            .databases
            .get(database)
            .map(|db| db.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    pub fn drop_database(&self, database: &str) {
        self.state.lock().unwrap().databases.remove(database);
    }

    pub fn set_running(&self, service: &str, running: bool) {
        let mut state = self.state.lock().unwrap();
        if running {
            state.running.insert(service.to_string());
        } else {
            state.running.remove(service);
        }
    }

    pub fn is_service_running(&self, service: &str) -> bool {
        self.state.lock().unwrap().running.contains(service)
    }

    /// Make every invocation of `tool` exit nonzero.
    pub fn fail_tool(&self, tool: &str) {
        self.state.lock().unwrap().failing_tools.insert(tool.to_string());
    }

    /// Make `copy_from` hang forever, as a stuck `docker compose cp` would.
    pub fn stall_copies(&self, stall: bool) {
        self.state.lock().unwrap().stall_copies = stall;
    }

    pub fn starts(&self) -> usize {
        self.state.lock().unwrap().starts
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    fn mongosh(&self, state: &mut State, command: &[String]) -> Result<ExecOutput> {
        let script = flag(command, "--eval").unwrap_or_default();
        let database = command.last().cloned().unwrap_or_default();

        match script {
            scripts::PING => ok("1\n"),
            scripts::DROP_DATABASE => {
                state.databases.remove(&database);
                ok("true\n")
            }
            scripts::COLLECTION_COUNTS => {
                let counts: Vec<Value> = state
                    .databases
                    .get(&database)
                    .map(|db| {
                        db.iter()
                            .map(|(name, docs)| json!({ "name": name, "count": docs.len() }))
                            .collect()
                    })
                    .unwrap_or_default();
                ok(format!("{}\n", Value::Array(counts)))
            }
            scripts::EXPORT_USERS => ok(
                r#"[{"_id":"admin.admin","user":"admin","db":"admin","roles":[{"role":"root","db":"admin"}]}]"#,
            ),
            s if s.contains(".createIndex(") => ok("index_1\n"),
            s if s.contains(".distinct(") => {
                let collection = script_arg(s, "getCollection(");
                let field = script_arg(s, ".distinct(");
                let mut values: Vec<String> = state
                    .databases
                    .get(&database)
                    .and_then(|db| db.get(&collection))
                    .map(|docs| {
                        docs.iter()
                            .filter_map(|d| d.get(&field).and_then(Value::as_str))
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                values.sort();
                values.dedup();
                ok(format!("{}\n", json!(values)))
            }
            other => fail(1, format!("unknown script: {other}")),
        }
    }

    fn mongodump(&self, state: &mut State, service: &str, command: &[String]) -> Result<ExecOutput> {
        let database = flag(command, "--db").unwrap_or_default();
        let out = flag(command, "--out").unwrap_or_default();
        let Some(db) = state.databases.get(database) else {
            return ok("");
        };

        let dir = self.service_path(service, out).join(database);
        fs::create_dir_all(&dir)?;
        for (collection, docs) in db {
            fs::write(dir.join(format!("{collection}.bson")), serde_json::to_vec(docs)?)?;
            fs::write(
                dir.join(format!("{collection}.metadata.json")),
                json!({ "collectionName": collection, "indexes": [] }).to_string(),
            )?;
        }
        ok("")
    }

    fn mongorestore(&self, state: &mut State, service: &str, command: &[String]) -> Result<ExecOutput> {
        let database = flag(command, "--db").unwrap_or_default().to_string();
        let dir = self.service_path(service, command.last().map(String::as_str).unwrap_or_default());
        if !dir.is_dir() {
            return fail(1, format!("{} does not exist", dir.display()));
        }

        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("bson") {
                continue;
            }
            let collection = path.file_stem().unwrap().to_string_lossy().to_string();
            let docs: Vec<Value> = serde_json::from_slice(&fs::read(&path)?)?;
            state
                .databases
                .entry(database.clone())
                .or_default()
                .entry(collection)
                .or_default()
                .extend(docs);
        }
        ok("")
    }

    fn mongoimport(&self, state: &mut State, service: &str, command: &[String]) -> Result<ExecOutput> {
        let database = flag(command, "--db").unwrap_or_default().to_string();
        let collection = flag(command, "--collection").unwrap_or_default().to_string();
        let file = self.service_path(service, flag(command, "--file").unwrap_or_default());
        let docs: Vec<Value> = serde_json::from_slice(&fs::read(file)?)?;

        let db = state.databases.entry(database).or_default();
        if command.iter().any(|a| a == "--drop") {
            db.remove(&collection);
        }
        db.entry(collection).or_default().extend(docs);
        ok("")
    }
}

impl Orchestrator for FakeStack {
    async fn is_running(&self, service: &str) -> Result<bool> {
        Ok(self.is_service_running(service))
    }

    async fn exec(&self, service: &str, command: &[String]) -> Result<ExecOutput> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("{service}: {}", describe_command(command)));

        if !state.running.contains(service) {
            return fail(1, format!("service \"{service}\" is not running"));
        }
        let tool = command.first().map(String::as_str).unwrap_or_default();
        if state.failing_tools.contains(tool) {
            return fail(1, format!("{tool}: simulated failure"));
        }

        match tool {
            "mongosh" => self.mongosh(&mut state, command),
            "mongodump" => self.mongodump(&mut state, service, command),
            "mongorestore" => self.mongorestore(&mut state, service, command),
            "mongoimport" => self.mongoimport(&mut state, service, command),
            "mkdir" => {
                let path = command.last().map(String::as_str).unwrap_or_default();
                fs::create_dir_all(self.service_path(service, path))?;
                ok("")
            }
            "rm" => {
                let path = self.service_path(service, command.last().map(String::as_str).unwrap_or_default());
                if path.is_dir() {
                    fs::remove_dir_all(path)?;
                } else if path.exists() {
                    fs::remove_file(path)?;
                }
                ok("")
            }
            other => fail(127, format!("{other}: not found")),
        }
    }

    async fn copy_from(&self, service: &str, path: &str, host_path: &Path) -> Result<()> {
        let stall = self.state.lock().unwrap().stall_copies;
        if stall {
            std::future::pending::<()>().await;
        }
        let source = self.service_path(service, path);
        if !source.exists() {
            return Err(BackupError::CommandFailed {
                command: format!("cp {service}:{path}"),
                code: 1,
                stderr: "no such file or directory".into(),
            });
        }
        copy_tree(&source, host_path)?;
        Ok(())
    }

    async fn copy_to(&self, host_path: &Path, service: &str, path: &str) -> Result<()> {
        copy_tree(host_path, &self.service_path(service, path))?;
        Ok(())
    }

    async fn stop(&self, service: &str) -> Result<()> {
        self.set_running(service, false);
        Ok(())
    }

    async fn start(&self, service: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.starts += 1;
        state.running.insert(service.to_string());
        Ok(())
    }

    async fn inspect_volume(&self, volume: &str) -> Result<VolumeInfo> {
        let dir = self.volume_dir(volume);
        if !dir.is_dir() {
            return Err(BackupError::CommandFailed {
                command: format!("volume inspect {volume}"),
                code: 1,
                stderr: "no such volume".into(),
            });
        }
        Ok(VolumeInfo {
            name: volume.to_string(),
            driver: "local".into(),
            mountpoint: dir.display().to_string(),
            created_at: None,
        })
    }

    async fn run_with_volume(
        &self,
        mount: VolumeMount<'_>,
        host_dir: &Path,
        command: &[String],
    ) -> Result<ExecOutput> {
        self.state
            .lock()
            .unwrap()
            .calls
            .push(format!("run {}: {}", mount.volume, describe_command(command)));

        let volume = self.volume_dir(mount.volume);
        let tarball = host_dir.join(layout::APPSTATE);

        if command == appstate::capture_command().as_slice() {
            archive::pack(&volume, ".", &tarball, ArchiveFormat::Gzip, None)?;
            ok("")
        } else if command == appstate::replace_command().as_slice() {
            if mount.read_only {
                return fail(1, "read-only file system");
            }
            if !tarball.is_file() {
                return fail(2, "tar: can't open metabase_data.tar.gz");
            }
            fs::remove_dir_all(&volume)?;
            fs::create_dir_all(&volume)?;
            archive::unpack(&tarball, &volume)?;
            ok("")
        } else {
            fail(127, "unsupported helper command")
        }
    }
}
