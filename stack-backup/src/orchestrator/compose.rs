//! Docker Compose implementation of [`Orchestrator`].
//!
//! Shells out to the `docker` CLI. Service-level operations go through
//! `docker compose` scoped to the configured project; volume helpers use
//! plain `docker run --rm`.

use super::{argv, describe_command, ExecOutput, Orchestrator, VolumeInfo, VolumeMount, HOST_MOUNT};
use crate::config::ComposeConfig;
use crate::utils::{BackupError, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

pub struct ComposeOrchestrator {
    docker_bin: String,
    project_dir: PathBuf,
    compose_file: PathBuf,
    helper_image: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DockerVolume {
    name: String,
    #[serde(default)]
    driver: String,
    #[serde(default)]
    mountpoint: String,
    #[serde(default)]
    created_at: Option<String>,
}

impl ComposeOrchestrator {
    pub fn new(config: &ComposeConfig) -> Self {
        Self {
            docker_bin: config.docker_bin.clone(),
            project_dir: config.project_dir.clone(),
            compose_file: config.project_dir.join(&config.compose_file),
            helper_image: config.helper_image.clone(),
        }
    }

    /// Full argv for a `docker compose` subcommand in this project.
    fn compose_command(&self, args: &[&str]) -> Vec<String> {
        let mut cmd = argv([self.docker_bin.as_str(), "compose", "--project-directory"]);
        cmd.push(self.project_dir.display().to_string());
        cmd.push("-f".to_string());
        cmd.push(self.compose_file.display().to_string());
        cmd.extend(args.iter().map(|a| a.to_string()));
        cmd
    }

    async fn run(&self, command: &[String]) -> Result<ExecOutput> {
        debug!("Running: {}", describe_command(command));

        let (program, args) = command
            .split_first()
            .ok_or_else(|| BackupError::Config("empty command".into()))?;
        let output = Command::new(program).args(args).output().await?;

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn run_checked(&self, command: Vec<String>) -> Result<ExecOutput> {
        self.run(&command).await?.check(&command)
    }

    /// Compose prefixes volume names with the project name; look the volume up
    /// by its compose label and fall back to the literal name.
    async fn resolve_volume(&self, volume: &str) -> Result<String> {
        let filter = format!("label=com.docker.compose.volume={volume}");
        let cmd = argv([self.docker_bin.as_str(), "volume", "ls", "-q", "--filter", filter.as_str()]);
        let output = self.run_checked(cmd).await?;
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or(volume)
            .to_string())
    }
}

fn service_listed(stdout: &str, service: &str) -> bool {
    stdout.lines().any(|line| line.trim() == service)
}

fn parse_volume_inspect(stdout: &str) -> Result<VolumeInfo> {
    let volumes: Vec<DockerVolume> = serde_json::from_str(stdout)?;
    let volume = volumes
        .into_iter()
        .next()
        .ok_or_else(|| BackupError::DiagnosticCollectionFailed("volume inspect returned nothing".into()))?;
    Ok(VolumeInfo {
        name: volume.name,
        driver: volume.driver,
        mountpoint: volume.mountpoint,
        created_at: volume.created_at,
    })
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

impl Orchestrator for ComposeOrchestrator {
    async fn is_running(&self, service: &str) -> Result<bool> {
        let cmd = self.compose_command(&["ps", "--status", "running", "--services"]);
        let output = self.run_checked(cmd).await?;
        Ok(service_listed(&output.stdout, service))
    }

    async fn exec(&self, service: &str, command: &[String]) -> Result<ExecOutput> {
        let mut cmd = self.compose_command(&["exec", "-T", service]);
        cmd.extend(command.iter().cloned());
        self.run(&cmd).await
    }

    async fn copy_from(&self, service: &str, path: &str, host_path: &Path) -> Result<()> {
        if let Some(parent) = host_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let source = format!("{service}:{path}");
        let dest = host_path.display().to_string();
        let cmd = self.compose_command(&["cp", source.as_str(), dest.as_str()]);
        self.run_checked(cmd).await?;
        Ok(())
    }

    async fn copy_to(&self, host_path: &Path, service: &str, path: &str) -> Result<()> {
        if let Some(parent) = Path::new(path).parent() {
            let parent = parent.display().to_string();
            let mkdir = argv(["mkdir", "-p", parent.as_str()]);
            self.exec(service, &mkdir).await?.check(&mkdir)?;
        }
        let source = host_path.display().to_string();
        let dest = format!("{service}:{path}");
        let cmd = self.compose_command(&["cp", source.as_str(), dest.as_str()]);
        self.run_checked(cmd).await?;
        Ok(())
    }

    async fn stop(&self, service: &str) -> Result<()> {
        self.run_checked(self.compose_command(&["stop", service])).await?;
        Ok(())
    }

    async fn start(&self, service: &str) -> Result<()> {
        self.run_checked(self.compose_command(&["up", "-d", service])).await?;
        Ok(())
    }

    async fn inspect_volume(&self, volume: &str) -> Result<VolumeInfo> {
        let name = self.resolve_volume(volume).await?;
        let cmd = argv([self.docker_bin.as_str(), "volume", "inspect", name.as_str()]);
        let output = self.run_checked(cmd).await?;
        parse_volume_inspect(&output.stdout)
    }

    async fn run_with_volume(
        &self,
        mount: VolumeMount<'_>,
        host_dir: &Path,
        command: &[String],
    ) -> Result<ExecOutput> {
        let volume = self.resolve_volume(mount.volume).await?;
        let mut volume_arg = format!("{}:{}", volume, mount.target);
        if mount.read_only {
            volume_arg.push_str(":ro");
        }
        let host_arg = format!("{}:{}", absolute(host_dir)?.display(), HOST_MOUNT);

        let mut cmd = argv([
            self.docker_bin.as_str(),
            "run",
            "--rm",
            "-v",
            volume_arg.as_str(),
            "-v",
            host_arg.as_str(),
            self.helper_image.as_str(),
        ]);
        cmd.extend(command.iter().cloned());
        self.run(&cmd).await
    }
}
