//! Container orchestrator interface.
//!
//! The workflow never talks to a container runtime directly. Everything it
//! needs from the deployment (service state, commands inside services, file
//! transfer, volume manipulation) goes through [`Orchestrator`].

pub mod compose;

use crate::utils::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub use compose::ComposeOrchestrator;

/// Output of a command run inside a service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Turn a nonzero exit into [`BackupError::CommandFailed`].
    pub fn check(self, command: &[String]) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(BackupError::CommandFailed {
                command: describe_command(command),
                code: self.exit_code,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Volume metadata as reported by the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub name: String,
    pub driver: String,
    pub mountpoint: String,
    pub created_at: Option<String>,
}

/// A volume mounted into a one-off helper container.
#[derive(Debug, Clone, Copy)]
pub struct VolumeMount<'a> {
    pub volume: &'a str,
    pub target: &'a str,
    pub read_only: bool,
}

/// Host directory exposed to helper containers at this path.
pub const HOST_MOUNT: &str = "/backup";

/// Operations the snapshot workflow needs from the deployment.
#[allow(async_fn_in_trait)]
pub trait Orchestrator {
    /// Whether the named service has a running container.
    async fn is_running(&self, service: &str) -> Result<bool>;

    /// Run a command inside a running service.
    async fn exec(&self, service: &str, command: &[String]) -> Result<ExecOutput>;

    /// Copy `path` out of the service so that it lands exactly at `host_path`.
    async fn copy_from(&self, service: &str, path: &str, host_path: &Path) -> Result<()>;

    /// Copy `host_path` into the service so that it lands exactly at `path`.
    async fn copy_to(&self, host_path: &Path, service: &str, path: &str) -> Result<()>;

    async fn stop(&self, service: &str) -> Result<()>;

    async fn start(&self, service: &str) -> Result<()>;

    async fn inspect_volume(&self, volume: &str) -> Result<VolumeInfo>;

    /// Run a command in a throwaway container with `mount` attached and
    /// `host_dir` exposed at [`HOST_MOUNT`].
    async fn run_with_volume(
        &self,
        mount: VolumeMount<'_>,
        host_dir: &Path,
        command: &[String],
    ) -> Result<ExecOutput>;
}

/// Render a command for log and error messages, hiding password arguments.
pub fn describe_command(command: &[String]) -> String {
    let mut parts = Vec::with_capacity(command.len());
    let mut redact_next = false;
    for arg in command {
        if redact_next {
            parts.push("****".to_string());
            redact_next = false;
            continue;
        }
        redact_next = arg == "--password" || arg == "-p";
        parts.push(arg.clone());
    }
    parts.join(" ")
}

/// Build an owned argv from string slices.
pub fn argv<I, S>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    args.into_iter().map(Into::into).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_command_redacts_password() {
        let cmd = argv(["mongodump", "--username", "admin", "--password", "secret", "--db", "x"]);
        let text = describe_command(&cmd);
        assert!(!text.contains("secret"));
        assert!(text.contains("--password ****"));
        assert!(text.contains("--db x"));
    }

    #[test]
    fn test_check_nonzero_exit() {
        let output = ExecOutput {
            stdout: String::new(),
            stderr: "auth failed\n".into(),
            exit_code: 1,
        };
        let err = output.check(&argv(["mongosh"])).unwrap_err();
        match err {
            BackupError::CommandFailed { code, stderr, .. } => {
                assert_eq!(code, 1);
                assert_eq!(stderr, "auth failed");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
