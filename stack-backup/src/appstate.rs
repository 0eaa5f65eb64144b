//! Application-state volume handling.
//!
//! The volume is an opaque tree owned by the analytics application. It is
//! captured as a gzip tarball through a read-only helper mount and replaced
//! wholesale on restore; nothing here looks inside it.

use crate::archive::layout;
use crate::config::{AppStateConfig, RetryPolicy};
use crate::orchestrator::{argv, Orchestrator, VolumeInfo, VolumeMount, HOST_MOUNT};
use crate::utils::retry::poll;
use crate::utils::{BackupError, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Where helper containers see the application volume.
pub const VOLUME_MOUNT: &str = "/appstate";

const HEALTH_PATH: &str = "/api/health";
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
}

pub fn capture_command() -> Vec<String> {
    let target = format!("{}/{}", HOST_MOUNT, layout::APPSTATE);
    argv(["tar", "czf", target.as_str(), "-C", VOLUME_MOUNT, "."])
}

pub fn replace_command() -> Vec<String> {
    let script = format!(
        "find {mount} -mindepth 1 -delete && tar xzf {host}/{file} -C {mount}",
        mount = VOLUME_MOUNT,
        host = HOST_MOUNT,
        file = layout::APPSTATE
    );
    argv(["sh", "-c", script.as_str()])
}

pub struct AppState<'a, O> {
    orchestrator: &'a O,
    config: &'a AppStateConfig,
}

impl<'a, O: Orchestrator> AppState<'a, O> {
    pub fn new(orchestrator: &'a O, config: &'a AppStateConfig) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    pub fn service(&self) -> &str {
        &self.config.service
    }

    pub async fn inspect(&self) -> Result<VolumeInfo> {
        self.orchestrator.inspect_volume(&self.config.volume).await
    }

    /// Write `metabase_data.tar.gz` into `archive_root` from the live volume.
    pub async fn capture(&self, archive_root: &Path) -> Result<u64> {
        let mount = VolumeMount {
            volume: &self.config.volume,
            target: VOLUME_MOUNT,
            read_only: true,
        };
        let command = capture_command();
        self.orchestrator
            .run_with_volume(mount, archive_root, &command)
            .await?
            .check(&command)?;

        let tarball = archive_root.join(layout::APPSTATE);
        let size = std::fs::metadata(&tarball)
            .map_err(|e| {
                BackupError::CorruptArchive(format!("{} was not produced: {}", layout::APPSTATE, e))
            })?
            .len();
        Ok(size)
    }

    /// Stop the application, replace the volume from `archive_root`, start it again.
    ///
    /// The application is restarted even when the replacement fails, so a
    /// failed restore does not also leave it down.
    pub async fn replace(&self, archive_root: &Path) -> Result<()> {
        info!("Stopping {}", self.service());
        self.orchestrator.stop(self.service()).await?;

        let mount = VolumeMount {
            volume: &self.config.volume,
            target: VOLUME_MOUNT,
            read_only: false,
        };
        let command = replace_command();
        let replaced = match self
            .orchestrator
            .run_with_volume(mount, archive_root, &command)
            .await
        {
            Ok(output) => output.check(&command).map(|_| ()),
            Err(e) => Err(e),
        };

        info!("Starting {}", self.service());
        let started = self.orchestrator.start(self.service()).await;

        replaced?;
        started
    }

    /// Poll the application's health endpoint. `Some(false)` when it never
    /// reported healthy within the policy, `None` when no URL is configured.
    pub async fn wait_healthy(&self, policy: RetryPolicy) -> Result<Option<bool>> {
        let base = self.config.health_url.trim_end_matches('/');
        if base.is_empty() {
            return Ok(None);
        }
        let url = format!("{base}{HEALTH_PATH}");
        let client = reqwest::Client::builder().timeout(HEALTH_TIMEOUT).build()?;

        info!("Waiting for {} to report healthy at {}", self.service(), url);
        let healthy = poll(policy, self.service(), || check_health(&client, &url)).await;
        match healthy {
            Some(attempt) => {
                info!("{} healthy after {} attempt(s)", self.service(), attempt);
                Ok(Some(true))
            }
            None => {
                warn!("{} did not report healthy at {}", self.service(), url);
                Ok(Some(false))
            }
        }
    }
}

async fn check_health(client: &reqwest::Client, url: &str) -> Result<()> {
    let response = client.get(url).send().await?.error_for_status()?;
    let body: HealthResponse = response.json().await?;
    if body.status == "ok" {
        Ok(())
    } else {
        Err(BackupError::ServiceUnavailable(format!("health status {}", body.status)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeStack;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_commands_target_mounts() {
        assert_eq!(
            capture_command(),
            argv(["tar", "czf", "/backup/metabase_data.tar.gz", "-C", "/appstate", "."])
        );
        let replace = replace_command();
        assert_eq!(replace[0], "sh");
        assert!(replace[2].contains("tar xzf /backup/metabase_data.tar.gz -C /appstate"));
    }

    #[tokio::test]
    async fn test_capture_then_replace_restores_volume() {
        let stack = FakeStack::new();
        stack.write_volume_file("metabase_data", "metabase.db.mv.db", b"dashboards-v1");
        let config = stack.config();
        let appstate = AppState::new(&stack, &config.appstate);

        let root = TempDir::new().unwrap();
        let size = appstate.capture(root.path()).await.unwrap();
        assert!(size > 0);

        stack.write_volume_file("metabase_data", "metabase.db.mv.db", b"dashboards-v2");
        stack.write_volume_file("metabase_data", "stray.tmp", b"junk");

        appstate.replace(root.path()).await.unwrap();

        let volume = stack.volume_dir("metabase_data");
        assert_eq!(fs::read(volume.join("metabase.db.mv.db")).unwrap(), b"dashboards-v1");
        assert!(!volume.join("stray.tmp").exists());
        assert!(stack.is_service_running("metabase"));
    }

    #[tokio::test]
    async fn test_replace_restarts_on_failure() {
        let stack = FakeStack::new();
        let config = stack.config();
        let appstate = AppState::new(&stack, &config.appstate);

        let empty = TempDir::new().unwrap();
        assert!(appstate.replace(empty.path()).await.is_err());
        assert!(stack.is_service_running("metabase"));
    }

    #[tokio::test]
    async fn test_health_unreachable_reports_unhealthy() {
        let stack = FakeStack::new();
        let mut config = stack.config();
        config.appstate.health_url = "http://127.0.0.1:9".into();
        let appstate = AppState::new(&stack, &config.appstate);

        let policy = RetryPolicy {
            attempts: 2,
            interval_ms: 1,
        };
        assert_eq!(appstate.wait_healthy(policy).await.unwrap(), Some(false));
    }

    #[tokio::test]
    async fn test_health_without_url_is_unknown() {
        let stack = FakeStack::new();
        let config = stack.config();
        let appstate = AppState::new(&stack, &config.appstate);
        let policy = RetryPolicy {
            attempts: 1,
            interval_ms: 1,
        };
        assert_eq!(appstate.wait_healthy(policy).await.unwrap(), None);
    }
}
