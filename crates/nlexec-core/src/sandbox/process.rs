//! Local interpreter runtime for hosts without Docker.
//!
//! Isolation is weaker than a container: each run gets a private scratch
//! directory, a cleared environment, an isolated-mode interpreter and rlimits
//! applied by the harness. Network access is refused inside the harness.

use super::harness::{HarnessPayload, ARTIFACT_FILE, HARNESS_FILE, HARNESS_SOURCE, PAYLOAD_FILE};
use super::{RawRun, SandboxHandle, SandboxRuntime};
use crate::core_types::{CodeArtifact, ResourceLimits, SandboxBackend};
use crate::errors::SandboxError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const MAX_OUTPUT_BYTES: u64 = 1024 * 1024;
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub struct ProcessRuntime {
    python_path: String,
    workspaces: Mutex<HashMap<String, TempDir>>,
}

impl ProcessRuntime {
    pub fn new(python_path: String) -> Self {
        Self {
            python_path,
            workspaces: Mutex::new(HashMap::new()),
        }
    }

    /// Sandboxes provisioned and not yet torn down.
    pub fn live_sandboxes(&self) -> usize {
        self.workspaces.lock().map(|w| w.len()).unwrap_or(0)
    }

    fn command(&self, handle: &SandboxHandle) -> Command {
        let mut command = Command::new(&self.python_path);
        command
            .arg("-I")
            .arg("-B")
            .arg(HARNESS_FILE)
            .arg(ARTIFACT_FILE)
            .arg(PAYLOAD_FILE)
            .current_dir(handle.workspace())
            .env_clear()
            .env("HOME", handle.workspace())
            .env("LANG", "C.UTF-8")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(path) = std::env::var_os("PATH") {
            command.env("PATH", path);
        }
        command
    }
}

async fn read_capped<R: AsyncRead + Unpin>(reader: Option<R>) -> Vec<u8> {
    let mut buffer = Vec::new();
    let Some(mut reader) = reader else {
        return buffer;
    };
    if let Err(e) = (&mut reader).take(MAX_OUTPUT_BYTES).read_to_end(&mut buffer).await {
        log::debug!("Reading sandbox output failed: {}", e);
    }
    // Keep draining so the child never blocks on a full pipe.
    let _ = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await;
    buffer
}

async fn kill(child: &mut Child) {
    if let Err(e) = child.kill().await {
        log::warn!("Failed to kill sandbox process: {}", e);
    }
}

#[async_trait]
impl SandboxRuntime for ProcessRuntime {
    fn backend(&self) -> SandboxBackend {
        SandboxBackend::Process
    }

    fn needs_rlimits(&self) -> bool {
        cfg!(unix)
    }

    async fn provision(
        &self,
        limits: &ResourceLimits,
        network_enabled: bool,
    ) -> Result<SandboxHandle, SandboxError> {
        let workspace = tempfile::Builder::new().prefix("nlexec-").tempdir()?;
        let id = Uuid::new_v4().to_string();
        let handle = SandboxHandle::new(
            id.clone(),
            SandboxBackend::Process,
            *limits,
            network_enabled,
            workspace.path().to_path_buf(),
        );
        self.workspaces
            .lock()
            .map_err(|_| SandboxError::ProvisionFailed("workspace registry poisoned".to_string()))?
            .insert(id, workspace);
        Ok(handle)
    }

    async fn run(
        &self,
        handle: &SandboxHandle,
        artifact: &CodeArtifact,
        payload: &HarnessPayload,
        cancel: &CancellationToken,
    ) -> Result<RawRun, SandboxError> {
        let workspace = handle.workspace();
        fs::write(workspace.join(HARNESS_FILE), HARNESS_SOURCE).await?;
        fs::write(workspace.join(ARTIFACT_FILE), &artifact.source_text).await?;
        fs::write(workspace.join(PAYLOAD_FILE), serde_json::to_vec(payload)?).await?;

        let mut child = self.command(handle).spawn().map_err(|e| {
            SandboxError::ProvisionFailed(format!("could not start '{}': {}", self.python_path, e))
        })?;
        let stdout_task = tokio::spawn(read_capped(child.stdout.take()));
        let stderr_task = tokio::spawn(read_capped(child.stderr.take()));

        let mut raw = RawRun::default();
        tokio::select! {
            status = child.wait() => {
                let status = status?;
                raw.exit_code = status.code().map(i64::from);
                #[cfg(unix)]
                {
                    use std::os::unix::process::ExitStatusExt;
                    raw.signal = status.signal();
                }
            }
            _ = tokio::time::sleep(handle.limits().wall_clock_timeout) => {
                log::warn!("Sandbox {} hit its wall clock limit; killing", handle.id());
                kill(&mut child).await;
                raw.timed_out = true;
            }
            _ = cancel.cancelled() => {
                log::info!("Sandbox {} cancelled; killing", handle.id());
                kill(&mut child).await;
                raw.cancelled = true;
            }
        }

        let stdout = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, stdout_task).await;
        let stderr = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, stderr_task).await;
        raw.stdout = String::from_utf8_lossy(&stdout.ok().and_then(|r| r.ok()).unwrap_or_default()).into_owned();
        raw.stderr = String::from_utf8_lossy(&stderr.ok().and_then(|r| r.ok()).unwrap_or_default()).into_owned();
        Ok(raw)
    }

    async fn teardown(&self, handle: SandboxHandle) -> Result<(), SandboxError> {
        let workspace = self
            .workspaces
            .lock()
            .map_err(|_| SandboxError::ProvisionFailed("workspace registry poisoned".to_string()))?
            .remove(handle.id())
            .ok_or_else(|| SandboxError::ForeignHandle(handle.id().to_string()))?;
        workspace.close()?;
        Ok(())
    }
}
