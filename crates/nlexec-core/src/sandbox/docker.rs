// src/sandbox/docker.rs
use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions as BollardCreateContainerOptionsQuery,
    CreateImageOptions as BollardCreateImageOptionsQuery,
    InspectContainerOptions as BollardInspectContainerOptionsQuery,
    KillContainerOptions as BollardKillContainerOptionsQuery,
    LogsOptions as BollardLogsOptionsQuery,
    RemoveContainerOptions as BollardRemoveContainerOptionsQuery,
    StartContainerOptions as BollardStartContainerOptionsQuery,
    WaitContainerOptions as BollardWaitContainerOptionsQuery,
};
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::sync::Mutex;
use tempfile::TempDir;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::harness::{HarnessPayload, ARTIFACT_FILE, HARNESS_FILE, HARNESS_SOURCE, PAYLOAD_FILE};
use super::{RawRun, SandboxHandle, SandboxRuntime};
use crate::core_types::{CodeArtifact, ResourceLimits, SandboxBackend};
use crate::errors::SandboxError;

const CONTAINER_WORK_DIR: &str = "/sandbox";
const PIDS_LIMIT: i64 = 64;

struct Provisioned {
    container_id: String,
    // Bind-mounted into the container; removed with it.
    workspace: TempDir,
}

/// One short-lived container per execution, created at provision time and
/// started by `run`.
pub struct DockerRuntime {
    docker: Docker,
    image: String,
    containers: Mutex<HashMap<String, Provisioned>>,
}

impl DockerRuntime {
    pub fn new(image: String) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self {
            docker,
            image,
            containers: Mutex::new(HashMap::new()),
        })
    }

    pub fn live_sandboxes(&self) -> usize {
        self.containers.lock().map(|c| c.len()).unwrap_or(0)
    }

    fn container_id(&self, handle: &SandboxHandle) -> Result<String, SandboxError> {
        self.containers
            .lock()
            .map_err(|_| SandboxError::ProvisionFailed("container registry poisoned".to_string()))?
            .get(handle.id())
            .map(|p| p.container_id.clone())
            .ok_or_else(|| SandboxError::ForeignHandle(handle.id().to_string()))
    }

    async fn ensure_image(&self) -> Result<(), SandboxError> {
        if self.docker.inspect_image(&self.image).await.is_ok() {
            return Ok(());
        }
        log::info!("Pulling sandbox image {}", self.image);
        let mut pull = self.docker.create_image(
            Some(BollardCreateImageOptionsQuery {
                from_image: Some(self.image.clone()),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = pull.next().await {
            progress?;
        }
        Ok(())
    }

    async fn collect_logs(&self, container_id: &str) -> Result<(String, String), SandboxError> {
        let mut output_stream = self.docker.logs(
            container_id,
            Some(BollardLogsOptionsQuery {
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );
        let mut buffers = LogBuffers::default();
        while let Some(log_result) = output_stream.next().await {
            buffers.push(log_result?);
        }
        Ok(buffers.decode())
    }

    async fn kill(&self, container_id: &str) {
        if let Err(e) = self
            .docker
            .kill_container(container_id, None::<BollardKillContainerOptionsQuery>)
            .await
        {
            log::warn!("Failed to kill container {}: {}", container_id, e);
        }
    }
}

/// Frames may split a multi-byte character, so each stream is decoded once.
#[derive(Debug, Default)]
struct LogBuffers {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl LogBuffers {
    fn push(&mut self, frame: LogOutput) {
        match frame {
            LogOutput::StdOut { message } => self.stdout.extend_from_slice(&message),
            LogOutput::StdErr { message } => self.stderr.extend_from_slice(&message),
            _ => {}
        }
    }

    fn decode(self) -> (String, String) {
        (
            String::from_utf8_lossy(&self.stdout).into_owned(),
            String::from_utf8_lossy(&self.stderr).into_owned(),
        )
    }
}

#[async_trait]
impl SandboxRuntime for DockerRuntime {
    fn backend(&self) -> SandboxBackend {
        SandboxBackend::Docker
    }

    async fn provision(
        &self,
        limits: &ResourceLimits,
        network_enabled: bool,
    ) -> Result<SandboxHandle, SandboxError> {
        self.ensure_image().await?;

        let workspace = tempfile::Builder::new().prefix("nlexec-").tempdir()?;
        let host_dir = workspace
            .path()
            .to_str()
            .ok_or_else(|| SandboxError::ProvisionFailed("Invalid temp path".to_string()))?
            .to_string();
        let id = Uuid::new_v4().to_string();

        let options = Some(BollardCreateContainerOptionsQuery {
            name: Some(format!("nlexec-{}", id)),
            ..Default::default()
        });
        let memory = (limits.memory_mb * 1024 * 1024) as i64;
        let config = ContainerCreateBody {
            image: Some(self.image.clone()),
            cmd: Some(vec![
                "python".to_string(),
                "-I".to_string(),
                "-B".to_string(),
                format!("{}/{}", CONTAINER_WORK_DIR, HARNESS_FILE),
                format!("{}/{}", CONTAINER_WORK_DIR, ARTIFACT_FILE),
                format!("{}/{}", CONTAINER_WORK_DIR, PAYLOAD_FILE),
            ]),
            working_dir: Some(CONTAINER_WORK_DIR.to_string()),
            network_disabled: Some(!network_enabled),
            host_config: Some(HostConfig {
                binds: Some(vec![format!("{}:{}", host_dir, CONTAINER_WORK_DIR)]),
                memory: Some(memory),
                memory_swap: Some(memory),
                nano_cpus: Some((limits.cpu * 1e9) as i64),
                pids_limit: Some(PIDS_LIMIT),
                network_mode: (!network_enabled).then(|| "none".to_string()),
                security_opt: Some(vec!["no-new-privileges".to_string()]),
                ..Default::default()
            }),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let container = self.docker.create_container(options, config).await?;
        log::debug!("Created container {} for sandbox {}", container.id, id);
        let workspace_path = workspace.path().to_path_buf();
        self.containers
            .lock()
            .map_err(|_| SandboxError::ProvisionFailed("container registry poisoned".to_string()))?
            .insert(
                id.clone(),
                Provisioned {
                    container_id: container.id,
                    workspace,
                },
            );
        Ok(SandboxHandle::new(
            id,
            SandboxBackend::Docker,
            *limits,
            network_enabled,
            workspace_path,
        ))
    }

    async fn run(
        &self,
        handle: &SandboxHandle,
        artifact: &CodeArtifact,
        payload: &HarnessPayload,
        cancel: &CancellationToken,
    ) -> Result<RawRun, SandboxError> {
        let container_id = self.container_id(handle)?;
        let workspace = handle.workspace();
        fs::write(workspace.join(HARNESS_FILE), HARNESS_SOURCE).await?;
        fs::write(workspace.join(ARTIFACT_FILE), &artifact.source_text).await?;
        fs::write(workspace.join(PAYLOAD_FILE), serde_json::to_vec(payload)?).await?;

        self.docker
            .start_container(&container_id, None::<BollardStartContainerOptionsQuery>)
            .await?;

        let mut raw = RawRun::default();
        let mut wait_stream = self
            .docker
            .wait_container(&container_id, None::<BollardWaitContainerOptionsQuery>);
        let wait_outcome = tokio::select! {
            res = wait_stream.next() => Some(res),
            _ = tokio::time::sleep(handle.limits().wall_clock_timeout) => {
                log::warn!("Execution timed out for container {}", container_id);
                raw.timed_out = true;
                None
            }
            _ = cancel.cancelled() => {
                log::info!("Sandbox {} cancelled; killing container", handle.id());
                raw.cancelled = true;
                None
            }
        };
        drop(wait_stream);

        match wait_outcome {
            Some(Some(Ok(response))) => raw.exit_code = Some(response.status_code),
            // Non-zero exits arrive as wait errors.
            Some(Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. }))) => {
                raw.exit_code = Some(code)
            }
            Some(Some(Err(e))) => return Err(SandboxError::BollardError(e)),
            Some(None) => {
                return Err(SandboxError::ProvisionFailed(
                    "Container wait stream ended unexpectedly".to_string(),
                ))
            }
            None => self.kill(&container_id).await,
        }

        let state = self
            .docker
            .inspect_container(&container_id, None::<BollardInspectContainerOptionsQuery>)
            .await?
            .state;
        raw.oom_killed = state.and_then(|s| s.oom_killed).unwrap_or(false);

        let (stdout, stderr) = self.collect_logs(&container_id).await?;
        raw.stdout = stdout;
        raw.stderr = stderr;
        Ok(raw)
    }

    async fn teardown(&self, handle: SandboxHandle) -> Result<(), SandboxError> {
        let provisioned = self
            .containers
            .lock()
            .map_err(|_| SandboxError::ProvisionFailed("container registry poisoned".to_string()))?
            .remove(handle.id())
            .ok_or_else(|| SandboxError::ForeignHandle(handle.id().to_string()))?;
        let removed = self
            .docker
            .remove_container(
                &provisioned.container_id,
                Some(BollardRemoveContainerOptionsQuery {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;
        provisioned.workspace.close()?;
        removed?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SandboxExecutor;
    use crate::core_types::{ArtifactOrigin, ExecutionRequest, ExitReason};
    use crate::deps::ImportTable;
    use std::sync::Arc;
    use std::time::Duration;

    fn request(source: &str, timeout: u64) -> ExecutionRequest {
        ExecutionRequest {
            code_artifact: CodeArtifact {
                source_text: source.to_string(),
                entry_point_name: "main".to_string(),
                parameters: Vec::new(),
                description: String::new(),
                origin: ArtifactOrigin::Provided,
            },
            resource_limits: ResourceLimits {
                wall_clock_timeout: Duration::from_secs(timeout),
                ..Default::default()
            },
            network_enabled: false,
            arguments: Default::default(),
        }
    }

    #[test]
    fn test_split_utf8_frames_decode_intact() {
        let text = "zażółć\n".as_bytes();
        let mut buffers = LogBuffers::default();
        buffers.push(LogOutput::StdOut { message: text[..3].to_vec().into() });
        buffers.push(LogOutput::StdErr { message: b"warn\n".to_vec().into() });
        buffers.push(LogOutput::StdOut { message: text[3..].to_vec().into() });
        buffers.push(LogOutput::StdOut { message: vec![0xff].into() });
        let (stdout, stderr) = buffers.decode();
        assert_eq!(stdout, "zażółć\n\u{fffd}");
        assert_eq!(stderr, "warn\n");
    }

    #[tokio::test]
    #[ignore] // Requires Docker daemon
    async fn test_docker_runs_and_removes_container() {
        let runtime = Arc::new(DockerRuntime::new("python:3.11-slim".to_string()).unwrap());
        let executor = SandboxExecutor::new(runtime.clone(), Arc::new(ImportTable::standard()));

        let result = executor
            .execute(&request("def main():\n    return 2 + 2\n", 30), &CancellationToken::new())
            .await;
        assert!(result.success, "{:?}", result);
        assert_eq!(result.return_value, Some(serde_json::json!(4)));
        assert_eq!(runtime.live_sandboxes(), 0);
    }

    #[tokio::test]
    #[ignore] // Requires Docker daemon
    async fn test_docker_timeout() {
        let runtime = Arc::new(DockerRuntime::new("python:3.11-slim".to_string()).unwrap());
        let executor = SandboxExecutor::new(runtime.clone(), Arc::new(ImportTable::standard()));

        let result = executor
            .execute(&request("def main():\n    while True:\n        pass\n", 2), &CancellationToken::new())
            .await;
        assert_eq!(result.exit_reason, ExitReason::Timeout);
        assert_eq!(runtime.live_sandboxes(), 0);
    }
}
