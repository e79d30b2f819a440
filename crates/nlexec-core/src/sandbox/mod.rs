//! Sandboxed execution of code artifacts.
//!
//! A `SandboxRuntime` knows how to provision, run in and tear down one
//! isolated context. `SandboxExecutor` drives a runtime through a single
//! execution and turns the raw outcome into an `ExecutionResult`. The
//! executor holds the provisioned handle in a `SandboxLease`, so teardown
//! happens exactly once on every path, including a dropped future.

pub mod docker;
pub mod harness;
pub mod process;

use crate::config::SandboxConfig;
use crate::core_types::{
    CodeArtifact, ExecutionRequest, ExecutionResult, ExitReason, ResourceLimits, SandboxBackend,
};
use crate::deps::ImportTable;
use crate::errors::{PipelineError, SandboxError};
use async_trait::async_trait;
use harness::{parse_output, HarnessPayload};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

pub use docker::DockerRuntime;
pub use process::ProcessRuntime;

/// Extra time a runtime gets beyond the wall clock limit before the executor
/// gives up on it.
const RUNTIME_GRACE: Duration = Duration::from_secs(30);

const SIGKILL: i32 = 9;
const SIGXCPU: i32 = 24;

/// One live isolated context. Owned by the executor until teardown.
#[derive(Debug)]
pub struct SandboxHandle {
    id: String,
    backend: SandboxBackend,
    limits: ResourceLimits,
    network_enabled: bool,
    workspace: PathBuf,
}

impl SandboxHandle {
    pub fn new(
        id: String,
        backend: SandboxBackend,
        limits: ResourceLimits,
        network_enabled: bool,
        workspace: PathBuf,
    ) -> Self {
        Self {
            id,
            backend,
            limits,
            network_enabled,
            workspace,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn backend(&self) -> SandboxBackend {
        self.backend
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    pub fn network_enabled(&self) -> bool {
        self.network_enabled
    }

    /// Host directory shared with the context.
    pub fn workspace(&self) -> &Path {
        &self.workspace
    }
}

/// What a runtime observed, before interpretation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRun {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i64>,
    /// Terminating signal, where the runtime can tell.
    pub signal: Option<i32>,
    pub timed_out: bool,
    pub oom_killed: bool,
    pub cancelled: bool,
}

#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    fn backend(&self) -> SandboxBackend;

    /// Whether the harness must apply memory and CPU limits itself.
    fn needs_rlimits(&self) -> bool {
        false
    }

    async fn provision(
        &self,
        limits: &ResourceLimits,
        network_enabled: bool,
    ) -> Result<SandboxHandle, SandboxError>;

    /// Runs the artifact, killing it at the handle's wall clock limit or on
    /// cancellation.
    async fn run(
        &self,
        handle: &SandboxHandle,
        artifact: &CodeArtifact,
        payload: &HarnessPayload,
        cancel: &CancellationToken,
    ) -> Result<RawRun, SandboxError>;

    async fn teardown(&self, handle: SandboxHandle) -> Result<(), SandboxError>;
}

pub fn create_runtime(
    config: &SandboxConfig,
    backend: SandboxBackend,
) -> Result<Arc<dyn SandboxRuntime>, PipelineError> {
    match backend {
        SandboxBackend::Docker => {
            let runtime = DockerRuntime::new(config.image.clone()).map_err(|e| {
                PipelineError::ConfigError(format!("Docker is not available: {}", e))
            })?;
            Ok(Arc::new(runtime))
        }
        SandboxBackend::Process => Ok(Arc::new(ProcessRuntime::new(config.python_path.clone()))),
    }
}

/// Tears the handle down when released, or from a spawned task when dropped.
pub struct SandboxLease {
    runtime: Arc<dyn SandboxRuntime>,
    handle: Option<SandboxHandle>,
}

impl SandboxLease {
    pub fn new(runtime: Arc<dyn SandboxRuntime>, handle: SandboxHandle) -> Self {
        Self {
            runtime,
            handle: Some(handle),
        }
    }

    pub fn handle(&self) -> Option<&SandboxHandle> {
        self.handle.as_ref()
    }

    pub async fn release(mut self) {
        if let Some(handle) = self.handle.take() {
            let id = handle.id().to_string();
            match self.runtime.teardown(handle).await {
                Ok(()) => log::debug!("Sandbox {} torn down", id),
                Err(e) => log::error!("Teardown of sandbox {} failed: {}", id, e),
            }
        }
    }
}

impl Drop for SandboxLease {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let runtime = self.runtime.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    let id = handle.id().to_string();
                    if let Err(e) = runtime.teardown(handle).await {
                        log::error!("Deferred teardown of sandbox {} failed: {}", id, e);
                    }
                });
            }
            Err(_) => log::error!("Sandbox {} dropped outside a runtime; not torn down", handle.id()),
        }
    }
}

#[derive(Clone)]
pub struct SandboxExecutor {
    runtime: Arc<dyn SandboxRuntime>,
    table: Arc<ImportTable>,
}

impl SandboxExecutor {
    pub fn new(runtime: Arc<dyn SandboxRuntime>, table: Arc<ImportTable>) -> Self {
        Self { runtime, table }
    }

    pub fn backend(&self) -> SandboxBackend {
        self.runtime.backend()
    }

    /// Never fails: runtime faults come back as `ExitReason::SandboxError`.
    pub async fn execute(
        &self,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let started = Instant::now();
        let limits = request.resource_limits;

        let handle = match self.runtime.provision(&limits, request.network_enabled).await {
            Ok(handle) => handle,
            Err(e) => {
                log::error!("Could not provision {} sandbox: {}", self.runtime.backend(), e);
                return ExecutionResult::sandbox_error(
                    format!("Could not provision sandbox: {}", e),
                    started.elapsed(),
                );
            }
        };
        log::debug!("Provisioned {} sandbox {}", handle.backend(), handle.id());
        let lease = SandboxLease::new(self.runtime.clone(), handle);

        let payload = HarnessPayload::for_request(
            request,
            self.table.resolvable(),
            self.runtime.needs_rlimits(),
        );
        let outcome = match lease.handle() {
            Some(handle) if !cancel.is_cancelled() => {
                let run = self.runtime.run(handle, &request.code_artifact, &payload, cancel);
                match tokio::time::timeout(limits.wall_clock_timeout + RUNTIME_GRACE, run).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        log::error!("Sandbox {} did not report back in time", handle.id());
                        Ok(RawRun {
                            timed_out: true,
                            ..Default::default()
                        })
                    }
                }
            }
            _ => Ok(RawRun {
                cancelled: true,
                ..Default::default()
            }),
        };
        lease.release().await;

        let duration = started.elapsed();
        match outcome {
            Ok(raw) => interpret(raw, &limits, duration),
            Err(e) => {
                log::error!("Sandbox run failed: {}", e);
                ExecutionResult::sandbox_error(e.to_string(), duration)
            }
        }
    }
}

/// Maps a raw run onto the exit reasons callers distinguish.
pub fn interpret(raw: RawRun, limits: &ResourceLimits, duration: Duration) -> ExecutionResult {
    let (stdout, report) = parse_output(&raw.stdout);
    let mut result = ExecutionResult {
        success: false,
        return_value: None,
        error_message: None,
        error_type: None,
        missing_symbol: None,
        runtime_imports: Vec::new(),
        stdout,
        stderr: raw.stderr,
        duration,
        exit_reason: ExitReason::SandboxError,
    };

    if raw.cancelled {
        result.error_message = Some("Execution was cancelled".to_string());
        return result;
    }
    if raw.timed_out {
        log::warn!(
            "Execution exceeded its {}s wall clock limit",
            limits.wall_clock_timeout.as_secs()
        );
        result.exit_reason = ExitReason::Timeout;
        result.error_message = Some(format!(
            "Execution exceeded the {} second time limit",
            limits.wall_clock_timeout.as_secs()
        ));
        return result;
    }
    if raw.oom_killed || (raw.signal == Some(SIGKILL) && report.is_none()) {
        log::warn!("Execution exceeded its {} MB memory limit", limits.memory_mb);
        result.exit_reason = ExitReason::ResourceLimit;
        result.error_message = Some(format!("memory limit of {} MB", limits.memory_mb));
        return result;
    }
    if raw.signal == Some(SIGXCPU) {
        log::warn!("Execution exceeded its CPU time allowance");
        result.exit_reason = ExitReason::ResourceLimit;
        result.error_message = Some("CPU time limit".to_string());
        return result;
    }

    let Some(report) = report else {
        result.error_message = Some(match raw.exit_code {
            Some(code) => format!("Harness exited with status {} without a result", code),
            None => "Harness terminated without a result".to_string(),
        });
        return result;
    };

    result.runtime_imports = report.runtime_imports;
    if !result.runtime_imports.is_empty() {
        log::info!("Runtime imports applied: {}", result.runtime_imports.join(", "));
    }
    if report.error_type.as_deref() == Some("MemoryError") {
        log::warn!("Execution exceeded its {} MB memory limit", limits.memory_mb);
        result.exit_reason = ExitReason::ResourceLimit;
        result.error_type = report.error_type;
        result.error_message = Some(format!("memory limit of {} MB", limits.memory_mb));
        return result;
    }

    result.exit_reason = ExitReason::Completed;
    result.success = report.success;
    result.return_value = report.return_value;
    result.error_type = report.error_type;
    result.error_message = report.error_message;
    result.missing_symbol = report.missing_symbol;
    result
}
