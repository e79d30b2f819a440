use super::*;
use crate::core_types::{QueryOptions, ResourceLimits, SandboxBackend};
use crate::errors::{ModelError, SandboxError};
use crate::sandbox::harness::{HarnessPayload, RESULT_MARKER};
use crate::sandbox::{RawRun, SandboxHandle};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

struct ScriptedModel {
    reply: String,
    calls: AtomicUsize,
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn model_id(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, _: &str, _: &CompletionParams) -> Result<String, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.reply.clone())
    }
}

/// Replays queued outcomes; the last one repeats.
struct ScriptedRuntime {
    runs: Mutex<VecDeque<RawRun>>,
    sources: Mutex<Vec<String>>,
    provisioned: AtomicUsize,
    torn_down: AtomicUsize,
}

impl ScriptedRuntime {
    fn new(runs: Vec<RawRun>) -> Arc<Self> {
        Arc::new(Self {
            runs: Mutex::new(runs.into()),
            sources: Mutex::new(Vec::new()),
            provisioned: AtomicUsize::new(0),
            torn_down: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl SandboxRuntime for ScriptedRuntime {
    fn backend(&self) -> SandboxBackend {
        SandboxBackend::Process
    }

    async fn provision(
        &self,
        limits: &ResourceLimits,
        network_enabled: bool,
    ) -> Result<SandboxHandle, SandboxError> {
        self.provisioned.fetch_add(1, Ordering::SeqCst);
        Ok(SandboxHandle::new(
            "scripted".to_string(),
            SandboxBackend::Process,
            *limits,
            network_enabled,
            PathBuf::from("/nonexistent"),
        ))
    }

    async fn run(
        &self,
        _: &SandboxHandle,
        artifact: &CodeArtifact,
        _: &HarnessPayload,
        _: &CancellationToken,
    ) -> Result<RawRun, SandboxError> {
        self.sources.lock().unwrap().push(artifact.source_text.clone());
        let mut runs = self.runs.lock().unwrap();
        let run = if runs.len() > 1 {
            runs.pop_front()
        } else {
            runs.front().cloned()
        };
        Ok(run.unwrap_or_default())
    }

    async fn teardown(&self, _: SandboxHandle) -> Result<(), SandboxError> {
        self.torn_down.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct RecordingSink {
    records: Mutex<Vec<HistoryRecord>>,
}

#[async_trait]
impl HistorySink for RecordingSink {
    async fn record(&self, record: &HistoryRecord) -> Result<(), PipelineError> {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}

fn harness_run(json: &str) -> RawRun {
    RawRun {
        stdout: format!("\n{}{}\n", RESULT_MARKER, json),
        exit_code: Some(0),
        ..Default::default()
    }
}

fn pipeline(
    reply: &str,
    runtime: Arc<ScriptedRuntime>,
) -> (Pipeline, Arc<ScriptedModel>, Arc<RecordingSink>) {
    let model = Arc::new(ScriptedModel {
        reply: reply.to_string(),
        calls: AtomicUsize::new(0),
    });
    let sink = Arc::new(RecordingSink::default());
    let pipeline = Pipeline::builder(NlexecConfig::default())
        .with_model(model.clone())
        .with_runtime(runtime)
        .with_history(sink.clone())
        .build()
        .unwrap();
    (pipeline, model, sink)
}

#[tokio::test]
async fn test_arithmetic_query_runs_extension_artifact() {
    let runtime = ScriptedRuntime::new(vec![harness_run(
        r#"{"success": true, "return_value": 4, "runtime_imports": []}"#,
    )]);
    let (pipeline, model, sink) = pipeline("", runtime.clone());

    let outcome = pipeline
        .process(&Query::new("oblicz 2+2"), &CancellationToken::new())
        .await;
    assert!(outcome.success(), "{:?}", outcome.error);
    assert_eq!(model.calls.load(Ordering::SeqCst), 0);

    let response = outcome.response();
    assert_eq!(response.output.as_deref(), Some("4"));
    assert!(response.code.unwrap().contains("def calculate(a=2, b=2):"));
    assert!(response.explanation.starts_with("Ran calculate() from the built-in arithmetic template"));

    assert_eq!(runtime.torn_down.load(Ordering::SeqCst), 1);
    assert_eq!(sink.records.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_unresolved_symbol_is_never_executed() {
    let runtime = ScriptedRuntime::new(vec![]);
    let reply = "```python\ndef main():\n    return quantumflux.collapse(3)\n```";
    let (pipeline, _, sink) = pipeline(reply, runtime.clone());

    let outcome = pipeline
        .process(&Query::new("collapse the wave function"), &CancellationToken::new())
        .await;
    assert!(!outcome.success());
    match outcome.error {
        Some(PipelineError::UnresolvedDependency { ref symbols, .. }) => {
            assert_eq!(symbols, &vec!["quantumflux".to_string()]);
        }
        ref other => panic!("unexpected error: {:?}", other),
    }
    assert!(outcome.report.unwrap().unresolved.contains("quantumflux"));
    assert_eq!(runtime.provisioned.load(Ordering::SeqCst), 0);
    assert!(sink.records.lock().unwrap()[0].error.is_some());
}

#[tokio::test]
async fn test_static_repair_can_be_disabled() {
    let runtime = ScriptedRuntime::new(vec![harness_run(
        r#"{"success": false, "error_type": "NameError", "error_message": "name 'quantumflux' is not defined", "missing_symbol": "quantumflux"}"#,
    )]);
    let reply = "```python\ndef main():\n    return quantumflux.collapse(3)\n```";
    let (pipeline, _, _) = pipeline(reply, runtime.clone());

    let query = Query::new("collapse").with_options(QueryOptions {
        static_repair: Some(false),
        ..Default::default()
    });
    let outcome = pipeline.process(&query, &CancellationToken::new()).await;
    assert_eq!(runtime.provisioned.load(Ordering::SeqCst), 1);
    assert!(matches!(
        outcome.error,
        Some(PipelineError::UnresolvedDependency { .. })
    ));
}

#[tokio::test]
async fn test_runtime_missing_symbol_triggers_one_repair() {
    let runtime = ScriptedRuntime::new(vec![
        harness_run(
            r#"{"success": false, "error_type": "NameError", "error_message": "name 'json' is not defined", "missing_symbol": "json"}"#,
        ),
        harness_run(r#"{"success": true, "return_value": "{}"}"#),
    ]);
    let reply = "```python\ndef main():\n    return 1\n```";
    let (pipeline, _, _) = pipeline(reply, runtime.clone());

    let outcome = pipeline
        .process(&Query::new("serialize nothing"), &CancellationToken::new())
        .await;
    assert!(outcome.success(), "{:?}", outcome.error);
    assert_eq!(outcome.repair_attempts, 1);
    assert_eq!(runtime.provisioned.load(Ordering::SeqCst), 2);
    assert_eq!(runtime.torn_down.load(Ordering::SeqCst), 2);

    let sources = runtime.sources.lock().unwrap();
    assert!(!sources[0].contains("import json"));
    assert!(sources[1].starts_with("import json\n"));
    assert_eq!(
        outcome.report.unwrap().resolved_imports,
        vec!["import json".to_string()]
    );
}

#[tokio::test]
async fn test_repair_attempts_are_bounded() {
    let runtime = ScriptedRuntime::new(vec![harness_run(
        r#"{"success": false, "error_type": "NameError", "error_message": "name 'json' is not defined", "missing_symbol": "json"}"#,
    )]);
    let reply = "```python\ndef main():\n    return 1\n```";
    let (pipeline, _, _) = pipeline(reply, runtime.clone());

    let query = Query::new("x").with_options(QueryOptions {
        max_repair_attempts: Some(0),
        ..Default::default()
    });
    let outcome = pipeline.process(&query, &CancellationToken::new()).await;
    assert_eq!(outcome.repair_attempts, 0);
    assert_eq!(runtime.provisioned.load(Ordering::SeqCst), 1);

    // With the default of one attempt the repeated failure stops the loop too.
    let outcome = pipeline.process(&Query::new("x"), &CancellationToken::new()).await;
    assert_eq!(outcome.repair_attempts, 1);
    assert_eq!(runtime.provisioned.load(Ordering::SeqCst), 3);
    assert!(matches!(
        outcome.error,
        Some(PipelineError::UnresolvedDependency { .. })
    ));
}

#[tokio::test]
async fn test_timeout_reports_configured_limit() {
    let runtime = ScriptedRuntime::new(vec![RawRun {
        timed_out: true,
        ..Default::default()
    }]);
    let (pipeline, _, _) = pipeline("```python\ndef main():\n    while True:\n        pass\n```", runtime);

    let query = Query::new("loop forever").with_options(QueryOptions {
        timeout_seconds: Some(2),
        ..Default::default()
    });
    let outcome = pipeline.process(&query, &CancellationToken::new()).await;
    assert_eq!(outcome.error, Some(PipelineError::SandboxTimeout { seconds: 2 }));
    assert_eq!(outcome.result.unwrap().exit_reason, ExitReason::Timeout);
}

#[tokio::test]
async fn test_user_exception_is_reported_without_pipeline_error() {
    let runtime = ScriptedRuntime::new(vec![harness_run(
        r#"{"success": false, "error_type": "ZeroDivisionError", "error_message": "division by zero"}"#,
    )]);
    let (pipeline, _, _) = pipeline("```python\ndef main():\n    return 1 / 0\n```", runtime);

    let response = pipeline
        .process_text("divide by zero", &CancellationToken::new())
        .await;
    assert!(!response.success);
    assert_eq!(response.error.as_deref(), Some("ZeroDivisionError: division by zero"));
    assert!(response.explanation.contains("raised ZeroDivisionError"));
}

#[tokio::test]
async fn test_cancelled_query() {
    let runtime = ScriptedRuntime::new(vec![]);
    let (pipeline, _, _) = pipeline("", runtime.clone());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcome = pipeline.process(&Query::new("oblicz 2+2"), &cancel).await;
    assert_eq!(outcome.error, Some(PipelineError::Cancelled));
    assert_eq!(runtime.provisioned.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_execute_provided_artifact() {
    let runtime = ScriptedRuntime::new(vec![harness_run(r#"{"success": true, "return_value": 1.5}"#)]);
    let (pipeline, _, _) = pipeline("", runtime.clone());
    let artifact = CodeArtifact {
        source_text: "def main():\n    return math.sqrt(2.25)\n".to_string(),
        entry_point_name: "main".to_string(),
        parameters: Vec::new(),
        description: String::new(),
        origin: ArtifactOrigin::Provided,
    };

    let outcome = pipeline
        .execute_artifact(&Query::new("main.py"), artifact, &CancellationToken::new())
        .await;
    assert!(outcome.success());
    assert!(runtime.sources.lock().unwrap()[0].starts_with("import math\n"));
    assert_eq!(outcome.response().output.as_deref(), Some("1.5"));
}
