use async_trait::async_trait;
use futures_util::future::join_all;
use nlexec_core::config::SandboxConfig;
use nlexec_core::errors::{ModelError, PipelineError};
use nlexec_core::sandbox::process::ProcessRuntime;
use nlexec_core::{
    CompletionParams, ExitReason, LanguageModel, NlexecConfig, Pipeline, Query, QueryOptions,
    SandboxBackend,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

struct FixedModel(String);

#[async_trait]
impl LanguageModel for FixedModel {
    fn model_id(&self) -> &str {
        "fixed"
    }

    async fn complete(&self, _prompt: &str, _params: &CompletionParams) -> Result<String, ModelError> {
        Ok(self.0.clone())
    }
}

fn python_available() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

fn setup(reply: &str) -> Option<(Pipeline, Arc<ProcessRuntime>)> {
    setup_with(reply, |_| {})
}

fn setup_with(
    reply: &str,
    configure: impl FnOnce(&mut NlexecConfig),
) -> Option<(Pipeline, Arc<ProcessRuntime>)> {
    if !python_available() {
        eprintln!("python3 not found, skipping");
        return None;
    }
    let _ = env_logger::builder().is_test(true).try_init();
    let mut config = NlexecConfig {
        sandbox: SandboxConfig {
            backend: SandboxBackend::Process,
            ..Default::default()
        },
        ..Default::default()
    };
    configure(&mut config);
    let runtime = Arc::new(ProcessRuntime::new("python3".to_string()));
    let pipeline = Pipeline::builder(config)
        .with_model(Arc::new(FixedModel(reply.to_string())))
        .with_runtime(runtime.clone())
        .build()
        .unwrap();
    Some((pipeline, runtime))
}

#[tokio::test]
async fn test_arithmetic_request_end_to_end() {
    let Some((pipeline, runtime)) = setup("") else { return };

    let response = pipeline
        .process_text("oblicz 2+2", &CancellationToken::new())
        .await;
    assert!(response.success, "{:?}", response.error);
    assert_eq!(response.output.as_deref(), Some("4"));
    assert_eq!(runtime.live_sandboxes(), 0);
}

#[tokio::test]
async fn test_signed_and_grouped_arithmetic_end_to_end() {
    let Some((pipeline, _)) = setup("") else { return };
    let cancel = CancellationToken::new();

    let grouped = pipeline.process_text("oblicz (2+3)*4", &cancel).await;
    assert!(grouped.success, "{:?}", grouped.error);
    assert_eq!(grouped.output.as_deref(), Some("20"));

    let signed = pipeline.process_text("oblicz -5 + 3", &cancel).await;
    assert!(signed.success, "{:?}", signed.error);
    assert_eq!(signed.output.as_deref(), Some("-2"));
}

#[tokio::test]
async fn test_extension_output_is_deterministic() {
    let Some((pipeline, _)) = setup("") else { return };
    let cancel = CancellationToken::new();

    let first = pipeline.process_text("oblicz 7*6", &cancel).await;
    let second = pipeline.process_text("oblicz 7*6", &cancel).await;
    assert_eq!(first.code, second.code);
    assert_eq!(first.output.as_deref(), Some("42"));
    assert_eq!(second.output.as_deref(), Some("42"));
}

#[tokio::test]
async fn test_missing_import_is_added_before_running() {
    let reply = "```python\ndef main():\n    time.sleep(0.05)\n    return \"done\"\n```";
    let Some((pipeline, _)) = setup(reply) else { return };

    let outcome = pipeline
        .process(&Query::new("wait a moment"), &CancellationToken::new())
        .await;
    assert!(outcome.success(), "{:?}", outcome.error);
    let response = outcome.response();
    assert!(response.code.unwrap().starts_with("import time\n"));
    assert_eq!(response.output.as_deref(), Some("done"));
}

#[tokio::test]
async fn test_harness_imports_on_name_error_without_static_repair() {
    let reply = "```python\ndef main():\n    return json.dumps([1, 2])\n```";
    let Some((pipeline, _)) = setup(reply) else { return };

    let query = Query::new("dump a list").with_options(QueryOptions {
        static_repair: Some(false),
        ..Default::default()
    });
    let outcome = pipeline.process(&query, &CancellationToken::new()).await;
    assert!(outcome.success(), "{:?}", outcome.error);
    let result = outcome.result.as_ref().unwrap();
    assert_eq!(result.runtime_imports, vec!["import json".to_string()]);
    assert_eq!(outcome.response().output.as_deref(), Some("[1, 2]"));
}

#[tokio::test]
async fn test_runtime_import_resumes_instead_of_rerunning() {
    let reply = "```python\nimport sys\n\nprint(\"loading\")\n\ndef main():\n    print(\"before\")\n    sys.nlexec_calls = getattr(sys, \"nlexec_calls\", 0) + 1\n    return [sys.nlexec_calls, json.dumps(1)]\n```";
    let Some((pipeline, _)) = setup(reply) else { return };

    let query = Query::new("count calls").with_options(QueryOptions {
        static_repair: Some(false),
        ..Default::default()
    });
    let outcome = pipeline.process(&query, &CancellationToken::new()).await;
    assert!(outcome.success(), "{:?}", outcome.error);
    let result = outcome.result.unwrap();
    // A second run of the artifact would have counted two calls.
    assert_eq!(result.return_value, Some(serde_json::json!([1, "1"])));
    assert_eq!(result.runtime_imports, vec!["import json".to_string()]);
    assert_eq!(result.stdout.matches("loading").count(), 1);
    assert_eq!(result.stdout.matches("before").count(), 1);
}

#[tokio::test]
async fn test_unimported_submodule_is_repaired_and_retried() {
    let reply = "```python\nimport concurrent\n\ndef main():\n    return concurrent.futures.ALL_COMPLETED\n```";
    let Some((pipeline, _)) = setup(reply) else { return };

    let outcome = pipeline
        .process(&Query::new("name the wait mode"), &CancellationToken::new())
        .await;
    assert!(outcome.success(), "{:?}", outcome.error);
    assert_eq!(outcome.repair_attempts, 1);
    let response = outcome.response();
    assert!(response.code.unwrap().starts_with("import concurrent.futures\n"));
    assert_eq!(response.output.as_deref(), Some("ALL_COMPLETED"));
}

#[tokio::test]
async fn test_socket_use_fails_without_network() {
    let reply = "```python\nimport socket\n\ndef main():\n    connection = socket.socket(socket.AF_INET, socket.SOCK_STREAM)\n    connection.close()\n    return \"created\"\n```";
    let Some((pipeline, _)) = setup(reply) else { return };
    let cancel = CancellationToken::new();

    let outcome = pipeline.process(&Query::new("open a socket"), &cancel).await;
    let result = outcome.result.clone().unwrap();
    assert!(!result.success);
    assert_eq!(result.exit_reason, ExitReason::Completed);
    assert_eq!(result.error_type.as_deref(), Some("OSError"));
    assert!(result
        .error_message
        .unwrap()
        .contains("network access is disabled"));

    let allowed = Query::new("open a socket").with_options(QueryOptions {
        allow_network: Some(true),
        ..Default::default()
    });
    let outcome = pipeline.process(&allowed, &cancel).await;
    assert!(outcome.success(), "{:?}", outcome.error);
    assert_eq!(outcome.response().output.as_deref(), Some("created"));
}

#[cfg(unix)]
#[tokio::test]
async fn test_allocation_past_memory_limit_is_a_resource_limit() {
    let reply = "```python\ndef main():\n    data = bytearray(512 * 1024 * 1024)\n    return len(data)\n```";
    let Some((pipeline, runtime)) = setup_with(reply, |config| config.sandbox.memory_mb = 128)
    else {
        return;
    };

    let outcome = pipeline
        .process(&Query::new("allocate a lot"), &CancellationToken::new())
        .await;
    assert!(matches!(
        outcome.error,
        Some(PipelineError::SandboxResourceExceeded(_))
    ));
    assert_eq!(outcome.result.unwrap().exit_reason, ExitReason::ResourceLimit);
    assert_eq!(runtime.live_sandboxes(), 0);
}

#[tokio::test]
async fn test_infinite_loop_times_out_and_cleans_up() {
    let reply = "```python\ndef main():\n    while True:\n        pass\n```";
    let Some((pipeline, runtime)) = setup(reply) else { return };

    let query = Query::new("spin forever").with_options(QueryOptions {
        timeout_seconds: Some(1),
        ..Default::default()
    });
    let outcome = pipeline.process(&query, &CancellationToken::new()).await;
    assert_eq!(outcome.error, Some(PipelineError::SandboxTimeout { seconds: 1 }));
    assert_eq!(outcome.result.unwrap().exit_reason, ExitReason::Timeout);
    assert_eq!(runtime.live_sandboxes(), 0);
}

#[tokio::test]
async fn test_fictitious_module_is_not_executed() {
    let reply = "```python\ndef main():\n    return quantumflux.collapse(3)\n```";
    let Some((pipeline, runtime)) = setup(reply) else { return };

    let outcome = pipeline
        .process(&Query::new("collapse the wave function"), &CancellationToken::new())
        .await;
    assert!(matches!(
        outcome.error,
        Some(PipelineError::UnresolvedDependency { .. })
    ));
    assert!(outcome.result.is_none());
    assert_eq!(runtime.live_sandboxes(), 0);
}

#[tokio::test]
async fn test_user_exception_is_captured() {
    let reply = "```python\ndef main():\n    print(\"about to fail\")\n    return 1 / 0\n```";
    let Some((pipeline, _)) = setup(reply) else { return };

    let outcome = pipeline
        .process(&Query::new("divide by zero"), &CancellationToken::new())
        .await;
    let result = outcome.result.clone().unwrap();
    assert!(!result.success);
    assert_eq!(result.exit_reason, ExitReason::Completed);
    assert_eq!(result.error_type.as_deref(), Some("ZeroDivisionError"));
    assert!(result.stdout.contains("about to fail"));
}

#[tokio::test]
async fn test_concurrent_runs_leave_no_sandboxes() {
    let Some((pipeline, runtime)) = setup("") else { return };
    let cancel = CancellationToken::new();

    let responses = join_all((1..=8).map(|n| {
        let text = format!("oblicz {}+{}", n, n);
        let pipeline = &pipeline;
        let cancel = &cancel;
        async move { pipeline.process_text(&text, cancel).await }
    }))
    .await;

    for (n, response) in (1..=8).zip(responses) {
        assert!(response.success, "{:?}", response.error);
        assert_eq!(response.output, Some((n * 2).to_string()));
    }
    assert_eq!(runtime.live_sandboxes(), 0);
}
