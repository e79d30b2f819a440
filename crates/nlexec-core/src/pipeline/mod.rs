//! Pipeline coordinator: analyze, generate, repair, execute.
//!
//! One `process` call owns one query. The only state shared between
//! concurrent calls is the read-only import table and the immutable
//! extension registry. Runtime repair is a bounded loop: each missing symbol
//! reported by the sandbox costs one attempt, and the loop stops when the
//! attempts run out or a repair adds nothing.

use crate::analysis::{HeuristicAnalyzer, QueryAnalyzer};
use crate::config::NlexecConfig;
use crate::core_types::{
    ArtifactOrigin, CodeArtifact, DependencyReport, ExecutionRequest, ExecutionResult, ExitReason,
    HistoryRecord, ProcessResponse, Query, QueryAnalysis,
};
use crate::deps::{DependencyRepairer, ImportTable};
use crate::errors::PipelineError;
use crate::extensions::ExtensionRegistry;
use crate::generator::CodeGenerator;
use crate::history::{HistorySink, JsonlHistorySink, NoopHistorySink};
use crate::llm::{create_model, CompletionParams, LanguageModel};
use crate::sandbox::{create_runtime, SandboxExecutor, SandboxRuntime};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Everything one query produced, successful or not.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub query: Query,
    pub analysis: QueryAnalysis,
    pub artifact: Option<CodeArtifact>,
    pub report: Option<DependencyReport>,
    pub result: Option<ExecutionResult>,
    pub error: Option<PipelineError>,
    pub repair_attempts: u32,
}

impl PipelineOutcome {
    fn new(query: &Query, analysis: QueryAnalysis) -> Self {
        Self {
            query: query.clone(),
            analysis,
            artifact: None,
            report: None,
            result: None,
            error: None,
            repair_attempts: 0,
        }
    }

    pub fn success(&self) -> bool {
        self.error.is_none() && self.result.as_ref().is_some_and(|r| r.success)
    }

    pub fn response(&self) -> ProcessResponse {
        let success = self.success();
        let error = match (&self.error, &self.result) {
            (Some(e), _) => Some(e.to_string()),
            (None, Some(result)) if !result.success => Some(match (&result.error_type, &result.error_message) {
                (Some(kind), Some(message)) => format!("{}: {}", kind, message),
                (_, Some(message)) => message.clone(),
                _ => "Execution failed".to_string(),
            }),
            (None, None) => Some("Nothing was executed".to_string()),
            _ => None,
        };
        ProcessResponse {
            success,
            code: self.artifact.as_ref().map(|a| a.source_text.clone()),
            output: if success { self.result.as_ref().map(render_output) } else { None },
            error,
            explanation: self.explain(),
            result: self.result.clone(),
        }
    }

    /// A short account of what ran and, when it failed, why.
    pub fn explain(&self) -> String {
        if let Some(error) = &self.error {
            return error.explain();
        }
        let (Some(artifact), Some(result)) = (&self.artifact, &self.result) else {
            return "Nothing was executed.".to_string();
        };
        let source = match &artifact.origin {
            ArtifactOrigin::Extension { handler } => format!("the built-in {} template", handler),
            ArtifactOrigin::Model { model_id } => format!("code written by {}", model_id),
            ArtifactOrigin::Provided => "the provided code".to_string(),
        };
        let mut parts = vec![if result.success {
            format!(
                "Ran {}() from {} in {} ms.",
                artifact.entry_point_name,
                source,
                result.duration.as_millis()
            )
        } else {
            format!(
                "{}() from {} raised {}.",
                artifact.entry_point_name,
                source,
                result.error_type.as_deref().unwrap_or("an error")
            )
        }];
        if let Some(report) = self.report.as_ref().filter(|r| !r.resolved_imports.is_empty()) {
            parts.push(format!("Added imports: {}.", report.resolved_imports.join("; ")));
        }
        if !result.runtime_imports.is_empty() {
            parts.push(format!(
                "Imported while running: {}.",
                result.runtime_imports.join("; ")
            ));
        }
        parts.join(" ")
    }
}

fn render_output(result: &ExecutionResult) -> String {
    match &result.return_value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => result.stdout.trim_end().to_string(),
        Some(value) => value.to_string(),
    }
}

pub struct PipelineBuilder {
    config: NlexecConfig,
    analyzer: Option<Arc<dyn QueryAnalyzer>>,
    registry: Option<ExtensionRegistry>,
    model: Option<Arc<dyn LanguageModel>>,
    runtime: Option<Arc<dyn SandboxRuntime>>,
    history: Option<Arc<dyn HistorySink>>,
}

impl PipelineBuilder {
    pub fn with_analyzer(mut self, analyzer: Arc<dyn QueryAnalyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    pub fn with_registry(mut self, registry: ExtensionRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Fixes the model; per-query model overrides are then ignored.
    pub fn with_model(mut self, model: Arc<dyn LanguageModel>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_runtime(mut self, runtime: Arc<dyn SandboxRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn with_history(mut self, history: Arc<dyn HistorySink>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn build(self) -> Result<Pipeline, PipelineError> {
        let config = self.config;
        config.validate()?;

        let table = Arc::new(config.imports.build_table());
        let fixed_model = self.model.is_some();
        let model = match self.model {
            Some(model) => model,
            None => create_model(&config.llm, None)?,
        };
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => create_runtime(&config.sandbox, config.sandbox.backend)?,
        };
        let history: Arc<dyn HistorySink> = match (self.history, &config.pipeline.history_file) {
            (Some(history), _) => history,
            (None, Some(path)) => Arc::new(JsonlHistorySink::new(path.clone())),
            (None, None) => Arc::new(NoopHistorySink),
        };
        let params = CompletionParams {
            temperature: config.llm.temperature,
            max_tokens: config.llm.max_tokens,
            timeout: config.llm.timeout(),
            ..Default::default()
        };

        Ok(Pipeline {
            analyzer: self
                .analyzer
                .unwrap_or_else(|| Arc::new(HeuristicAnalyzer::new())),
            generator: CodeGenerator::new(
                Arc::new(self.registry.unwrap_or_else(ExtensionRegistry::with_defaults)),
                model,
                params,
            ),
            repairer: DependencyRepairer::new(table.clone()),
            executor: SandboxExecutor::new(runtime, table.clone()),
            table,
            history,
            fixed_model,
            config,
        })
    }
}

pub struct Pipeline {
    config: NlexecConfig,
    analyzer: Arc<dyn QueryAnalyzer>,
    generator: CodeGenerator,
    repairer: DependencyRepairer,
    executor: SandboxExecutor,
    table: Arc<ImportTable>,
    history: Arc<dyn HistorySink>,
    fixed_model: bool,
}

impl Pipeline {
    pub fn builder(config: NlexecConfig) -> PipelineBuilder {
        PipelineBuilder {
            config,
            analyzer: None,
            registry: None,
            model: None,
            runtime: None,
            history: None,
        }
    }

    pub fn from_config(config: NlexecConfig) -> Result<Self, PipelineError> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &NlexecConfig {
        &self.config
    }

    pub fn analyze(&self, text: &str) -> QueryAnalysis {
        self.analyzer.analyze(text)
    }

    pub fn repairer(&self) -> &DependencyRepairer {
        &self.repairer
    }

    /// Runs one query to completion and records it in the history sink.
    pub async fn process(&self, query: &Query, cancel: &CancellationToken) -> PipelineOutcome {
        let analysis = self.analyzer.analyze(&query.text);
        log::debug!(
            "Analysis: {} (confidence {:.2}, {} variable(s))",
            analysis.query_type,
            analysis.confidence,
            analysis.detected_variables.len()
        );
        if analysis.ambiguous {
            let degraded = PipelineError::AnalysisAmbiguous(query.text.clone());
            log::info!("{}; continuing with the most specific reading", degraded);
        }

        let mut outcome = PipelineOutcome::new(query, analysis);
        if let Err(e) = self.run_stages(&mut outcome, cancel).await {
            log::warn!("Query failed: {}", e);
            outcome.error = Some(e);
        }
        self.emit_history(&outcome).await;
        outcome
    }

    /// Caller-facing form of `process`.
    pub async fn process_text(&self, text: &str, cancel: &CancellationToken) -> ProcessResponse {
        self.process(&Query::new(text), cancel).await.response()
    }

    /// Repairs and executes an artifact that did not come from generation.
    pub async fn execute_artifact(
        &self,
        query: &Query,
        artifact: CodeArtifact,
        cancel: &CancellationToken,
    ) -> PipelineOutcome {
        let mut outcome = PipelineOutcome::new(query, QueryAnalysis::generic());
        outcome.artifact = Some(artifact);
        if let Err(e) = self.repair_and_execute(&mut outcome, cancel).await {
            outcome.error = Some(e);
        }
        self.emit_history(&outcome).await;
        outcome
    }

    async fn run_stages(
        &self,
        outcome: &mut PipelineOutcome,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let generator = self.generator_for(&outcome.query)?;
        let artifact = generator
            .generate(&outcome.query.text, &outcome.analysis, cancel)
            .await?;
        outcome.artifact = Some(artifact);
        self.repair_and_execute(outcome, cancel).await
    }

    async fn repair_and_execute(
        &self,
        outcome: &mut PipelineOutcome,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let options = &outcome.query.options;
        let Some(mut artifact) = outcome.artifact.clone() else {
            return Err(PipelineError::GenerationError("No artifact to execute".to_string()));
        };

        if options.static_repair.unwrap_or(self.config.pipeline.static_repair) {
            let (repaired, report) = self.repairer.repair(&artifact);
            artifact = repaired;
            outcome.artifact = Some(artifact.clone());
            let unresolved: Vec<String> = report.unresolved.iter().cloned().collect();
            outcome.report = Some(report);
            if !unresolved.is_empty() {
                return Err(PipelineError::UnresolvedDependency {
                    symbols: unresolved,
                    code: artifact.source_text,
                });
            }
        } else {
            log::info!("Static repair disabled for this query");
        }

        let mut limits = self.config.sandbox.limits();
        if let Some(seconds) = options.timeout_seconds {
            limits.wall_clock_timeout = Duration::from_secs(seconds.max(1));
        }
        let mut request = ExecutionRequest {
            code_artifact: artifact,
            resource_limits: limits,
            network_enabled: options.allow_network.unwrap_or(self.config.sandbox.allow_network),
            arguments: options.arguments.clone(),
        };
        let executor = self.executor_for(&outcome.query)?;
        let max_attempts = options
            .max_repair_attempts
            .unwrap_or(self.config.pipeline.max_repair_attempts);

        let mut attempts = 0;
        let result = loop {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            let result = executor.execute(&request, cancel).await;
            if cancel.is_cancelled() {
                outcome.result = Some(result);
                return Err(PipelineError::Cancelled);
            }

            let Some(symbol) = result.missing_symbol.clone() else {
                break result;
            };
            if attempts >= max_attempts {
                log::warn!("Repair attempts exhausted with '{}' still missing", symbol);
                break result;
            }
            attempts += 1;
            let (repaired, report) = self.repairer.repair_symbol(&request.code_artifact, &symbol);
            if report.resolved_imports.is_empty() {
                log::warn!("No import known for runtime-missing symbol '{}'", symbol);
                break result;
            }
            log::info!(
                "Retrying after adding {:?} (attempt {}/{})",
                report.resolved_imports,
                attempts,
                max_attempts
            );
            merge_report(&mut outcome.report, report);
            request.code_artifact = repaired;
            outcome.artifact = Some(request.code_artifact.clone());
        };
        outcome.repair_attempts = attempts;

        let error = match result.exit_reason {
            ExitReason::Completed => result.missing_symbol.as_ref().map(|symbol| {
                outcome
                    .report
                    .get_or_insert_with(DependencyReport::default)
                    .unresolved
                    .insert(symbol.clone());
                PipelineError::UnresolvedDependency {
                    symbols: vec![symbol.clone()],
                    code: request.code_artifact.source_text.clone(),
                }
            }),
            _ => result.as_error(&limits),
        };
        outcome.result = Some(result);
        match error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn generator_for(&self, query: &Query) -> Result<CodeGenerator, PipelineError> {
        match query.options.model_id.as_deref() {
            Some(model_id) if model_id != self.generator.model_id() => {
                if self.fixed_model {
                    log::warn!("Ignoring model override '{}': model is fixed", model_id);
                    return Ok(self.generator.clone());
                }
                let model = create_model(&self.config.llm, Some(model_id))?;
                Ok(self.generator.with_model(model))
            }
            _ => Ok(self.generator.clone()),
        }
    }

    fn executor_for(&self, query: &Query) -> Result<SandboxExecutor, PipelineError> {
        match query.options.sandbox {
            Some(backend) if backend != self.executor.backend() => {
                let runtime = create_runtime(&self.config.sandbox, backend)?;
                Ok(SandboxExecutor::new(runtime, self.table.clone()))
            }
            _ => Ok(self.executor.clone()),
        }
    }

    async fn emit_history(&self, outcome: &PipelineOutcome) {
        let record = HistoryRecord {
            query: outcome.query.clone(),
            artifact: outcome.artifact.clone(),
            result: outcome.result.clone(),
            error: outcome.error.as_ref().map(|e| e.to_string()),
            timestamp: chrono::Utc::now(),
        };
        if let Err(e) = self.history.record(&record).await {
            log::error!("Failed to write history record: {}", e);
        }
    }
}

fn merge_report(target: &mut Option<DependencyReport>, update: DependencyReport) {
    let report = target.get_or_insert_with(DependencyReport::default);
    report.missing_symbols.extend(update.missing_symbols);
    for statement in update.resolved_imports {
        if !report.resolved_imports.contains(&statement) {
            report.resolved_imports.push(statement);
        }
    }
}

#[cfg(test)]
mod tests;
