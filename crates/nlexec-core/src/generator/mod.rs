//! Code generation: extension handlers first, the language model otherwise.

pub mod extract;
pub mod normalize;

use crate::core_types::{ArtifactOrigin, CodeArtifact, QueryAnalysis};
use crate::errors::PipelineError;
use crate::extensions::ExtensionRegistry;
use crate::llm::{CompletionParams, LanguageModel};
use std::fmt::Write as _;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub use extract::extract_code;
pub use normalize::{normalize, Normalized};

#[derive(Clone)]
pub struct CodeGenerator {
    registry: Arc<ExtensionRegistry>,
    model: Arc<dyn LanguageModel>,
    params: CompletionParams,
}

impl CodeGenerator {
    pub fn new(
        registry: Arc<ExtensionRegistry>,
        model: Arc<dyn LanguageModel>,
        params: CompletionParams,
    ) -> Self {
        Self {
            registry,
            model,
            params,
        }
    }

    /// Same registry and parameters, different model.
    pub fn with_model(&self, model: Arc<dyn LanguageModel>) -> Self {
        Self {
            model,
            ..self.clone()
        }
    }

    pub fn model_id(&self) -> &str {
        self.model.model_id()
    }

    pub async fn generate(
        &self,
        query_text: &str,
        analysis: &QueryAnalysis,
        cancel: &CancellationToken,
    ) -> Result<CodeArtifact, PipelineError> {
        if let Some(handler) = self.registry.find_handler(query_text, analysis) {
            log::info!("Extension handler '{}' matched the query", handler.name());
            return Ok(handler.generate(query_text, analysis));
        }

        let prompt = build_prompt(query_text, analysis);
        log::info!("Requesting code from model '{}'", self.model.model_id());
        let response = tokio::select! {
            _ = cancel.cancelled() => {
                log::info!("Model call abandoned after cancellation");
                return Err(PipelineError::Cancelled);
            }
            response = self.model.complete(&prompt, &self.params) => response?,
        };

        let source = extract_code(&response)?;
        let summary = summarize(query_text, analysis);
        let normalized = normalize(&source, analysis, &summary);
        log::debug!(
            "Normalized model output to entry point '{}' with {} parameter(s)",
            normalized.entry_point_name,
            normalized.parameters.len()
        );

        Ok(CodeArtifact {
            source_text: normalized.source_text,
            entry_point_name: normalized.entry_point_name,
            parameters: normalized.parameters,
            description: summary,
            origin: ArtifactOrigin::Model {
                model_id: self.model.model_id().to_string(),
            },
        })
    }
}

/// The query plus structured hints from the analysis.
pub fn build_prompt(query_text: &str, analysis: &QueryAnalysis) -> String {
    let mut prompt = format!("Task: {}\n", query_text.trim());
    let _ = writeln!(prompt, "Kind of task: {}", analysis.query_type);
    if let Some(shape) = analysis.shape {
        let _ = writeln!(prompt, "Shape: {}", shape);
    }
    if let Some(expression) = &analysis.expression {
        let _ = writeln!(prompt, "Expression: {}", expression);
    }
    if !analysis.detected_variables.is_empty() {
        prompt.push_str("Values found in the task (use them as parameters with these defaults):\n");
        for variable in &analysis.detected_variables {
            let _ = writeln!(prompt, "- {} = {}", variable.name, variable.value.to_python());
        }
    }
    prompt.push_str(
        "Write one Python function that solves the task and returns the result. \
         Every parameter needs a default value.",
    );
    prompt
}

fn summarize(query_text: &str, analysis: &QueryAnalysis) -> String {
    let kind = analysis.query_type.to_string();
    let mut chars = kind.chars();
    let kind = match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
        None => kind,
    };
    let first_line = query_text.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
    format!("{} task: {}", kind, first_line)
}
