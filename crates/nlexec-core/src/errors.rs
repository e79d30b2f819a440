//! Error types for the generate, repair and execute pipeline
//!
//! Errors are grouped by the boundary they originate from: the model service,
//! the sandbox runtime, and the pipeline itself. Pipeline errors carry enough
//! detail (missing symbol names, timeout versus resource limit) for a caller to
//! explain a failure to an end user without showing a raw stack trace.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error("Query analysis was ambiguous: {0}")]
    AnalysisAmbiguous(String),
    #[error("Code generation failed: {0}")]
    GenerationError(String),
    #[error("No code block could be extracted from the model response")]
    ExtractionFailed,
    #[error("Unresolved dependencies: {}", symbols.join(", "))]
    UnresolvedDependency { symbols: Vec<String>, code: String },
    #[error("Sandbox execution timed out after {seconds}s")]
    SandboxTimeout { seconds: u64 },
    #[error("Sandbox exceeded its resource limits: {0}")]
    SandboxResourceExceeded(String),
    #[error("Sandbox crashed: {stderr}")]
    SandboxCrash { stderr: String },
    #[error("Query was cancelled")]
    Cancelled,
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("I/O error: {0}")]
    IoError(String),
}

impl PipelineError {
    /// Short user-facing explanation, free of internal detail.
    pub fn explain(&self) -> String {
        match self {
            PipelineError::AnalysisAmbiguous(_) => {
                "The request was ambiguous; it was handled as a generic task.".to_string()
            }
            PipelineError::GenerationError(msg) => {
                format!("The language model could not produce code ({}).", msg)
            }
            PipelineError::ExtractionFailed => {
                "The language model answered, but its reply contained no usable code.".to_string()
            }
            PipelineError::UnresolvedDependency { symbols, .. } => format!(
                "The generated code uses names that could not be imported automatically: {}.",
                symbols.join(", ")
            ),
            PipelineError::SandboxTimeout { seconds } => format!(
                "The program ran longer than the {} second limit and was stopped.",
                seconds
            ),
            PipelineError::SandboxResourceExceeded(what) => {
                format!("The program exceeded its resource limits ({}) and was stopped.", what)
            }
            PipelineError::SandboxCrash { .. } => {
                "The isolated execution environment failed unexpectedly.".to_string()
            }
            PipelineError::Cancelled => "The request was cancelled.".to_string(),
            PipelineError::ConfigError(msg) => format!("Configuration problem: {}.", msg),
            PipelineError::IoError(msg) => format!("I/O problem: {}.", msg),
        }
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::IoError(err.to_string())
    }
}

impl From<ModelError> for PipelineError {
    fn from(err: ModelError) -> Self {
        PipelineError::GenerationError(err.to_string())
    }
}

/// Failures at the model service boundary.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("Model '{model}' unavailable: {message}")]
    Unavailable { model: String, message: String },
    #[error("Model '{model}' timed out after {seconds}s")]
    Timeout { model: String, seconds: u64 },
    #[error("Invalid model response: {0}")]
    InvalidResponse(String),
}

impl ModelError {
    /// Whether an alternate model identifier is worth trying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ModelError::Unavailable { .. } | ModelError::Timeout { .. })
    }
}

// Internal failures of a sandbox runtime, reported as `ExitReason::SandboxError`.
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Bollard (Docker client) error: {0}")]
    BollardError(#[from] bollard::errors::Error),
    #[error("I/O error during sandbox operation: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Could not encode sandbox payload: {0}")]
    PayloadError(#[from] serde_json::Error),
    #[error("Could not provision sandbox: {0}")]
    ProvisionFailed(String),
    #[error("Sandbox handle {0} does not belong to this runtime")]
    ForeignHandle(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unresolved_dependency_lists_symbols() {
        let err = PipelineError::UnresolvedDependency {
            symbols: vec!["frobnicate".to_string(), "zzz".to_string()],
            code: String::new(),
        };
        assert_eq!(err.to_string(), "Unresolved dependencies: frobnicate, zzz");
        assert!(err.explain().contains("frobnicate, zzz"));
    }

    #[test]
    fn test_timeout_and_resource_limit_are_distinct() {
        let timeout = PipelineError::SandboxTimeout { seconds: 3 };
        let memory = PipelineError::SandboxResourceExceeded("memory".to_string());
        assert_ne!(timeout.explain(), memory.explain());
        assert!(timeout.explain().contains("3 second"));
    }

    #[test]
    fn test_model_error_retryable() {
        assert!(ModelError::Timeout { model: "m".into(), seconds: 1 }.is_retryable());
        assert!(ModelError::Unavailable { model: "m".into(), message: "down".into() }.is_retryable());
        assert!(!ModelError::InvalidResponse("bad".into()).is_retryable());
    }
}
