//! Turns natural-language requests into Python programs and runs them in a
//! sandbox.
//!
//! The pipeline analyzes the request, generates an artifact (from a built-in
//! extension template or a language model), statically repairs missing
//! imports, and executes the artifact in a resource-limited sandbox whose
//! harness carries a second, runtime import fallback.

pub mod analysis;
pub mod config;
pub mod core_types;
pub mod deps;
pub mod errors;
pub mod extensions;
pub mod generator;
pub mod history;
pub mod llm;
pub mod pipeline;
pub mod sandbox;

pub use analysis::{HeuristicAnalyzer, QueryAnalyzer};
pub use config::{ConfigLoader, NlexecConfig};
pub use core_types::*;
pub use deps::{DependencyRepairer, ImportTable};
pub use errors::{ModelError, PipelineError, SandboxError};
pub use extensions::{ExtensionHandler, ExtensionRegistry};
pub use generator::CodeGenerator;
pub use history::{HistorySink, JsonlHistorySink, NoopHistorySink};
pub use llm::{CompletionParams, LanguageModel};
pub use pipeline::{Pipeline, PipelineBuilder, PipelineOutcome};
pub use sandbox::{SandboxExecutor, SandboxRuntime};

#[cfg(test)]
pub mod test_utils;
