//! Language model abstraction used by the code generator.
//!
//! A model only turns a prompt into text. Extraction and normalization of the
//! returned code happen in the generator, so providers stay thin HTTP clients.

use crate::errors::ModelError;
use async_trait::async_trait;
use std::time::Duration;

pub mod fallback;
pub mod providers;

pub use fallback::FallbackModel;
pub use providers::create_model;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You write small, self-contained Python 3 programs. \
Answer with a single ```python fenced block containing one function that returns the result. \
Give every parameter a default value taken from the request. Use only the standard library \
unless the request needs something else, and import everything you use.";

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionParams {
    pub temperature: f32,
    pub max_tokens: u32,
    /// Per-call deadline; a call that exceeds it fails with `ModelError::Timeout`.
    pub timeout: Duration,
    pub system_prompt: String,
}

impl Default for CompletionParams {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            max_tokens: 2048,
            timeout: Duration::from_secs(60),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn model_id(&self) -> &str;

    async fn complete(&self, prompt: &str, params: &CompletionParams) -> Result<String, ModelError>;
}
