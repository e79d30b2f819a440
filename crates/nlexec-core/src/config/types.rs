//! Configuration type definitions.
//!
//! Every section has serde defaults, so an empty YAML document is a valid
//! configuration. Caller options on a single query override these values.

use crate::core_types::{ResourceLimits, SandboxBackend};
use crate::deps::ImportTable;
use crate::errors::PipelineError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NlexecConfig {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub imports: ImportsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub provider: LlmProvider,
    /// Empty means the provider's default model.
    #[serde(default)]
    pub model: String,
    /// Alternate model identifiers tried in order when the primary fails.
    #[serde(default)]
    pub fallback_models: Vec<String>,
    /// Overrides the provider's default endpoint.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub auth: LlmAuth,
    #[serde(default = "default_llm_timeout")]
    pub timeout_seconds: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::default(),
            model: String::new(),
            fallback_models: Vec::new(),
            base_url: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            auth: LlmAuth::default(),
            timeout_seconds: default_llm_timeout(),
        }
    }
}

impl LlmConfig {
    pub fn effective_model(&self) -> &str {
        if self.model.is_empty() {
            self.provider.default_model()
        } else {
            &self.model
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    #[default]
    OpenAI,
    Ollama,
    Custom {
        base_url: String,
    },
}

impl LlmProvider {
    pub fn default_model(&self) -> &'static str {
        match self {
            LlmProvider::OpenAI | LlmProvider::Custom { .. } => "gpt-4.1-mini",
            LlmProvider::Ollama => "llama3.1",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmAuth {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_backend")]
    pub backend: SandboxBackend,
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_python_path")]
    pub python_path: String,
    /// CPU cores.
    #[serde(default = "default_cpu")]
    pub cpu: f64,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
    #[serde(default = "default_sandbox_timeout")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub allow_network: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            image: default_image(),
            python_path: default_python_path(),
            cpu: default_cpu(),
            memory_mb: default_memory_mb(),
            timeout_seconds: default_sandbox_timeout(),
            allow_network: false,
        }
    }
}

impl SandboxConfig {
    pub fn limits(&self) -> ResourceLimits {
        ResourceLimits {
            cpu: self.cpu,
            memory_mb: self.memory_mb,
            wall_clock_timeout: Duration::from_secs(self.timeout_seconds),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_max_repair_attempts")]
    pub max_repair_attempts: u32,
    #[serde(default = "default_true")]
    pub static_repair: bool,
    /// JSON-lines file receiving one record per processed query.
    #[serde(default)]
    pub history_file: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_repair_attempts: default_max_repair_attempts(),
            static_repair: true,
            history_file: None,
        }
    }
}

/// Additions to the built-in import mapping table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportsConfig {
    /// `symbol: import statement`, replacing any built-in entry.
    #[serde(default)]
    pub entries: BTreeMap<String, String>,
    /// Symbols that must never be resolved automatically.
    #[serde(default)]
    pub ambiguous: Vec<String>,
}

impl ImportsConfig {
    pub fn build_table(&self) -> ImportTable {
        let mut table = ImportTable::standard();
        for (symbol, statement) in &self.entries {
            table.insert_statement(symbol, statement);
        }
        for symbol in &self.ambiguous {
            let candidates = table
                .resolvable()
                .get(symbol)
                .map(|statement| vec![statement.clone()])
                .unwrap_or_default();
            table.mark_ambiguous(symbol, candidates);
        }
        table
    }
}

impl NlexecConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.llm.effective_model().trim().is_empty() {
            return Err(PipelineError::ConfigError("LLM model cannot be empty".to_string()));
        }
        if self.llm.timeout_seconds == 0 {
            return Err(PipelineError::ConfigError(
                "LLM timeout_seconds must be greater than 0".to_string(),
            ));
        }
        if let LlmProvider::Custom { base_url } = &self.llm.provider {
            if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
                return Err(PipelineError::ConfigError(format!(
                    "Custom provider base_url must be an http(s) URL, got '{}'",
                    base_url
                )));
            }
        }
        if self.llm.fallback_models.iter().any(|m| m.trim().is_empty()) {
            return Err(PipelineError::ConfigError(
                "Fallback model identifiers cannot be empty".to_string(),
            ));
        }

        if !(self.sandbox.cpu > 0.0) {
            return Err(PipelineError::ConfigError(
                "Sandbox cpu must be greater than 0".to_string(),
            ));
        }
        if self.sandbox.memory_mb < 16 {
            return Err(PipelineError::ConfigError(
                "Sandbox memory_mb must be at least 16".to_string(),
            ));
        }
        if self.sandbox.timeout_seconds == 0 {
            return Err(PipelineError::ConfigError(
                "Sandbox timeout_seconds must be greater than 0".to_string(),
            ));
        }
        if self.sandbox.backend == SandboxBackend::Docker && self.sandbox.image.is_empty() {
            return Err(PipelineError::ConfigError(
                "Sandbox image cannot be empty for the docker backend".to_string(),
            ));
        }

        for (symbol, statement) in &self.imports.entries {
            let statement = statement.trim();
            if !statement.starts_with("import ") && !statement.starts_with("from ") {
                return Err(PipelineError::ConfigError(format!(
                    "Import entry for '{}' is not an import statement: '{}'",
                    symbol, statement
                )));
            }
        }
        Ok(())
    }
}

fn default_temperature() -> f32 { 0.2 }
fn default_max_tokens() -> u32 { 2048 }
fn default_llm_timeout() -> u64 { 60 }
fn default_backend() -> SandboxBackend { SandboxBackend::Docker }
fn default_image() -> String { "python:3.11-slim".to_string() }
fn default_python_path() -> String { "python3".to_string() }
fn default_cpu() -> f64 { 1.0 }
fn default_memory_mb() -> u64 { 256 }
fn default_sandbox_timeout() -> u64 { 10 }
fn default_max_repair_attempts() -> u32 { 1 }
fn default_true() -> bool { true }
