//! Core type definitions for the query-to-execution pipeline
//!
//! These types form the contract between the pipeline stages. Analysis and
//! execution records are immutable snapshots; the only value that changes after
//! creation is a `CodeArtifact`, and only by having import lines prepended.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

/// A natural-language request plus the caller's per-query options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    pub text: String,
    #[serde(default)]
    pub options: QueryOptions,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            options: QueryOptions::default(),
        }
    }

    pub fn with_options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SandboxBackend {
    Docker,
    Process,
}

impl fmt::Display for SandboxBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SandboxBackend::Docker => write!(f, "docker"),
            SandboxBackend::Process => write!(f, "process"),
        }
    }
}

/// Caller overrides; unset fields fall back to configuration defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryOptions {
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub allow_network: Option<bool>,
    #[serde(default)]
    pub max_repair_attempts: Option<u32>,
    #[serde(default)]
    pub static_repair: Option<bool>,
    #[serde(default)]
    pub sandbox: Option<SandboxBackend>,
    /// Overrides for the entry point's parameter defaults.
    #[serde(default)]
    pub arguments: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    Arithmetic,
    Geometric,
    Generic,
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryType::Arithmetic => write!(f, "arithmetic"),
            QueryType::Geometric => write!(f, "geometric"),
            QueryType::Generic => write!(f, "generic"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Shape {
    Circle,
    Square,
    Rectangle,
    Triangle,
    Sphere,
    Cube,
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Shape::Circle => "circle",
            Shape::Square => "square",
            Shape::Rectangle => "rectangle",
            Shape::Triangle => "triangle",
            Shape::Sphere => "sphere",
            Shape::Cube => "cube",
        };
        write!(f, "{}", name)
    }
}

/// A numeric literal detected in the query text.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum DetectedValue {
    Int(i64),
    Float(f64),
}

impl DetectedValue {
    /// Parses `2`, `-3`, `2.5` and the decimal-comma form `2,5`.
    pub fn parse(literal: &str) -> Option<Self> {
        let normalized = literal.trim().replace(',', ".");
        if let Ok(value) = normalized.parse::<i64>() {
            return Some(DetectedValue::Int(value));
        }
        normalized.parse::<f64>().ok().map(DetectedValue::Float)
    }

    pub fn negated(self) -> Self {
        match self {
            DetectedValue::Int(v) => v
                .checked_neg()
                .map(DetectedValue::Int)
                .unwrap_or(DetectedValue::Float(-(v as f64))),
            DetectedValue::Float(v) => DetectedValue::Float(-v),
        }
    }

    pub fn as_f64(&self) -> f64 {
        match self {
            DetectedValue::Int(v) => *v as f64,
            DetectedValue::Float(v) => *v,
        }
    }

    /// Renders the value as a Python literal.
    pub fn to_python(&self) -> String {
        match self {
            DetectedValue::Int(v) => v.to_string(),
            DetectedValue::Float(v) if v.fract() == 0.0 && v.is_finite() => format!("{:.1}", v),
            DetectedValue::Float(v) => v.to_string(),
        }
    }

    pub fn param_type(&self) -> ParamType {
        match self {
            DetectedValue::Int(_) => ParamType::Int,
            DetectedValue::Float(_) => ParamType::Float,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetectedVariable {
    pub name: String,
    pub value: DetectedValue,
}

/// Read-only snapshot of what the analyzer found in a query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryAnalysis {
    pub query_type: QueryType,
    /// Detected variables in scan order.
    pub detected_variables: Vec<DetectedVariable>,
    pub confidence: f32,
    /// Arithmetic expression over the detected variable names, e.g. `a + b`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<Shape>,
    /// Overlapping candidates were discarded while scanning.
    #[serde(default)]
    pub ambiguous: bool,
}

impl QueryAnalysis {
    pub fn generic() -> Self {
        Self {
            query_type: QueryType::Generic,
            detected_variables: Vec::new(),
            confidence: 0.0,
            expression: None,
            shape: None,
            ambiguous: false,
        }
    }

    pub fn variable(&self, name: &str) -> Option<DetectedValue> {
        self.detected_variables
            .iter()
            .find(|v| v.name == name)
            .map(|v| v.value)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    Int,
    Float,
    Str,
    Bool,
    List,
    Dict,
    Any,
}

impl ParamType {
    /// Infers a type from a Python annotation or default literal.
    pub fn infer(annotation: Option<&str>, default: Option<&str>) -> Self {
        if let Some(annotation) = annotation {
            let annotation = annotation.trim();
            let base = annotation.split('[').next().unwrap_or(annotation).trim();
            match base {
                "int" => return ParamType::Int,
                "float" => return ParamType::Float,
                "str" => return ParamType::Str,
                "bool" => return ParamType::Bool,
                "list" | "List" | "tuple" | "Tuple" | "Sequence" => return ParamType::List,
                "dict" | "Dict" | "Mapping" => return ParamType::Dict,
                _ => {}
            }
        }
        let Some(default) = default.map(str::trim) else {
            return ParamType::Any;
        };
        if default == "True" || default == "False" {
            ParamType::Bool
        } else if default.parse::<i64>().is_ok() {
            ParamType::Int
        } else if default.parse::<f64>().is_ok() {
            ParamType::Float
        } else if default.starts_with('"') || default.starts_with('\'') {
            ParamType::Str
        } else if default.starts_with('[') || default.starts_with('(') {
            ParamType::List
        } else if default.starts_with('{') {
            ParamType::Dict
        } else {
            ParamType::Any
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParamType::Int => "int",
            ParamType::Float => "float",
            ParamType::Str => "str",
            ParamType::Bool => "bool",
            ParamType::List => "list",
            ParamType::Dict => "dict",
            ParamType::Any => "any",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Parameter {
    pub name: String,
    /// Default as Python source text, if any.
    pub default_value: Option<String>,
    pub inferred_type: ParamType,
}

/// Where an artifact came from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ArtifactOrigin {
    Extension { handler: String },
    Model { model_id: String },
    Provided,
}

/// A generated, executable Python unit with one designated entry point.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CodeArtifact {
    pub source_text: String,
    pub entry_point_name: String,
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub description: String,
    pub origin: ArtifactOrigin,
}

impl CodeArtifact {
    /// Returns a copy with `imports` prepended, keeping any leading
    /// `from __future__` lines first so the result stays valid Python.
    pub fn with_prepended_imports(&self, imports: &[String]) -> Self {
        if imports.is_empty() {
            return self.clone();
        }
        let lines: Vec<&str> = self.source_text.lines().collect();
        let future_count = lines
            .iter()
            .take_while(|l| l.trim_start().starts_with("from __future__"))
            .count();
        let mut out: Vec<String> = Vec::with_capacity(lines.len() + imports.len() + 1);
        out.extend(lines[..future_count].iter().map(|l| l.to_string()));
        out.extend(imports.iter().cloned());
        if future_count == 0 {
            out.push(String::new());
        }
        out.extend(lines[future_count..].iter().map(|l| l.to_string()));
        let mut source_text = out.join("\n");
        if self.source_text.ends_with('\n') {
            source_text.push('\n');
        }
        Self {
            source_text,
            ..self.clone()
        }
    }
}

/// Outcome of one static repair pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DependencyReport {
    pub missing_symbols: BTreeSet<String>,
    pub resolved_imports: Vec<String>,
    pub unresolved: BTreeSet<String>,
    /// Unresolved symbols that matched more than one candidate import.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ambiguous: BTreeMap<String, Vec<String>>,
}

impl DependencyReport {
    pub fn is_resolved(&self) -> bool {
        self.unresolved.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ResourceLimits {
    /// CPU cores available to the sandbox.
    pub cpu: f64,
    pub memory_mb: u64,
    #[serde(with = "duration_secs")]
    pub wall_clock_timeout: Duration,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu: 1.0,
            memory_mb: 256,
            wall_clock_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionRequest {
    pub code_artifact: CodeArtifact,
    pub resource_limits: ResourceLimits,
    pub network_enabled: bool,
    #[serde(default)]
    pub arguments: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Completed,
    Timeout,
    ResourceLimit,
    SandboxError,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExitReason::Completed => "completed",
            ExitReason::Timeout => "timeout",
            ExitReason::ResourceLimit => "resource_limit",
            ExitReason::SandboxError => "sandbox_error",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(default)]
    pub return_value: Option<serde_json::Value>,
    #[serde(default)]
    pub error_message: Option<String>,
    /// Python exception class name when the artifact raised.
    #[serde(default)]
    pub error_type: Option<String>,
    /// Name that failed to resolve at runtime and the shim could not import,
    /// or the dotted path of a submodule the artifact never imported.
    #[serde(default)]
    pub missing_symbol: Option<String>,
    /// Symbols the runtime shim imported just in time.
    #[serde(default)]
    pub runtime_imports: Vec<String>,
    pub stdout: String,
    pub stderr: String,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    pub exit_reason: ExitReason,
}

impl ExecutionResult {
    pub fn sandbox_error(message: impl Into<String>, duration: Duration) -> Self {
        let message = message.into();
        Self {
            success: false,
            return_value: None,
            error_message: Some(message.clone()),
            error_type: None,
            missing_symbol: None,
            runtime_imports: Vec::new(),
            stdout: String::new(),
            stderr: message,
            duration,
            exit_reason: ExitReason::SandboxError,
        }
    }

    /// The failure as a pipeline error, for results that did not complete.
    /// Timeouts report the configured limit, not the time actually spent.
    pub fn as_error(&self, limits: &ResourceLimits) -> Option<crate::errors::PipelineError> {
        use crate::errors::PipelineError;
        match self.exit_reason {
            ExitReason::Completed => None,
            ExitReason::Timeout => Some(PipelineError::SandboxTimeout {
                seconds: limits.wall_clock_timeout.as_secs(),
            }),
            ExitReason::ResourceLimit => Some(PipelineError::SandboxResourceExceeded(
                self.error_message
                    .clone()
                    .unwrap_or_else(|| "resource limit".to_string()),
            )),
            ExitReason::SandboxError => Some(PipelineError::SandboxCrash {
                stderr: self.stderr.clone(),
            }),
        }
    }
}

/// What the caller sees: `{success, code, output|error, explanation}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessResponse {
    pub success: bool,
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub explanation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionResult>,
}

/// One record per completed query, handed to the history store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub query: Query,
    pub artifact: Option<CodeArtifact>,
    pub result: Option<ExecutionResult>,
    pub error: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(source: &str) -> CodeArtifact {
        CodeArtifact {
            source_text: source.to_string(),
            entry_point_name: "main".to_string(),
            parameters: vec![],
            description: String::new(),
            origin: ArtifactOrigin::Provided,
        }
    }

    #[test]
    fn test_detected_value_parse() {
        assert_eq!(DetectedValue::parse("2"), Some(DetectedValue::Int(2)));
        assert_eq!(DetectedValue::parse("2,5"), Some(DetectedValue::Float(2.5)));
        assert_eq!(DetectedValue::parse("abc"), None);
        assert_eq!(DetectedValue::Float(3.0).to_python(), "3.0");
        assert_eq!(DetectedValue::Float(2.25).to_python(), "2.25");
    }

    #[test]
    fn test_param_type_inference() {
        assert_eq!(ParamType::infer(Some("float"), Some("2")), ParamType::Float);
        assert_eq!(ParamType::infer(None, Some("2")), ParamType::Int);
        assert_eq!(ParamType::infer(None, Some("'x'")), ParamType::Str);
        assert_eq!(ParamType::infer(Some("List[int]"), None), ParamType::List);
        assert_eq!(ParamType::infer(None, None), ParamType::Any);
    }

    #[test]
    fn test_prepend_imports_keeps_future_first() {
        let a = artifact("from __future__ import annotations\ndef main():\n    return 1\n");
        let repaired = a.with_prepended_imports(&["import math".to_string()]);
        assert_eq!(
            repaired.source_text,
            "from __future__ import annotations\nimport math\ndef main():\n    return 1\n"
        );
    }

    #[test]
    fn test_prepend_imports_plain() {
        let a = artifact("def main():\n    return time.time()");
        let repaired = a.with_prepended_imports(&["import time".to_string()]);
        assert!(repaired.source_text.starts_with("import time\n\ndef main():"));
        assert_eq!(repaired.entry_point_name, "main");
    }

    #[test]
    fn test_execution_result_serializes_exit_reason() {
        let result = ExecutionResult::sandbox_error("boom", Duration::from_millis(5));
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["exit_reason"], "sandbox_error");
        assert_eq!(json["duration"], 5);
        assert!(result.as_error(&ResourceLimits::default()).is_some());
    }

    #[test]
    fn test_timeout_error_reports_the_configured_limit() {
        let mut result = ExecutionResult::sandbox_error("killed", Duration::from_millis(2400));
        result.exit_reason = ExitReason::Timeout;
        let limits = ResourceLimits {
            wall_clock_timeout: Duration::from_secs(2),
            ..Default::default()
        };
        assert_eq!(
            result.as_error(&limits),
            Some(crate::errors::PipelineError::SandboxTimeout { seconds: 2 })
        );
    }
}
