//! Deterministic code handlers for recognised query domains.
//!
//! A handler turns a recognised query straight into an artifact without a
//! model call, so the same input always yields the same source. The registry
//! is assembled once at startup and is read-only afterwards; it is shared by
//! reference with every pipeline that needs it.

mod arithmetic;
mod geometry;

pub use arithmetic::ArithmeticHandler;
pub use geometry::GeometryHandler;

use crate::core_types::{ArtifactOrigin, CodeArtifact, DetectedValue, Parameter, QueryAnalysis};
use crate::generator::normalize::render_docstring;
use std::sync::Arc;

pub trait ExtensionHandler: Send + Sync {
    fn name(&self) -> &str;

    fn matches(&self, query_text: &str, analysis: &QueryAnalysis) -> bool;

    /// Only called after `matches` returned true for the same input.
    fn generate(&self, query_text: &str, analysis: &QueryAnalysis) -> CodeArtifact;
}

#[derive(Clone, Default)]
pub struct ExtensionRegistry {
    handlers: Vec<Arc<dyn ExtensionHandler>>,
}

impl ExtensionRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Built-in handlers, most specific first.
    pub fn with_defaults() -> Self {
        Self::builder()
            .register(Arc::new(GeometryHandler::new()))
            .register(Arc::new(ArithmeticHandler::new()))
            .build()
    }

    pub fn builder() -> ExtensionRegistryBuilder {
        ExtensionRegistryBuilder {
            handlers: Vec::new(),
        }
    }

    /// First registered handler whose patterns match.
    pub fn find_handler(
        &self,
        query_text: &str,
        analysis: &QueryAnalysis,
    ) -> Option<&dyn ExtensionHandler> {
        self.handlers
            .iter()
            .find(|h| h.matches(query_text, analysis))
            .map(|h| h.as_ref())
    }

    pub fn handler_names(&self) -> Vec<&str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

pub struct ExtensionRegistryBuilder {
    handlers: Vec<Arc<dyn ExtensionHandler>>,
}

impl ExtensionRegistryBuilder {
    pub fn register(mut self, handler: Arc<dyn ExtensionHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn build(self) -> ExtensionRegistry {
        ExtensionRegistry {
            handlers: self.handlers,
        }
    }
}

/// Renders a documented single-function artifact.
pub(crate) fn render_function(
    handler: &str,
    function_name: &str,
    summary: &str,
    params: &[(String, DetectedValue)],
    body: &[String],
) -> CodeArtifact {
    let parameters: Vec<Parameter> = params
        .iter()
        .map(|(name, value)| Parameter {
            name: name.clone(),
            default_value: Some(value.to_python()),
            inferred_type: value.param_type(),
        })
        .collect();
    let signature = parameters
        .iter()
        .map(|p| match &p.default_value {
            Some(default) => format!("{}={}", p.name, default),
            None => p.name.clone(),
        })
        .collect::<Vec<_>>()
        .join(", ");

    let mut source = format!("def {}({}):\n", function_name, signature);
    source.push_str(&render_docstring(summary, &parameters, "    "));
    for line in body {
        source.push_str("    ");
        source.push_str(line);
        source.push('\n');
    }

    CodeArtifact {
        source_text: source,
        entry_point_name: function_name.to_string(),
        parameters,
        description: summary.to_string(),
        origin: ArtifactOrigin::Extension {
            handler: handler.to_string(),
        },
    }
}
