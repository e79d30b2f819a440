use super::{render_function, ExtensionHandler};
use crate::core_types::{CodeArtifact, QueryAnalysis, QueryType};

/// Evaluates a detected arithmetic chain such as `2 + 2` or `3 * 4 - 1`.
pub struct ArithmeticHandler;

impl ArithmeticHandler {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ArithmeticHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtensionHandler for ArithmeticHandler {
    fn name(&self) -> &str {
        "arithmetic"
    }

    fn matches(&self, _query_text: &str, analysis: &QueryAnalysis) -> bool {
        analysis.query_type == QueryType::Arithmetic
            && analysis.expression.is_some()
            && !analysis.detected_variables.is_empty()
    }

    fn generate(&self, _query_text: &str, analysis: &QueryAnalysis) -> CodeArtifact {
        let expression = analysis.expression.clone().unwrap_or_default();
        // Only variables the expression reads become parameters.
        let params: Vec<_> = analysis
            .detected_variables
            .iter()
            .filter(|v| {
                expression
                    .split(|c: char| !c.is_alphanumeric() && c != '_')
                    .any(|token| token == v.name.as_str())
            })
            .map(|v| (v.name.clone(), v.value))
            .collect();
        render_function(
            self.name(),
            "calculate",
            &format!("Arithmetic: evaluates {}.", expression),
            &params,
            &[format!("return {}", expression)],
        )
    }
}
