//! Query analysis: structured intent from free-form request text.
//!
//! Analyzers are pure functions from text to a [`QueryAnalysis`] snapshot and
//! never fail. Anything they cannot classify comes back as a generic query
//! with whatever numbers were found.

mod heuristic;

pub use heuristic::HeuristicAnalyzer;

use crate::core_types::QueryAnalysis;

pub trait QueryAnalyzer: Send + Sync {
    fn analyze(&self, text: &str) -> QueryAnalysis;
}
