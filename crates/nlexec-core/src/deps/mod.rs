//! Static dependency analysis and repair for generated artifacts.
//!
//! The repairer scans an artifact's source, computes the names that are read
//! but never bound, and prepends the imports the mapping table knows for
//! them. Generated logic is never touched; the only edit is prepended import
//! lines. Names without a table entry, or with several candidate modules, are
//! reported as unresolved instead of being guessed.

pub mod scanner;
pub mod table;

pub use scanner::{scan, SymbolScan};
pub use table::{ImportEntry, ImportTable, Lookup};

use crate::core_types::{CodeArtifact, DependencyReport};
use std::collections::BTreeSet;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct DependencyRepairer {
    table: Arc<ImportTable>,
}

impl DependencyRepairer {
    pub fn new(table: Arc<ImportTable>) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &Arc<ImportTable> {
        &self.table
    }

    /// Inspects `artifact` and returns a copy with the resolvable imports
    /// prepended, plus the report describing what was found.
    pub fn repair(&self, artifact: &CodeArtifact) -> (CodeArtifact, DependencyReport) {
        let scan = scan(&artifact.source_text);
        let missing: BTreeSet<String> = scan
            .unbound()
            .into_iter()
            .filter(|name| {
                !scan
                    .star_imports
                    .iter()
                    .any(|module| self.table.provided_by_star(name, module))
            })
            .collect();
        let report = self.resolve(missing);
        if report.resolved_imports.is_empty() {
            log::debug!("No imports needed for '{}'", artifact.entry_point_name);
        } else {
            log::info!(
                "Static repair added {} import(s) to '{}': {:?}",
                report.resolved_imports.len(),
                artifact.entry_point_name,
                report.resolved_imports
            );
        }
        if !report.unresolved.is_empty() {
            log::warn!("Static repair left unresolved symbols: {:?}", report.unresolved);
        }
        (artifact.with_prepended_imports(&report.resolved_imports), report)
    }

    /// Repairs a single symbol reported by a failed execution.
    ///
    /// A dotted symbol names a submodule the artifact reached through its
    /// parent package without importing it; it is repaired with a plain
    /// `import` of the full path.
    pub fn repair_symbol(
        &self,
        artifact: &CodeArtifact,
        symbol: &str,
    ) -> (CodeArtifact, DependencyReport) {
        let mut missing = BTreeSet::new();
        missing.insert(symbol.to_string());
        let mut report = match submodule_import(symbol) {
            Some(statement) => DependencyReport {
                missing_symbols: missing,
                resolved_imports: vec![statement],
                ..Default::default()
            },
            None => self.resolve(missing),
        };
        // An import already present in the source cannot fix the failure.
        let existing: BTreeSet<&str> = artifact.source_text.lines().map(str::trim).collect();
        let duplicates: Vec<String> = report
            .resolved_imports
            .iter()
            .filter(|stmt| existing.contains(stmt.as_str()))
            .cloned()
            .collect();
        if !duplicates.is_empty() {
            report.resolved_imports.retain(|stmt| !duplicates.contains(stmt));
            report.unresolved.insert(symbol.to_string());
        }
        (artifact.with_prepended_imports(&report.resolved_imports), report)
    }

    fn resolve(&self, missing: BTreeSet<String>) -> DependencyReport {
        let mut report = DependencyReport {
            missing_symbols: missing.clone(),
            ..Default::default()
        };
        let mut resolved: Vec<(bool, String)> = Vec::new();
        for name in &missing {
            match self.table.lookup(name) {
                Lookup::Resolved(entry) => resolved.push((entry.stdlib, entry.statement.clone())),
                Lookup::Ambiguous(candidates) => {
                    report.unresolved.insert(name.clone());
                    report.ambiguous.insert(name.clone(), candidates.to_vec());
                }
                Lookup::Unknown => {
                    report.unresolved.insert(name.clone());
                }
            }
        }
        // Standard library first, then alphabetical within each group.
        resolved.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        resolved.dedup_by(|a, b| a.1 == b.1);
        report.resolved_imports = resolved.into_iter().map(|(_, stmt)| stmt).collect();
        report
    }
}

fn submodule_import(symbol: &str) -> Option<String> {
    let is_identifier = |segment: &str| {
        let mut chars = segment.chars();
        matches!(chars.next(), Some(c) if c.is_alphabetic() || c == '_')
            && chars.all(|c| c.is_alphanumeric() || c == '_')
    };
    (symbol.contains('.') && symbol.split('.').all(is_identifier))
        .then(|| format!("import {}", symbol))
}

impl Default for DependencyRepairer {
    fn default() -> Self {
        Self::new(Arc::new(ImportTable::standard()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::ArtifactOrigin;

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
    fn test_inserts_missing_time_import() {
        let repairer = DependencyRepairer::default();
        let (repaired, report) =
            repairer.repair(&artifact("def main():\n    time.sleep(1)\n    return 'done'\n"));
        assert_eq!(report.resolved_imports, vec!["import time".to_string()]);
        assert!(report.unresolved.is_empty());
        assert!(repaired.source_text.starts_with("import time\n"));
        assert!(repaired.source_text.ends_with("    return 'done'\n"));
    }

    #[test]
    fn test_repair_is_idempotent() {
        let repairer = DependencyRepairer::default();
        let source = "def main(n=5):\n    xs = np.arange(n)\n    c = Counter(xs.tolist())\n    return math.factorial(n) + len(c)\n";
        let (once, first) = repairer.repair(&artifact(source));
        assert_eq!(first.resolved_imports.len(), 3);
        let (twice, second) = repairer.repair(&once);
        assert!(second.resolved_imports.is_empty());
        assert!(second.missing_symbols.is_empty());
        assert_eq!(once.source_text, twice.source_text);
    }

    #[test]
    fn test_stdlib_imports_sort_first() {
        let repairer = DependencyRepairer::default();
        let (_, report) = repairer.repair(&artifact(
            "def main():\n    return pd.DataFrame(), json.dumps({}), math.pi, deque()\n",
        ));
        assert_eq!(
            report.resolved_imports,
            vec![
                "from collections import deque".to_string(),
                "import json".to_string(),
                "import math".to_string(),
                "import pandas as pd".to_string(),
            ]
        );
    }

    #[test]
    fn test_unknown_symbol_is_unresolved_not_guessed() {
        let repairer = DependencyRepairer::default();
        let (repaired, report) = repairer.repair(&artifact(
            "def main():\n    return quantumflux.compute(42)\n",
        ));
        assert!(report.resolved_imports.is_empty());
        assert!(report.unresolved.contains("quantumflux"));
        assert_eq!(repaired.source_text, "def main():\n    return quantumflux.compute(42)\n");
    }

    #[test]
    fn test_ambiguous_symbol_is_reported_with_candidates() {
        let repairer = DependencyRepairer::default();
        let (_, report) = repairer.repair(&artifact("def main(x=4):\n    return sqrt(x)\n"));
        assert!(report.unresolved.contains("sqrt"));
        assert!(report.ambiguous["sqrt"].len() >= 2);
    }

    #[test]
    fn test_star_import_covers_members() {
        let repairer = DependencyRepairer::default();
        let (_, report) =
            repairer.repair(&artifact("from math import *\ndef main():\n    return factorial(4)\n"));
        assert!(report.missing_symbols.is_empty());
    }

    #[test]
    fn test_duplicate_symbols_share_one_import() {
        let mut table = ImportTable::standard();
        table.insert_statement("np", "import numpy as np");
        table.insert_statement("numpy", "import numpy as np");
        let repairer = DependencyRepairer::new(Arc::new(table));
        let (_, report) =
            repairer.repair(&artifact("def main():\n    return np.zeros(2), numpy.ones(2)\n"));
        assert_eq!(report.resolved_imports, vec!["import numpy as np".to_string()]);
    }

    #[test]
    fn test_repair_symbol_for_runtime_failure() {
        let repairer = DependencyRepairer::default();
        let (repaired, report) =
            repairer.repair_symbol(&artifact("def main():\n    return 1\n"), "random");
        assert_eq!(report.resolved_imports, vec!["import random".to_string()]);
        assert!(repaired.source_text.starts_with("import random"));

        let (_, again) = repairer.repair_symbol(&repaired, "random");
        assert!(again.resolved_imports.is_empty());
        assert!(again.unresolved.contains("random"));
    }

    #[test]
    fn test_repair_symbol_imports_unloaded_submodule() {
        let repairer = DependencyRepairer::default();
        let source = "import concurrent\n\ndef main():\n    return concurrent.futures.ALL_COMPLETED\n";
        let (repaired, report) = repairer.repair_symbol(&artifact(source), "concurrent.futures");
        assert_eq!(report.resolved_imports, vec!["import concurrent.futures".to_string()]);
        assert!(report.unresolved.is_empty());
        assert!(repaired.source_text.starts_with("import concurrent.futures\n"));

        let (_, bogus) = repairer.repair_symbol(&artifact(source), "concurrent.futures; rm");
        assert!(bogus.resolved_imports.is_empty());
        assert!(bogus.unresolved.contains("concurrent.futures; rm"));
    }
}
