//! Static mapping from well-known Python names to the import that binds them.
//!
//! The table is read-only once built and is shared by the static repair pass
//! and the runtime shim inside the sandbox. Names exported by more than one
//! common module are recorded as ambiguous and are never resolved silently.
//! Configuration may add entries, override them, or mark further names
//! ambiguous.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportEntry {
    pub statement: String,
    /// Standard library imports sort before third-party ones.
    pub stdlib: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<'a> {
    Resolved(&'a ImportEntry),
    Ambiguous(&'a [String]),
    Unknown,
}

#[derive(Debug, Clone, Default)]
pub struct ImportTable {
    entries: BTreeMap<String, ImportEntry>,
    ambiguous: BTreeMap<String, Vec<String>>,
}

const STDLIB_MODULES: &[&str] = &[
    "abc", "argparse", "array", "base64", "bisect", "calendar", "cmath", "collections",
    "contextlib", "copy", "csv", "dataclasses", "datetime", "decimal", "enum", "fractions",
    "functools", "glob", "hashlib", "heapq", "io", "itertools", "json", "locale", "logging",
    "math", "operator", "os", "pathlib", "platform", "pprint", "queue", "random", "re",
    "secrets", "shutil", "statistics", "string", "struct", "sys", "tempfile", "textwrap",
    "threading", "time", "timeit", "typing", "unicodedata", "uuid", "zlib",
];

const STDLIB_MEMBERS: &[(&str, &str)] = &[
    ("Counter", "collections"),
    ("OrderedDict", "collections"),
    ("defaultdict", "collections"),
    ("deque", "collections"),
    ("namedtuple", "collections"),
    ("reduce", "functools"),
    ("lru_cache", "functools"),
    ("partial", "functools"),
    ("wraps", "functools"),
    ("cache", "functools"),
    ("permutations", "itertools"),
    ("combinations", "itertools"),
    ("combinations_with_replacement", "itertools"),
    ("accumulate", "itertools"),
    ("chain", "itertools"),
    ("groupby", "itertools"),
    ("islice", "itertools"),
    ("Decimal", "decimal"),
    ("Fraction", "fractions"),
    ("Path", "pathlib"),
    ("timedelta", "datetime"),
    ("dataclass", "dataclasses"),
    ("Enum", "enum"),
    ("List", "typing"),
    ("Dict", "typing"),
    ("Tuple", "typing"),
    ("Set", "typing"),
    ("Optional", "typing"),
    ("Union", "typing"),
    ("Any", "typing"),
    ("Callable", "typing"),
    ("Iterable", "typing"),
    ("sleep", "time"),
    ("perf_counter", "time"),
    ("randint", "random"),
    ("shuffle", "random"),
    ("uniform", "random"),
    ("stdev", "statistics"),
    ("factorial", "math"),
    ("isclose", "math"),
    ("hypot", "math"),
    ("heappush", "heapq"),
    ("heappop", "heapq"),
    ("bisect_left", "bisect"),
    ("bisect_right", "bisect"),
    ("dedent", "textwrap"),
];

const THIRD_PARTY: &[(&str, &str)] = &[
    ("np", "import numpy as np"),
    ("numpy", "import numpy"),
    ("pd", "import pandas as pd"),
    ("pandas", "import pandas"),
    ("plt", "import matplotlib.pyplot as plt"),
    ("matplotlib", "import matplotlib"),
    ("sympy", "import sympy"),
    ("scipy", "import scipy"),
    ("requests", "import requests"),
];

/// Names exported by several modules; picking one would be a guess.
const AMBIGUOUS: &[(&str, &[&str])] = &[
    ("sqrt", &["from math import sqrt", "from cmath import sqrt", "from numpy import sqrt"]),
    ("pi", &["from math import pi", "from numpy import pi"]),
    ("e", &["from math import e", "from numpy import e"]),
    ("log", &["from math import log", "from cmath import log", "from numpy import log"]),
    ("exp", &["from math import exp", "from cmath import exp", "from numpy import exp"]),
    ("sin", &["from math import sin", "from cmath import sin", "from numpy import sin"]),
    ("cos", &["from math import cos", "from cmath import cos", "from numpy import cos"]),
    ("tan", &["from math import tan", "from cmath import tan", "from numpy import tan"]),
    ("floor", &["from math import floor", "from numpy import floor"]),
    ("ceil", &["from math import ceil", "from numpy import ceil"]),
    ("mean", &["from statistics import mean", "from numpy import mean"]),
    ("median", &["from statistics import median", "from numpy import median"]),
    ("choice", &["from random import choice", "from secrets import choice"]),
    ("array", &["import array", "from numpy import array"]),
    ("sp", &["import sympy as sp", "import scipy as sp"]),
];

impl ImportTable {
    pub fn empty() -> Self {
        Self::default()
    }

    /// The built-in table: standard library modules, common members, the
    /// conventional scientific-stack aliases and the known ambiguous names.
    pub fn standard() -> Self {
        let mut table = Self::empty();
        for module in STDLIB_MODULES {
            table.insert(module, format!("import {}", module), true);
        }
        for (name, module) in STDLIB_MEMBERS {
            table.insert(name, format!("from {} import {}", module, name), true);
        }
        for (name, statement) in THIRD_PARTY {
            table.insert(name, statement.to_string(), false);
        }
        for (name, candidates) in AMBIGUOUS {
            table.mark_ambiguous(name, candidates.iter().map(|c| c.to_string()).collect());
        }
        table
    }

    pub fn insert(&mut self, name: &str, statement: String, stdlib: bool) {
        self.ambiguous.remove(name);
        self.entries
            .insert(name.to_string(), ImportEntry { statement, stdlib });
    }

    /// Adds an entry, classifying it as standard library when the imported
    /// top-level module is one of the known standard modules.
    pub fn insert_statement(&mut self, name: &str, statement: &str) {
        let stdlib = statement_module(statement)
            .map(|m| STDLIB_MODULES.contains(&m.as_str()))
            .unwrap_or(false);
        self.insert(name, statement.trim().to_string(), stdlib);
    }

    pub fn mark_ambiguous(&mut self, name: &str, candidates: Vec<String>) {
        self.entries.remove(name);
        self.ambiguous.insert(name.to_string(), candidates);
    }

    pub fn lookup(&self, name: &str) -> Lookup<'_> {
        if let Some(entry) = self.entries.get(name) {
            return Lookup::Resolved(entry);
        }
        if let Some(candidates) = self.ambiguous.get(name) {
            return Lookup::Ambiguous(candidates);
        }
        Lookup::Unknown
    }

    /// Whether `name` would be bound by `from <module> import *`.
    pub fn provided_by_star(&self, name: &str, module: &str) -> bool {
        let star_prefix = format!("from {} import ", module);
        match self.lookup(name) {
            Lookup::Resolved(entry) => entry.statement.starts_with(&star_prefix),
            Lookup::Ambiguous(candidates) => candidates.iter().any(|c| c.starts_with(&star_prefix)),
            Lookup::Unknown => false,
        }
    }

    /// Resolvable entries as `name -> statement`, handed to the sandbox shim.
    pub fn resolvable(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .map(|(name, entry)| (name.clone(), entry.statement.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Top-level module named by an import statement.
fn statement_module(statement: &str) -> Option<String> {
    let mut words = statement.split_whitespace();
    match words.next()? {
        "import" | "from" => words
            .next()
            .and_then(|m| m.split('.').next())
            .map(|m| m.trim_end_matches(',').to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_table_resolves_modules_and_members() {
        let table = ImportTable::standard();
        assert_eq!(
            table.lookup("time"),
            Lookup::Resolved(&ImportEntry { statement: "import time".to_string(), stdlib: true })
        );
        match table.lookup("defaultdict") {
            Lookup::Resolved(entry) => {
                assert_eq!(entry.statement, "from collections import defaultdict")
            }
            other => panic!("unexpected lookup {:?}", other),
        }
        match table.lookup("np") {
            Lookup::Resolved(entry) => assert!(!entry.stdlib),
            other => panic!("unexpected lookup {:?}", other),
        }
    }

    #[test]
    fn test_ambiguous_names_are_not_resolved() {
        let table = ImportTable::standard();
        match table.lookup("sqrt") {
            Lookup::Ambiguous(candidates) => assert!(candidates.len() >= 2),
            other => panic!("sqrt should be ambiguous, got {:?}", other),
        }
        assert!(!table.resolvable().contains_key("sqrt"));
        assert_eq!(table.lookup("frobnicate"), Lookup::Unknown);
    }

    #[test]
    fn test_configured_entry_overrides_ambiguity() {
        let mut table = ImportTable::standard();
        table.insert_statement("sqrt", "from math import sqrt");
        match table.lookup("sqrt") {
            Lookup::Resolved(entry) => assert!(entry.stdlib),
            other => panic!("unexpected lookup {:?}", other),
        }
        table.mark_ambiguous("time", vec!["import time".into(), "from datetime import time".into()]);
        assert!(matches!(table.lookup("time"), Lookup::Ambiguous(_)));
    }

    #[test]
    fn test_star_import_coverage() {
        let table = ImportTable::standard();
        assert!(table.provided_by_star("sqrt", "math"));
        assert!(table.provided_by_star("factorial", "math"));
        assert!(!table.provided_by_star("factorial", "numpy"));
    }
}
