//! The Python side of a sandbox run.
//!
//! The harness is copied next to the artifact and started instead of it. It
//! receives the symbol table up front and runs the artifact in a globals
//! mapping whose `__missing__` imports a table entry the first time the name
//! is read, so execution continues where it was instead of starting over.
//! Lookups that bypass the mapping (class bodies) fall back to a restart with
//! the import preloaded. A reference to a submodule that was never imported
//! is reported as the missing dotted name for the caller to repair. The
//! outcome is printed as one JSON line behind `RESULT_MARKER` after the
//! artifact's own output.

use crate::core_types::{CodeArtifact, ExecutionRequest};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const RESULT_MARKER: &str = "__NLEXEC_RESULT__";
pub const HARNESS_FILE: &str = "nlexec_harness.py";
pub const ARTIFACT_FILE: &str = "artifact.py";
pub const PAYLOAD_FILE: &str = "payload.json";

pub const HARNESS_SOURCE: &str = r#"import builtins
import contextlib
import io
import json
import re
import sys
import traceback

MARKER = "__NLEXEC_RESULT__"
NAME_PATTERN = re.compile(r"name '([^']+)' is not defined")
ATTRIBUTE_PATTERN = re.compile(r"module '([\w.]+)' has no attribute '(\w+)'")
NETWORK_DISABLED = "network access is disabled in this sandbox"


def block_network():
    import socket

    def refuse(*args, **kwargs):
        raise OSError(NETWORK_DISABLED)

    class DisabledSocket(socket.socket):
        def __init__(self, *args, **kwargs):
            raise OSError(NETWORK_DISABLED)

    socket.socket = DisabledSocket
    socket.create_connection = refuse
    socket.getaddrinfo = refuse


def apply_limits(limits):
    if not limits:
        return
    try:
        import resource
    except ImportError:
        return
    memory = int(limits.get("memory_mb", 0)) * 1024 * 1024
    if memory > 0:
        resource.setrlimit(resource.RLIMIT_AS, (memory, memory))
    cpu = int(limits.get("cpu_seconds", 0))
    if cpu > 0:
        resource.setrlimit(resource.RLIMIT_CPU, (cpu, cpu + 1))


class LazyImports(dict):
    def __init__(self, table):
        super().__init__(__name__="__nlexec__", __builtins__=builtins)
        self.table = table
        self.imported = []

    def bind(self, name):
        statement = self.table[name]
        scratch = {"__builtins__": builtins}
        exec(statement, scratch)
        value = scratch[name]
        self[name] = value
        self.imported.append(name)
        sys.stderr.write("runtime import for %s: %s\n" % (name, statement))
        return value

    def __missing__(self, name):
        if name not in self.table or hasattr(builtins, name):
            raise KeyError(name)
        return self.bind(name)


def missing_name(exc):
    name = getattr(exc, "name", None)
    if name:
        return name
    match = NAME_PATTERN.search(str(exc))
    return match.group(1) if match else None


def missing_submodule(exc):
    match = ATTRIBUTE_PATTERN.search(str(exc))
    if not match:
        return None
    dotted = "%s.%s" % match.groups()
    try:
        import importlib.util
        if importlib.util.find_spec(dotted) is None:
            return None
    except (ImportError, ValueError):
        return None
    return dotted


def encode(value):
    try:
        json.dumps(value, allow_nan=False)
        return value
    except (TypeError, ValueError):
        return repr(value)


def run(source, entry, arguments, namespace):
    exec(compile(source, "artifact.py", "exec"), namespace)
    function = namespace.get(entry)
    if not callable(function):
        raise RuntimeError("entry point '%s' is not defined" % entry)
    return function(**arguments)


def fail(result, exc, missing=None):
    traceback.print_exc(file=sys.stderr)
    result["error_type"] = type(exc).__name__
    result["error_message"] = str(exc)
    result["missing_symbol"] = missing


def main():
    with open(sys.argv[1], encoding="utf-8") as handle:
        source = handle.read()
    with open(sys.argv[2], encoding="utf-8") as handle:
        payload = json.load(handle)

    table = payload.get("symbol_table", {})
    if not payload.get("network_enabled", False):
        block_network()
    apply_limits(payload.get("limits"))

    preloaded = []
    result = {"success": False, "return_value": None, "error_type": None,
              "error_message": None, "missing_symbol": None}
    while True:
        namespace = LazyImports(table)
        captured = io.StringIO()
        try:
            with contextlib.redirect_stdout(captured):
                for name in preloaded:
                    namespace.bind(name)
                value = run(source, payload["entry_point"], payload.get("arguments", {}), namespace)
            result["success"] = True
            result["return_value"] = encode(value)
            break
        except NameError as exc:
            name = missing_name(exc)
            if name and name in table and name not in namespace.imported:
                sys.stderr.write("restarting with %s preloaded\n" % name)
                sys.stderr.write(captured.getvalue())
                preloaded.append(name)
                continue
            fail(result, exc, name)
            break
        except AttributeError as exc:
            fail(result, exc, missing_submodule(exc))
            break
        except BaseException as exc:
            fail(result, exc)
            break

    result["runtime_imports"] = [table[name] for name in namespace.imported]
    sys.stdout.write(captured.getvalue())
    sys.stdout.write("\n" + MARKER + json.dumps(result) + "\n")
    sys.stdout.flush()


if __name__ == "__main__":
    main()
"#;

/// In-process limits for runtimes without cgroups.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RlimitSpec {
    pub memory_mb: u64,
    pub cpu_seconds: u64,
}

/// Everything the harness needs besides the artifact source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HarnessPayload {
    pub entry_point: String,
    pub arguments: BTreeMap<String, Value>,
    pub symbol_table: BTreeMap<String, String>,
    pub network_enabled: bool,
    #[serde(default)]
    pub limits: Option<RlimitSpec>,
}

impl HarnessPayload {
    /// Caller arguments are kept only for declared parameters.
    pub fn for_request(
        request: &ExecutionRequest,
        symbol_table: BTreeMap<String, String>,
        with_rlimits: bool,
    ) -> Self {
        let artifact: &CodeArtifact = &request.code_artifact;
        let mut arguments = BTreeMap::new();
        for (name, value) in &request.arguments {
            if artifact.parameters.iter().any(|p| &p.name == name) {
                arguments.insert(name.clone(), value.clone());
            } else {
                log::warn!(
                    "Ignoring argument '{}': '{}' has no such parameter",
                    name,
                    artifact.entry_point_name
                );
            }
        }
        let limits = with_rlimits.then(|| {
            let limits = &request.resource_limits;
            RlimitSpec {
                memory_mb: limits.memory_mb,
                cpu_seconds: (limits.wall_clock_timeout.as_secs_f64() * limits.cpu).ceil() as u64 + 1,
            }
        });
        Self {
            entry_point: artifact.entry_point_name.clone(),
            arguments,
            symbol_table,
            network_enabled: request.network_enabled,
            limits,
        }
    }
}

/// The JSON line the harness prints behind `RESULT_MARKER`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct HarnessReport {
    pub success: bool,
    #[serde(default)]
    pub return_value: Option<Value>,
    #[serde(default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub missing_symbol: Option<String>,
    #[serde(default)]
    pub runtime_imports: Vec<String>,
}

/// Splits raw stdout into the artifact's own output and the harness report.
pub fn parse_output(stdout: &str) -> (String, Option<HarnessReport>) {
    let Some(position) = stdout.rfind(RESULT_MARKER) else {
        return (stdout.to_string(), None);
    };
    let user_output = stdout[..position]
        .strip_suffix('\n')
        .unwrap_or(&stdout[..position])
        .to_string();
    let line = stdout[position + RESULT_MARKER.len()..].lines().next().unwrap_or("");
    match serde_json::from_str(line) {
        Ok(report) => (user_output, Some(report)),
        Err(e) => {
            log::warn!("Unreadable harness report: {}", e);
            (user_output, None)
        }
    }
}
