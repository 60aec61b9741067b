use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::{
    Namespace, SandboxExecutor, SandboxFile, SandboxOutput, SandboxOutputSpec, SandboxRequest,
};
use crate::capability::truncate;

const RUNNER_SCRIPT: &str = "runner.py";
const SNIPPET_FILE: &str = "snippet.py";
const STATE_IN: &str = "state.pkl";
pub(crate) const STATE_OUT: &str = "state_out.pkl";
pub(crate) const RESULT_FILE: &str = "result.json";
const OUTPUT_LIMIT: usize = 4_000;

/// Loads the pickled namespace, runs the snippet against it and writes the
/// surviving variables back out. Modules cannot be pickled, so imports are
/// recorded by name and re-imported on the next load.
const RUNNER_SOURCE: &str = r#"import contextlib
import importlib
import io
import json
import os
import pickle
import sys
import traceback
import types


def load_state():
    if not os.path.exists("state.pkl"):
        return {}, []
    with open("state.pkl", "rb") as fh:
        saved = pickle.load(fh)
    return saved.get("variables", {}), saved.get("modules", [])


def main():
    variables, modules = load_state()
    namespace = {"__name__": "__main__"}
    for alias, module_name in modules:
        try:
            namespace[alias] = importlib.import_module(module_name)
        except Exception:
            pass
    namespace.update(variables)

    with open("snippet.py", "r", encoding="utf-8") as fh:
        code = fh.read()

    buffer = io.StringIO()
    error = None
    try:
        with contextlib.redirect_stdout(buffer):
            exec(compile(code, "<snippet>", "exec"), namespace)
    except BaseException:
        error = traceback.format_exc(limit=5)

    kept, imported, summary = {}, [], []
    for name, value in namespace.items():
        if name.startswith("__"):
            continue
        if isinstance(value, types.ModuleType):
            imported.append([name, value.__name__])
            continue
        try:
            pickle.dumps(value)
        except Exception:
            continue
        kept[name] = value
        summary.append({"name": name, "type": type(value).__name__, "preview": repr(value)[:200]})

    with open("state_out.pkl", "wb") as fh:
        pickle.dump({"variables": kept, "modules": imported}, fh)
    with open("result.json", "w", encoding="utf-8") as fh:
        json.dump({"ok": error is None, "stdout": buffer.getvalue(), "error": error, "variables": summary}, fh)
    return 0 if error is None else 1


if __name__ == "__main__":
    sys.exit(main())
"#;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableSummary {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub preview: String,
}

#[derive(Debug, Deserialize)]
struct RunnerResult {
    ok: bool,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    variables: Vec<VariableSummary>,
}

/// Outcome of one snippet.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub success: bool,
    pub stdout: String,
    pub error: Option<String>,
    pub variables: Vec<VariableSummary>,
    pub artifacts: Vec<SandboxOutput>,
    pub notes: Vec<String>,
    pub timed_out: bool,
}

impl ExecutionReport {
    pub fn artifact(&self, path: &str) -> Option<&SandboxOutput> {
        self.artifacts.iter().find(|output| output.spec.path == path)
    }

    pub fn note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }

    /// Text appended to the agent history after the snippet ran.
    pub fn to_observation(&self) -> String {
        let mut out = String::new();
        if self.success {
            out.push_str("Execution succeeded\n");
            let stdout = self.stdout.trim();
            if stdout.is_empty() {
                out.push_str("Output: (none)\n");
            } else {
                let _ = writeln!(out, "Output:\n{}", truncate(stdout, OUTPUT_LIMIT));
            }
        } else {
            out.push_str("Execution failed\n");
            let stdout = self.stdout.trim();
            if !stdout.is_empty() {
                let _ = writeln!(out, "Partial output:\n{}", truncate(stdout, OUTPUT_LIMIT));
            }
            if let Some(error) = &self.error {
                let _ = writeln!(out, "Error:\n{}", truncate(error.trim(), OUTPUT_LIMIT));
            }
        }
        if !self.variables.is_empty() {
            out.push_str("Variables:\n");
            for variable in &self.variables {
                let _ = writeln!(
                    out,
                    "- {}: {} = {}",
                    variable.name, variable.type_name, variable.preview
                );
            }
        }
        if !self.notes.is_empty() {
            out.push_str("Notes:\n");
            for note in &self.notes {
                let _ = writeln!(out, "- {note}");
            }
        }
        out.trim_end().to_string()
    }
}

/// Python execution bound to a run's [`Namespace`].
#[derive(Clone)]
pub struct CodeSandbox {
    executor: Arc<dyn SandboxExecutor>,
    timeout: Duration,
}

impl CodeSandbox {
    pub fn new(executor: Arc<dyn SandboxExecutor>, timeout: Duration) -> Self {
        Self { executor, timeout }
    }

    /// Run `code` against `namespace`.
    ///
    /// Variables that survive the snippet are committed to the namespace even
    /// when the snippet raised, mirroring notebook semantics. `Err` is
    /// reserved for infrastructure failures (the sandbox could not run at all).
    #[instrument(skip(self, namespace, code, extra_outputs), fields(run_id = %namespace.run_id()))]
    pub async fn run(
        &self,
        namespace: &mut Namespace,
        code: &str,
        extra_outputs: &[SandboxOutputSpec],
    ) -> Result<ExecutionReport> {
        let mut request = SandboxRequest::new(RUNNER_SCRIPT, RUNNER_SOURCE);
        request.timeout = self.timeout;
        request.files.push(SandboxFile::new(SNIPPET_FILE, code));
        if !namespace.state().is_empty() {
            request.files.push(SandboxFile::new(STATE_IN, namespace.state()));
        }
        request.expected_outputs.push(SandboxOutputSpec::binary(STATE_OUT));
        request.expected_outputs.push(SandboxOutputSpec::text(RESULT_FILE));
        request.expected_outputs.extend(extra_outputs.iter().cloned());

        let result = self
            .executor
            .execute(request)
            .await
            .context("sandbox execution failed to start")?;

        if let Some(state) = result.output(STATE_OUT) {
            namespace.commit(state.bytes.clone())?;
        }

        let artifacts: Vec<SandboxOutput> = result
            .outputs
            .iter()
            .filter(|output| extra_outputs.iter().any(|spec| spec == &output.spec))
            .cloned()
            .collect();

        let parsed = result
            .output(RESULT_FILE)
            .and_then(|output| serde_json::from_slice::<RunnerResult>(&output.bytes).ok());

        let report = match parsed {
            Some(runner) => ExecutionReport {
                success: runner.ok && !result.timed_out,
                stdout: runner.stdout,
                error: runner.error,
                variables: runner.variables,
                artifacts,
                notes: Vec::new(),
                timed_out: result.timed_out,
            },
            None => {
                let error = if result.timed_out {
                    format!("execution timed out after {}s", self.timeout.as_secs())
                } else if result.stderr.trim().is_empty() {
                    format!("sandbox exited with status {:?}", result.exit_code)
                } else {
                    result.stderr.trim().to_string()
                };
                warn!(timed_out = result.timed_out, "snippet produced no result file");
                ExecutionReport {
                    success: false,
                    stdout: result.stdout.clone(),
                    error: Some(error),
                    variables: Vec::new(),
                    artifacts: Vec::new(),
                    notes: Vec::new(),
                    timed_out: result.timed_out,
                }
            }
        };

        debug!(success = report.success, artifacts = report.artifacts.len(), "snippet finished");
        Ok(report)
    }
}
