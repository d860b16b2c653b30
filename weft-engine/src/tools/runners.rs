//! Tool runners
//!
//! One `ToolRunner` implementation per runner name, selected from a
//! `ToolRunnerRegistry`. The gateway never hard-codes how a tool runs: it
//! resolves a binding, asks the registry for the binding's runner and hands
//! it a `ToolRequest`.

use crate::tools::bindings::ToolBinding;
use std::collections::HashMap;
use std::fmt;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use thiserror::Error;
use weft::ir::{Span, ToolDecl};
use weft::runtime::error_reporting::build_guidance_message;
use weft::{RuntimeError, Value};

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("tool returned malformed output: {0}")]
    Protocol(String),
    #[error("{0}")]
    Failed(String),
}

impl From<RunnerError> for RuntimeError {
    fn from(err: RunnerError) -> Self {
        RuntimeError::domain(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct ToolRequest<'a> {
    pub tool: &'a ToolDecl,
    pub binding: Option<&'a ToolBinding>,
    pub payload: &'a Value,
    pub project_root: Option<&'a PathBuf>,
}

pub trait ToolRunner: fmt::Debug + Send + Sync {
    fn name(&self) -> &str;
    fn execute(&self, request: &ToolRequest<'_>) -> Result<Value, RunnerError>;
}

#[derive(Debug, Clone, Default)]
pub struct ToolRunnerRegistry {
    runners: HashMap<String, Arc<dyn ToolRunner>>,
}

impl ToolRunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the out-of-process python (`local`) and node runners.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ProcessToolRunner::python()));
        registry.register(Arc::new(ProcessToolRunner::node()));
        registry
    }

    pub fn register(&mut self, runner: Arc<dyn ToolRunner>) {
        log::debug!("Registering tool runner '{}'", runner.name());
        self.runners.insert(runner.name().to_string(), runner);
    }

    pub fn get(&self, name: &str, span: Span) -> Result<Arc<dyn ToolRunner>, RuntimeError> {
        self.runners.get(name).cloned().ok_or_else(|| {
            let mut known: Vec<&str> = self.runners.keys().map(String::as_str).collect();
            known.sort_unstable();
            RuntimeError::domain(build_guidance_message(
                &format!("Unknown tool runner \"{}\".", name),
                "Bindings must name a registered runner.",
                &format!("Use one of: {}.", known.join(", ")),
                "runner = \"local\"",
            ))
            .at(span)
        })
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.runners.keys().cloned().collect();
        names.sort();
        names
    }
}

const PYTHON_SHIM: &str = r#"
import importlib, json, sys
module_name, func_name = sys.argv[1].split(":", 1)
sys.path.insert(0, sys.argv[2])
try:
    fn = getattr(importlib.import_module(module_name), func_name)
    result = fn(json.load(sys.stdin))
    json.dump({"ok": True, "result": result}, sys.stdout)
except Exception as exc:
    json.dump({"ok": False, "error": f"{type(exc).__name__}: {exc}"}, sys.stdout)
"#;

const NODE_SHIM: &str = r#"
const path = require("path");
const [entry, root] = process.argv.slice(1);
const [mod, fn] = entry.split(":");
let input = "";
process.stdin.on("data", (c) => (input += c));
process.stdin.on("end", async () => {
  try {
    const m = require(path.join(root, ...mod.split(".")));
    const result = await m[fn](JSON.parse(input || "{}"));
    process.stdout.write(JSON.stringify({ ok: true, result }));
  } catch (e) {
    process.stdout.write(JSON.stringify({ ok: false, error: String(e) }));
  }
});
"#;

/// Runs a bound entry point in a child process. The payload is written to
/// stdin as JSON; the shim answers `{"ok": bool, "result"|"error": ...}`.
#[derive(Debug, Clone)]
pub struct ProcessToolRunner {
    name: String,
    program: String,
    shim_flag: &'static str,
    shim: &'static str,
}

impl ProcessToolRunner {
    pub fn python() -> Self {
        Self {
            name: "local".to_string(),
            program: "python3".to_string(),
            shim_flag: "-c",
            shim: PYTHON_SHIM,
        }
    }

    pub fn node() -> Self {
        Self {
            name: "node".to_string(),
            program: "node".to_string(),
            shim_flag: "-e",
            shim: NODE_SHIM,
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn parse_reply(stdout: &[u8]) -> Result<Value, RunnerError> {
        let reply: serde_json::Value = serde_json::from_slice(stdout)
            .map_err(|e| RunnerError::Protocol(e.to_string()))?;
        match reply.get("ok").and_then(|v| v.as_bool()) {
            Some(true) => Ok(Value::from_json(reply.get("result").unwrap_or(&serde_json::Value::Null))),
            Some(false) => Err(RunnerError::Failed(
                reply
                    .get("error")
                    .and_then(|v| v.as_str())
                    .unwrap_or("tool failed")
                    .to_string(),
            )),
            None => Err(RunnerError::Protocol("missing \"ok\" field".to_string())),
        }
    }
}

impl ToolRunner for ProcessToolRunner {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, request: &ToolRequest<'_>) -> Result<Value, RunnerError> {
        let binding = request.binding.ok_or_else(|| {
            RunnerError::Failed(format!("Tool \"{}\" has no binding", request.tool.name))
        })?;
        let root = request
            .project_root
            .cloned()
            .unwrap_or_else(|| PathBuf::from("."));
        log::debug!(
            "Running tool '{}' via {} ({})",
            request.tool.name,
            self.program,
            binding.entry
        );
        let body = serde_json::to_vec(&request.payload.to_json()).map_err(|e| RunnerError::Protocol(e.to_string()))?;
        let mut child = Command::new(&self.program)
            .arg(self.shim_flag)
            .arg(self.shim)
            .arg(&binding.entry)
            .arg(&root)
            .current_dir(&root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| RunnerError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        // A child that exits early closes its stdin; its status and stderr
        // explain the failure better than the broken pipe does.
        let write_result = match child.stdin.take() {
            Some(mut stdin) => stdin.write_all(&body),
            None => Ok(()),
        };
        let output = child.wait_with_output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RunnerError::Failed(format!(
                "Tool \"{}\" exited with {}: {}",
                request.tool.name,
                output.status,
                stderr.trim()
            )));
        }
        match write_result {
            Err(err) if err.kind() != io::ErrorKind::BrokenPipe => return Err(err.into()),
            _ => {}
        }
        Self::parse_reply(&output.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft::ir::ToolKind;

    #[test]
    fn test_default_registry_names() {
        let registry = ToolRunnerRegistry::with_defaults();
        assert_eq!(registry.names(), vec!["local", "node"]);
        assert!(registry.get("container", Span::unknown()).is_err());
    }

    #[test]
    fn test_parse_reply() {
        let ok = ProcessToolRunner::parse_reply(br#"{"ok": true, "result": {"n": 3}}"#).unwrap();
        assert_eq!(ok.get_path(&["n"]), Some(&Value::Integer(3)));

        let failed = ProcessToolRunner::parse_reply(br#"{"ok": false, "error": "ValueError: bad"}"#);
        assert!(matches!(failed, Err(RunnerError::Failed(msg)) if msg == "ValueError: bad"));

        assert!(matches!(
            ProcessToolRunner::parse_reply(b"not json"),
            Err(RunnerError::Protocol(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_early_exit_reports_status_not_broken_pipe() {
        let tool = ToolDecl::new("bulk", ToolKind::Python);
        let binding = ToolBinding::new(ToolKind::Python, "tools.bulk:run");
        let payload = Value::map([("blob", Value::text("x".repeat(4 * 1024 * 1024)))]);
        let request = ToolRequest {
            tool: &tool,
            binding: Some(&binding),
            payload: &payload,
            project_root: None,
        };
        let runner = ProcessToolRunner::python().with_program("false");
        let result = runner.execute(&request);
        assert!(matches!(result, Err(RunnerError::Failed(msg)) if msg.contains("Tool \"bulk\" exited with")));
    }
}
