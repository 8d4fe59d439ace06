use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use stepflow_core::config::SandboxConfig;
use stepflow_core::error::{Result, StepflowError};
use stepflow_core::traits::{Sandbox, ToolInvoker};
use stepflow_core::types::{SandboxOutcome, SandboxRequest};

const TOOL_PREFIX: &str = "@@tool ";
const RESULT_PREFIX: &str = "@@result ";

/// Runs code variants in a child Python interpreter.
///
/// The variant body is parsed by the child and compiled as the body of a
/// function, so a top-level `return` works and the source text is never
/// rewritten. `inputs`, `globals_schema`, `output_dir` and `session_id` are
/// in scope, as is every global variable by name and one stub per
/// registered tool. Each variant writes into its own subdirectory of the
/// step's output directory (`<output_dir>/<code key>`), which is what
/// `created_files` is computed from. The child talks
/// to us over stdio: one JSON header line in, `@@tool` requests out (each
/// answered with a JSON line), and a final `@@result` line. A variant whose
/// body falls off the end returns its local variables.
pub struct ProcessSandbox {
    interpreter: String,
    timeout: Duration,
    max_output_bytes: usize,
    tools: Option<Arc<dyn ToolInvoker>>,
}

#[derive(Deserialize)]
struct ToolRequest {
    tool: String,
    #[serde(default)]
    args: Vec<Value>,
}

struct RunOutput {
    result: Value,
    tool_calls: Vec<String>,
}

impl ProcessSandbox {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            interpreter: config.interpreter.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            max_output_bytes: config.max_output_bytes,
            tools: None,
        }
    }

    /// Make `tools` callable from variant code.
    pub fn with_tools(mut self, tools: Arc<dyn ToolInvoker>) -> Self {
        self.tools = Some(tools);
        self
    }

    async fn run(&self, request: SandboxRequest) -> Result<SandboxOutcome> {
        let started = Instant::now();
        let key = request.variant.code_key(&request.step_id);
        let output_dir = request.output_dir.join(&key);

        tokio::fs::create_dir_all(&output_dir)
            .await
            .map_err(|e| StepflowError::sandbox(&key, format!("output dir: {}", e)))?;
        let before = list_files(&output_dir).await;

        let tool_names = self
            .tools
            .as_ref()
            .map(|t| t.tool_names())
            .unwrap_or_default();
        let script = render_script(&request.code, &tool_names);
        let script_path = std::env::temp_dir().join(format!(
            "stepflow-{}-{}.py",
            key,
            uuid::Uuid::new_v4()
        ));
        tokio::fs::write(&script_path, script)
            .await
            .map_err(|e| StepflowError::sandbox(&key, format!("script: {}", e)))?;

        debug!(variant = %key, interpreter = %self.interpreter, "Starting sandbox process");
        let outcome = tokio::time::timeout(self.timeout, self.drive(&script_path, &request, &output_dir, &key)).await;
        tokio::fs::remove_file(&script_path).await.ok();

        let output = match outcome {
            Ok(result) => result?,
            Err(_) => {
                warn!(variant = %key, timeout_secs = self.timeout.as_secs(), "Sandbox timed out");
                return Err(StepflowError::sandbox(
                    key,
                    format!("timed out after {}s", self.timeout.as_secs()),
                ));
            }
        };

        let created_files = new_files(&output_dir, &before).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            variant = %key,
            tool_calls = output.tool_calls.len(),
            created_files = created_files.len(),
            elapsed_ms,
            "Sandbox run finished"
        );
        Ok(SandboxOutcome {
            result: output.result,
            created_files,
            tool_calls: output.tool_calls,
            elapsed_ms,
        })
    }

    async fn drive(
        &self,
        script: &Path,
        request: &SandboxRequest,
        output_dir: &Path,
        key: &str,
    ) -> Result<RunOutput> {
        let mut child = Command::new(&self.interpreter)
            .arg(script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                StepflowError::sandbox(key, format!("failed to start {}: {}", self.interpreter, e))
            })?;

        let broken_pipe = |what: &str| StepflowError::sandbox(key, format!("no {} pipe", what));
        let mut stdin = child.stdin.take().ok_or_else(|| broken_pipe("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| broken_pipe("stdout"))?;
        let mut stderr = child.stderr.take().ok_or_else(|| broken_pipe("stderr"))?;

        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            stderr.read_to_string(&mut buf).await.ok();
            buf
        });

        let header = json!({
            "session_id": request.session_id.0,
            "inputs": request.inputs,
            "globals": request.globals,
            "output_dir": output_dir,
        });
        send_line(&mut stdin, &header, key).await?;

        let mut lines = BufReader::new(stdout).lines();
        let mut result = None;
        let mut tool_calls = Vec::new();
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| StepflowError::sandbox(key, e.to_string()))?
        {
            if let Some(raw) = line.strip_prefix(TOOL_PREFIX) {
                let call: ToolRequest = serde_json::from_str(raw)
                    .map_err(|e| StepflowError::sandbox(key, format!("bad tool request: {}", e)))?;
                tool_calls.push(call.tool.clone());
                let reply = match self.call_tool(call).await {
                    Ok(value) => json!({ "result": value }),
                    Err(e) => json!({ "error": e.to_string() }),
                };
                send_line(&mut stdin, &reply, key).await?;
            } else if let Some(raw) = line.strip_prefix(RESULT_PREFIX) {
                result = Some(serde_json::from_str(raw).map_err(|e| {
                    StepflowError::sandbox(key, format!("unreadable result: {}", e))
                })?);
            } else {
                debug!(variant = %key, line = %line, "Sandbox output");
            }
        }
        drop(stdin);

        let status = child
            .wait()
            .await
            .map_err(|e| StepflowError::sandbox(key, e.to_string()))?;
        let stderr = stderr_task.await.unwrap_or_default();
        if !status.success() {
            return Err(StepflowError::sandbox(
                key,
                error_summary(&stderr, self.max_output_bytes),
            ));
        }

        let result = result.ok_or_else(|| {
            StepflowError::sandbox(key, "code finished without reporting a result")
        })?;
        Ok(RunOutput { result, tool_calls })
    }

    async fn call_tool(&self, call: ToolRequest) -> Result<Value> {
        match &self.tools {
            Some(tools) => tools.invoke(&call.tool, call.args).await,
            None => Err(StepflowError::ToolNotFound(call.tool)),
        }
    }
}

impl Sandbox for ProcessSandbox {
    fn execute(&self, request: SandboxRequest) -> BoxFuture<'_, Result<SandboxOutcome>> {
        Box::pin(self.run(request))
    }
}

async fn send_line(stdin: &mut tokio::process::ChildStdin, value: &Value, key: &str) -> Result<()> {
    let line = format!("{}\n", value);
    stdin
        .write_all(line.as_bytes())
        .await
        .map_err(|e| StepflowError::sandbox(key, format!("stdin: {}", e)))?;
    stdin
        .flush()
        .await
        .map_err(|e| StepflowError::sandbox(key, format!("stdin: {}", e)))
}

/// The exception line of a traceback, plus as much context as fits.
fn error_summary(stderr: &str, max_bytes: usize) -> String {
    let last = stderr
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("process exited with an error")
        .trim();
    let mut summary = last.to_string();
    if summary.len() > max_bytes {
        let mut cut = max_bytes;
        while !summary.is_char_boundary(cut) {
            cut -= 1;
        }
        summary.truncate(cut);
        summary.push_str("... (truncated)");
    }
    summary
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn render_script(code: &str, tool_names: &[String]) -> String {
    let mut script = String::from(PRELUDE);
    for name in tool_names.iter().filter(|n| is_identifier(n)) {
        script.push_str(&format!(
            "def {name}(*args):\n    return _call_tool({name:?}, *args)\n\n"
        ));
    }
    // A JSON string is also a valid Python string literal.
    let source = Value::String(code.to_string());
    script.push_str(&format!("_variant = _compile_variant({source})\n"));
    script.push_str(EPILOGUE);
    script
}

const PRELUDE: &str = r#"import ast
import json
import os
import sys

_header = json.loads(sys.stdin.readline())
session_id = _header["session_id"]
inputs = _header["inputs"]
globals_schema = _header["globals"]
output_dir = _header["output_dir"]
os.makedirs(output_dir, exist_ok=True)
for _name, _value in globals_schema.items():
    if _name.isidentifier():
        globals()[_name] = _value


def _call_tool(name, *args):
    sys.stdout.write("@@tool " + json.dumps({"tool": name, "args": list(args)}, default=str) + "\n")
    sys.stdout.flush()
    _reply = json.loads(sys.stdin.readline())
    if "error" in _reply:
        raise RuntimeError(_reply["error"])
    return _reply["result"]


def _compile_variant(source):
    tree = ast.parse(source, "<variant>", "exec")
    func = ast.parse("def _variant():\n    pass\n").body[0]
    tail = ast.parse(
        "_locals = dict(locals())\n"
        "return {k: v for k, v in _locals.items() if not k.startswith('_')}\n"
    ).body
    func.body = tree.body + tail
    module = ast.Module(body=[func], type_ignores=[])
    ast.fix_missing_locations(module)
    exec(compile(module, "<variant>", "exec"), globals())
    return globals()["_variant"]


"#;

const EPILOGUE: &str = r#"_result = _variant()
sys.stdout.write("@@result " + json.dumps(_result, default=str) + "\n")
sys.stdout.flush()
"#;

/// Regular files in `dir` with their modification times.
async fn list_files(dir: &Path) -> BTreeMap<PathBuf, Option<SystemTime>> {
    let mut files = BTreeMap::new();
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return files;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if let Ok(meta) = entry.metadata().await {
            if meta.is_file() {
                files.insert(entry.path(), meta.modified().ok());
            }
        }
    }
    files
}

/// Files that appeared or changed since `before` was taken.
async fn new_files(dir: &Path, before: &BTreeMap<PathBuf, Option<SystemTime>>) -> Vec<PathBuf> {
    list_files(dir)
        .await
        .into_iter()
        .filter(|(path, modified)| before.get(path) != Some(modified))
        .map(|(path, _)| path)
        .collect()
}
