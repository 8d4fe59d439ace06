use std::sync::Mutex;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;

use stepflow_core::traits::Sandbox;
use stepflow_core::{Result, SandboxOutcome, SandboxRequest, StepflowError};

/// Sandbox that interprets variant code as a line script:
///
/// - `sleep <ms>` waits
/// - `tool <name>` records a tool call
/// - `raise <message>` fails the variant
/// - `return <json>` ends the variant with that value
///
/// Code without a `return` yields `null`.
#[derive(Default)]
pub struct ScriptedSandbox {
    executed: Mutex<Vec<String>>,
}

impl ScriptedSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// `<step><variant>` for every execution, in order (e.g. `T1A`).
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl Sandbox for ScriptedSandbox {
    fn execute(&self, request: SandboxRequest) -> BoxFuture<'_, Result<SandboxOutcome>> {
        Box::pin(async move {
            let started = Instant::now();
            let key = request.variant.code_key(&request.step_id);
            if let Ok(mut executed) = self.executed.lock() {
                executed.push(format!("{}{}", request.step_id, request.variant));
            }

            let mut tool_calls = Vec::new();
            let mut result = serde_json::Value::Null;
            for line in request.code.lines().map(str::trim) {
                let (op, arg) = line.split_once(' ').unwrap_or((line, ""));
                match op {
                    "" => {}
                    "sleep" => {
                        let ms = arg.trim().parse().unwrap_or(0);
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                    }
                    "tool" => tool_calls.push(arg.trim().to_string()),
                    "raise" => return Err(StepflowError::sandbox(key, arg.trim())),
                    "return" => {
                        result = serde_json::from_str(arg.trim()).map_err(|e| {
                            StepflowError::sandbox(key.clone(), format!("bad return value: {}", e))
                        })?;
                        break;
                    }
                    other => {
                        return Err(StepflowError::sandbox(
                            key,
                            format!("unknown statement '{}'", other),
                        ))
                    }
                }
            }

            Ok(SandboxOutcome {
                result,
                created_files: vec![],
                tool_calls,
                elapsed_ms: started.elapsed().as_millis() as u64,
            })
        })
    }
}
