use std::collections::BTreeMap;
use std::path::PathBuf;

use serde_json::Value;
use tracing::{debug, warn};

use stepflow_core::traits::Sandbox;
use stepflow_core::{Result, SandboxRequest, StepflowError, Variant};

use crate::validator;

/// The variant that was accepted and what trying the others cost.
#[derive(Debug, Clone)]
pub struct VariantSelection {
    pub variant: Variant,
    pub outputs: BTreeMap<String, Value>,
    /// `CODE_<step><variant>: reason` for every rejected variant, in order.
    pub errors: Vec<String>,
    /// Files created by every variant that ran, accepted or not.
    pub created_files: Vec<PathBuf>,
    pub tool_calls: Vec<String>,
}

/// Run `variants` in order and accept the first that returns a mapping
/// whose keys follow `<name>_<step><variant>` and cover `declared`.
///
/// `base` supplies everything but the variant and its code. When every
/// variant is rejected the step fails with `RetryExhausted` carrying the
/// last variant's error.
pub async fn select_variant(
    sandbox: &dyn Sandbox,
    base: &SandboxRequest,
    variants: Vec<(Variant, String)>,
    declared: &[String],
) -> Result<VariantSelection> {
    let step_id = base.step_id.as_str();
    let attempts = variants.len() as u32;
    let mut errors = Vec::new();
    let mut created_files = Vec::new();
    let mut tool_calls = Vec::new();

    for (variant, code) in variants {
        let key = variant.code_key(step_id);
        debug!(step_id, variant = %key, "Executing code variant");

        let request = SandboxRequest {
            variant,
            code,
            ..base.clone()
        };
        let outcome = match sandbox.execute(request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(step_id, variant = %key, error = %e, "Code variant raised");
                errors.push(format!("{}: {}", key, e));
                continue;
            }
        };
        created_files.extend(outcome.created_files.iter().cloned());
        tool_calls.extend(outcome.tool_calls.iter().cloned());

        match accept(step_id, variant, declared, outcome.result) {
            Ok(outputs) => {
                debug!(
                    step_id,
                    variant = %key,
                    outputs = outputs.len(),
                    elapsed_ms = outcome.elapsed_ms,
                    "Code variant accepted"
                );
                return Ok(VariantSelection {
                    variant,
                    outputs,
                    errors,
                    created_files,
                    tool_calls,
                });
            }
            Err(reason) => {
                warn!(step_id, variant = %key, reason = %reason, "Code variant rejected");
                errors.push(format!("{}: {}", key, reason));
            }
        }
    }

    Err(StepflowError::RetryExhausted {
        step: step_id.to_string(),
        attempts,
        last_error: errors
            .last()
            .cloned()
            .unwrap_or_else(|| "no code variants to run".into()),
    })
}

fn accept(
    step_id: &str,
    variant: Variant,
    declared: &[String],
    result: Value,
) -> std::result::Result<BTreeMap<String, Value>, String> {
    let outputs: BTreeMap<String, Value> = match result {
        Value::Object(map) => map.into_iter().collect(),
        Value::Null => return Err("code did not return a mapping".into()),
        other => return Err(format!("code returned {} instead of a mapping", other)),
    };
    validator::check_outputs(step_id, Some(variant), declared, &outputs)
        .map_err(|e| e.to_string())?;
    Ok(outputs)
}
