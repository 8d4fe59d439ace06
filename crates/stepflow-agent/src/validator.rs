use std::collections::BTreeMap;

use regex::Regex;
use serde_json::{Map, Value};

use stepflow_core::{AgentRole, Result, StepflowError, Variant};

use crate::graph::GraphFragment;

/// A step reply whose shape has been checked.
#[derive(Debug, Clone)]
pub struct ParsedReply {
    pub fragment: Option<GraphFragment>,
    pub next_step_id: Option<String>,
    pub payload: ReplyPayload,
    /// Files to materialize directly (`name -> content`).
    pub files: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub enum ReplyPayload {
    /// Ready-made outputs keyed by full variable name.
    Outputs(BTreeMap<String, Value>),
    /// Code variants in trial order.
    Code(Vec<(Variant, String)>),
}

/// Check a step reply for `role` and split it into its parts.
///
/// Missing keys are reported together as a `Validation` error; a fragment
/// that doesn't deserialize is a `Schema` error.
pub fn parse_step_reply(role: AgentRole, step_id: &str, body: &Value) -> Result<ParsedReply> {
    let body = normalize(body)?;
    let obj = expect_object(&body)?;

    let payload_key = if role.produces_code() {
        "code_variants"
    } else {
        "outputs"
    };
    let missing: Vec<&str> = ["plan_graph", "next_step_id", payload_key]
        .into_iter()
        .filter(|k| !obj.contains_key(*k))
        .collect();
    if !missing.is_empty() {
        return Err(StepflowError::Validation(format!(
            "{} reply for step {} is missing required key(s): {}",
            role,
            step_id,
            missing.join(", ")
        )));
    }

    let fragment = parse_fragment(&obj["plan_graph"])?;
    let next_step_id = match &obj["next_step_id"] {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        other => {
            return Err(StepflowError::Validation(format!(
                "next_step_id must be a string, got {}",
                other
            )))
        }
    };

    let payload = if role.produces_code() {
        ReplyPayload::Code(parse_code_variants(step_id, &obj["code_variants"])?)
    } else {
        let outputs = match &obj["outputs"] {
            Value::Object(map) => map.clone().into_iter().collect(),
            other => {
                return Err(StepflowError::Validation(format!(
                    "outputs must be an object, got {}",
                    type_name(other)
                )))
            }
        };
        ReplyPayload::Outputs(outputs)
    };

    let files = match obj.get("files") {
        None | Some(Value::Null) => BTreeMap::new(),
        Some(Value::Object(map)) => {
            let mut files = BTreeMap::new();
            for (name, content) in map {
                let text = match content {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                files.insert(name.clone(), text);
            }
            files
        }
        Some(other) => {
            return Err(StepflowError::Validation(format!(
                "files must be an object, got {}",
                type_name(other)
            )))
        }
    };

    Ok(ParsedReply {
        fragment,
        next_step_id,
        payload,
        files,
    })
}

/// Extract the initial fragment from a planner reply.
pub fn parse_plan_reply(body: &Value) -> Result<GraphFragment> {
    let body = normalize(body)?;
    let obj = expect_object(&body)?;
    let raw = obj.get("plan_graph").ok_or_else(|| {
        StepflowError::Validation("planner reply is missing required key(s): plan_graph".into())
    })?;
    let mut fragment = parse_fragment(raw)?.unwrap_or_default();
    if fragment.final_step.is_none() {
        if let Some(Value::String(id)) = obj.get("final_step") {
            fragment.final_step = Some(id.clone());
        }
    }
    if fragment.nodes.is_empty() {
        return Err(StepflowError::Validation("planner returned an empty plan".into()));
    }
    Ok(fragment)
}

/// Check that every key follows `<name>_<step><variant>` and that every
/// declared output name is present.
pub fn check_outputs(
    step_id: &str,
    variant: Option<Variant>,
    declared: &[String],
    outputs: &BTreeMap<String, Value>,
) -> Result<()> {
    let pattern = output_pattern(step_id, variant)?;
    let mut issues = Vec::new();
    let mut produced = Vec::new();

    for key in outputs.keys() {
        match pattern.captures(key).and_then(|c| c.get(1)) {
            Some(base) => produced.push(base.as_str()),
            None => issues.push(format!(
                "'{}' does not follow the <name>_{}{} convention",
                key,
                step_id,
                variant.map(|v| v.to_string()).unwrap_or_default()
            )),
        }
    }
    for name in declared {
        if !produced.contains(&name.as_str()) {
            issues.push(format!("declared output '{}' was not produced", name));
        }
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(StepflowError::Validation(issues.join("; ")))
    }
}

fn output_pattern(step_id: &str, variant: Option<Variant>) -> Result<Regex> {
    let suffix = match variant {
        Some(v) => format!("{}{}", regex::escape(step_id), v.letter()),
        None => regex::escape(step_id),
    };
    Regex::new(&format!(r"^([A-Za-z_][A-Za-z0-9_]*)_{}$", suffix))
        .map_err(|e| StepflowError::Validation(format!("bad step id '{}': {}", step_id, e)))
}

fn parse_code_variants(step_id: &str, raw: &Value) -> Result<Vec<(Variant, String)>> {
    let map = match raw {
        Value::Object(map) => map,
        other => {
            return Err(StepflowError::Validation(format!(
                "code_variants must be an object, got {}",
                type_name(other)
            )))
        }
    };

    let prefix = format!("CODE_{}", step_id);
    let mut variants = Vec::new();
    for (key, code) in map {
        let variant = key
            .strip_prefix(&prefix)
            .and_then(|rest| {
                let mut chars = rest.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => Variant::from_letter(c),
                    _ => None,
                }
            })
            .ok_or_else(|| {
                StepflowError::Validation(format!(
                    "code variant key '{}' must be {}A, {}B or {}C",
                    key, prefix, prefix, prefix
                ))
            })?;
        let code = code.as_str().ok_or_else(|| {
            StepflowError::Validation(format!("code variant '{}' is not a string", key))
        })?;
        variants.push((variant, code.to_string()));
    }
    if variants.is_empty() {
        return Err(StepflowError::Validation(format!(
            "no code variants for step {}",
            step_id
        )));
    }
    variants.sort_by_key(|(v, _)| *v);
    Ok(variants)
}

fn parse_fragment(raw: &Value) -> Result<Option<GraphFragment>> {
    match raw {
        Value::Null => Ok(None),
        Value::Object(map) if map.is_empty() => Ok(None),
        other => serde_json::from_value(other.clone())
            .map(Some)
            .map_err(|e| StepflowError::Schema(format!("malformed plan_graph: {}", e))),
    }
}

/// Backends sometimes hand back the JSON as text, possibly fenced.
fn normalize(body: &Value) -> Result<Value> {
    match body {
        Value::String(text) => serde_json::from_str(strip_code_fences(text)).map_err(|e| {
            StepflowError::Validation(format!("reply is not valid JSON: {}", e))
        }),
        other => Ok(other.clone()),
    }
}

fn expect_object(body: &Value) -> Result<&Map<String, Value>> {
    body.as_object().ok_or_else(|| {
        StepflowError::Validation(format!(
            "expected a JSON object reply, got {}",
            type_name(body)
        ))
    })
}

fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(start) = trimmed.find("```") else {
        return trimmed;
    };
    let after = &trimmed[start + 3..];
    // Skip an optional language tag on the fence line
    let after = match after.find('\n') {
        Some(nl) if !after[..nl].contains('{') => &after[nl + 1..],
        _ => after,
    };
    match after.find("```") {
        Some(end) => after[..end].trim(),
        None => after.trim(),
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
