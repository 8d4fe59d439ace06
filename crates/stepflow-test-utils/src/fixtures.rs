use serde_json::{json, Map, Value};

/// Reply body for a direct-output role.
pub fn outputs_reply(outputs: Value) -> Value {
    json!({
        "plan_graph": null,
        "next_step_id": null,
        "outputs": outputs,
    })
}

/// Reply body for a code-producing role; `variants` pairs a variant letter
/// with its code, e.g. `("A", "return {}")`.
pub fn code_reply(step_id: &str, variants: &[(&str, &str)]) -> Value {
    let mut code = Map::new();
    for (letter, body) in variants {
        code.insert(format!("CODE_{}{}", step_id, letter), json!(body));
    }
    json!({
        "plan_graph": null,
        "next_step_id": null,
        "code_variants": code,
    })
}

/// Planner reply carrying the initial graph.
pub fn plan_reply(graph: Value) -> Value {
    json!({ "plan_graph": graph })
}

/// Attach a plan fragment to any step reply.
pub fn with_fragment(mut reply: Value, fragment: Value) -> Value {
    reply["plan_graph"] = fragment;
    reply
}
