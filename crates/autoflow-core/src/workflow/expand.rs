//! Run-time expansion of loops and branches.
//!
//! Loop bodies have no static per-iteration identity, so the executor and the
//! materializer derive one with the same scheme:
//!
//! | what | id |
//! |---|---|
//! | loop header, iteration 0 | `<loopID>` |
//! | loop header, iteration k | `<loopID>_i<k>` |
//! | body step | `<loopID>_i<k>_s<stepID>` |
//! | branch body step (VM instances) | `<loopID>_i<k>_s<stepID>` |
//! | branch body step (other instances) | `<branchHeaderID>_<branchIndex>_<stepID>` |

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{json, Map, Value};

pub use autoflow_types::instance::normalize_event_task_id;
use autoflow_types::instance::{task_key, InstanceMode};
use autoflow_types::task::PreChecks;

use super::expression::ExpressionResolver;

static STEP_REF: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\{\{__([A-Za-z0-9-]+)\.([^}]+)\}\}").ok());

/// Id of the loop header for iteration `index`.
pub fn iteration_task_id(loop_id: &str, index: usize) -> String {
    if index == 0 {
        loop_id.to_string()
    } else {
        format!("{loop_id}_i{index}")
    }
}

/// Id of a loop body step in iteration `index`.
pub fn body_task_id(loop_id: &str, index: usize, step_id: &str) -> String {
    format!("{loop_id}_i{index}_s{step_id}")
}

/// Id of a step inside branch `branch_index` of the branch task `header_id`.
pub fn branch_task_id(
    mode: InstanceMode,
    header_id: &str,
    branch_index: usize,
    iteration: usize,
    step_id: &str,
) -> String {
    match mode {
        InstanceMode::Vm => {
            let loop_id = header_id
                .find("_i")
                .map(|pos| &header_id[..pos])
                .unwrap_or(header_id);
            body_task_id(loop_id, iteration, step_id)
        }
        InstanceMode::Schedule => format!("{header_id}_{branch_index}_{step_id}"),
    }
}

// ---------------------------------------------------------------------------
// LoopScope
// ---------------------------------------------------------------------------

/// State of one loop iteration while its body is expanded.
#[derive(Debug, Clone, Default)]
pub struct LoopScope {
    pub loop_task_id: String,
    pub index: usize,
    /// Items of an array loop. Empty for limit loops.
    pub items: Vec<Value>,
    /// Body step id to the iteration-qualified id it last ran under.
    pub step_map: HashMap<String, String>,
}

impl LoopScope {
    pub fn new(loop_task_id: impl Into<String>, items: Vec<Value>) -> Self {
        Self {
            loop_task_id: loop_task_id.into(),
            items,
            ..Default::default()
        }
    }

    /// Current element, or an empty string past the end of the items.
    pub fn value(&self) -> Value {
        self.items
            .get(self.index)
            .cloned()
            .unwrap_or_else(|| Value::String(String::new()))
    }

    /// What `{{__<loopID>.value}}` and `{{__<loopID>.index}}` resolve against.
    pub fn binding(&self) -> Value {
        json!({"value": self.value(), "index": self.index})
    }
}

/// How many times a loop runs and over which items.
///
/// `mode = "limit"` coerces `limit` from an integer, a float or a numeric
/// string. `mode = "array"` uses the array's elements.
pub fn loop_iterations(params: &Map<String, Value>) -> (usize, Vec<Value>) {
    match params.get("mode").and_then(Value::as_str) {
        Some("limit") => {
            let n = match params.get("limit") {
                Some(Value::Number(n)) => n
                    .as_u64()
                    .or_else(|| n.as_f64().filter(|f| *f > 0.0).map(|f| f as u64))
                    .unwrap_or(0),
                Some(Value::String(s)) => s.trim().parse::<u64>().unwrap_or(0),
                _ => 0,
            };
            (n as usize, Vec::new())
        }
        Some("array") => match params.get("array") {
            Some(Value::Array(items)) => (items.len(), items.clone()),
            _ => {
                tracing::warn!("loop array parameter is not an array");
                (0, Vec::new())
            }
        },
        _ => (0, Vec::new()),
    }
}

/// Point `{{__<stepID>.field}}` references at the iteration-qualified id the
/// step last ran under.
pub fn rewrite_step_refs(
    params: &Map<String, Value>,
    step_map: &HashMap<String, String>,
) -> Map<String, Value> {
    if step_map.is_empty() {
        return params.clone();
    }
    let mut out = Map::with_capacity(params.len());
    for (k, v) in params {
        out.insert(k.clone(), rewrite_value(v, step_map));
    }
    out
}

fn rewrite_value(value: &Value, step_map: &HashMap<String, String>) -> Value {
    match value {
        Value::String(s) if s.contains("{{__") => {
            let Some(re) = STEP_REF.as_ref() else {
                return value.clone();
            };
            let rewritten = re.replace_all(s, |caps: &regex::Captures<'_>| {
                match step_map.get(&caps[1]) {
                    Some(qualified) => format!("{{{{__{}.{}}}}}", qualified, &caps[2]),
                    None => caps[0].to_string(),
                }
            });
            Value::String(rewritten.into_owned())
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| rewrite_value(v, step_map)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), rewrite_value(v, step_map)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Resolve `params` against `env`, with the loop binding and step references
/// of `scope` applied. Falls back to the raw parameters when resolution fails.
pub fn render_params(
    params: &Map<String, Value>,
    scope: Option<&LoopScope>,
    env: &Value,
    resolver: &dyn ExpressionResolver,
) -> Map<String, Value> {
    let (raw, env) = match scope {
        Some(scope) => {
            let mut env = env.clone();
            if let Value::Object(map) = &mut env {
                map.insert(task_key(&scope.loop_task_id), scope.binding());
            }
            (rewrite_step_refs(params, &scope.step_map), env)
        }
        None => (params.clone(), env.clone()),
    };
    match resolver.resolve_map(&raw, &env) {
        Ok(resolved) => resolved,
        Err(e) => {
            tracing::warn!(error = %e, "parameter rendering failed, keeping raw parameters");
            raw
        }
    }
}

/// Resolve the condition operands of `checks` with the loop binding and step
/// references of `scope` applied.
pub fn render_checks(
    mut checks: PreChecks,
    scope: &LoopScope,
    env: &Value,
    resolver: &dyn ExpressionResolver,
) -> PreChecks {
    for check in checks.values_mut() {
        for cond in &mut check.conditions {
            let mut operands = Map::new();
            operands.insert("a".into(), cond.parameters.a.take());
            operands.insert("b".into(), cond.parameters.b.take());
            let mut rendered = render_params(&operands, Some(scope), env, resolver);
            cond.parameters.a = rendered.remove("a").unwrap_or(Value::Null);
            cond.parameters.b = rendered.remove("b").unwrap_or(Value::Null);
        }
    }
    checks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::expression::TemplateResolver;

    #[test]
    fn test_iteration_ids() {
        assert_eq!(iteration_task_id("7", 0), "7");
        assert_eq!(iteration_task_id("7", 2), "7_i2");
        assert_eq!(body_task_id("7", 2, "9"), "7_i2_s9");
        assert_eq!(branch_task_id(InstanceMode::Vm, "7_i2_s8", 1, 2, "10"), "7_i2_s10");
        assert_eq!(branch_task_id(InstanceMode::Schedule, "7_i2_s8", 1, 2, "10"), "7_i2_s8_1_10");
        assert_eq!(branch_task_id(InstanceMode::Schedule, "3", 0, 0, "4"), "3_0_4");
    }

    #[test]
    fn test_loop_iterations_coerce_limit() {
        let p = |v: Value| -> Map<String, Value> { serde_json::from_value(v).unwrap() };
        assert_eq!(loop_iterations(&p(json!({"mode": "limit", "limit": 3}))).0, 3);
        assert_eq!(loop_iterations(&p(json!({"mode": "limit", "limit": 2.0}))).0, 2);
        assert_eq!(loop_iterations(&p(json!({"mode": "limit", "limit": "4"}))).0, 4);
        assert_eq!(loop_iterations(&p(json!({"mode": "limit", "limit": "x"}))).0, 0);
        let (n, items) = loop_iterations(&p(json!({"mode": "array", "array": ["a", "b"]})));
        assert_eq!((n, items), (2, vec![json!("a"), json!("b")]));
        assert_eq!(loop_iterations(&p(json!({"mode": "array", "array": "{{__1.list}}"}))).0, 0);
    }

    #[test]
    fn test_rewrite_step_refs() {
        let mut step_map = HashMap::new();
        step_map.insert("8".to_string(), "7_i1_s8".to_string());
        let params: Map<String, Value> = serde_json::from_value(json!({
            "a": "{{__8.name}}",
            "b": ["x {{__8.size}} y", "{{__3.other}}"],
            "c": 1
        }))
        .unwrap();
        let out = rewrite_step_refs(&params, &step_map);
        assert_eq!(out["a"], json!("{{__7_i1_s8.name}}"));
        assert_eq!(out["b"], json!(["x {{__7_i1_s8.size}} y", "{{__3.other}}"]));
        assert_eq!(out["c"], json!(1));
    }

    #[test]
    fn test_render_params_with_loop_binding() {
        let mut scope = LoopScope::new("7", vec![json!({"id": "d1"}), json!({"id": "d2"})]);
        scope.index = 1;
        scope.step_map.insert("8".into(), "7_i1_s8".into());
        let env = json!({"__7_i1_s8": {"name": "report"}});
        let params: Map<String, Value> = serde_json::from_value(json!({
            "docid": "{{__7.value.id}}",
            "at": "{{__7.index}}",
            "name": "{{__8.name}}"
        }))
        .unwrap();
        let out = render_params(&params, Some(&scope), &env, &TemplateResolver::new());
        assert_eq!(out["docid"], json!("d2"));
        assert_eq!(out["at"], json!(1));
        assert_eq!(out["name"], json!("report"));
    }
}
