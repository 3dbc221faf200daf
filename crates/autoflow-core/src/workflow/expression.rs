//! Parameter template resolution.
//!
//! Parameters reference the instance environment with `{{ ... }}`
//! placeholders, e.g. `{{__3.docid}}` for a field of task 3's result or
//! `{{__7.value}}` for the current element of loop 7.
//!
//! A string that is exactly one placeholder resolves to the referenced value
//! with its JSON type intact. Placeholders embedded in longer strings are
//! interpolated as text. Plain dotted paths are looked up directly; anything
//! else is evaluated as a JEXL expression against the environment.
//! Unknown references are left as-is.

use serde_json::{json, Map, Value};

/// Errors that can occur while resolving parameters.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("expression '{expr}' failed: {message}")]
    Expression { expr: String, message: String },

    #[error("environment must be a JSON object")]
    InvalidEnvironment,
}

/// Substitutes `{{...}}` references in raw parameters.
pub trait ExpressionResolver: Send + Sync {
    fn resolve(&self, raw: &Value, env: &Value) -> Result<Value, ResolveError>;

    /// Resolve a parameter map. Non-object results are reported as the raw map.
    fn resolve_map(
        &self,
        raw: &Map<String, Value>,
        env: &Value,
    ) -> Result<Map<String, Value>, ResolveError> {
        match self.resolve(&Value::Object(raw.clone()), env)? {
            Value::Object(map) => Ok(map),
            _ => Ok(raw.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// TemplateResolver
// ---------------------------------------------------------------------------

/// JEXL-backed resolver with a handful of string transforms.
pub struct TemplateResolver {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl TemplateResolver {
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_uppercase()))
            })
            .with_transform("trim", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.trim()))
            })
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.chars().count(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            })
            .with_transform("json", |args: &[Value]| {
                let v = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(v.to_string()))
            });

        Self { evaluator }
    }

    fn resolve_value(&self, raw: &Value, env: &Value) -> Result<Value, ResolveError> {
        match raw {
            Value::String(s) => self.resolve_string(s, env),
            Value::Array(items) => items
                .iter()
                .map(|item| self.resolve_value(item, env))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.resolve_value(v, env)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    fn resolve_string(&self, s: &str, env: &Value) -> Result<Value, ResolveError> {
        if !s.contains("{{") {
            return Ok(Value::String(s.to_string()));
        }

        // Whole-string placeholder keeps its JSON type.
        let whole = s
            .trim()
            .strip_prefix("{{")
            .and_then(|rest| rest.strip_suffix("}}"))
            .filter(|inner| !inner.contains("{{") && !inner.contains("}}"));
        if let Some(inner) = whole {
            return Ok(self
                .evaluate(inner, env)?
                .unwrap_or_else(|| Value::String(s.to_string())));
        }

        let mut out = String::with_capacity(s.len());
        let mut rest = s;
        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find("}}") else {
                out.push_str(&rest[start..]);
                rest = "";
                break;
            };
            let expr = &after[..end];
            match self.evaluate(expr, env)? {
                Some(v) => out.push_str(&value_to_string(&v)),
                None => out.push_str(&rest[start..start + 2 + end + 2]),
            }
            rest = &after[end + 2..];
        }
        out.push_str(rest);
        Ok(Value::String(out))
    }

    /// `None` means the reference is unknown and should be left in place.
    fn evaluate(&self, expr: &str, env: &Value) -> Result<Option<Value>, ResolveError> {
        let expr = expr.trim();
        if is_path(expr) {
            return Ok(lookup_path(env, expr).cloned());
        }
        match self.evaluator.eval_in_context(expr, env) {
            Ok(Value::Null) => Ok(None),
            Ok(v) => Ok(Some(v)),
            Err(e) => Err(ResolveError::Expression {
                expr: expr.to_string(),
                message: e.to_string(),
            }),
        }
    }
}

impl Default for TemplateResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpressionResolver for TemplateResolver {
    fn resolve(&self, raw: &Value, env: &Value) -> Result<Value, ResolveError> {
        if !env.is_object() {
            return Err(ResolveError::InvalidEnvironment);
        }
        self.resolve_value(raw, env)
    }
}

/// Dotted path of identifier or index segments, e.g. `__3.items.0.name`.
fn is_path(expr: &str) -> bool {
    !expr.is_empty()
        && expr.split('.').all(|seg| {
            !seg.is_empty()
                && seg
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        })
}

/// Look up a dotted path in a JSON value.
pub fn lookup_path<'a>(env: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = env;
    for seg in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(seg)?,
            Value::Array(items) => items.get(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> Value {
        json!({
            "__0": {"x": 1, "name": "report.docx", "tags": ["a", "b"]},
            "__7": {"index": 2, "value": {"id": "doc-9"}},
            "count": 7,
            "title": "Report",
        })
    }

    #[test]
    fn test_whole_placeholder_keeps_type() {
        let r = TemplateResolver::new();
        assert_eq!(r.resolve(&json!("{{__0.x}}"), &env()).unwrap(), json!(1));
        assert_eq!(r.resolve(&json!("{{ __0.tags }}"), &env()).unwrap(), json!(["a", "b"]));
        assert_eq!(r.resolve(&json!("{{__0.tags.1}}"), &env()).unwrap(), json!("b"));
    }

    #[test]
    fn test_embedded_placeholders_interpolate() {
        let r = TemplateResolver::new();
        let out = r
            .resolve(&json!("file {{__0.name}} at {{__7.index}}"), &env())
            .unwrap();
        assert_eq!(out, json!("file report.docx at 2"));
    }

    #[test]
    fn test_unknown_reference_left_asis() {
        let r = TemplateResolver::new();
        assert_eq!(r.resolve(&json!("{{__9.y}}"), &env()).unwrap(), json!("{{__9.y}}"));
        assert_eq!(
            r.resolve(&json!("a {{__9.y}} b"), &env()).unwrap(),
            json!("a {{__9.y}} b")
        );
    }

    #[test]
    fn test_nested_structures_resolved() {
        let r = TemplateResolver::new();
        let raw = json!({"docid": "{{__7.value.id}}", "list": ["{{__0.x}}", 3], "flag": true});
        let out = r.resolve(&raw, &env()).unwrap();
        assert_eq!(out, json!({"docid": "doc-9", "list": [1, 3], "flag": true}));
    }

    #[test]
    fn test_jexl_expression() {
        let r = TemplateResolver::new();
        assert_eq!(
            r.resolve(&json!("{{(count > 5) ? 'high' : 'low'}}"), &env()).unwrap(),
            json!("high")
        );
        assert_eq!(r.resolve(&json!("{{title|upper}}"), &env()).unwrap(), json!("REPORT"));
    }

    #[test]
    fn test_non_object_environment_rejected() {
        let r = TemplateResolver::new();
        assert!(matches!(
            r.resolve(&json!("x"), &json!([])),
            Err(ResolveError::InvalidEnvironment)
        ));
    }

    #[test]
    fn test_unterminated_placeholder_kept() {
        let r = TemplateResolver::new();
        assert_eq!(r.resolve(&json!("a {{__0.x"), &env()).unwrap(), json!("a {{__0.x"));
    }
}
