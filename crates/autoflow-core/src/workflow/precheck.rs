//! PreCheck evaluation.
//!
//! A [`Check`] is met when every one of its conditions holds. Checks are
//! grouped by the key prefix before the first `_` (the id of the branch step
//! that produced them). A task is deactivated when some group has no met
//! check; the unmet check's action then decides between Skipped and Blocked.

use std::collections::BTreeMap;

use chrono::DateTime;
use serde_json::Value;

use autoflow_types::task::{
    check_group, ActiveAction, Check, ConditionOperator, ConditionSource, PreChecks, TaskCondition,
};

use super::expression::ExpressionResolver;

/// Environments condition operands are resolved against.
#[derive(Debug, Clone, Copy)]
pub struct ConditionEnv<'a> {
    pub share_data: &'a Value,
    pub vars: &'a Value,
}

impl<'a> ConditionEnv<'a> {
    fn source(&self, source: ConditionSource) -> &'a Value {
        match source {
            ConditionSource::ShareData => self.share_data,
            ConditionSource::Vars => self.vars,
        }
    }
}

/// Evaluate a task's prechecks. `None` means the task should run.
pub fn evaluate(
    pre_checks: &PreChecks,
    env: &ConditionEnv<'_>,
    resolver: &dyn ExpressionResolver,
) -> Option<ActiveAction> {
    // group -> (every check unmet so far, action of an unmet check)
    let mut groups: BTreeMap<&str, (bool, ActiveAction)> = BTreeMap::new();
    for (key, check) in pre_checks {
        let met = check_met(check, env, resolver);
        let entry = groups
            .entry(check_group(key))
            .or_insert((true, check.act));
        if met {
            entry.0 = false;
        } else {
            entry.1 = check.act;
        }
    }

    groups
        .into_iter()
        .find(|(_, (deactivated, _))| *deactivated)
        .map(|(_, (_, act))| act)
}

pub fn check_met(check: &Check, env: &ConditionEnv<'_>, resolver: &dyn ExpressionResolver) -> bool {
    check
        .conditions
        .iter()
        .all(|cond| condition_met(cond, env, resolver))
}

pub fn condition_met(
    cond: &TaskCondition,
    env: &ConditionEnv<'_>,
    resolver: &dyn ExpressionResolver,
) -> bool {
    let Ok(op) = cond.operator.parse::<ConditionOperator>() else {
        tracing::debug!(operator = %cond.operator, "unknown condition operator");
        return false;
    };

    let source = env.source(cond.source);
    let a = resolver
        .resolve(&cond.parameters.a, source)
        .unwrap_or_else(|_| cond.parameters.a.clone());
    let b = resolver
        .resolve(&cond.parameters.b, source)
        .unwrap_or_else(|_| cond.parameters.b.clone());

    compare(op, &a, &b)
}

/// Apply `op` to already-resolved operands.
pub fn compare(op: ConditionOperator, a: &Value, b: &Value) -> bool {
    use ConditionOperator::*;

    match op {
        StringEmpty => a.as_str().is_some_and(str::is_empty),
        StringNotEmpty => a.as_str().is_some_and(|s| !s.is_empty()),
        StringContains | StringNotContains | StringEq | StringNeq | StringStartWith
        | StringEndWith | StringMatch | ApprovalEq | ApprovalNeq => {
            let (Some(a), Some(b)) = (a.as_str(), b.as_str()) else {
                return false;
            };
            match op {
                StringContains => a.contains(b),
                StringNotContains => !a.contains(b),
                StringEq | ApprovalEq => a == b,
                StringNeq | ApprovalNeq => a != b,
                StringStartWith => a.starts_with(b),
                StringEndWith => a.ends_with(b),
                StringMatch => regex::Regex::new(b).is_ok_and(|re| re.is_match(a)),
                _ => false,
            }
        }
        NumberEq | NumberNeq | NumberGt | NumberGte | NumberLt | NumberLte => {
            let (Some(a), Some(b)) = (parse_number(a), parse_number(b)) else {
                return false;
            };
            match op {
                NumberEq => a == b,
                NumberNeq => a != b,
                NumberGt => a > b,
                NumberGte => a >= b,
                NumberLt => a < b,
                NumberLte => a <= b,
                _ => false,
            }
        }
        DateEq => parse_date(a) == parse_date(b),
        DateNeq => parse_date(a) != parse_date(b),
        DateEarlierThan => parse_date(a) < parse_date(b),
        DateLaterThan => parse_date(a) > parse_date(b),
    }
}

/// Numeric operand: a JSON number or a string holding one.
fn parse_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| !f.is_nan()),
        _ => None,
    }
}

/// Date operand in epoch seconds: RFC 3339 strings or numbers.
fn parse_date(v: &Value) -> i64 {
    match v {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        Value::String(s) => match DateTime::parse_from_rfc3339(s.trim()) {
            Ok(dt) => dt.timestamp(),
            Err(_) => s.trim().parse::<f64>().map(|f| f as i64).unwrap_or(0),
        },
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::expression::TemplateResolver;
    use autoflow_types::task::ConditionParameters;
    use serde_json::json;

    fn cond(op: &str, a: Value, b: Value) -> TaskCondition {
        TaskCondition {
            id: String::new(),
            source: ConditionSource::ShareData,
            parameters: ConditionParameters { a, b },
            operator: op.to_string(),
        }
    }

    fn met(op: &str, a: Value, b: Value) -> bool {
        let share = json!({"__0": {"x": "1", "n": 7, "at": "2024-05-01T00:00:00Z"}});
        let vars = json!({});
        let env = ConditionEnv { share_data: &share, vars: &vars };
        condition_met(&cond(op, a, b), &env, &TemplateResolver::new())
    }

    #[test]
    fn test_string_operators() {
        assert!(met("@internal/cmp/string-eq", json!("{{__0.x}}"), json!("1")));
        assert!(!met("@internal/cmp/string-eq", json!("{{__0.x}}"), json!("2")));
        assert!(met("@internal/cmp/string-contains", json!("report.docx"), json!(".doc")));
        assert!(met("@internal/cmp/string-start-with", json!("report"), json!("rep")));
        assert!(met("@internal/cmp/string-end-with", json!("report"), json!("ort")));
        assert!(met("@internal/cmp/string-empty", json!(""), Value::Null));
        assert!(met("@internal/cmp/string-not-empty", json!("x"), Value::Null));
        assert!(met("@internal/cmp/string-match", json!("abc123"), json!("^[a-z]+\\d+$")));
        assert!(!met("@internal/cmp/string-match", json!("abc"), json!("(")));
        assert!(met("@workflow/cmp/approval-eq", json!("pass"), json!("pass")));
    }

    #[test]
    fn test_string_operators_reject_non_strings() {
        assert!(!met("@internal/cmp/string-eq", json!(1), json!("1")));
        assert!(!met("@internal/cmp/string-neq", json!(1), json!("2")));
        assert!(!met("@internal/cmp/string-empty", Value::Null, Value::Null));
    }

    #[test]
    fn test_number_operators_coerce_strings() {
        assert!(met("@internal/cmp/number-eq", json!("{{__0.n}}"), json!("7")));
        assert!(met("@internal/cmp/number-gt", json!("{{__0.n}}"), json!(3)));
        assert!(met("@internal/cmp/number-lte", json!(3.5), json!("3.5")));
        assert!(!met("@internal/cmp/number-lt", json!(4), json!(4)));
    }

    #[test]
    fn test_number_operators_reject_unparseable_operands() {
        assert!(!met("@internal/cmp/number-eq", json!("abc"), json!("xyz")));
        assert!(!met("@internal/cmp/number-neq", json!("abc"), json!(1)));
        assert!(!met("@internal/cmp/number-lte", json!(""), json!(0)));
        assert!(!met("@internal/cmp/number-gt", json!(1), Value::Null));
        assert!(!met("@internal/cmp/number-eq", json!("{{__0.missing}}"), json!(0)));
    }

    #[test]
    fn test_date_operators() {
        assert!(met(
            "@internal/cmp/date-earlier-than",
            json!("{{__0.at}}"),
            json!("2024-06-01T00:00:00Z")
        ));
        assert!(met("@internal/cmp/date-eq", json!("1714521600"), json!("{{__0.at}}")));
        assert!(met("@internal/cmp/date-later-than", json!(1714521601), json!("{{__0.at}}")));
    }

    #[test]
    fn test_unknown_operator_is_unmet() {
        assert!(!met("@internal/cmp/nope", json!("a"), json!("a")));
    }

    #[test]
    fn test_group_deactivates_when_no_check_met() {
        let share = json!({"__0": {"x": "2"}});
        let vars = json!({});
        let env = ConditionEnv { share_data: &share, vars: &vars };
        let resolver = TemplateResolver::new();

        let mut pre = PreChecks::new();
        pre.insert(
            "1_0".into(),
            Check::skip(vec![cond("@internal/cmp/string-eq", json!("{{__0.x}}"), json!("1"))]),
        );
        pre.insert(
            "1_1".into(),
            Check::skip(vec![cond("@internal/cmp/string-eq", json!("{{__0.x}}"), json!("2"))]),
        );
        // One check of group "1" holds.
        assert_eq!(evaluate(&pre, &env, &resolver), None);

        pre.insert(
            "5_0".into(),
            Check {
                conditions: vec![cond("@internal/cmp/string-eq", json!("a"), json!("b"))],
                act: ActiveAction::Block,
            },
        );
        assert_eq!(evaluate(&pre, &env, &resolver), Some(ActiveAction::Block));
    }

    #[test]
    fn test_vars_source() {
        let share = json!({});
        let vars = json!({"region": "eu"});
        let env = ConditionEnv { share_data: &share, vars: &vars };
        let mut c = cond("@internal/cmp/string-eq", json!("{{region}}"), json!("eu"));
        c.source = ConditionSource::Vars;
        assert!(condition_met(&c, &env, &TemplateResolver::new()));
    }

    #[test]
    fn test_empty_checks_run() {
        let share = json!({});
        let env = ConditionEnv { share_data: &share, vars: &share };
        assert_eq!(evaluate(&PreChecks::new(), &env, &TemplateResolver::new()), None);
    }
}
