//! Shared rendering helpers for CLI output.

use anyhow::{bail, Context, Result};
use console::{style, StyledObject};
use serde::Serialize;
use serde_json::{Map, Value};

use autoflow_types::instance::{DagInstanceStatus, TaskInstanceStatus};

/// Parse a `--vars` / `--result` argument. It must be a JSON object.
pub fn parse_json_object(raw: &str, flag: &str) -> Result<Map<String, Value>> {
    let value: Value =
        serde_json::from_str(raw).with_context(|| format!("--{flag} is not valid JSON"))?;
    match value {
        Value::Object(map) => Ok(map),
        other => bail!("--{flag} must be a JSON object, got {other}"),
    }
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn instance_status(status: DagInstanceStatus) -> StyledObject<&'static str> {
    let s = style(status.as_str());
    match status {
        DagInstanceStatus::Success => s.green(),
        DagInstanceStatus::Failed => s.red(),
        DagInstanceStatus::Blocked => s.yellow(),
        DagInstanceStatus::Canceled => s.dim(),
        _ => s.cyan(),
    }
}

pub fn task_status(status: TaskInstanceStatus) -> StyledObject<&'static str> {
    let s = style(status.as_str());
    match status {
        TaskInstanceStatus::Success => s.green(),
        TaskInstanceStatus::Failed => s.red(),
        TaskInstanceStatus::Blocked | TaskInstanceStatus::Retrying => s.yellow(),
        TaskInstanceStatus::Skipped | TaskInstanceStatus::Canceled => s.dim(),
        _ => s.cyan(),
    }
}

/// Single-line preview of a JSON value for table cells.
pub fn preview(value: &Value, max: usize) -> String {
    let text = value.to_string();
    if text.chars().count() <= max {
        return text;
    }
    let cut: String = text.chars().take(max.saturating_sub(1)).collect();
    format!("{cut}…")
}
