//! Append-only instance event log.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One immutable record in an instance's event log.
///
/// `id` is assigned by the store on append and gives the replay order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DagInstanceEvent {
    #[serde(default)]
    pub id: i64,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub instance_id: Uuid,
    /// Action name, for task-status events.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub operator: String,
    /// Step id, for task-status events.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub task_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
    /// Variable name, for variable and trace events.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub visibility: Visibility,
    /// Microseconds since the epoch.
    pub timestamp: i64,
}

impl DagInstanceEvent {
    pub fn task_status(
        instance_id: Uuid,
        operator: &str,
        task_id: &str,
        status: &str,
        data: Value,
        timestamp: i64,
    ) -> Self {
        Self {
            id: 0,
            event_type: EventType::TaskStatus,
            instance_id,
            operator: operator.to_string(),
            task_id: task_id.to_string(),
            status: status.to_string(),
            name: String::new(),
            data,
            visibility: Visibility::Public,
            timestamp,
        }
    }

    pub fn variable(instance_id: Uuid, name: &str, data: Value, timestamp: i64) -> Self {
        Self {
            id: 0,
            event_type: EventType::Variable,
            instance_id,
            operator: String::new(),
            task_id: String::new(),
            status: String::new(),
            name: name.to_string(),
            data,
            visibility: Visibility::Public,
            timestamp,
        }
    }

    pub fn trace(instance_id: Uuid, name: &str, data: Value, timestamp: i64) -> Self {
        Self {
            event_type: EventType::Trace,
            ..Self::variable(instance_id, name, data, timestamp)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    TaskStatus,
    Variable,
    Trace,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::TaskStatus => "task_status",
            EventType::Variable => "variable",
            EventType::Trace => "trace",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task_status" => Ok(EventType::TaskStatus),
            "variable" => Ok(EventType::Variable),
            "trace" => Ok(EventType::Trace),
            other => Err(format!("invalid event type: '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Public,
    Private,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Private => "private",
        }
    }
}

impl FromStr for Visibility {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" => Ok(Visibility::Public),
            "private" => Ok(Visibility::Private),
            other => Err(format!("invalid visibility: '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_type_wire_name() {
        let event = DagInstanceEvent::variable(Uuid::nil(), "__1", json!(2), 10);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "variable");
        assert!(value.get("task_id").is_none());
    }

    #[test]
    fn test_trace_constructor() {
        let event = DagInstanceEvent::trace(Uuid::nil(), "__1_trace", json!({"duration": 5}), 10);
        assert_eq!(event.event_type, EventType::Trace);
        assert_eq!(event.name, "__1_trace");
    }

    #[test]
    fn test_event_type_parse() {
        assert_eq!("task_status".parse::<EventType>().unwrap(), EventType::TaskStatus);
        assert!("status".parse::<EventType>().is_err());
    }
}
