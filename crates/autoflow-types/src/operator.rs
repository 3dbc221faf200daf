//! Well-known operator identifiers and trigger classification.
//!
//! Operators are plain strings on the wire. The engine only interprets the
//! handful listed here; every other operator is opaque and dispatched through
//! the action registry.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Control flow
// ---------------------------------------------------------------------------

/// Branch-control step: each branch carries condition groups and a body.
pub const BRANCH: &str = "@control/flow/branches";

/// Loop step: a nested body repeated over a limit or an array.
pub const LOOP: &str = "@control/flow/loop";

/// Internal return: nothing after it is reachable.
pub const INTERNAL_RETURN: &str = "@internal/return";

/// Internal assignment of `value` into `target`.
pub const INTERNAL_ASSIGN: &str = "@internal/assign";

// ---------------------------------------------------------------------------
// Actions with engine-level special cases
// ---------------------------------------------------------------------------

/// Human approval. Blocks until resumed.
pub const WORKFLOW_APPROVAL: &str = "@workflow/approval";

/// Knowledge-graph transfer. Uses its own timeout policy.
pub const INTELLIINFO_TRANSFER: &str = "@intelliinfo/transfer";

/// Create a file under a destination folder.
pub const FILE_CREATE: &str = "@anyshare/file/create";

// ---------------------------------------------------------------------------
// Triggers
// ---------------------------------------------------------------------------

pub const TRIGGER_MANUAL: &str = "@trigger/manual";
pub const TRIGGER_FORM: &str = "@trigger/form";
pub const TRIGGER_WEBHOOK: &str = "@trigger/webhook";
pub const TRIGGER_CRON: &str = "@trigger/cron";
pub const TRIGGER_CRON_WEEK: &str = "@trigger/cron/week";
pub const TRIGGER_CRON_MONTH: &str = "@trigger/cron/month";
pub const TRIGGER_CRON_CUSTOM: &str = "@trigger/cron/custom";
pub const TRIGGER_SELECTED_FILE: &str = "@trigger/selected-file";
pub const TRIGGER_SELECTED_FOLDER: &str = "@trigger/selected-folder";
pub const TRIGGER_SECURITY_POLICY: &str = "@trigger/security-policy";
pub const TRIGGER_EVENT: &str = "@trigger/event";

/// Prefix shared by document-store event triggers.
pub const EVENT_TRIGGER_PREFIX: &str = "@anyshare-trigger/";

/// Fires when a file is uploaded under one of the watched folders.
pub const TRIGGER_FILE_UPLOAD: &str = "@anyshare-trigger/upload-file";

/// Prefix of every trigger operator that is not a document-store event.
pub const TRIGGER_PREFIX: &str = "@trigger/";

/// Whether `operator` names a trigger step.
pub fn is_trigger(operator: &str) -> bool {
    operator.starts_with(TRIGGER_PREFIX) || operator.starts_with(EVENT_TRIGGER_PREFIX)
}

// ---------------------------------------------------------------------------
// TriggerKind
// ---------------------------------------------------------------------------

/// How a Dag is started, derived from its first step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerKind {
    #[default]
    Manually,
    Cron,
    Event,
    Webhook,
    Form,
    Document,
    SecurityPolicy,
}

impl TriggerKind {
    /// Classify a trigger operator. Unknown operators start manually.
    pub fn from_operator(operator: &str) -> Self {
        match operator {
            TRIGGER_MANUAL => TriggerKind::Manually,
            TRIGGER_CRON | TRIGGER_CRON_WEEK | TRIGGER_CRON_MONTH | TRIGGER_CRON_CUSTOM => {
                TriggerKind::Cron
            }
            TRIGGER_WEBHOOK => TriggerKind::Webhook,
            TRIGGER_FORM => TriggerKind::Form,
            TRIGGER_SELECTED_FILE | TRIGGER_SELECTED_FOLDER => TriggerKind::Document,
            TRIGGER_SECURITY_POLICY => TriggerKind::SecurityPolicy,
            TRIGGER_EVENT => TriggerKind::Event,
            other if other.starts_with(EVENT_TRIGGER_PREFIX) => TriggerKind::Event,
            _ => TriggerKind::Manually,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Manually => "manually",
            TriggerKind::Cron => "cron",
            TriggerKind::Event => "event",
            TriggerKind::Webhook => "webhook",
            TriggerKind::Form => "form",
            TriggerKind::Document => "document",
            TriggerKind::SecurityPolicy => "security-policy",
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manually" => Ok(TriggerKind::Manually),
            "cron" => Ok(TriggerKind::Cron),
            "event" => Ok(TriggerKind::Event),
            "webhook" => Ok(TriggerKind::Webhook),
            "form" => Ok(TriggerKind::Form),
            "document" => Ok(TriggerKind::Document),
            "security-policy" => Ok(TriggerKind::SecurityPolicy),
            other => Err(format!("invalid trigger kind: '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_kind_from_operator() {
        assert_eq!(TriggerKind::from_operator(TRIGGER_MANUAL), TriggerKind::Manually);
        assert_eq!(TriggerKind::from_operator(TRIGGER_CRON_WEEK), TriggerKind::Cron);
        assert_eq!(TriggerKind::from_operator(TRIGGER_FILE_UPLOAD), TriggerKind::Event);
        assert_eq!(TriggerKind::from_operator(TRIGGER_SELECTED_FOLDER), TriggerKind::Document);
        assert_eq!(TriggerKind::from_operator("@something/else"), TriggerKind::Manually);
    }

    #[test]
    fn test_is_trigger() {
        assert!(is_trigger(TRIGGER_FORM));
        assert!(is_trigger(TRIGGER_FILE_UPLOAD));
        assert!(!is_trigger(FILE_CREATE));
        assert!(!is_trigger(BRANCH));
    }

    #[test]
    fn test_trigger_kind_string_roundtrip() {
        for kind in [
            TriggerKind::Manually,
            TriggerKind::Cron,
            TriggerKind::Event,
            TriggerKind::Webhook,
            TriggerKind::Form,
            TriggerKind::Document,
            TriggerKind::SecurityPolicy,
        ] {
            assert_eq!(kind.to_string().parse::<TriggerKind>().unwrap(), kind);
        }
    }
}
