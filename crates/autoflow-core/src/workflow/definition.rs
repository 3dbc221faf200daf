//! Workflow documents.
//!
//! Authored workflows arrive as JSON or YAML documents: either a bare list
//! of steps or an object with a name, optional metadata and `steps`.
//! YAML is a superset of JSON, so one parser handles both.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use autoflow_types::dag::DagType;
use autoflow_types::step::Step;

use crate::error::ValidationError;

/// An authored workflow before compilation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDocument {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, rename = "type")]
    pub dag_type: DagType,
    /// Composable Dags this one invokes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_ids: Vec<Uuid>,
    pub steps: Vec<Step>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDocument {
    Steps(Vec<Step>),
    Document(WorkflowDocument),
}

/// Parse a JSON or YAML workflow document.
pub fn parse_document(text: &str) -> Result<WorkflowDocument, ValidationError> {
    let raw: RawDocument =
        serde_yaml_ng::from_str(text).map_err(|e| ValidationError::Malformed(e.to_string()))?;
    Ok(match raw {
        RawDocument::Steps(steps) => WorkflowDocument {
            name: String::new(),
            description: None,
            dag_type: DagType::Default,
            sub_ids: Vec::new(),
            steps,
        },
        RawDocument::Document(doc) => doc,
    })
}

/// Serialize a document to YAML.
pub fn to_yaml(doc: &WorkflowDocument) -> Result<String, ValidationError> {
    serde_yaml_ng::to_string(doc).map_err(|e| ValidationError::Malformed(e.to_string()))
}
