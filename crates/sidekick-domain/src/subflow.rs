use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubflowStatus {
    /// More or less means "in progress".
    #[default]
    Started,
    Complete,
    Failed,
}

impl SubflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

/// A named, possibly nested section inside a flow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subflow {
    pub workspace_id: String,
    /// Unique identifier, prefixed with `sf_`.
    pub id: String,
    pub name: String,
    /// Kind of subflow, e.g. "step" or "edit_code".
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub subflow_type: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub status: SubflowStatus,
    /// Parent subflow id when nested.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parent_subflow_id: String,
    pub flow_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub result: String,
}
