use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowActionStatus {
    #[default]
    Pending,
    Started,
    Completed,
    Failed,
}

impl FlowActionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A single tracked step within a flow.
///
/// Every status transition is appended to the flow's change stream, so the
/// sequence of flow-action changes for one flow is a totally ordered replay
/// log of what the flow did.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowAction {
    pub id: String,
    pub workspace_id: String,
    pub flow_id: String,
    /// The subflow that was active when this step ran, if any.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subflow_id: String,
    pub action_type: String,
    #[serde(default)]
    pub action_params: serde_json::Value,
    pub status: FlowActionStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub result: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_message: String,
    #[serde(rename = "createdAt")]
    pub created: DateTime<Utc>,
    #[serde(rename = "updatedAt")]
    pub updated: DateTime<Utc>,
}

impl FlowAction {
    /// Id of the synthetic change-stream entry that marks end of stream.
    pub const END_OF_STREAM_ID: &'static str = "end";

    /// The end-of-stream sentinel for a flow's change stream.
    pub fn end_of_stream(workspace_id: impl Into<String>, flow_id: impl Into<String>) -> Self {
        Self {
            id: Self::END_OF_STREAM_ID.to_string(),
            workspace_id: workspace_id.into(),
            flow_id: flow_id.into(),
            ..Default::default()
        }
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.id == Self::END_OF_STREAM_ID
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_end_of_stream_sentinel() {
        let end = FlowAction::end_of_stream("ws_1", "flow_1");
        assert!(end.is_end_of_stream());
        assert_eq!(end.flow_id, "flow_1");

        let action = FlowAction {
            id: "fa_1".to_string(),
            ..Default::default()
        };
        assert!(!action.is_end_of_stream());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!FlowActionStatus::Pending.is_terminal());
        assert!(!FlowActionStatus::Started.is_terminal());
        assert!(FlowActionStatus::Completed.is_terminal());
        assert!(FlowActionStatus::Failed.is_terminal());
    }
}
