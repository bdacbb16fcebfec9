//! Messages exchanged between dev flows and the agent manager

use serde::{Deserialize, Serialize};

/// What a flow is asking of the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// Free-form guidance while the flow is stuck.
    FreeForm,
    /// Approval to merge, with an optional target-branch override.
    MergeApproval,
    /// A "continue when done" acknowledgement.
    Continue,
}

/// A flow's request for human input, relayed through the manager. The
/// manager keeps at most one pending request per origin workflow, since a
/// flow parks until its request is fulfilled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestForUser {
    pub origin_workflow_id: String,
    pub request_kind: RequestKind,
    pub content: String,
    #[serde(default)]
    pub request_params: serde_json::Value,
}

/// The user's answer, addressed to the workflow that asked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserResponse {
    pub target_workflow_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default)]
    pub approved: Option<bool>,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Emitted by a flow right before it returns; the manager reconciles the
/// Flow row and parent task from this alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowClosure {
    pub flow_id: String,
    /// Terminal status: "completed", "failed" or "cancelled".
    pub reason: String,
}
