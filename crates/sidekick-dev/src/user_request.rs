//! User-request protocol
//!
//! Flows ask for human input by signaling the manager with a
//! [`RequestForUser`](sidekick_domain::RequestForUser); the manager relays
//! the eventual [`UserResponse`](sidekick_domain::UserResponse) back onto
//! the asking flow's own `userResponse` signal channel. A flow keeps at
//! most one request outstanding and parks until it is answered.

use serde_json::json;

use sidekick_domain::{RequestForUser, RequestKind, UserResponse};
use sidekick_durable::WorkflowSignal;

/// Signal channel names shared between flows and the manager.
pub mod signal_names {
    /// Manager: request cancellation of a flow.
    pub const CANCEL: &str = "cancel";
    /// Manager: a flow is asking for user input.
    pub const REQUEST_FOR_USER: &str = "requestForUser";
    /// Manager and flows: a user answered a request.
    pub const USER_RESPONSE: &str = "userResponse";
    /// Manager: a flow closed with a terminal status.
    pub const WORKFLOW_CLOSED: &str = "workflowClosed";
    /// Flows: pause at the next checkpoint.
    pub const PAUSE: &str = "pause";
    /// Flows: generic user actions (resume, input).
    pub const USER_ACTION: &str = "userAction";
}

pub fn request_for_user_signal(request: &RequestForUser) -> WorkflowSignal {
    WorkflowSignal::new(
        signal_names::REQUEST_FOR_USER,
        serde_json::to_value(request).unwrap_or(json!({})),
    )
}

pub fn user_response_signal(response: &UserResponse) -> WorkflowSignal {
    WorkflowSignal::new(
        signal_names::USER_RESPONSE,
        serde_json::to_value(response).unwrap_or(json!({})),
    )
}

pub fn workflow_closed_signal(flow_id: &str, reason: &str) -> WorkflowSignal {
    WorkflowSignal::new(
        signal_names::WORKFLOW_CLOSED,
        json!({ "flowId": flow_id, "reason": reason }),
    )
}

/// Free-form guidance request, as raised every third failed coding attempt.
pub fn guidance_request(
    origin_workflow_id: &str,
    content: &str,
    request_params: serde_json::Value,
) -> RequestForUser {
    RequestForUser {
        origin_workflow_id: origin_workflow_id.to_string(),
        request_kind: RequestKind::FreeForm,
        content: content.to_string(),
        request_params,
    }
}

pub fn merge_approval_request(
    origin_workflow_id: &str,
    content: &str,
    request_params: serde_json::Value,
) -> RequestForUser {
    RequestForUser {
        origin_workflow_id: origin_workflow_id.to_string(),
        request_kind: RequestKind::MergeApproval,
        content: content.to_string(),
        request_params,
    }
}

pub fn continue_request(
    origin_workflow_id: &str,
    content: &str,
    continue_tag: &str,
) -> RequestForUser {
    RequestForUser {
        origin_workflow_id: origin_workflow_id.to_string(),
        request_kind: RequestKind::Continue,
        content: content.to_string(),
        request_params: json!({ "continueTag": continue_tag }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_payload_round_trip() {
        let request = merge_approval_request(
            "flow_1",
            "Please approve before we merge",
            json!({ "targetBranch": "main" }),
        );
        let signal = request_for_user_signal(&request);
        assert_eq!(signal.signal_type, signal_names::REQUEST_FOR_USER);

        let parsed: RequestForUser = serde_json::from_value(signal.payload).unwrap();
        assert_eq!(parsed, request);
        assert_eq!(parsed.request_kind, RequestKind::MergeApproval);
    }

    #[test]
    fn test_workflow_closed_signal() {
        let signal = workflow_closed_signal("flow_1", "completed");
        assert_eq!(signal.payload["flowId"], "flow_1");
        assert_eq!(signal.payload["reason"], "completed");
    }
}
