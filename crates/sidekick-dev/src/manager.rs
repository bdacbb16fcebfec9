//! Dev Agent Manager workflow
//!
//! One indefinitely running workflow per workspace (execution id
//! `dev-agent-manager-<workspaceId>`). It dispatches work requests as child
//! flow workflows, relays user requests and responses between flows and the
//! outside world, and reconciles Flow/Task records when flows close. After
//! enough processed events it continues-as-new, carrying the pending
//! user-request table forward in its input.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::json;
use svix_ksuid::{Ksuid, KsuidLike};
use tracing::warn;

use sidekick_domain::{
    Flow, FlowStatus, FlowType, RequestForUser, UserResponse, Workspace, WorkflowClosure,
};
use sidekick_durable::{
    ActivityError, ParentClosePolicy, Workflow, WorkflowAction, WorkflowContext, WorkflowError,
    WorkflowSignal, WorkflowUpdate,
};

use crate::activities::manager::{
    CompleteFlowParentTaskActivity, CreatePendingUserRequestActivity, FindWorkspaceActivity,
    GetFlowActivity, GetFlowsForTaskActivity, PersistFlowActivity,
    UpdateTaskForUserRequestActivity,
};
use crate::basic_dev::{BasicDevOptions, BasicDevWorkflow, BasicDevWorkflowInput};
use crate::planned_dev::{PlannedDevWorkflow, PlannedDevWorkflowInput};
use crate::user_request::{signal_names, user_response_signal};
use sidekick_durable::Activity as _;

pub const UPDATE_NAME_WORK_REQUEST: &str = "workRequest";

/// Events processed before the manager replaces its history.
pub const CONTINUE_AS_NEW_THRESHOLD: u64 = 1000;

pub fn manager_workflow_id(workspace_id: &str) -> String {
    format!("dev-agent-manager-{workspace_id}")
}

/// Manager activities run on their own queue, separate from dev work.
pub fn manager_task_queue(workspace_id: &str) -> String {
    format!("default-{workspace_id}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevAgentManagerInput {
    pub workspace_id: String,
    /// Pending user requests carried across continue-as-new boundaries.
    #[serde(default)]
    pub pending_requests: HashMap<String, RequestForUser>,
}

impl DevAgentManagerInput {
    pub fn new(workspace_id: impl Into<String>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            pending_requests: HashMap::new(),
        }
    }
}

/// A request to start a flow, delivered via the `workRequest` update.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkRequest {
    /// `task_...` id, or empty for ad-hoc flows.
    #[serde(default)]
    pub parent_id: String,
    /// Raw requirements text.
    pub input: String,
    pub flow_type: String,
    #[serde(default)]
    pub flow_options: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelSignal {
    pub workflow_id: String,
}

/// An in-flight manager operation, keyed by op id. Each signal/update spawns
/// one; the op advances as its activities complete and is dropped at its
/// last step.
#[derive(Debug, Clone)]
enum Op {
    WorkRequest {
        update_id: String,
        request: WorkRequest,
        workspace: Option<Workspace>,
        flow: Option<Flow>,
    },
    CancelFlow {
        flow: Option<Flow>,
    },
    UserRequest {
        request: RequestForUser,
    },
    Closure {
        closure: WorkflowClosure,
        flow: Option<Flow>,
    },
}

pub struct DevAgentManagerWorkflow {
    input: DevAgentManagerInput,
    /// In-memory user-request table for flows without a parent task.
    requests: HashMap<String, RequestForUser>,
    ops: HashMap<String, Op>,
    op_seq: u64,
    events_handled: u64,
}

impl DevAgentManagerWorkflow {
    fn next_op_id(&mut self) -> String {
        self.op_seq += 1;
        format!("op-{}", self.op_seq)
    }

    fn schedule(
        op_id: &str,
        step: &str,
        activity_type: &str,
        input: serde_json::Value,
    ) -> WorkflowAction {
        WorkflowAction::schedule_activity(format!("{op_id}:{step}"), activity_type, input)
    }

    /// After ≥ CONTINUE_AS_NEW_THRESHOLD processed events and with nothing
    /// in flight, restart with a fresh history. Pending user requests ride
    /// along in the input.
    fn maybe_continue_as_new(&self, mut actions: Vec<WorkflowAction>) -> Vec<WorkflowAction> {
        if self.events_handled >= CONTINUE_AS_NEW_THRESHOLD && self.ops.is_empty() {
            let input = DevAgentManagerInput {
                workspace_id: self.input.workspace_id.clone(),
                pending_requests: self.requests.clone(),
            };
            actions.push(WorkflowAction::ContinueAsNew {
                input: serde_json::to_value(input).unwrap_or(json!({})),
            });
        }
        actions
    }

    fn handle_work_request(
        &mut self,
        update: &WorkflowUpdate,
    ) -> Vec<WorkflowAction> {
        let request: WorkRequest = match serde_json::from_value(update.payload.clone()) {
            Ok(request) => request,
            Err(e) => {
                return vec![WorkflowAction::fail_update(
                    update.update_id.clone(),
                    WorkflowError::new(format!("invalid work request: {e}"))
                        .with_code("INVALID_WORK_REQUEST"),
                )];
            }
        };

        if let Err(message) = request.flow_type.parse::<FlowType>() {
            return vec![WorkflowAction::fail_update(
                update.update_id.clone(),
                WorkflowError::new(message).with_code("INVALID_FLOW_TYPE"),
            )];
        }

        let op_id = self.next_op_id();
        let action = Self::schedule(
            &op_id,
            "find-workspace",
            FindWorkspaceActivity::TYPE,
            json!({ "workspace_id": self.input.workspace_id }),
        );
        self.ops.insert(
            op_id,
            Op::WorkRequest {
                update_id: update.update_id.clone(),
                request,
                workspace: None,
                flow: None,
            },
        );
        vec![action]
    }

    fn dispatch_flow(
        &mut self,
        ctx: &mut WorkflowContext,
        op_id: &str,
        workspace: Workspace,
    ) -> Vec<WorkflowAction> {
        let Some(Op::WorkRequest { request, flow, .. }) = self.ops.get_mut(op_id) else {
            return vec![];
        };

        let flow_type: FlowType = request
            .flow_type
            .parse()
            .expect("flow type validated at update time");

        let ksuid = ctx.side_effect(|| json!(Ksuid::new(None, None).to_string()));
        let flow_id = format!("flow_{}", ksuid.as_str().unwrap_or_default());

        let new_flow = Flow {
            id: flow_id.clone(),
            workspace_id: workspace.id.clone(),
            flow_type,
            parent_id: request.parent_id.clone(),
            status: FlowStatus::InProgress,
        };
        *flow = Some(new_flow);

        let options: BasicDevOptions =
            serde_json::from_value(request.flow_options.clone()).unwrap_or_default();

        let (workflow_type, input) = match flow_type {
            FlowType::BasicDev => (
                <BasicDevWorkflow as Workflow>::TYPE,
                serde_json::to_value(BasicDevWorkflowInput {
                    workspace_id: workspace.id.clone(),
                    repo_dir: workspace.local_repo_dir.clone(),
                    requirements: request.input.clone(),
                    options,
                })
                .unwrap_or(json!({})),
            ),
            FlowType::PlannedDev => (
                <PlannedDevWorkflow as Workflow>::TYPE,
                serde_json::to_value(PlannedDevWorkflowInput {
                    workspace_id: workspace.id.clone(),
                    repo_dir: workspace.local_repo_dir.clone(),
                    requirements: request.input.clone(),
                    options,
                })
                .unwrap_or(json!({})),
            ),
        };

        vec![WorkflowAction::StartChildWorkflow {
            workflow_id: flow_id,
            workflow_type: workflow_type.to_string(),
            input,
            parent_close_policy: ParentClosePolicy::Abandon,
            // Dev activities run on the workspace queue, not the manager's.
            task_queue: Some(workspace.id),
        }]
    }

    fn handle_cancel(&mut self, signal: &WorkflowSignal) -> Vec<WorkflowAction> {
        let cancel: CancelSignal = match serde_json::from_value(signal.payload.clone()) {
            Ok(cancel) => cancel,
            Err(e) => {
                warn!(error = %e, "ignoring malformed cancel signal");
                return vec![];
            }
        };

        // Ask the flow to stop, and independently mark the Flow (and its
        // task) cancelled so the cancel is reflected even if the target
        // cannot emit its closure signal.
        let op_id = self.next_op_id();
        let actions = vec![
            WorkflowAction::RequestCancelExternalWorkflow {
                workflow_id: cancel.workflow_id.clone(),
            },
            Self::schedule(
                &op_id,
                "get-flow-cancel",
                GetFlowActivity::TYPE,
                json!({
                    "workspace_id": self.input.workspace_id,
                    "flow_id": cancel.workflow_id,
                }),
            ),
        ];
        self.ops.insert(op_id, Op::CancelFlow { flow: None });
        actions
    }

    fn handle_request_for_user(&mut self, signal: &WorkflowSignal) -> Vec<WorkflowAction> {
        let request: RequestForUser = match serde_json::from_value(signal.payload.clone()) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "ignoring malformed requestForUser signal");
                return vec![];
            }
        };

        let op_id = self.next_op_id();
        let action = Self::schedule(
            &op_id,
            "get-flow-request",
            GetFlowActivity::TYPE,
            json!({
                "workspace_id": self.input.workspace_id,
                "flow_id": request.origin_workflow_id,
            }),
        );
        self.ops.insert(op_id, Op::UserRequest { request });
        vec![action]
    }

    fn handle_user_response(&mut self, signal: &WorkflowSignal) -> Vec<WorkflowAction> {
        let response: UserResponse = match serde_json::from_value(signal.payload.clone()) {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "ignoring malformed userResponse signal");
                return vec![];
            }
        };

        // The manager only relays; the target workflow interprets the
        // response against its own pending request kind. One request per
        // workflow, so answering clears the table entry.
        self.requests.remove(&response.target_workflow_id);
        vec![WorkflowAction::signal_external(
            response.target_workflow_id.clone(),
            user_response_signal(&response),
        )]
    }

    fn handle_workflow_closed(&mut self, signal: &WorkflowSignal) -> Vec<WorkflowAction> {
        let closure: WorkflowClosure = match serde_json::from_value(signal.payload.clone()) {
            Ok(closure) => closure,
            Err(e) => {
                warn!(error = %e, "ignoring malformed workflowClosed signal");
                return vec![];
            }
        };

        let op_id = self.next_op_id();
        let action = Self::schedule(
            &op_id,
            "get-flow-closed",
            GetFlowActivity::TYPE,
            json!({
                "workspace_id": self.input.workspace_id,
                "flow_id": closure.flow_id,
            }),
        );
        self.ops.insert(
            op_id,
            Op::Closure {
                closure,
                flow: None,
            },
        );
        vec![action]
    }
}

impl Workflow for DevAgentManagerWorkflow {
    const TYPE: &'static str = "dev_agent_manager";
    type Input = DevAgentManagerInput;
    type Output = serde_json::Value;

    fn new(input: Self::Input) -> Self {
        Self {
            requests: input.pending_requests.clone(),
            input,
            ops: HashMap::new(),
            op_seq: 0,
            events_handled: 0,
        }
    }

    fn on_start(&mut self, _ctx: &mut WorkflowContext) -> Vec<WorkflowAction> {
        vec![]
    }

    fn on_update(
        &mut self,
        _ctx: &mut WorkflowContext,
        update: &WorkflowUpdate,
    ) -> Vec<WorkflowAction> {
        self.events_handled += 1;
        match update.name.as_str() {
            UPDATE_NAME_WORK_REQUEST => self.handle_work_request(update),
            other => vec![WorkflowAction::fail_update(
                update.update_id.clone(),
                WorkflowError::new(format!("unsupported update: {other}"))
                    .with_code("UNSUPPORTED_UPDATE"),
            )],
        }
    }

    fn on_signal(
        &mut self,
        _ctx: &mut WorkflowContext,
        signal: &WorkflowSignal,
    ) -> Vec<WorkflowAction> {
        self.events_handled += 1;
        let actions = match signal.signal_type.as_str() {
            signal_names::CANCEL => self.handle_cancel(signal),
            signal_names::REQUEST_FOR_USER => self.handle_request_for_user(signal),
            signal_names::USER_RESPONSE => self.handle_user_response(signal),
            signal_names::WORKFLOW_CLOSED => self.handle_workflow_closed(signal),
            other => {
                warn!(signal_type = other, "ignoring unknown signal");
                vec![]
            }
        };
        self.maybe_continue_as_new(actions)
    }

    fn on_child_workflow_started(
        &mut self,
        _ctx: &mut WorkflowContext,
        child_workflow_id: &str,
    ) -> Vec<WorkflowAction> {
        // The work request only waits for the child to have started, not
        // completed; once it has, the Flow record is persisted and returned.
        let entry = self.ops.iter().find_map(|(op_id, op)| match op {
            Op::WorkRequest {
                flow: Some(flow), ..
            } if flow.id == child_workflow_id => Some((op_id.clone(), flow.clone())),
            _ => None,
        });
        match entry {
            Some((op_id, flow)) => vec![Self::schedule(
                &op_id,
                "persist-flow",
                PersistFlowActivity::TYPE,
                serde_json::to_value(flow).unwrap_or(json!({})),
            )],
            None => vec![],
        }
    }

    fn on_activity_completed(
        &mut self,
        ctx: &mut WorkflowContext,
        activity_id: &str,
        result: serde_json::Value,
    ) -> Vec<WorkflowAction> {
        let (op_id, step) = match activity_id.split_once(':') {
            Some(parts) => parts,
            None => return vec![],
        };
        let op_id = op_id.to_string();

        let actions = match step {
            "find-workspace" => {
                let workspace: Workspace = match serde_json::from_value(result) {
                    Ok(workspace) => workspace,
                    Err(e) => {
                        warn!(error = %e, "malformed find_workspace result");
                        return vec![];
                    }
                };
                let parent_id = match self.ops.get_mut(&op_id) {
                    Some(Op::WorkRequest {
                        request,
                        workspace: slot,
                        ..
                    }) => {
                        *slot = Some(workspace.clone());
                        request.parent_id.clone()
                    }
                    _ => return vec![],
                };

                if parent_id.starts_with("task_") {
                    // One in-progress flow per task: check before dispatch.
                    vec![Self::schedule(
                        &op_id,
                        "check-flows",
                        GetFlowsForTaskActivity::TYPE,
                        json!({
                            "workspace_id": self.input.workspace_id,
                            "task_id": parent_id,
                        }),
                    )]
                } else {
                    self.dispatch_flow(ctx, &op_id, workspace)
                }
            }

            "check-flows" => {
                let flows: Vec<Flow> = serde_json::from_value(result).unwrap_or_default();
                if flows.iter().any(|f| f.status == FlowStatus::InProgress) {
                    let Some(Op::WorkRequest { update_id, .. }) = self.ops.remove(&op_id) else {
                        return vec![];
                    };
                    return vec![WorkflowAction::fail_update(
                        update_id,
                        WorkflowError::new("task already has a flow in progress")
                            .with_code("FLOW_IN_PROGRESS"),
                    )];
                }
                let workspace = match self.ops.get(&op_id) {
                    Some(Op::WorkRequest {
                        workspace: Some(workspace),
                        ..
                    }) => workspace.clone(),
                    _ => return vec![],
                };
                self.dispatch_flow(ctx, &op_id, workspace)
            }

            "persist-flow" => {
                let Some(Op::WorkRequest { update_id, .. }) = self.ops.remove(&op_id) else {
                    return vec![];
                };
                vec![WorkflowAction::complete_update(update_id, result)]
            }

            "get-flow-cancel" => {
                let mut flow: Flow = match serde_json::from_value(result) {
                    Ok(flow) => flow,
                    Err(e) => {
                        warn!(error = %e, "malformed get_flow result");
                        self.ops.remove(&op_id);
                        return vec![];
                    }
                };
                flow.status = FlowStatus::Cancelled;
                if let Some(Op::CancelFlow { flow: slot }) = self.ops.get_mut(&op_id) {
                    *slot = Some(flow.clone());
                }
                vec![Self::schedule(
                    &op_id,
                    "persist-cancelled",
                    PersistFlowActivity::TYPE,
                    serde_json::to_value(flow).unwrap_or(json!({})),
                )]
            }

            "persist-cancelled" => {
                let Some(Op::CancelFlow { flow: Some(flow) }) = self.ops.get(&op_id).cloned()
                else {
                    self.ops.remove(&op_id);
                    return vec![];
                };
                if flow.parent_id.starts_with("task_") {
                    vec![Self::schedule(
                        &op_id,
                        "complete-task",
                        CompleteFlowParentTaskActivity::TYPE,
                        json!({
                            "workspace_id": self.input.workspace_id,
                            "parent_task_id": flow.parent_id,
                            "flow_status": flow.status,
                        }),
                    )]
                } else {
                    self.ops.remove(&op_id);
                    vec![]
                }
            }

            "get-flow-request" => {
                let flow: Flow = match serde_json::from_value(result) {
                    Ok(flow) => flow,
                    Err(e) => {
                        warn!(error = %e, "malformed get_flow result");
                        self.ops.remove(&op_id);
                        return vec![];
                    }
                };
                let Some(Op::UserRequest { request }) = self.ops.get(&op_id).cloned() else {
                    return vec![];
                };
                if flow.parent_id.starts_with("task_") {
                    vec![Self::schedule(
                        &op_id,
                        "create-pending",
                        CreatePendingUserRequestActivity::TYPE,
                        json!({
                            "workspace_id": self.input.workspace_id,
                            "request": request,
                        }),
                    )]
                } else {
                    // At most one pending request per workflow: a flow parks
                    // until its request is answered.
                    self.requests
                        .insert(request.origin_workflow_id.clone(), request);
                    self.ops.remove(&op_id);
                    vec![]
                }
            }

            "create-pending" => {
                let Some(Op::UserRequest { request }) = self.ops.get(&op_id).cloned() else {
                    return vec![];
                };
                vec![Self::schedule(
                    &op_id,
                    "update-task",
                    UpdateTaskForUserRequestActivity::TYPE,
                    json!({
                        "workspace_id": self.input.workspace_id,
                        "flow_id": request.origin_workflow_id,
                    }),
                )]
            }

            "update-task" => {
                self.ops.remove(&op_id);
                vec![]
            }

            "get-flow-closed" => {
                let mut flow: Flow = match serde_json::from_value(result) {
                    Ok(flow) => flow,
                    Err(e) => {
                        warn!(error = %e, "malformed get_flow result");
                        self.ops.remove(&op_id);
                        return vec![];
                    }
                };
                let Some(Op::Closure { closure, flow: slot }) = self.ops.get_mut(&op_id) else {
                    return vec![];
                };
                flow.status = FlowStatus::from_closure_reason(&closure.reason);
                *slot = Some(flow.clone());
                vec![Self::schedule(
                    &op_id,
                    "persist-closed",
                    PersistFlowActivity::TYPE,
                    serde_json::to_value(flow).unwrap_or(json!({})),
                )]
            }

            "persist-closed" => {
                let Some(Op::Closure {
                    flow: Some(flow), ..
                }) = self.ops.get(&op_id).cloned()
                else {
                    self.ops.remove(&op_id);
                    return vec![];
                };
                if flow.parent_id.starts_with("task_") {
                    vec![Self::schedule(
                        &op_id,
                        "complete-task",
                        CompleteFlowParentTaskActivity::TYPE,
                        json!({
                            "workspace_id": self.input.workspace_id,
                            "parent_task_id": flow.parent_id,
                            "flow_status": flow.status,
                        }),
                    )]
                } else {
                    self.ops.remove(&op_id);
                    vec![]
                }
            }

            "complete-task" => {
                self.ops.remove(&op_id);
                vec![]
            }

            other => {
                warn!(step = other, "activity completed for unknown manager step");
                vec![]
            }
        };
        self.maybe_continue_as_new(actions)
    }

    fn on_activity_failed(
        &mut self,
        _ctx: &mut WorkflowContext,
        activity_id: &str,
        error: &ActivityError,
    ) -> Vec<WorkflowAction> {
        // Reconciliation is best effort: a failed step drops the operation
        // rather than wedging the manager, and a failed work request is
        // reported back to its caller.
        let Some((op_id, _)) = activity_id.split_once(':') else {
            return vec![];
        };
        warn!(%activity_id, error = %error.message, "manager operation step failed");
        match self.ops.remove(op_id) {
            Some(Op::WorkRequest { update_id, .. }) => {
                vec![WorkflowAction::fail_update(
                    update_id,
                    WorkflowError::new(format!("failed to dispatch work request: {}", error.message)),
                )]
            }
            _ => self.maybe_continue_as_new(vec![]),
        }
    }

    fn on_cancel_requested(
        &mut self,
        _ctx: &mut WorkflowContext,
        reason: &str,
    ) -> Vec<WorkflowAction> {
        vec![WorkflowAction::cancel(reason)]
    }

    fn is_completed(&self) -> bool {
        false
    }

    fn result(&self) -> Option<Self::Output> {
        None
    }
}
