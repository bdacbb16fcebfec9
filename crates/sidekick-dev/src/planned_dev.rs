//! Planned Dev workflow
//!
//! The multi-step variant: a planning pass turns the raw input into a
//! structured requirements document, then each planned step is driven
//! through the Basic Dev contracts as a child execution. Steps run
//! sequentially; the first failed step fails the flow. Closure signaling to
//! the manager is identical to Basic Dev.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use sidekick_durable::{
    Activity as _, ActivityError, ChildWorkflowOutcome, ParentClosePolicy, Workflow,
    WorkflowAction, WorkflowContext, WorkflowError,
};

use crate::activities::coding::BuildDevRequirementsActivity;
use crate::basic_dev::{BasicDevOptions, BasicDevWorkflow, BasicDevWorkflowInput};
use crate::coding_agent::DevRequirements;
use crate::env::EnvContainer;
use crate::manager::manager_workflow_id;
use crate::user_request::workflow_closed_signal;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedDevWorkflowInput {
    pub workspace_id: String,
    pub repo_dir: String,
    pub requirements: String,
    #[serde(flatten)]
    pub options: BasicDevOptions,
}

#[derive(Debug, Clone, PartialEq)]
enum Phase {
    Planning,
    RunningStep { index: usize },
    Closed,
}

pub struct PlannedDevWorkflow {
    input: PlannedDevWorkflowInput,
    flow_id: String,
    phase: Phase,
    steps: Vec<String>,
    step_results: Vec<String>,
    outcome: Option<Result<String, WorkflowError>>,
}

impl PlannedDevWorkflow {
    fn step_workflow_id(&self, index: usize) -> String {
        format!("{}:step-{}", self.flow_id, index + 1)
    }

    fn start_step(&mut self, index: usize) -> Vec<WorkflowAction> {
        self.phase = Phase::RunningStep { index };
        let input = BasicDevWorkflowInput {
            workspace_id: self.input.workspace_id.clone(),
            repo_dir: self.input.repo_dir.clone(),
            requirements: self.steps[index].clone(),
            options: BasicDevOptions {
                // Step requirements were already planned; don't re-derive
                // them per step.
                determine_requirements: false,
                ..self.input.options.clone()
            },
        };
        vec![WorkflowAction::StartChildWorkflow {
            workflow_id: self.step_workflow_id(index),
            workflow_type: <BasicDevWorkflow as Workflow>::TYPE.to_string(),
            input: serde_json::to_value(input).unwrap_or(json!({})),
            parent_close_policy: ParentClosePolicy::RequestCancel,
            task_queue: None,
        }]
    }

    fn close_completed(&mut self, ctx: &mut WorkflowContext) -> Vec<WorkflowAction> {
        self.phase = Phase::Closed;
        let result = self.step_results.join("\n");
        self.outcome = Some(Ok(result.clone()));
        vec![
            WorkflowAction::signal_external(
                manager_workflow_id(&self.input.workspace_id),
                workflow_closed_signal(ctx.workflow_id(), "completed"),
            ),
            WorkflowAction::complete(json!(result)),
        ]
    }

    fn close_failed(&mut self, ctx: &mut WorkflowContext, message: String) -> Vec<WorkflowAction> {
        self.phase = Phase::Closed;
        let error = WorkflowError::new(message);
        self.outcome = Some(Err(error.clone()));
        vec![
            WorkflowAction::signal_external(
                manager_workflow_id(&self.input.workspace_id),
                workflow_closed_signal(ctx.workflow_id(), "failed"),
            ),
            WorkflowAction::fail(error),
        ]
    }
}

impl Workflow for PlannedDevWorkflow {
    const TYPE: &'static str = "planned_dev";
    type Input = PlannedDevWorkflowInput;
    type Output = String;

    fn new(input: Self::Input) -> Self {
        Self {
            input,
            flow_id: String::new(),
            phase: Phase::Planning,
            steps: vec![],
            step_results: vec![],
            outcome: None,
        }
    }

    fn on_start(&mut self, ctx: &mut WorkflowContext) -> Vec<WorkflowAction> {
        self.flow_id = ctx.workflow_id().to_string();
        self.phase = Phase::Planning;
        vec![WorkflowAction::schedule_activity(
            "plan-1",
            BuildDevRequirementsActivity::TYPE,
            json!({
                "env": EnvContainer::local(self.input.repo_dir.clone()),
                "requirements": self.input.requirements,
            }),
        )]
    }

    fn on_activity_completed(
        &mut self,
        ctx: &mut WorkflowContext,
        _activity_id: &str,
        result: serde_json::Value,
    ) -> Vec<WorkflowAction> {
        let requirements: DevRequirements = match serde_json::from_value(result) {
            Ok(requirements) => requirements,
            Err(e) => return self.close_failed(ctx, format!("failed to plan steps: {e}")),
        };

        // One step per acceptance criterion; an unstructured plan runs as a
        // single step over the overview.
        self.steps = if requirements.acceptance_criteria.is_empty() {
            vec![requirements.overview.clone()]
        } else {
            requirements
                .acceptance_criteria
                .iter()
                .map(|criterion| format!("{}\n\nStep: {criterion}", requirements.overview))
                .collect()
        };
        self.start_step(0)
    }

    fn on_activity_failed(
        &mut self,
        ctx: &mut WorkflowContext,
        _activity_id: &str,
        error: &ActivityError,
    ) -> Vec<WorkflowAction> {
        self.close_failed(ctx, format!("failed to plan steps: {}", error.message))
    }

    fn on_child_workflow_closed(
        &mut self,
        ctx: &mut WorkflowContext,
        child_workflow_id: &str,
        outcome: &ChildWorkflowOutcome,
    ) -> Vec<WorkflowAction> {
        let Phase::RunningStep { index } = self.phase.clone() else {
            warn!(%child_workflow_id, "step closed outside RunningStep phase");
            return vec![];
        };

        match outcome {
            ChildWorkflowOutcome::Completed(result) => {
                self.step_results
                    .push(result.as_str().unwrap_or_default().to_string());
                if index + 1 < self.steps.len() {
                    self.start_step(index + 1)
                } else {
                    self.close_completed(ctx)
                }
            }
            ChildWorkflowOutcome::Failed(error) => self.close_failed(
                ctx,
                format!("step {} failed: {}", index + 1, error.message),
            ),
        }
    }

    fn on_cancel_requested(
        &mut self,
        ctx: &mut WorkflowContext,
        reason: &str,
    ) -> Vec<WorkflowAction> {
        if self.phase == Phase::Closed {
            return vec![];
        }
        self.phase = Phase::Closed;
        self.outcome = Some(Err(WorkflowError::new(reason).with_code("CANCELLED")));
        vec![
            WorkflowAction::signal_external(
                manager_workflow_id(&self.input.workspace_id),
                workflow_closed_signal(ctx.workflow_id(), "cancelled"),
            ),
            WorkflowAction::cancel(reason),
        ]
    }

    fn is_completed(&self) -> bool {
        self.outcome.is_some()
    }

    fn result(&self) -> Option<String> {
        match &self.outcome {
            Some(Ok(result)) => Some(result.clone()),
            _ => None,
        }
    }

    fn error(&self) -> Option<WorkflowError> {
        match &self.outcome {
            Some(Err(error)) => Some(error.clone()),
            _ => None,
        }
    }
}
