//! Workflow registry for type-erased workflow creation
//!
//! The registry maps workflow type names to factories that build workflow
//! instances from JSON input, so the executor can replay any registered
//! workflow without knowing its concrete type.

use std::collections::HashMap;
use std::fmt;

use serde_json::Value;

use crate::activity::ActivityError;
use crate::workflow::{
    ChildWorkflowOutcome, Workflow, WorkflowAction, WorkflowContext, WorkflowError,
    WorkflowSignal, WorkflowUpdate,
};

/// Type-erased workflow interface. All payloads cross as JSON.
pub trait AnyWorkflow: Send + Sync {
    fn workflow_type(&self) -> &'static str;

    fn on_start(&mut self, ctx: &mut WorkflowContext) -> Vec<WorkflowAction>;

    fn on_activity_completed(
        &mut self,
        ctx: &mut WorkflowContext,
        activity_id: &str,
        result: Value,
    ) -> Vec<WorkflowAction>;

    fn on_activity_failed(
        &mut self,
        ctx: &mut WorkflowContext,
        activity_id: &str,
        error: &ActivityError,
    ) -> Vec<WorkflowAction>;

    fn on_timer_fired(&mut self, ctx: &mut WorkflowContext, timer_id: &str) -> Vec<WorkflowAction>;

    fn on_signal(&mut self, ctx: &mut WorkflowContext, signal: &WorkflowSignal)
        -> Vec<WorkflowAction>;

    fn on_update(&mut self, ctx: &mut WorkflowContext, update: &WorkflowUpdate)
        -> Vec<WorkflowAction>;

    fn on_child_workflow_started(
        &mut self,
        ctx: &mut WorkflowContext,
        child_workflow_id: &str,
    ) -> Vec<WorkflowAction>;

    fn on_child_workflow_closed(
        &mut self,
        ctx: &mut WorkflowContext,
        child_workflow_id: &str,
        outcome: &ChildWorkflowOutcome,
    ) -> Vec<WorkflowAction>;

    fn on_cancel_requested(
        &mut self,
        ctx: &mut WorkflowContext,
        reason: &str,
    ) -> Vec<WorkflowAction>;

    fn is_completed(&self) -> bool;

    fn result_json(&self) -> Option<Value>;

    fn error(&self) -> Option<WorkflowError>;
}

struct WorkflowWrapper<W: Workflow> {
    inner: W,
}

impl<W: Workflow> AnyWorkflow for WorkflowWrapper<W> {
    fn workflow_type(&self) -> &'static str {
        W::TYPE
    }

    fn on_start(&mut self, ctx: &mut WorkflowContext) -> Vec<WorkflowAction> {
        self.inner.on_start(ctx)
    }

    fn on_activity_completed(
        &mut self,
        ctx: &mut WorkflowContext,
        activity_id: &str,
        result: Value,
    ) -> Vec<WorkflowAction> {
        self.inner.on_activity_completed(ctx, activity_id, result)
    }

    fn on_activity_failed(
        &mut self,
        ctx: &mut WorkflowContext,
        activity_id: &str,
        error: &ActivityError,
    ) -> Vec<WorkflowAction> {
        self.inner.on_activity_failed(ctx, activity_id, error)
    }

    fn on_timer_fired(&mut self, ctx: &mut WorkflowContext, timer_id: &str) -> Vec<WorkflowAction> {
        self.inner.on_timer_fired(ctx, timer_id)
    }

    fn on_signal(
        &mut self,
        ctx: &mut WorkflowContext,
        signal: &WorkflowSignal,
    ) -> Vec<WorkflowAction> {
        self.inner.on_signal(ctx, signal)
    }

    fn on_update(
        &mut self,
        ctx: &mut WorkflowContext,
        update: &WorkflowUpdate,
    ) -> Vec<WorkflowAction> {
        self.inner.on_update(ctx, update)
    }

    fn on_child_workflow_started(
        &mut self,
        ctx: &mut WorkflowContext,
        child_workflow_id: &str,
    ) -> Vec<WorkflowAction> {
        self.inner.on_child_workflow_started(ctx, child_workflow_id)
    }

    fn on_child_workflow_closed(
        &mut self,
        ctx: &mut WorkflowContext,
        child_workflow_id: &str,
        outcome: &ChildWorkflowOutcome,
    ) -> Vec<WorkflowAction> {
        self.inner
            .on_child_workflow_closed(ctx, child_workflow_id, outcome)
    }

    fn on_cancel_requested(
        &mut self,
        ctx: &mut WorkflowContext,
        reason: &str,
    ) -> Vec<WorkflowAction> {
        self.inner.on_cancel_requested(ctx, reason)
    }

    fn is_completed(&self) -> bool {
        self.inner.is_completed()
    }

    fn result_json(&self) -> Option<Value> {
        self.inner
            .result()
            .map(|r| serde_json::to_value(r).unwrap_or(Value::Null))
    }

    fn error(&self) -> Option<WorkflowError> {
        self.inner.error()
    }
}

type WorkflowFactory =
    Box<dyn Fn(Value) -> Result<Box<dyn AnyWorkflow + Send>, serde_json::Error> + Send + Sync>;

/// Registry of workflow factories.
#[derive(Default)]
pub struct WorkflowRegistry {
    factories: HashMap<String, WorkflowFactory>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<W: Workflow>(&mut self) {
        let factory: WorkflowFactory = Box::new(|input: Value| {
            let typed_input: W::Input = serde_json::from_value(input)?;
            let workflow = W::new(typed_input);
            Ok(Box::new(WorkflowWrapper { inner: workflow }) as Box<dyn AnyWorkflow + Send>)
        });
        self.factories.insert(W::TYPE.to_string(), factory);
    }

    pub fn contains(&self, workflow_type: &str) -> bool {
        self.factories.contains_key(workflow_type)
    }

    pub fn create(
        &self,
        workflow_type: &str,
        input: Value,
    ) -> Result<Box<dyn AnyWorkflow + Send>, RegistryError> {
        let factory = self
            .factories
            .get(workflow_type)
            .ok_or_else(|| RegistryError::UnknownWorkflowType(workflow_type.to_string()))?;
        factory(input).map_err(RegistryError::Deserialization)
    }

    pub fn workflow_types(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(|s| s.as_str())
    }
}

impl fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowRegistry")
            .field("workflow_types", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown workflow type: {0}")]
    UnknownWorkflowType(String),

    #[error("failed to deserialize workflow input: {0}")]
    Deserialization(#[source] serde_json::Error),
}
