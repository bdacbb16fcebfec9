//! Workflow event persistence

mod memory;
mod store;

pub use memory::InMemoryWorkflowEventStore;
pub use store::{
    ClaimedTask, ParentRef, StartWorkflowOptions, StoreError, TaskDefinition, TaskFailureOutcome,
    WorkflowEventStore, WorkflowInfo, WorkflowStatus,
};
