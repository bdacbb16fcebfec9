//! # Durable workflow engine
//!
//! An event-sourced workflow orchestration engine: workflow state machines
//! are driven by an append-only event log, which makes them replayable after
//! a crash and deterministic by construction.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkflowExecutor                        │
//! │  (replays event histories, dispatches handlers, processes   │
//! │   actions: activities, children, signals, updates, timers)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   WorkflowEventStore                         │
//! │  (event histories, activity task queue, signal queues)      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Worker                                │
//! │  (claims tasks per queue, runs activities with retries and  │
//! │   timeouts, feeds completions back into the executor)       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Workflow code is single-threaded cooperative: all nondeterminism goes
//! through activities, recorded side effects ([`WorkflowContext::side_effect`])
//! or version markers ([`WorkflowContext::version`]). Activities run as
//! preemptible tasks in the worker with retries and timeouts.

pub mod activity;
pub mod engine;
pub mod persistence;
pub mod retry;
pub mod worker;
pub mod workflow;

pub use activity::{
    Activity, ActivityContext, ActivityError, ActivityOutcome, ActivityRegistry,
    CancellationHandle,
};
pub use engine::{ExecutorError, WorkflowExecutor, WorkflowRegistry};
pub use persistence::{
    ClaimedTask, InMemoryWorkflowEventStore, ParentRef, StartWorkflowOptions, StoreError,
    TaskDefinition, TaskFailureOutcome, WorkflowEventStore, WorkflowInfo, WorkflowStatus,
};
pub use retry::RetryPolicy;
pub use worker::{ActivityInterceptor, Worker, WorkerConfig, WorkerHandle};
pub use workflow::{
    signal_types, ActivityOptions, ChildWorkflowOutcome, ParentClosePolicy, Workflow,
    WorkflowAction, WorkflowContext, WorkflowError, WorkflowEvent, WorkflowSignal, WorkflowUpdate,
};
