//! Domain model for the Sidekick core
//!
//! This crate holds the persistent entities (workspaces, tasks, flows,
//! subflows, flow actions, worktrees), the messages exchanged between dev
//! workflows and the agent manager, and the capability traits that storage
//! and streaming backends implement. It is deliberately free of I/O: ids are
//! plain strings with kind prefixes, relations are stored by id and resolved
//! by lookup.

pub mod flow;
pub mod flow_action;
pub mod flow_event;
pub mod ids;
pub mod request;
pub mod storage;
pub mod streamer;
pub mod subflow;
pub mod task;
pub mod workspace;
pub mod worktree;

pub use flow::{Flow, FlowStatus, FlowType};
pub use flow_action::{FlowAction, FlowActionStatus};
pub use flow_event::{EndStreamEvent, FlowEvent, FlowEventSubscription, END_STREAM_EVENT_TYPE};
pub use ids::{new_flow_action_id, new_flow_id, new_id, new_subflow_id, new_task_id, new_worktree_id};
pub use request::{RequestForUser, RequestKind, UserResponse, WorkflowClosure};
pub use storage::{KvStorage, Storage, StorageError};
pub use streamer::{FlowActionStreamer, FlowEventStreamer, Streamer, TaskStreamer};
pub use subflow::{Subflow, SubflowStatus};
pub use task::{AgentType, Task, TaskStatus};
pub use workspace::{ModelConfig, Workspace, WorkspaceConfig};
pub use worktree::Worktree;
