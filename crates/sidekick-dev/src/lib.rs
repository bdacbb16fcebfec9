//! Dev orchestration for Sidekick
//!
//! The per-workspace Dev Agent Manager workflow, the Basic/Planned Dev
//! workflows, flow-action tracking, the user-request protocol, and their
//! supporting activities. Workflows here are deterministic state machines on
//! top of [`sidekick_durable`]; everything touching the filesystem, git, or
//! an LLM runs as an activity.

pub mod activities;
pub mod basic_dev;
pub mod coding_agent;
pub mod config;
pub mod context;
pub mod env;
pub mod manager;
pub mod model_config;
pub mod planned_dev;
pub mod runtime;
pub mod secrets;
pub mod track;
pub mod user_request;

pub use basic_dev::{BasicDevWorkflow, BasicDevWorkflowInput};
pub use coding_agent::{
    ChatMessage, ChatRole, CodeContext, CodingAgent, CriteriaFulfillment, DevRequirements,
    PromptInfo, ScriptedCodingAgent, TestResult,
};
pub use config::{FormatterCommand, RepoConfig, TestCommand, CONFIG_FILE_NAME};
pub use context::{DevContext, FlowScope, GlobalState};
pub use env::{CommandOutput, EnvContainer, EnvType};
pub use manager::{
    manager_workflow_id, CancelSignal, DevAgentManagerInput, DevAgentManagerWorkflow, WorkRequest,
};
pub use model_config::ModelConfigResolver;
pub use planned_dev::{PlannedDevWorkflow, PlannedDevWorkflowInput};
pub use runtime::DevAgentRuntime;
pub use secrets::{SecretManager, SecretManagerKind};
pub use track::{FlowActionTracker, TrackMetadata};
pub use user_request::signal_names;
