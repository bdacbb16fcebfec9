//! Dev context
//!
//! Workflow-scoped state threaded through a dev flow: ids, the repo config,
//! the execution environment, the current subflow scope, and global flags
//! (pause, cancellation). The flow's state machine owns one of these and
//! rebuilds it deterministically on replay.

use sidekick_domain::Worktree;

use crate::config::RepoConfig;
use crate::env::EnvContainer;
use crate::model_config::ModelConfigResolver;

/// Which subflow newly tracked actions should be attributed to.
#[derive(Debug, Clone, Default)]
pub struct FlowScope {
    /// The parent "Coding" subflow wrapping the whole coding phase.
    pub coding_subflow_id: String,
    /// The per-attempt subflow, when one is open.
    pub iteration_subflow_id: String,
}

impl FlowScope {
    /// The innermost open subflow.
    pub fn current_subflow_id(&self) -> String {
        if !self.iteration_subflow_id.is_empty() {
            self.iteration_subflow_id.clone()
        } else {
            self.coding_subflow_id.clone()
        }
    }
}

/// Flow-wide flags toggled by signals.
#[derive(Debug, Clone, Default)]
pub struct GlobalState {
    pub paused: bool,
}

/// Per-flow configuration and environment.
pub struct DevContext {
    pub workspace_id: String,
    /// Workflow execution id; doubles as the Flow id.
    pub flow_id: String,
    pub repo_config: RepoConfig,
    pub model_resolver: ModelConfigResolver,
    pub max_attempts: u32,
    pub env: EnvContainer,
    pub worktree: Option<Worktree>,
    pub flow_scope: FlowScope,
    pub global: GlobalState,
}

impl DevContext {
    pub fn new(workspace_id: impl Into<String>, repo_dir: impl Into<String>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            flow_id: String::new(),
            repo_config: RepoConfig::default(),
            model_resolver: ModelConfigResolver::default(),
            max_attempts: crate::basic_dev::DEFAULT_MAX_ATTEMPTS,
            env: EnvContainer::local(repo_dir),
            worktree: None,
            flow_scope: FlowScope::default(),
            global: GlobalState::default(),
        }
    }
}
