//! Basic Dev workflow
//!
//! The edit → test → verify → format → merge loop, as a deterministic state
//! machine. Attempts are bounded (`max_iterations` from `side.toml`, default
//! 17), models rotate every third attempt, and every third failed attempt
//! escalates to the user for guidance. In worktree mode the loop ends with a
//! user-approved merge back to the start branch and worktree cleanup.
//!
//! Whatever happens, the workflow emits a `workflowClosed` signal to its
//! manager with the terminal status before it returns; that signal is the
//! only thing the manager relies on to reconcile the Flow and its task.

use serde::{Deserialize, Serialize};
use serde_json::json;
use svix_ksuid::{Ksuid, KsuidLike};
use tracing::warn;

use sidekick_domain::{RequestForUser, Subflow, SubflowStatus, UserResponse};
use sidekick_durable::{
    Activity as _, ActivityError, ActivityOptions, Workflow, WorkflowAction, WorkflowContext,
    WorkflowError, WorkflowSignal,
};

use crate::activities::coding::{
    AutoFormatActivity, BuildDevRequirementsActivity, CheckCriteriaActivity, EditCodeActivity,
    LoadRepoConfigActivity, PrepareCodeContextActivity, RunTestsActivity,
};
use crate::activities::git::{
    CleanupWorktreeActivity, CreateWorktreeActivity, CreateWorktreeOutput, GitAddActivity,
    GitCommitActivity, GitDiffActivity, GitMergeActivity,
};
use crate::activities::tracking::{PersistSubflowActivity, RecordUserRequestActivity, ResolveUserRequestActivity};
use crate::coding_agent::{
    ChatMessage, CodeContext, CriteriaFulfillment, DevRequirements, PromptInfo, TestResult,
};
use crate::config::RepoConfig;
use crate::context::DevContext;
use crate::env::git::MergeResult;
use crate::env::EnvType;
use crate::manager::manager_workflow_id;
use crate::model_config::{ModelConfigResolver, ModelKey};
use crate::track::{flow_action_id, TrackMetadata};
use crate::user_request::{
    continue_request, guidance_request, merge_approval_request, request_for_user_signal,
    signal_names, workflow_closed_signal,
};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 17;

/// Timeout for the long dev activities (LLM edits, test runs).
const DEV_ACTIVITY_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BasicDevOptions {
    #[serde(default, rename = "determineRequirements")]
    pub determine_requirements: bool,
    #[serde(default, rename = "envType")]
    pub env_type: EnvType,
    #[serde(default, rename = "startBranch", skip_serializing_if = "Option::is_none")]
    pub start_branch: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BasicDevWorkflowInput {
    pub workspace_id: String,
    pub repo_dir: String,
    pub requirements: String,
    #[serde(flatten)]
    pub options: BasicDevOptions,
}

#[derive(Debug, Clone, PartialEq)]
enum Phase {
    LoadingConfig,
    CreatingWorktree,
    BuildingRequirements,
    PreparingContext,
    Editing,
    Testing,
    IntegrationTesting,
    CheckingCriteria,
    CollectingGuidanceDiff,
    AwaitingGuidance,
    Formatting,
    StagingChanges,
    DiffingForMerge,
    AwaitingMergeApproval,
    Committing,
    Merging,
    AwaitingConflictResolution,
    CleaningWorktree,
    Closed,
}

pub struct BasicDevWorkflow {
    input: BasicDevWorkflowInput,
    dev: DevContext,
    phase: Phase,
    seq: u32,
    attempt: u32,

    requirements: String,

    context_size_extension: usize,
    chat_history: Vec<ChatMessage>,
    prompt_info: PromptInfo,
    last_test_result: TestResult,
    last_fulfillment: Option<CriteriaFulfillment>,

    merge_target: String,
    pending_request_action_id: Option<String>,
    stash: Vec<WorkflowAction>,

    outcome: Option<Result<String, WorkflowError>>,
}

impl BasicDevWorkflow {
    fn next_id(&mut self, kind: &str) -> String {
        self.seq += 1;
        format!("{kind}-{}", self.seq)
    }

    fn dev_options() -> ActivityOptions {
        ActivityOptions::default().with_start_to_close_timeout(
            std::time::Duration::from_secs(DEV_ACTIVITY_TIMEOUT_SECS),
        )
    }

    fn tracked(
        &self,
        ctx: &WorkflowContext,
        action_type: &str,
        action_params: serde_json::Value,
    ) -> serde_json::Value {
        serde_json::to_value(TrackMetadata {
            workspace_id: self.input.workspace_id.clone(),
            flow_id: ctx.workflow_id().to_string(),
            subflow_id: self.current_subflow_id(),
            action_type: action_type.to_string(),
            action_params,
        })
        .unwrap_or(json!({}))
    }

    fn current_subflow_id(&self) -> String {
        self.dev.flow_scope.current_subflow_id()
    }

    /// Schedule a tracked dev activity: the interceptor turns the metadata
    /// into flow-action transitions on the change stream.
    fn schedule_tracked(
        &mut self,
        ctx: &WorkflowContext,
        kind: &str,
        activity_type: &str,
        input: serde_json::Value,
        action_type: &str,
        action_params: serde_json::Value,
    ) -> WorkflowAction {
        let metadata = self.tracked(ctx, action_type, action_params);
        WorkflowAction::ScheduleActivity {
            activity_id: self.next_id(kind),
            activity_type: activity_type.to_string(),
            input,
            options: Self::dev_options().with_metadata(metadata),
        }
    }

    fn schedule_plain(
        &mut self,
        kind: &str,
        activity_type: &str,
        input: serde_json::Value,
    ) -> WorkflowAction {
        WorkflowAction::ScheduleActivity {
            activity_id: self.next_id(kind),
            activity_type: activity_type.to_string(),
            input,
            options: Self::dev_options(),
        }
    }

    /// Gate actions on the pause flag: while paused, actions are stashed and
    /// released in order when the user resumes.
    fn emit(&mut self, actions: Vec<WorkflowAction>) -> Vec<WorkflowAction> {
        if self.dev.global.paused && self.phase != Phase::Closed {
            self.stash.extend(actions);
            vec![]
        } else {
            actions
        }
    }

    // ------------------------------------------------------------------
    // Closure
    // ------------------------------------------------------------------

    fn close_completed(&mut self, ctx: &mut WorkflowContext, result: String) -> Vec<WorkflowAction> {
        self.phase = Phase::Closed;
        self.outcome = Some(Ok(result.clone()));
        let mut actions = self.finish_subflows(SubflowStatus::Complete);
        actions.push(WorkflowAction::signal_external(
            manager_workflow_id(&self.input.workspace_id),
            workflow_closed_signal(ctx.workflow_id(), "completed"),
        ));
        actions.push(WorkflowAction::complete(json!(result)));
        actions
    }

    fn close_failed(&mut self, ctx: &mut WorkflowContext, message: String) -> Vec<WorkflowAction> {
        self.phase = Phase::Closed;
        let error = WorkflowError::new(message);
        self.outcome = Some(Err(error.clone()));
        let mut actions = self.finish_subflows(SubflowStatus::Failed);
        actions.push(WorkflowAction::signal_external(
            manager_workflow_id(&self.input.workspace_id),
            workflow_closed_signal(ctx.workflow_id(), "failed"),
        ));
        actions.push(WorkflowAction::fail(error));
        actions
    }

    fn close_cancelled(&mut self, ctx: &mut WorkflowContext, reason: &str) -> Vec<WorkflowAction> {
        self.phase = Phase::Closed;
        self.outcome = Some(Err(WorkflowError::new(reason).with_code("CANCELLED")));
        // An outstanding user request is abandoned with the flow. No
        // subflow bookkeeping either: cancellation drops queued work.
        self.pending_request_action_id = None;
        vec![
            WorkflowAction::signal_external(
                manager_workflow_id(&self.input.workspace_id),
                workflow_closed_signal(ctx.workflow_id(), "cancelled"),
            ),
            WorkflowAction::cancel(reason),
        ]
    }

    /// Close the open iteration and coding subflows.
    fn finish_subflows(&mut self, status: SubflowStatus) -> Vec<WorkflowAction> {
        let mut actions = vec![];
        if let Some(action) = self.close_iteration_subflow(status) {
            actions.push(action);
        }
        if !self.dev.flow_scope.coding_subflow_id.is_empty() {
            let subflow = self.subflow_record(
                self.dev.flow_scope.coding_subflow_id.clone(),
                "Coding".to_string(),
                Some("coding".to_string()),
                String::new(),
                status,
            );
            actions.push(self.persist_subflow(subflow));
        }
        actions
    }

    // ------------------------------------------------------------------
    // Subflows
    // ------------------------------------------------------------------

    fn subflow_record(
        &self,
        id: String,
        name: String,
        subflow_type: Option<String>,
        parent_subflow_id: String,
        status: SubflowStatus,
    ) -> Subflow {
        Subflow {
            workspace_id: self.input.workspace_id.clone(),
            id,
            name,
            subflow_type,
            description: String::new(),
            status,
            parent_subflow_id,
            flow_id: self.dev.flow_id.clone(),
            result: String::new(),
        }
    }

    fn persist_subflow(&mut self, subflow: Subflow) -> WorkflowAction {
        self.schedule_plain(
            "subflow",
            PersistSubflowActivity::TYPE,
            serde_json::to_value(subflow).unwrap_or(json!({})),
        )
    }

    fn iteration_subflow_name(&self) -> String {
        if self.attempt == 0 {
            "Basic Dev".to_string()
        } else {
            format!("Basic Dev ({})", self.attempt + 1)
        }
    }

    fn open_iteration_subflow(&mut self, ctx: &mut WorkflowContext) -> WorkflowAction {
        let id = ctx.side_effect(|| json!(format!("sf_{}", Ksuid::new(None, None))));
        self.dev.flow_scope.iteration_subflow_id = id.as_str().unwrap_or_default().to_string();
        let subflow = self.subflow_record(
            self.dev.flow_scope.iteration_subflow_id.clone(),
            self.iteration_subflow_name(),
            None,
            self.dev.flow_scope.coding_subflow_id.clone(),
            SubflowStatus::Started,
        );
        self.persist_subflow(subflow)
    }

    fn close_iteration_subflow(&mut self, status: SubflowStatus) -> Option<WorkflowAction> {
        if self.dev.flow_scope.iteration_subflow_id.is_empty() {
            return None;
        }
        let subflow = self.subflow_record(
            std::mem::take(&mut self.dev.flow_scope.iteration_subflow_id),
            self.iteration_subflow_name(),
            None,
            self.dev.flow_scope.coding_subflow_id.clone(),
            status,
        );
        Some(self.persist_subflow(subflow))
    }

    // ------------------------------------------------------------------
    // Coding loop
    // ------------------------------------------------------------------

    fn start_coding_phase(&mut self, ctx: &mut WorkflowContext) -> Vec<WorkflowAction> {
        let mut actions = vec![];

        // Wrap the whole coding phase in a parent "Coding" subflow for
        // histories new enough to know about it.
        if ctx.version("basic-dev-parent-subflow", 0, 1) == 1 {
            let id = ctx.side_effect(|| json!(format!("sf_{}", Ksuid::new(None, None))));
            self.dev.flow_scope.coding_subflow_id = id.as_str().unwrap_or_default().to_string();
            let subflow = self.subflow_record(
                self.dev.flow_scope.coding_subflow_id.clone(),
                "Coding".to_string(),
                Some("coding".to_string()),
                String::new(),
                SubflowStatus::Started,
            );
            actions.push(self.persist_subflow(subflow));
        }

        self.phase = Phase::PreparingContext;
        let input = json!({
            "env": self.dev.env,
            "requirements": self.requirements,
        });
        let action = self.schedule_tracked(
            ctx,
            "prepare-context",
            PrepareCodeContextActivity::TYPE,
            input,
            "prepare_context",
            json!({}),
        );
        actions.push(action);
        actions
    }

    /// One pass through the loop head: guidance escalation, the attempt cap,
    /// then an edit.
    fn start_iteration(&mut self, ctx: &mut WorkflowContext) -> Vec<WorkflowAction> {
        let mut actions = vec![self.open_iteration_subflow(ctx)];

        if self.attempt > 0 && self.attempt % 3 == 0 {
            // Collect the latest diff before asking for help; it may have
            // changed since the last attempt.
            self.phase = Phase::CollectingGuidanceDiff;
            let input = json!({ "env": self.dev.env });
            actions.push(self.schedule_plain("guidance-diff", GitDiffActivity::TYPE, input));
            return actions;
        }

        if self.attempt >= self.dev.max_attempts {
            return self.close_failed(
                ctx,
                "failed to author code passing tests and fulfilling requirements, max attempts reached"
                    .to_string(),
            );
        }

        actions.extend(self.schedule_edit(ctx));
        actions
    }

    fn schedule_edit(&mut self, ctx: &mut WorkflowContext) -> Vec<WorkflowAction> {
        self.phase = Phase::Editing;
        let model_config =
            self.dev.model_resolver
                .get_model_config(ModelKey::Coding, self.attempt / 3, "default");
        let input = json!({
            "env": self.dev.env,
            "request": {
                "modelConfig": model_config,
                "contextSizeExtension": self.context_size_extension,
                "chatHistory": self.chat_history,
                "promptInfo": self.prompt_info,
            },
        });
        vec![self.schedule_tracked(
            ctx,
            "edit",
            EditCodeActivity::TYPE,
            input,
            "edit_code",
            json!({ "attempt": self.attempt + 1 }),
        )]
    }

    fn schedule_tests(&mut self, ctx: &WorkflowContext) -> Vec<WorkflowAction> {
        self.phase = Phase::Testing;
        let input = json!({
            "env": self.dev.env,
            "commands": self.dev.repo_config.test_commands,
        });
        vec![self.schedule_tracked(
            ctx,
            "test",
            RunTestsActivity::TYPE,
            input,
            "run_tests",
            json!({}),
        )]
    }

    fn schedule_criteria_check(&mut self, ctx: &WorkflowContext) -> Vec<WorkflowAction> {
        self.phase = Phase::CheckingCriteria;
        let input = json!({
            "env": self.dev.env,
            "requirements": self.requirements,
        });
        vec![self.schedule_tracked(
            ctx,
            "check-criteria",
            CheckCriteriaActivity::TYPE,
            input,
            "check_criteria",
            json!({}),
        )]
    }

    /// Tests or criteria said no: carry feedback into the next attempt.
    fn next_attempt(&mut self, ctx: &mut WorkflowContext) -> Vec<WorkflowAction> {
        self.attempt += 1;
        let mut actions = vec![];
        if let Some(action) = self.close_iteration_subflow(SubflowStatus::Complete) {
            actions.push(action);
        }
        actions.extend(self.start_iteration(ctx));
        actions
    }

    fn schedule_format(&mut self, ctx: &WorkflowContext) -> Vec<WorkflowAction> {
        self.phase = Phase::Formatting;
        let input = json!({
            "env": self.dev.env,
            "formatters": self.dev.repo_config.formatters,
        });
        vec![self.schedule_tracked(
            ctx,
            "format",
            AutoFormatActivity::TYPE,
            input,
            "auto_format",
            json!({}),
        )]
    }

    // ------------------------------------------------------------------
    // Merge
    // ------------------------------------------------------------------

    fn after_format(&mut self, ctx: &mut WorkflowContext) -> Vec<WorkflowAction> {
        let merge_version = ctx.version("git-worktree-merge", 0, 1);
        if self.input.options.env_type != EnvType::LocalGitWorktree || merge_version != 1 {
            let result = self.last_test_result.output.clone();
            return self.close_completed(ctx, result);
        }

        if ctx.version("git-add-before-diff", 0, 1) == 1 {
            // Stage the auto-format output so the approval diff shows it.
            self.phase = Phase::StagingChanges;
            let input = json!({ "env": self.dev.env });
            return vec![self.schedule_plain("git-add", GitAddActivity::TYPE, input)];
        }

        self.schedule_merge_diff()
    }

    fn schedule_merge_diff(&mut self) -> Vec<WorkflowAction> {
        self.phase = Phase::DiffingForMerge;
        let input = json!({ "env": self.dev.env });
        vec![self.schedule_plain("merge-diff", GitDiffActivity::TYPE, input)]
    }

    fn request_merge_approval(
        &mut self,
        ctx: &mut WorkflowContext,
        diff: String,
    ) -> Vec<WorkflowAction> {
        let default_target = self
            .input
            .options
            .start_branch
            .clone()
            .unwrap_or_else(|| "main".to_string());
        self.merge_target = default_target.clone();
        let source_branch = self
            .dev
            .worktree
            .as_ref()
            .map(|w| w.name.clone())
            .unwrap_or_default();

        let request = merge_approval_request(
            ctx.workflow_id(),
            "Please approve before we merge",
            json!({
                "mergeApprovalInfo": {
                    "sourceBranch": source_branch,
                    "defaultTargetBranch": default_target,
                    "diff": diff,
                },
            }),
        );
        self.phase = Phase::AwaitingMergeApproval;
        self.send_user_request(ctx, request, "user_request")
    }

    fn schedule_commit(&mut self) -> Vec<WorkflowAction> {
        self.phase = Phase::Committing;
        let input = json!({
            "env": self.dev.env,
            "commit_message": commit_message(&self.requirements),
        });
        vec![self.schedule_plain("commit", GitCommitActivity::TYPE, input)]
    }

    fn schedule_merge(&mut self, ctx: &WorkflowContext) -> Vec<WorkflowAction> {
        self.phase = Phase::Merging;
        let source_branch = self
            .dev
            .worktree
            .as_ref()
            .map(|w| w.name.clone())
            .unwrap_or_default();
        let input = json!({
            "env": self.dev.env,
            "source_branch": source_branch,
            "target_branch": self.merge_target,
        });
        vec![self.schedule_tracked(
            ctx,
            "merge",
            GitMergeActivity::TYPE,
            input,
            "merge",
            json!({
                "sourceBranch": source_branch,
                "targetBranch": self.merge_target,
            }),
        )]
    }

    fn schedule_cleanup(&mut self, ctx: &WorkflowContext) -> Vec<WorkflowAction> {
        self.phase = Phase::CleaningWorktree;
        let Some(worktree) = self.dev.worktree.clone() else {
            return vec![];
        };
        let input = json!({
            "workspace_id": self.input.workspace_id,
            "worktree": worktree,
            "env": self.dev.env,
        });
        vec![self.schedule_tracked(
            ctx,
            "cleanup",
            CleanupWorktreeActivity::TYPE,
            input,
            "cleanup_worktree",
            json!({}),
        )]
    }

    // ------------------------------------------------------------------
    // User requests
    // ------------------------------------------------------------------

    fn send_user_request(
        &mut self,
        ctx: &mut WorkflowContext,
        request: RequestForUser,
        action_type: &str,
    ) -> Vec<WorkflowAction> {
        let activity_id = self.next_id("user-request");
        let action_id = flow_action_id(ctx.workflow_id(), &activity_id);
        self.pending_request_action_id = Some(action_id.clone());

        vec![
            WorkflowAction::ScheduleActivity {
                activity_id,
                activity_type: RecordUserRequestActivity::TYPE.to_string(),
                input: json!({
                    "action_id": action_id,
                    "workspace_id": self.input.workspace_id,
                    "flow_id": ctx.workflow_id(),
                    "subflow_id": self.current_subflow_id(),
                    "action_type": action_type,
                    "action_params": {
                        "requestKind": request.request_kind,
                        "content": request.content,
                        "requestParams": request.request_params,
                    },
                }),
                options: ActivityOptions::default(),
            },
            WorkflowAction::signal_external(
                manager_workflow_id(&self.input.workspace_id),
                request_for_user_signal(&request),
            ),
        ]
    }

    fn resolve_user_request(&mut self, response: &UserResponse) -> Vec<WorkflowAction> {
        let Some(action_id) = self.pending_request_action_id.take() else {
            return vec![];
        };
        vec![self.schedule_plain(
            "user-resolve",
            ResolveUserRequestActivity::TYPE,
            json!({
                "workspace_id": self.input.workspace_id,
                "action_id": action_id,
                "response": response,
            }),
        )]
    }

    fn handle_user_response(
        &mut self,
        ctx: &mut WorkflowContext,
        response: UserResponse,
    ) -> Vec<WorkflowAction> {
        if response.target_workflow_id != ctx.workflow_id() {
            // Misrouted or duplicate delivery; drop it.
            warn!(target = %response.target_workflow_id, "ignoring user response for another workflow");
            return vec![];
        }
        if self.pending_request_action_id.is_none() {
            return vec![];
        }

        let mut actions = self.resolve_user_request(&response);
        match self.phase {
            Phase::AwaitingGuidance => {
                self.prompt_info = PromptInfo::UserGuidance {
                    prompt: response.content.unwrap_or_default(),
                };
                if self.attempt >= self.dev.max_attempts {
                    return self.close_failed(
                        ctx,
                        "failed to author code passing tests and fulfilling requirements, max attempts reached"
                            .to_string(),
                    );
                }
                actions.extend(self.schedule_edit(ctx));
            }
            Phase::AwaitingMergeApproval => {
                if response.approved == Some(true) {
                    if let Some(target) = response
                        .params
                        .get("targetBranch")
                        .and_then(|v| v.as_str())
                    {
                        self.merge_target = target.to_string();
                    }
                    actions.extend(self.schedule_commit());
                } else {
                    // Declined merges leave the worktree in place and the
                    // work completed.
                    let result = self.last_test_result.output.clone();
                    return self.close_completed(ctx, result);
                }
            }
            Phase::AwaitingConflictResolution => {
                let result = self.last_test_result.output.clone();
                return self.close_completed(ctx, result);
            }
            _ => {
                warn!("user response received outside a waiting phase");
            }
        }
        actions
    }
}

/// Derive a commit message from the requirements: the first line after the
/// `Overview:` header (when present), capped at 100 characters.
fn commit_message(requirements: &str) -> String {
    let mut text = requirements.trim();
    if let Some((_, after)) = text.split_once("Overview:\n") {
        text = after.trim();
    }
    let line = text.lines().next().unwrap_or("").trim();
    if line.chars().count() > 100 {
        let truncated: String = line.chars().take(100).collect();
        format!("{truncated}...")
    } else {
        line.to_string()
    }
}

impl Workflow for BasicDevWorkflow {
    const TYPE: &'static str = "basic_dev";
    type Input = BasicDevWorkflowInput;
    type Output = String;

    fn new(input: Self::Input) -> Self {
        Self {
            dev: DevContext::new(input.workspace_id.clone(), input.repo_dir.clone()),
            requirements: input.requirements.clone(),
            prompt_info: PromptInfo::Skip,
            input,
            phase: Phase::LoadingConfig,
            seq: 0,
            attempt: 0,
            context_size_extension: 0,
            chat_history: vec![],
            last_test_result: TestResult::default(),
            last_fulfillment: None,
            merge_target: String::new(),
            pending_request_action_id: None,
            stash: vec![],
            outcome: None,
        }
    }

    fn on_start(&mut self, ctx: &mut WorkflowContext) -> Vec<WorkflowAction> {
        self.dev.flow_id = ctx.workflow_id().to_string();
        self.phase = Phase::LoadingConfig;
        let input = json!({ "repo_dir": self.input.repo_dir });
        vec![self.schedule_plain("load-config", LoadRepoConfigActivity::TYPE, input)]
    }

    fn on_activity_completed(
        &mut self,
        ctx: &mut WorkflowContext,
        activity_id: &str,
        result: serde_json::Value,
    ) -> Vec<WorkflowAction> {
        let kind = activity_id.rsplit_once('-').map(|(k, _)| k).unwrap_or(activity_id);

        // Bookkeeping activities have no bearing on control flow.
        if matches!(kind, "subflow" | "user-resolve" | "user-request") {
            return vec![];
        }

        let actions = match kind {
            "load-config" => {
                match serde_json::from_value::<RepoConfig>(result) {
                    Ok(config) => {
                        self.dev.max_attempts = if config.max_iterations > 0 {
                            config.max_iterations
                        } else {
                            DEFAULT_MAX_ATTEMPTS
                        };
                        self.dev.model_resolver = ModelConfigResolver::new(config.ai.default.clone());
                        self.dev.repo_config = config;
                    }
                    Err(e) => {
                        return self.close_failed(ctx, format!("failed to load repo config: {e}"))
                    }
                }

                if self.input.options.env_type == EnvType::LocalGitWorktree {
                    self.phase = Phase::CreatingWorktree;
                    let input = json!({
                        "workspace_id": self.input.workspace_id,
                        "flow_id": ctx.workflow_id(),
                        "repo_dir": self.input.repo_dir,
                        "start_branch": self.input.options.start_branch,
                    });
                    vec![self.schedule_plain(
                        "create-worktree",
                        CreateWorktreeActivity::TYPE,
                        input,
                    )]
                } else if self.input.options.determine_requirements {
                    self.phase = Phase::BuildingRequirements;
                    let input = json!({
                        "env": self.dev.env,
                        "requirements": self.requirements,
                    });
                    vec![self.schedule_plain(
                        "build-requirements",
                        BuildDevRequirementsActivity::TYPE,
                        input,
                    )]
                } else {
                    self.start_coding_phase(ctx)
                }
            }

            "create-worktree" => match serde_json::from_value::<CreateWorktreeOutput>(result) {
                Ok(output) => {
                    self.dev.env = output.env;
                    self.dev.worktree = Some(output.worktree);
                    if self.input.options.determine_requirements {
                        self.phase = Phase::BuildingRequirements;
                        let input = json!({
                            "env": self.dev.env,
                            "requirements": self.requirements,
                        });
                        vec![self.schedule_plain(
                            "build-requirements",
                            BuildDevRequirementsActivity::TYPE,
                            input,
                        )]
                    } else {
                        self.start_coding_phase(ctx)
                    }
                }
                Err(e) => self.close_failed(ctx, format!("failed to create worktree: {e}")),
            },

            "build-requirements" => match serde_json::from_value::<DevRequirements>(result) {
                Ok(requirements) => {
                    self.requirements = requirements.to_string();
                    self.start_coding_phase(ctx)
                }
                Err(e) => self.close_failed(ctx, format!("failed to build requirements: {e}")),
            },

            "prepare-context" => match serde_json::from_value::<CodeContext>(result) {
                Ok(context) => {
                    self.context_size_extension = context
                        .full_code_context
                        .len()
                        .saturating_sub(context.code_context.len());
                    self.prompt_info = PromptInfo::InitialCode {
                        code_context: context.code_context,
                        requirements: self.requirements.clone(),
                    };
                    self.start_iteration(ctx)
                }
                Err(e) => self.close_failed(ctx, format!("failed to prepare code context: {e}")),
            },

            "edit" => self.schedule_tests(ctx),

            "test" => match serde_json::from_value::<TestResult>(result) {
                Ok(test_result) => {
                    self.last_test_result = test_result.clone();
                    if !test_result.tests_passed {
                        self.prompt_info = PromptInfo::Feedback {
                            feedback: test_result.output,
                        };
                        self.next_attempt(ctx)
                    } else if !self.dev.repo_config.integration_test_commands.is_empty() {
                        self.phase = Phase::IntegrationTesting;
                        let input = json!({
                            "env": self.dev.env,
                            "commands": self.dev.repo_config.integration_test_commands,
                        });
                        vec![self.schedule_tracked(
                            ctx,
                            "integration-test",
                            RunTestsActivity::TYPE,
                            input,
                            "run_integration_tests",
                            json!({}),
                        )]
                    } else {
                        self.schedule_criteria_check(ctx)
                    }
                }
                Err(e) => self.close_failed(ctx, format!("failed to run tests: {e}")),
            },

            "integration-test" => match serde_json::from_value::<TestResult>(result) {
                Ok(test_result) => {
                    if !test_result.tests_passed {
                        self.prompt_info = PromptInfo::Feedback {
                            feedback: test_result.output.clone(),
                        };
                        self.last_test_result = test_result;
                        self.next_attempt(ctx)
                    } else {
                        self.schedule_criteria_check(ctx)
                    }
                }
                Err(e) => {
                    self.close_failed(ctx, format!("failed to run integration tests: {e}"))
                }
            },

            "check-criteria" => match serde_json::from_value::<CriteriaFulfillment>(result) {
                Ok(fulfillment) => {
                    self.last_fulfillment = Some(fulfillment.clone());
                    if fulfillment.is_fulfilled {
                        self.schedule_format(ctx)
                    } else {
                        // The fulfillment analysis goes straight into the
                        // chat history as the assistant's own words, so the
                        // next turn continues from it instead of asking for
                        // help it already has.
                        self.chat_history.push(ChatMessage::user(format!(
                            "Here is the diff:\n\n  [...] (Omitted for length)\n\n\
                             And here are test results:\n\n  Tests Passed: {}\n  [...] (Omitted for length)\n\n\
                             Please analyze whether the requirements have been fulfilled. \
                             If not, continue editing code as needed.",
                            self.last_test_result.tests_passed
                        )));
                        self.chat_history.push(ChatMessage::assistant(format!(
                            "The requirements were not fulfilled.\n\nAnalysis: {}\n\nFeedback: {}",
                            fulfillment.analysis, fulfillment.feedback_message
                        )));
                        self.prompt_info = PromptInfo::Skip;
                        self.next_attempt(ctx)
                    }
                }
                Err(e) => self.close_failed(
                    ctx,
                    format!("failed to check if requirements are fulfilled: {e}"),
                ),
            },

            "guidance-diff" => {
                let diff = result
                    .get("diff")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let request = guidance_request(
                    ctx.workflow_id(),
                    "Failing repeatedly to pass tests and/or fulfill requirements, please provide guidance.",
                    json!({
                        "gitDiff": diff,
                        "testResult": self.last_test_result,
                        "fulfillment": self.last_fulfillment,
                    }),
                );
                self.phase = Phase::AwaitingGuidance;
                self.send_user_request(ctx, request, "user_request")
            }

            "format" => self.after_format(ctx),

            "git-add" => self.schedule_merge_diff(),

            "merge-diff" => {
                let diff = result
                    .get("diff")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                self.request_merge_approval(ctx, diff)
            }

            "commit" => self.schedule_merge(ctx),

            "merge" => match serde_json::from_value::<MergeResult>(result) {
                Ok(merge) => {
                    if merge.has_conflicts {
                        let request = continue_request(
                            ctx.workflow_id(),
                            "Merge conflicts detected. Please resolve conflicts and continue when done.",
                            "done",
                        );
                        self.phase = Phase::AwaitingConflictResolution;
                        self.send_user_request(ctx, request, "user_request.continue")
                    } else {
                        self.schedule_cleanup(ctx)
                    }
                }
                Err(e) => self.close_failed(ctx, format!("failed to merge branches: {e}")),
            },

            "cleanup" => {
                let result = self.last_test_result.output.clone();
                self.close_completed(ctx, result)
            }

            other => {
                warn!(activity_id = other, "completion for unknown activity kind");
                vec![]
            }
        };
        self.emit(actions)
    }

    fn on_activity_failed(
        &mut self,
        ctx: &mut WorkflowContext,
        activity_id: &str,
        error: &ActivityError,
    ) -> Vec<WorkflowAction> {
        let kind = activity_id.rsplit_once('-').map(|(k, _)| k).unwrap_or(activity_id);
        let actions = match kind {
            // Bookkeeping failures must not take the flow down.
            "subflow" | "user-resolve" | "user-request" => {
                warn!(%activity_id, error = %error.message, "bookkeeping activity failed");
                vec![]
            }
            // A failed cleanup after a successful merge is logged, not fatal.
            "cleanup" => {
                warn!(error = %error.message, "failed to cleanup worktree");
                let result = self.last_test_result.output.clone();
                self.close_completed(ctx, result)
            }
            "load-config" => {
                self.close_failed(ctx, format!("failed to load repo config: {}", error.message))
            }
            "create-worktree" => {
                self.close_failed(ctx, format!("failed to create worktree: {}", error.message))
            }
            "edit" => self.close_failed(
                ctx,
                format!("failed to write edit blocks: {}", error.message),
            ),
            "test" | "integration-test" => {
                self.close_failed(ctx, format!("failed to run tests: {}", error.message))
            }
            "check-criteria" => self.close_failed(
                ctx,
                format!(
                    "failed to check if requirements are fulfilled: {}",
                    error.message
                ),
            ),
            "merge" => {
                self.close_failed(ctx, format!("failed to merge branches: {}", error.message))
            }
            _ => self.close_failed(ctx, format!("failed to {kind}: {}", error.message)),
        };
        self.emit(actions)
    }

    fn on_signal(
        &mut self,
        ctx: &mut WorkflowContext,
        signal: &WorkflowSignal,
    ) -> Vec<WorkflowAction> {
        match signal.signal_type.as_str() {
            signal_names::USER_RESPONSE => {
                let response: UserResponse = match serde_json::from_value(signal.payload.clone()) {
                    Ok(response) => response,
                    Err(e) => {
                        warn!(error = %e, "ignoring malformed userResponse signal");
                        return vec![];
                    }
                };
                let actions = self.handle_user_response(ctx, response);
                self.emit(actions)
            }
            signal_names::PAUSE => {
                self.dev.global.paused = true;
                vec![]
            }
            signal_names::USER_ACTION => {
                match signal.payload.get("action").and_then(|v| v.as_str()) {
                    Some("resume") => {
                        self.dev.global.paused = false;
                        std::mem::take(&mut self.stash)
                    }
                    Some("cancel") => self.close_cancelled(ctx, "cancelled by user"),
                    other => {
                        warn!(action = ?other, "ignoring unknown user action");
                        vec![]
                    }
                }
            }
            other => {
                warn!(signal_type = other, "ignoring unknown signal");
                vec![]
            }
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
        self.close_cancelled(ctx, reason)
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_message_prefers_overview() {
        let requirements = "Some preamble\nOverview:\nAdd a health endpoint\nMore detail here";
        assert_eq!(commit_message(requirements), "Add a health endpoint");
    }

    #[test]
    fn test_commit_message_truncates_at_100_chars() {
        let long = "x".repeat(150);
        let message = commit_message(&long);
        assert_eq!(message.chars().count(), 103);
        assert!(message.ends_with("..."));
    }

    #[test]
    fn test_commit_message_takes_first_line() {
        assert_eq!(commit_message("fix the bug\nand more"), "fix the bug");
    }

    #[test]
    fn test_iteration_subflow_naming() {
        let mut workflow = BasicDevWorkflow::new(BasicDevWorkflowInput {
            workspace_id: "ws_1".to_string(),
            repo_dir: "/tmp/repo".to_string(),
            requirements: "reqs".to_string(),
            options: BasicDevOptions::default(),
        });
        assert_eq!(workflow.iteration_subflow_name(), "Basic Dev");
        workflow.attempt = 1;
        assert_eq!(workflow.iteration_subflow_name(), "Basic Dev (2)");
        workflow.attempt = 4;
        assert_eq!(workflow.iteration_subflow_name(), "Basic Dev (5)");
    }

    fn driven_workflow() -> (BasicDevWorkflow, WorkflowContext) {
        let workflow = BasicDevWorkflow::new(BasicDevWorkflowInput {
            workspace_id: "ws_1".to_string(),
            repo_dir: "/tmp/repo".to_string(),
            requirements: "add a health endpoint".to_string(),
            options: BasicDevOptions::default(),
        });
        let ctx = WorkflowContext::new(
            "flow_test".to_string(),
            Default::default(),
            Default::default(),
        );
        (workflow, ctx)
    }

    fn repo_config_json() -> serde_json::Value {
        json!({
            "test_commands": [{ "command": "true" }],
            "integration_test_commands": [],
            "ai": { "default": [] },
            "max_iterations": 0,
            "formatters": [],
        })
    }

    #[test]
    fn test_pause_stashes_actions_until_resume() {
        let (mut workflow, mut ctx) = driven_workflow();

        let actions = workflow.on_start(&mut ctx);
        let WorkflowAction::ScheduleActivity { activity_id, .. } = &actions[0] else {
            panic!("expected load-config schedule");
        };
        let load_config_id = activity_id.clone();

        let actions = workflow.on_activity_completed(&mut ctx, &load_config_id, repo_config_json());
        let prepare_id = actions
            .iter()
            .find_map(|action| match action {
                WorkflowAction::ScheduleActivity { activity_id, activity_type, .. }
                    if activity_type == "prepare_code_context" =>
                {
                    Some(activity_id.clone())
                }
                _ => None,
            })
            .expect("prepare-context scheduled");

        // Pause, then let the in-flight activity complete: its follow-up
        // work is stashed, not emitted.
        let pause = WorkflowSignal::new(signal_names::PAUSE, json!({}));
        assert!(workflow.on_signal(&mut ctx, &pause).is_empty());

        let context_result = json!({ "codeContext": "ctx", "fullCodeContext": "ctx" });
        let actions = workflow.on_activity_completed(&mut ctx, &prepare_id, context_result);
        assert!(actions.is_empty());

        // Resume releases the stash in order, ending with the first edit.
        let resume = WorkflowSignal::new(signal_names::USER_ACTION, json!({ "action": "resume" }));
        let actions = workflow.on_signal(&mut ctx, &resume);
        assert!(!actions.is_empty());
        assert!(actions.iter().any(|action| matches!(
            action,
            WorkflowAction::ScheduleActivity { activity_type, .. } if activity_type == "edit_code"
        )));
    }

    #[test]
    fn test_cancel_emits_closure_signal_before_terminating() {
        let (mut workflow, mut ctx) = driven_workflow();
        workflow.on_start(&mut ctx);

        let actions = workflow.on_cancel_requested(&mut ctx, "user requested");
        assert_eq!(actions.len(), 2);
        let WorkflowAction::SignalExternalWorkflow { workflow_id, signal } = &actions[0] else {
            panic!("expected closure signal first, got {actions:?}");
        };
        assert_eq!(workflow_id, &manager_workflow_id("ws_1"));
        assert_eq!(signal.signal_type, signal_names::WORKFLOW_CLOSED);
        assert_eq!(signal.payload["reason"], "cancelled");
        assert!(matches!(
            &actions[1],
            WorkflowAction::CancelWorkflow { .. }
        ));

        // Already closed: a second cancel is a no-op.
        assert!(workflow.on_cancel_requested(&mut ctx, "again").is_empty());
    }

    #[test]
    fn test_input_flattens_options() {
        let json = serde_json::json!({
            "workspaceId": "ws_1",
            "repoDir": "/tmp/repo",
            "requirements": "do the thing",
            "determineRequirements": true,
            "envType": "local_git_worktree",
            "startBranch": "develop",
        });
        let input: BasicDevWorkflowInput = serde_json::from_value(json).unwrap();
        assert!(input.options.determine_requirements);
        assert_eq!(input.options.env_type, EnvType::LocalGitWorktree);
        assert_eq!(input.options.start_branch.as_deref(), Some("develop"));
    }
}
