//! Per-workspace runtime
//!
//! Wires storage, streaming, the workflow engine, the activity workers and
//! the manager workflow together. The manager runs on the
//! `default-<workspaceId>` queue; dev flows run on the workspace queue with
//! flow-action tracking attached to their worker.

use std::sync::Arc;

use sidekick_domain::{Flow, Storage, Streamer, UserResponse};
use sidekick_durable::{
    ActivityRegistry, ExecutorError, InMemoryWorkflowEventStore, StartWorkflowOptions, StoreError,
    Worker, WorkerConfig, WorkerHandle, WorkflowExecutor, WorkflowRegistry, WorkflowSignal,
};

use crate::activities::coding::{
    AutoFormatActivity, BuildDevRequirementsActivity, CheckCriteriaActivity, EditCodeActivity,
    LoadRepoConfigActivity, PrepareCodeContextActivity, RunTestsActivity,
};
use crate::activities::git::{
    CleanupWorktreeActivity, CreateWorktreeActivity, GitAddActivity, GitCommitActivity,
    GitDiffActivity, GitMergeActivity,
};
use crate::activities::manager::{
    CompleteFlowParentTaskActivity, CreatePendingUserRequestActivity, FindWorkspaceActivity,
    GetFlowActivity, GetFlowsForTaskActivity, PersistFlowActivity,
    UpdateTaskForUserRequestActivity,
};
use crate::activities::tracking::{
    PersistSubflowActivity, RecordUserRequestActivity, ResolveUserRequestActivity,
};
use crate::basic_dev::BasicDevWorkflow;
use crate::coding_agent::CodingAgent;
use crate::manager::{
    manager_task_queue, manager_workflow_id, CancelSignal, DevAgentManagerInput,
    DevAgentManagerWorkflow, WorkRequest, UPDATE_NAME_WORK_REQUEST,
};
use crate::planned_dev::PlannedDevWorkflow;
use crate::track::FlowActionTracker;
use crate::user_request::{signal_names, user_response_signal};

pub struct DevAgentRuntime {
    workspace_id: String,
    storage: Arc<dyn Storage>,
    streamer: Arc<dyn Streamer>,
    executor: Arc<WorkflowExecutor<InMemoryWorkflowEventStore>>,
    workers: Vec<WorkerHandle>,
}

impl DevAgentRuntime {
    /// Boot the engine, both workers, and the manager workflow for one
    /// workspace. Starting an already-running manager is a no-op.
    pub async fn start(
        storage: Arc<dyn Storage>,
        streamer: Arc<dyn Streamer>,
        agent: Arc<dyn CodingAgent>,
        workspace_id: &str,
    ) -> anyhow::Result<Self> {
        let mut workflows = WorkflowRegistry::new();
        workflows.register::<DevAgentManagerWorkflow>();
        workflows.register::<BasicDevWorkflow>();
        workflows.register::<PlannedDevWorkflow>();

        let executor = Arc::new(WorkflowExecutor::new(
            Arc::new(InMemoryWorkflowEventStore::new()),
            workflows,
        ));

        let mut manager_activities = ActivityRegistry::new();
        manager_activities.register(FindWorkspaceActivity {
            storage: storage.clone(),
        });
        manager_activities.register(PersistFlowActivity {
            storage: storage.clone(),
        });
        manager_activities.register(GetFlowActivity {
            storage: storage.clone(),
        });
        manager_activities.register(GetFlowsForTaskActivity {
            storage: storage.clone(),
        });
        manager_activities.register(CreatePendingUserRequestActivity {
            storage: storage.clone(),
        });
        manager_activities.register(UpdateTaskForUserRequestActivity {
            storage: storage.clone(),
            streamer: streamer.clone(),
        });
        manager_activities.register(CompleteFlowParentTaskActivity {
            storage: storage.clone(),
            streamer: streamer.clone(),
        });

        let mut dev_activities = ActivityRegistry::new();
        dev_activities.register(LoadRepoConfigActivity);
        dev_activities.register(BuildDevRequirementsActivity {
            agent: agent.clone(),
        });
        dev_activities.register(PrepareCodeContextActivity {
            agent: agent.clone(),
        });
        dev_activities.register(EditCodeActivity {
            agent: agent.clone(),
        });
        dev_activities.register(RunTestsActivity);
        dev_activities.register(CheckCriteriaActivity { agent });
        dev_activities.register(AutoFormatActivity);
        dev_activities.register(CreateWorktreeActivity {
            storage: storage.clone(),
        });
        dev_activities.register(CleanupWorktreeActivity {
            storage: storage.clone(),
        });
        dev_activities.register(GitDiffActivity);
        dev_activities.register(GitAddActivity);
        dev_activities.register(GitCommitActivity);
        dev_activities.register(GitMergeActivity);
        dev_activities.register(PersistSubflowActivity {
            storage: storage.clone(),
        });
        dev_activities.register(RecordUserRequestActivity {
            storage: storage.clone(),
            streamer: streamer.clone(),
        });
        dev_activities.register(ResolveUserRequestActivity {
            storage: storage.clone(),
            streamer: streamer.clone(),
        });

        let tracker = Arc::new(FlowActionTracker::new(storage.clone(), streamer.clone()));

        let manager_worker = Worker::new(
            executor.clone(),
            Arc::new(manager_activities),
            WorkerConfig::new(manager_task_queue(workspace_id)),
        )
        .start();
        let dev_worker = Worker::new(
            executor.clone(),
            Arc::new(dev_activities),
            WorkerConfig::new(workspace_id),
        )
        .with_interceptor(tracker)
        .start();

        let start = executor
            .start_workflow::<DevAgentManagerWorkflow>(
                &manager_workflow_id(workspace_id),
                DevAgentManagerInput::new(workspace_id),
                StartWorkflowOptions {
                    task_queue: manager_task_queue(workspace_id),
                    parent: None,
                },
            )
            .await;
        match start {
            Ok(()) | Err(ExecutorError::Store(StoreError::WorkflowAlreadyExists(_))) => {}
            Err(e) => return Err(e.into()),
        }

        Ok(Self {
            workspace_id: workspace_id.to_string(),
            storage,
            streamer,
            executor,
            workers: vec![manager_worker, dev_worker],
        })
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn streamer(&self) -> &Arc<dyn Streamer> {
        &self.streamer
    }

    pub fn executor(&self) -> &Arc<WorkflowExecutor<InMemoryWorkflowEventStore>> {
        &self.executor
    }

    /// Start a flow via the manager's `workRequest` update. Returns once the
    /// flow workflow has started and its Flow record is persisted.
    pub async fn submit_work_request(&self, request: WorkRequest) -> anyhow::Result<Flow> {
        let result = self
            .executor
            .execute_update(
                &manager_workflow_id(&self.workspace_id),
                UPDATE_NAME_WORK_REQUEST,
                serde_json::to_value(&request)?,
            )
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Ask the manager to cancel a flow.
    pub async fn cancel_flow(&self, workflow_id: &str) -> anyhow::Result<()> {
        self.executor
            .signal_workflow(
                &manager_workflow_id(&self.workspace_id),
                WorkflowSignal::new(
                    signal_names::CANCEL,
                    serde_json::to_value(CancelSignal {
                        workflow_id: workflow_id.to_string(),
                    })?,
                ),
            )
            .await?;
        Ok(())
    }

    /// Relay a user's answer through the manager to the asking flow.
    pub async fn send_user_response(&self, response: UserResponse) -> anyhow::Result<()> {
        self.executor
            .signal_workflow(
                &manager_workflow_id(&self.workspace_id),
                user_response_signal(&response),
            )
            .await?;
        Ok(())
    }

    pub async fn shutdown(self) {
        for worker in self.workers {
            worker.shutdown().await;
        }
    }
}
