//! Workflow executor with replay support
//!
//! The executor drives workflow state machines: it rebuilds workflow state
//! by replaying the event history, dispatches new events to the matching
//! handler, and turns the returned actions into persisted events, queued
//! activity tasks, child executions, external signals, update responses and
//! continue-as-new restarts.
//!
//! All cross-workflow effects (starting children, signaling other
//! executions) go through an explicit work queue instead of recursion, so a
//! signal storm between workflows cannot overflow the stack, and each work
//! item holds exactly one per-workflow lock at a time.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::activity::ActivityError;
use crate::persistence::{
    ParentRef, StartWorkflowOptions, StoreError, TaskDefinition, WorkflowEventStore, WorkflowInfo,
    WorkflowStatus,
};
use crate::workflow::{
    ChildWorkflowOutcome, Workflow, WorkflowAction, WorkflowContext, WorkflowError, WorkflowEvent,
    WorkflowSignal, WorkflowUpdate,
};

use super::registry::{AnyWorkflow, RegistryError, WorkflowRegistry};

/// Errors from executor operations.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("workflow {0} already closed")]
    WorkflowClosed(String),

    #[error("update failed: {0}")]
    UpdateFailed(WorkflowError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Unit of work on the executor's queue.
enum WorkItem {
    /// Run `on_start` of a freshly written history and process its actions.
    Start { workflow_id: String },

    /// Append one event and dispatch it to the workflow.
    Dispatch {
        workflow_id: String,
        event: WorkflowEvent,
    },

    /// Deliver the next pending signal, if any.
    Drain { workflow_id: String },
}

type UpdateWaiter = oneshot::Sender<Result<serde_json::Value, WorkflowError>>;

pub struct WorkflowExecutor<S: WorkflowEventStore> {
    store: Arc<S>,
    registry: WorkflowRegistry,
    /// Callers blocked on `execute_update`, by update id.
    pending_updates: Mutex<HashMap<String, UpdateWaiter>>,
    /// Update ids per workflow, so closing a workflow can release waiters.
    updates_by_workflow: Mutex<HashMap<String, Vec<String>>>,
    /// Per-workflow dispatch locks: workflow code is single-threaded.
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Terminated workflow ids, for workers to cancel running activities.
    terminations: broadcast::Sender<String>,
}

impl<S: WorkflowEventStore> WorkflowExecutor<S> {
    pub fn new(store: Arc<S>, registry: WorkflowRegistry) -> Self {
        let (terminations, _) = broadcast::channel(256);
        Self {
            store,
            registry,
            pending_updates: Mutex::new(HashMap::new()),
            updates_by_workflow: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            terminations,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Terminated workflow ids. Workers use this to cancel in-flight
    /// activities of closed workflows.
    pub fn subscribe_terminations(&self) -> broadcast::Receiver<String> {
        self.terminations.subscribe()
    }

    /// Start a workflow with a caller-chosen execution id.
    #[instrument(skip(self, input, options), fields(workflow_type = W::TYPE))]
    pub async fn start_workflow<W: Workflow>(
        self: &Arc<Self>,
        workflow_id: &str,
        input: W::Input,
        options: StartWorkflowOptions,
    ) -> Result<(), ExecutorError> {
        let input_json = serde_json::to_value(&input)?;
        self.start_workflow_by_type(workflow_id, W::TYPE, input_json, options)
            .await
    }

    pub async fn start_workflow_by_type(
        self: &Arc<Self>,
        workflow_id: &str,
        workflow_type: &str,
        input: serde_json::Value,
        options: StartWorkflowOptions,
    ) -> Result<(), ExecutorError> {
        if !self.registry.contains(workflow_type) {
            return Err(RegistryError::UnknownWorkflowType(workflow_type.to_string()).into());
        }

        info!(%workflow_id, %workflow_type, "starting workflow");
        self.store
            .create_workflow(workflow_id, workflow_type, input.clone(), options)
            .await?;
        self.store
            .append_events(workflow_id, 0, vec![WorkflowEvent::WorkflowStarted { input }])
            .await?;

        self.run(vec![WorkItem::Start {
            workflow_id: workflow_id.to_string(),
        }])
        .await
    }

    pub async fn get_workflow_info(&self, workflow_id: &str) -> Result<WorkflowInfo, ExecutorError> {
        Ok(self.store.get_workflow_info(workflow_id).await?)
    }

    /// Send a signal and process it.
    #[instrument(skip(self, signal))]
    pub async fn signal_workflow(
        self: &Arc<Self>,
        workflow_id: &str,
        signal: WorkflowSignal,
    ) -> Result<(), ExecutorError> {
        let status = self.store.get_workflow_status(workflow_id).await?;
        if status.is_terminal() {
            warn!(%workflow_id, %status, "dropping signal to closed workflow");
            return Err(ExecutorError::WorkflowClosed(workflow_id.to_string()));
        }

        self.store.send_signal(workflow_id, signal).await?;
        self.run(vec![WorkItem::Drain {
            workflow_id: workflow_id.to_string(),
        }])
        .await
    }

    /// Execute an update (request/response RPC into a running workflow).
    ///
    /// Resolves once the workflow issues a `CompleteUpdate` or `FailUpdate`
    /// for this update, which may happen only after intermediate activities
    /// complete.
    #[instrument(skip(self, payload))]
    pub async fn execute_update(
        self: &Arc<Self>,
        workflow_id: &str,
        name: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, ExecutorError> {
        let status = self.store.get_workflow_status(workflow_id).await?;
        if status.is_terminal() {
            return Err(ExecutorError::WorkflowClosed(workflow_id.to_string()));
        }

        let update_id = Uuid::now_v7().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending_updates.lock().insert(update_id.clone(), tx);
        self.updates_by_workflow
            .lock()
            .entry(workflow_id.to_string())
            .or_default()
            .push(update_id.clone());

        let update = WorkflowUpdate {
            update_id,
            name: name.to_string(),
            payload,
        };
        self.run(vec![WorkItem::Dispatch {
            workflow_id: workflow_id.to_string(),
            event: WorkflowEvent::UpdateReceived { update },
        }])
        .await?;

        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(ExecutorError::UpdateFailed(error)),
            Err(_) => Err(ExecutorError::UpdateFailed(WorkflowError::new(
                "update abandoned",
            ))),
        }
    }

    /// Deliver an external cancellation request.
    #[instrument(skip(self))]
    pub async fn request_cancel(
        self: &Arc<Self>,
        workflow_id: &str,
        reason: &str,
    ) -> Result<(), ExecutorError> {
        self.run(vec![WorkItem::Dispatch {
            workflow_id: workflow_id.to_string(),
            event: WorkflowEvent::CancelRequested {
                reason: reason.to_string(),
            },
        }])
        .await
    }

    /// Record that a worker started executing an activity attempt.
    pub async fn record_activity_started(
        self: &Arc<Self>,
        workflow_id: &str,
        activity_id: &str,
        attempt: u32,
        worker_id: &str,
    ) -> Result<(), ExecutorError> {
        let _guard = self.lock(workflow_id).await;
        if self
            .store
            .get_workflow_status(workflow_id)
            .await?
            .is_terminal()
        {
            return Ok(());
        }
        let events = self.store.load_events(workflow_id).await?;
        self.store
            .append_events(
                workflow_id,
                events.len() as i64,
                vec![WorkflowEvent::ActivityStarted {
                    activity_id: activity_id.to_string(),
                    attempt,
                    worker_id: worker_id.to_string(),
                }],
            )
            .await?;
        Ok(())
    }

    /// Handle an activity completion reported by a worker.
    #[instrument(skip(self, result))]
    pub async fn on_activity_completed(
        self: &Arc<Self>,
        workflow_id: &str,
        activity_id: &str,
        result: serde_json::Value,
    ) -> Result<(), ExecutorError> {
        self.run(vec![WorkItem::Dispatch {
            workflow_id: workflow_id.to_string(),
            event: WorkflowEvent::ActivityCompleted {
                activity_id: activity_id.to_string(),
                result,
            },
        }])
        .await
    }

    /// Handle an activity failure reported by a worker. Only final failures
    /// (no retry left) are dispatched to the workflow.
    #[instrument(skip(self, error))]
    pub async fn on_activity_failed(
        self: &Arc<Self>,
        workflow_id: &str,
        activity_id: &str,
        error: ActivityError,
        will_retry: bool,
    ) -> Result<(), ExecutorError> {
        if will_retry {
            // Record the attempt for the history without waking the workflow.
            let _guard = self.lock(workflow_id).await;
            let events = self.store.load_events(workflow_id).await?;
            self.store
                .append_events(
                    workflow_id,
                    events.len() as i64,
                    vec![WorkflowEvent::ActivityFailed {
                        activity_id: activity_id.to_string(),
                        error,
                        will_retry: true,
                    }],
                )
                .await?;
            return Ok(());
        }

        self.run(vec![WorkItem::Dispatch {
            workflow_id: workflow_id.to_string(),
            event: WorkflowEvent::ActivityFailed {
                activity_id: activity_id.to_string(),
                error,
                will_retry: false,
            },
        }])
        .await
    }

    // =========================================================================
    // Internal machinery
    // =========================================================================

    async fn lock(&self, workflow_id: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.locks.lock();
            locks
                .entry(workflow_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        mutex.lock_owned().await
    }

    /// Drive the work queue to exhaustion. Each item locks at most one
    /// workflow; follow-up work (children, signal targets, parents) is
    /// queued, never nested.
    ///
    /// Boxed explicitly (rather than a plain `async fn`) because this
    /// method is re-entered from inside a `tokio::spawn`'d future created
    /// deep in its own call graph (timer firing); without a concrete
    /// return type here, the auto-trait solver can't prove that spawned
    /// future is `Send` due to the resulting cycle.
    fn run<'a>(
        self: &'a Arc<Self>,
        initial: Vec<WorkItem>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), ExecutorError>> + Send + 'a>>
    {
        Box::pin(async move {
            let mut queue: VecDeque<WorkItem> = initial.into();
            while let Some(item) = queue.pop_front() {
                let follow_ups = match item {
                    WorkItem::Start { workflow_id } => self.start_body(&workflow_id).await?,
                    WorkItem::Dispatch { workflow_id, event } => {
                        self.dispatch_event(&workflow_id, event).await?
                    }
                    WorkItem::Drain { workflow_id } => self.drain_one_signal(&workflow_id).await?,
                };
                queue.extend(follow_ups);
            }
            Ok(())
        })
    }

    /// Rebuild a workflow instance from its history.
    async fn replay(
        &self,
        info: &WorkflowInfo,
    ) -> Result<(Box<dyn AnyWorkflow + Send>, WorkflowContext, i64), ExecutorError> {
        let events = self.store.load_events(&info.id).await?;

        let mut effects = VecDeque::new();
        let mut versions = HashMap::new();
        for (_, event) in &events {
            match event {
                WorkflowEvent::SideEffectRecorded { value } => effects.push_back(value.clone()),
                WorkflowEvent::VersionMarked { change_id, version } => {
                    versions.insert(change_id.clone(), *version);
                }
                _ => {}
            }
        }

        let mut ctx = WorkflowContext::new(info.id.clone(), effects, versions);
        ctx.set_replaying(true);
        let mut workflow = self.registry.create(&info.workflow_type, info.input.clone())?;

        for (_, event) in &events {
            // Actions were already processed when the event was first
            // dispatched; replay only rebuilds state.
            let _ = Self::call_handler(workflow.as_mut(), &mut ctx, event);
        }
        // Any markers "recorded" during replay would indicate
        // non-determinism; drop them rather than duplicating history.
        let stray = ctx.take_new_records();
        if !stray.is_empty() {
            warn!(workflow_id = %info.id, count = stray.len(),
                "workflow recorded new markers during replay (non-deterministic history?)");
        }
        ctx.set_replaying(false);

        Ok((workflow, ctx, events.len() as i64))
    }

    /// Dispatch one event to the matching handler. A panicking handler is
    /// converted into a workflow failure instead of poisoning the engine; a
    /// wedged manager would otherwise block all new work.
    fn call_handler(
        workflow: &mut dyn AnyWorkflow,
        ctx: &mut WorkflowContext,
        event: &WorkflowEvent,
    ) -> Vec<WorkflowAction> {
        let dispatch = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            Self::dispatch_handler(workflow, ctx, event)
        }));
        match dispatch {
            Ok(actions) => actions,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(workflow_id = %ctx.workflow_id(), %message, "workflow handler panicked");
                vec![WorkflowAction::FailWorkflow {
                    error: WorkflowError::new(format!("panic: {message}")).with_code("PANIC"),
                }]
            }
        }
    }

    fn dispatch_handler(
        workflow: &mut dyn AnyWorkflow,
        ctx: &mut WorkflowContext,
        event: &WorkflowEvent,
    ) -> Vec<WorkflowAction> {
        match event {
            WorkflowEvent::WorkflowStarted { .. } => workflow.on_start(ctx),
            WorkflowEvent::ActivityCompleted {
                activity_id,
                result,
            } => workflow.on_activity_completed(ctx, activity_id, result.clone()),
            WorkflowEvent::ActivityFailed {
                activity_id,
                error,
                will_retry,
            } => {
                if *will_retry {
                    vec![]
                } else {
                    workflow.on_activity_failed(ctx, activity_id, error)
                }
            }
            WorkflowEvent::TimerFired { timer_id } => workflow.on_timer_fired(ctx, timer_id),
            WorkflowEvent::SignalReceived { signal } => workflow.on_signal(ctx, signal),
            WorkflowEvent::UpdateReceived { update } => workflow.on_update(ctx, update),
            WorkflowEvent::ChildWorkflowStarted { workflow_id } => {
                workflow.on_child_workflow_started(ctx, workflow_id)
            }
            WorkflowEvent::ChildWorkflowClosed {
                workflow_id,
                result,
                error,
            } => {
                let outcome = match error {
                    Some(error) => ChildWorkflowOutcome::Failed(error.clone()),
                    None => ChildWorkflowOutcome::Completed(
                        result.clone().unwrap_or(serde_json::Value::Null),
                    ),
                };
                workflow.on_child_workflow_closed(ctx, workflow_id, &outcome)
            }
            WorkflowEvent::CancelRequested { reason } => workflow.on_cancel_requested(ctx, reason),
            _ => vec![],
        }
    }

    /// Process `on_start` of a history that contains only `WorkflowStarted`.
    /// Used for fresh workflows and after continue-as-new.
    async fn start_body(self: &Arc<Self>, workflow_id: &str) -> Result<Vec<WorkItem>, ExecutorError> {
        let _guard = self.lock(workflow_id).await;
        let info = self.store.get_workflow_info(workflow_id).await?;
        if info.status.is_terminal() {
            return Ok(vec![]);
        }

        let events = self.store.load_events(workflow_id).await?;
        let mut seq = events.len() as i64;

        let mut ctx = WorkflowContext::new(workflow_id.to_string(), VecDeque::new(), HashMap::new());
        let mut workflow = self.registry.create(&info.workflow_type, info.input.clone())?;
        let actions = Self::call_handler(
            workflow.as_mut(),
            &mut ctx,
            &WorkflowEvent::WorkflowStarted {
                input: info.input.clone(),
            },
        );

        let records = ctx.take_new_records();
        if !records.is_empty() {
            seq = self.store.append_events(workflow_id, seq, records).await?;
        }
        self.process_actions(&info, &mut seq, actions).await
    }

    /// Append one event and dispatch it to the workflow's handler.
    async fn dispatch_event(
        self: &Arc<Self>,
        workflow_id: &str,
        event: WorkflowEvent,
    ) -> Result<Vec<WorkItem>, ExecutorError> {
        let _guard = self.lock(workflow_id).await;

        let info = match self.store.get_workflow_info(workflow_id).await {
            Ok(info) => info,
            Err(StoreError::WorkflowNotFound(_)) => {
                warn!(%workflow_id, "dropping event for unknown workflow");
                return Ok(vec![]);
            }
            Err(e) => return Err(e.into()),
        };

        if info.status.is_terminal() {
            debug!(%workflow_id, status = %info.status, "workflow already closed; dropping event");
            // Release any caller still waiting on an update to this workflow.
            if matches!(event, WorkflowEvent::UpdateReceived { .. }) {
                self.resolve_updates_for_workflow(
                    workflow_id,
                    Err(WorkflowError::new("workflow closed")),
                );
            }
            return Ok(vec![]);
        }

        let (mut workflow, mut ctx, mut seq) = self.replay(&info).await?;

        seq = self
            .store
            .append_events(workflow_id, seq, vec![event.clone()])
            .await?;

        let actions = Self::call_handler(workflow.as_mut(), &mut ctx, &event);
        let records = ctx.take_new_records();
        if !records.is_empty() {
            seq = self.store.append_events(workflow_id, seq, records).await?;
        }

        self.process_actions(&info, &mut seq, actions).await
    }

    /// Deliver the oldest pending signal, then requeue a drain for the rest.
    async fn drain_one_signal(
        self: &Arc<Self>,
        workflow_id: &str,
    ) -> Result<Vec<WorkItem>, ExecutorError> {
        let signal = {
            let signals = match self.store.get_pending_signals(workflow_id).await {
                Ok(signals) => signals,
                Err(StoreError::WorkflowNotFound(_)) => {
                    warn!(%workflow_id, "dropping signals for unknown workflow");
                    return Ok(vec![]);
                }
                Err(e) => return Err(e.into()),
            };
            match signals.into_iter().next() {
                Some(signal) => signal,
                None => return Ok(vec![]),
            }
        };

        self.store.mark_signals_processed(workflow_id, 1).await?;
        let mut follow_ups = self
            .dispatch_event(
                workflow_id,
                WorkflowEvent::SignalReceived { signal },
            )
            .await?;
        follow_ups.push(WorkItem::Drain {
            workflow_id: workflow_id.to_string(),
        });
        Ok(follow_ups)
    }

    /// Turn actions into events, tasks, child executions and follow-up work.
    async fn process_actions(
        self: &Arc<Self>,
        info: &WorkflowInfo,
        seq: &mut i64,
        actions: Vec<WorkflowAction>,
    ) -> Result<Vec<WorkItem>, ExecutorError> {
        let workflow_id = &info.id;
        let mut follow_ups = Vec::new();

        for action in actions {
            match action {
                WorkflowAction::ScheduleActivity {
                    activity_id,
                    activity_type,
                    input,
                    options,
                } => {
                    debug!(%workflow_id, %activity_id, %activity_type, "scheduling activity");
                    *seq = self
                        .store
                        .append_events(
                            workflow_id,
                            *seq,
                            vec![WorkflowEvent::ActivityScheduled {
                                activity_id: activity_id.clone(),
                                activity_type: activity_type.clone(),
                                input: input.clone(),
                                options: options.clone(),
                            }],
                        )
                        .await?;

                    self.store
                        .enqueue_task(TaskDefinition {
                            workflow_id: workflow_id.clone(),
                            activity_id,
                            activity_type,
                            input,
                            options,
                            task_queue: info.task_queue.clone(),
                        })
                        .await?;
                }

                WorkflowAction::StartTimer { timer_id, duration } => {
                    debug!(%workflow_id, %timer_id, ?duration, "starting timer");
                    *seq = self
                        .store
                        .append_events(
                            workflow_id,
                            *seq,
                            vec![WorkflowEvent::TimerStarted {
                                timer_id: timer_id.clone(),
                                duration_ms: duration.as_millis() as u64,
                            }],
                        )
                        .await?;

                    let executor = Arc::clone(self);
                    let timer_workflow_id = workflow_id.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(duration).await;
                        let result = executor
                            .run(vec![WorkItem::Dispatch {
                                workflow_id: timer_workflow_id.clone(),
                                event: WorkflowEvent::TimerFired { timer_id },
                            }])
                            .await;
                        if let Err(e) = result {
                            warn!(workflow_id = %timer_workflow_id, error = %e, "timer dispatch failed");
                        }
                    });
                }

                WorkflowAction::CompleteWorkflow { result } => {
                    info!(%workflow_id, "workflow completed");
                    *seq = self
                        .store
                        .append_events(
                            workflow_id,
                            *seq,
                            vec![WorkflowEvent::WorkflowCompleted {
                                result: result.clone(),
                            }],
                        )
                        .await?;
                    follow_ups.extend(
                        self.close_workflow(info, WorkflowStatus::Completed, Some(result), None)
                            .await?,
                    );
                }

                WorkflowAction::FailWorkflow { error } => {
                    warn!(%workflow_id, error = %error.message, "workflow failed");
                    *seq = self
                        .store
                        .append_events(
                            workflow_id,
                            *seq,
                            vec![WorkflowEvent::WorkflowFailed {
                                error: error.clone(),
                            }],
                        )
                        .await?;
                    follow_ups.extend(
                        self.close_workflow(info, WorkflowStatus::Failed, None, Some(error))
                            .await?,
                    );
                }

                WorkflowAction::CancelWorkflow { reason } => {
                    info!(%workflow_id, %reason, "workflow cancelled");
                    *seq = self
                        .store
                        .append_events(
                            workflow_id,
                            *seq,
                            vec![WorkflowEvent::WorkflowCancelled {
                                reason: reason.clone(),
                            }],
                        )
                        .await?;
                    follow_ups.extend(
                        self.close_workflow(
                            info,
                            WorkflowStatus::Cancelled,
                            None,
                            Some(WorkflowError::new(reason).with_code("CANCELLED")),
                        )
                        .await?,
                    );
                }

                WorkflowAction::StartChildWorkflow {
                    workflow_id: child_id,
                    workflow_type,
                    input,
                    parent_close_policy,
                    task_queue,
                } => {
                    debug!(%workflow_id, %child_id, %workflow_type, "starting child workflow");

                    if !self.registry.contains(&workflow_type) {
                        return Err(
                            RegistryError::UnknownWorkflowType(workflow_type.clone()).into()
                        );
                    }

                    self.store
                        .create_workflow(
                            &child_id,
                            &workflow_type,
                            input.clone(),
                            StartWorkflowOptions {
                                task_queue: task_queue
                                    .unwrap_or_else(|| info.task_queue.clone()),
                                parent: Some(ParentRef {
                                    workflow_id: workflow_id.clone(),
                                    close_policy: parent_close_policy,
                                }),
                            },
                        )
                        .await?;
                    self.store
                        .append_events(
                            &child_id,
                            0,
                            vec![WorkflowEvent::WorkflowStarted {
                                input: input.clone(),
                            }],
                        )
                        .await?;

                    *seq = self
                        .store
                        .append_events(
                            workflow_id,
                            *seq,
                            vec![WorkflowEvent::ChildWorkflowInitiated {
                                workflow_id: child_id.clone(),
                                workflow_type,
                                parent_close_policy,
                            }],
                        )
                        .await?;

                    // The parent observes "started" as soon as the child's
                    // first event is durable, before the child does any work.
                    follow_ups.push(WorkItem::Dispatch {
                        workflow_id: workflow_id.clone(),
                        event: WorkflowEvent::ChildWorkflowStarted {
                            workflow_id: child_id.clone(),
                        },
                    });
                    follow_ups.push(WorkItem::Start {
                        workflow_id: child_id,
                    });
                }

                WorkflowAction::SignalExternalWorkflow {
                    workflow_id: target,
                    signal,
                } => {
                    match self.store.send_signal(&target, signal).await {
                        Ok(()) => follow_ups.push(WorkItem::Drain {
                            workflow_id: target,
                        }),
                        Err(StoreError::WorkflowNotFound(_)) => {
                            warn!(%workflow_id, %target, "signal target not found");
                        }
                        Err(e) => return Err(e.into()),
                    }
                }

                WorkflowAction::RequestCancelExternalWorkflow { workflow_id: target } => {
                    match self.store.get_workflow_status(&target).await {
                        Ok(status) if !status.is_terminal() => {
                            follow_ups.push(WorkItem::Dispatch {
                                workflow_id: target,
                                event: WorkflowEvent::CancelRequested {
                                    reason: format!("cancel requested by {workflow_id}"),
                                },
                            });
                        }
                        Ok(_) => {
                            debug!(%target, "cancel target already closed");
                        }
                        Err(StoreError::WorkflowNotFound(_)) => {
                            warn!(%workflow_id, %target, "cancel target not found");
                        }
                        Err(e) => return Err(e.into()),
                    }
                }

                WorkflowAction::CompleteUpdate { update_id, result } => {
                    *seq = self
                        .store
                        .append_events(
                            workflow_id,
                            *seq,
                            vec![WorkflowEvent::UpdateCompleted {
                                update_id: update_id.clone(),
                                result: result.clone(),
                            }],
                        )
                        .await?;
                    self.resolve_update(workflow_id, &update_id, Ok(result));
                }

                WorkflowAction::FailUpdate { update_id, error } => {
                    *seq = self
                        .store
                        .append_events(
                            workflow_id,
                            *seq,
                            vec![WorkflowEvent::UpdateFailed {
                                update_id: update_id.clone(),
                                error: error.clone(),
                            }],
                        )
                        .await?;
                    self.resolve_update(workflow_id, &update_id, Err(error));
                }

                WorkflowAction::ContinueAsNew { input } => {
                    info!(%workflow_id, "continuing workflow as new");
                    self.store
                        .append_events(
                            workflow_id,
                            *seq,
                            vec![WorkflowEvent::WorkflowContinuedAsNew {
                                input: input.clone(),
                            }],
                        )
                        .await?;
                    self.store.reset_workflow(workflow_id, input).await?;
                    follow_ups.push(WorkItem::Start {
                        workflow_id: workflow_id.clone(),
                    });
                    // Nothing meaningful can follow a continue-as-new.
                    break;
                }

                WorkflowAction::CancelActivity { activity_id } => {
                    debug!(%workflow_id, %activity_id, "cancelling activity");
                    *seq = self
                        .store
                        .append_events(
                            workflow_id,
                            *seq,
                            vec![WorkflowEvent::ActivityCancelled {
                                activity_id,
                                reason: "cancelled by workflow".to_string(),
                            }],
                        )
                        .await?;
                }

                WorkflowAction::None => {}
            }
        }

        Ok(follow_ups)
    }

    /// Terminal bookkeeping: status, pending tasks, waiting updates, parent
    /// notification, child close policies.
    async fn close_workflow(
        self: &Arc<Self>,
        info: &WorkflowInfo,
        status: WorkflowStatus,
        result: Option<serde_json::Value>,
        error: Option<WorkflowError>,
    ) -> Result<Vec<WorkItem>, ExecutorError> {
        let workflow_id = &info.id;
        self.store
            .update_workflow_status(workflow_id, status, result.clone(), error.clone())
            .await?;
        // On cancellation, queued work is dropped too. Completion and
        // failure let already-scheduled bookkeeping tasks drain; their
        // results are discarded at dispatch since the workflow is closed.
        if status == WorkflowStatus::Cancelled {
            self.store.cancel_pending_tasks(workflow_id).await?;
        }
        self.resolve_updates_for_workflow(
            workflow_id,
            Err(WorkflowError::new("workflow closed before completing update")),
        );
        let _ = self.terminations.send(workflow_id.clone());

        let mut follow_ups = Vec::new();

        if let Some(parent) = &info.parent {
            follow_ups.push(WorkItem::Dispatch {
                workflow_id: parent.workflow_id.clone(),
                event: WorkflowEvent::ChildWorkflowClosed {
                    workflow_id: workflow_id.clone(),
                    result,
                    error,
                },
            });
        }

        // Abandoned children keep running; request-cancel children go down
        // with the parent.
        for child in self.store.list_children(workflow_id).await? {
            if child.status.is_terminal() {
                continue;
            }
            if let Some(parent_ref) = &child.parent {
                if matches!(
                    parent_ref.close_policy,
                    crate::workflow::ParentClosePolicy::RequestCancel
                ) {
                    follow_ups.push(WorkItem::Dispatch {
                        workflow_id: child.id.clone(),
                        event: WorkflowEvent::CancelRequested {
                            reason: "parent workflow closed".to_string(),
                        },
                    });
                }
            }
        }

        Ok(follow_ups)
    }

    fn resolve_update(
        &self,
        workflow_id: &str,
        update_id: &str,
        outcome: Result<serde_json::Value, WorkflowError>,
    ) {
        if let Some(waiter) = self.pending_updates.lock().remove(update_id) {
            let _ = waiter.send(outcome);
        }
        if let Some(ids) = self.updates_by_workflow.lock().get_mut(workflow_id) {
            ids.retain(|id| id != update_id);
        }
    }

    fn resolve_updates_for_workflow(
        &self,
        workflow_id: &str,
        outcome: Result<serde_json::Value, WorkflowError>,
    ) {
        let update_ids = self
            .updates_by_workflow
            .lock()
            .remove(workflow_id)
            .unwrap_or_default();
        let mut pending = self.pending_updates.lock();
        for update_id in update_ids {
            if let Some(waiter) = pending.remove(&update_id) {
                let _ = waiter.send(outcome.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryWorkflowEventStore;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    fn executor_with<F>(register: F) -> Arc<WorkflowExecutor<InMemoryWorkflowEventStore>>
    where
        F: FnOnce(&mut WorkflowRegistry),
    {
        let mut registry = WorkflowRegistry::new();
        register(&mut registry);
        Arc::new(WorkflowExecutor::new(
            Arc::new(InMemoryWorkflowEventStore::new()),
            registry,
        ))
    }

    fn default_options() -> StartWorkflowOptions {
        StartWorkflowOptions {
            task_queue: "default".to_string(),
            parent: None,
        }
    }

    // A workflow that runs one activity and completes with its result.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct GreetInput {
        name: String,
    }

    struct GreetWorkflow {
        name: String,
        result: Option<String>,
        failed: Option<WorkflowError>,
    }

    impl Workflow for GreetWorkflow {
        const TYPE: &'static str = "greet";
        type Input = GreetInput;
        type Output = String;

        fn new(input: Self::Input) -> Self {
            Self {
                name: input.name,
                result: None,
                failed: None,
            }
        }

        fn on_start(&mut self, _ctx: &mut WorkflowContext) -> Vec<WorkflowAction> {
            vec![WorkflowAction::schedule_activity(
                "greet-1",
                "format_greeting",
                json!({ "name": self.name }),
            )]
        }

        fn on_activity_completed(
            &mut self,
            _ctx: &mut WorkflowContext,
            _activity_id: &str,
            result: serde_json::Value,
        ) -> Vec<WorkflowAction> {
            let greeting = result["greeting"].as_str().unwrap_or_default().to_string();
            self.result = Some(greeting.clone());
            vec![WorkflowAction::complete(json!(greeting))]
        }

        fn on_activity_failed(
            &mut self,
            _ctx: &mut WorkflowContext,
            _activity_id: &str,
            error: &ActivityError,
        ) -> Vec<WorkflowAction> {
            self.failed = Some(WorkflowError::new(&error.message));
            vec![WorkflowAction::fail(WorkflowError::new(&error.message))]
        }

        fn is_completed(&self) -> bool {
            self.result.is_some() || self.failed.is_some()
        }

        fn result(&self) -> Option<String> {
            self.result.clone()
        }

        fn error(&self) -> Option<WorkflowError> {
            self.failed.clone()
        }
    }

    #[tokio::test]
    async fn test_start_schedules_activity() {
        let executor = executor_with(|r| r.register::<GreetWorkflow>());
        executor
            .start_workflow::<GreetWorkflow>(
                "wf-1",
                GreetInput {
                    name: "side".to_string(),
                },
                default_options(),
            )
            .await
            .unwrap();

        let events = executor.store().load_events("wf-1").await.unwrap();
        assert!(matches!(events[0].1, WorkflowEvent::WorkflowStarted { .. }));
        assert!(matches!(
            events[1].1,
            WorkflowEvent::ActivityScheduled { .. }
        ));
        assert_eq!(executor.store().pending_task_count(), 1);
    }

    #[tokio::test]
    async fn test_activity_completion_completes_workflow() {
        let executor = executor_with(|r| r.register::<GreetWorkflow>());
        executor
            .start_workflow::<GreetWorkflow>(
                "wf-1",
                GreetInput {
                    name: "side".to_string(),
                },
                default_options(),
            )
            .await
            .unwrap();

        executor
            .on_activity_completed("wf-1", "greet-1", json!({ "greeting": "hello side" }))
            .await
            .unwrap();

        let info = executor.get_workflow_info("wf-1").await.unwrap();
        assert_eq!(info.status, WorkflowStatus::Completed);
        assert_eq!(info.result, Some(json!("hello side")));
    }

    #[tokio::test]
    async fn test_final_activity_failure_fails_workflow() {
        let executor = executor_with(|r| r.register::<GreetWorkflow>());
        executor
            .start_workflow::<GreetWorkflow>(
                "wf-1",
                GreetInput {
                    name: "side".to_string(),
                },
                default_options(),
            )
            .await
            .unwrap();

        // A retryable intermediate failure is recorded but not dispatched.
        executor
            .on_activity_failed(
                "wf-1",
                "greet-1",
                ActivityError::retryable("flaky"),
                true,
            )
            .await
            .unwrap();
        assert_eq!(
            executor.get_workflow_info("wf-1").await.unwrap().status,
            WorkflowStatus::Running
        );

        executor
            .on_activity_failed(
                "wf-1",
                "greet-1",
                ActivityError::retryable("flaky"),
                false,
            )
            .await
            .unwrap();
        let info = executor.get_workflow_info("wf-1").await.unwrap();
        assert_eq!(info.status, WorkflowStatus::Failed);
        assert_eq!(info.error.unwrap().message, "flaky");
    }

    #[tokio::test]
    async fn test_cannot_signal_closed_workflow() {
        let executor = executor_with(|r| r.register::<GreetWorkflow>());
        executor
            .start_workflow::<GreetWorkflow>(
                "wf-1",
                GreetInput {
                    name: "side".to_string(),
                },
                default_options(),
            )
            .await
            .unwrap();
        executor
            .on_activity_completed("wf-1", "greet-1", json!({ "greeting": "hi" }))
            .await
            .unwrap();

        let result = executor
            .signal_workflow("wf-1", WorkflowSignal::new("ping", json!({})))
            .await;
        assert!(matches!(result, Err(ExecutorError::WorkflowClosed(_))));
    }

    // A workflow whose update handler runs an activity before responding.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct RelayInput {}

    struct RelayWorkflow {
        pending_update: Option<String>,
        done: bool,
    }

    impl Workflow for RelayWorkflow {
        const TYPE: &'static str = "relay";
        type Input = RelayInput;
        type Output = serde_json::Value;

        fn new(_input: Self::Input) -> Self {
            Self {
                pending_update: None,
                done: false,
            }
        }

        fn on_start(&mut self, _ctx: &mut WorkflowContext) -> Vec<WorkflowAction> {
            vec![]
        }

        fn on_update(
            &mut self,
            ctx: &mut WorkflowContext,
            update: &WorkflowUpdate,
        ) -> Vec<WorkflowAction> {
            if update.name != "relay" {
                return vec![WorkflowAction::fail_update(
                    update.update_id.clone(),
                    WorkflowError::new("unknown update"),
                )];
            }
            self.pending_update = Some(update.update_id.clone());
            let token = ctx.side_effect(|| json!("token-1"));
            vec![WorkflowAction::schedule_activity(
                "relay-1",
                "relay_lookup",
                json!({ "payload": update.payload, "token": token }),
            )]
        }

        fn on_activity_completed(
            &mut self,
            _ctx: &mut WorkflowContext,
            _activity_id: &str,
            result: serde_json::Value,
        ) -> Vec<WorkflowAction> {
            match self.pending_update.take() {
                Some(update_id) => vec![WorkflowAction::complete_update(update_id, result)],
                None => vec![],
            }
        }

        fn on_activity_failed(
            &mut self,
            _ctx: &mut WorkflowContext,
            _activity_id: &str,
            error: &ActivityError,
        ) -> Vec<WorkflowAction> {
            match self.pending_update.take() {
                Some(update_id) => vec![WorkflowAction::fail_update(
                    update_id,
                    WorkflowError::new(&error.message),
                )],
                None => vec![],
            }
        }

        fn is_completed(&self) -> bool {
            self.done
        }

        fn result(&self) -> Option<serde_json::Value> {
            None
        }
    }

    #[tokio::test]
    async fn test_update_resolves_after_activity_chain() {
        let executor = executor_with(|r| r.register::<RelayWorkflow>());
        executor
            .start_workflow::<RelayWorkflow>("relay-wf", RelayInput {}, default_options())
            .await
            .unwrap();

        let exec = executor.clone();
        let update = tokio::spawn(async move {
            exec.execute_update("relay-wf", "relay", json!({ "q": 7 }))
                .await
        });

        // Wait for the update dispatch to schedule the activity.
        for _ in 0..100 {
            if executor.store().pending_task_count() > 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        executor
            .on_activity_completed("relay-wf", "relay-1", json!({ "answer": 42 }))
            .await
            .unwrap();

        let result = update.await.unwrap().unwrap();
        assert_eq!(result["answer"], 42);

        // The recorded side effect survives replay: the history contains
        // exactly one SideEffectRecorded event even though the workflow was
        // replayed for the activity completion.
        let events = executor.store().load_events("relay-wf").await.unwrap();
        let side_effects = events
            .iter()
            .filter(|(_, e)| matches!(e, WorkflowEvent::SideEffectRecorded { .. }))
            .count();
        assert_eq!(side_effects, 1);
    }

    #[tokio::test]
    async fn test_unknown_update_fails() {
        let executor = executor_with(|r| r.register::<RelayWorkflow>());
        executor
            .start_workflow::<RelayWorkflow>("relay-wf", RelayInput {}, default_options())
            .await
            .unwrap();

        let result = executor
            .execute_update("relay-wf", "nope", json!({}))
            .await;
        assert!(matches!(result, Err(ExecutorError::UpdateFailed(_))));
    }

    // Parent/child workflows.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct ParentInput {
        child_id: String,
    }

    struct ParentWorkflow {
        child_id: String,
        child_started: bool,
        child_result: Option<serde_json::Value>,
    }

    impl Workflow for ParentWorkflow {
        const TYPE: &'static str = "parent";
        type Input = ParentInput;
        type Output = serde_json::Value;

        fn new(input: Self::Input) -> Self {
            Self {
                child_id: input.child_id,
                child_started: false,
                child_result: None,
            }
        }

        fn on_start(&mut self, _ctx: &mut WorkflowContext) -> Vec<WorkflowAction> {
            vec![WorkflowAction::StartChildWorkflow {
                workflow_id: self.child_id.clone(),
                workflow_type: "greet".to_string(),
                input: json!({ "name": "child" }),
                parent_close_policy: crate::workflow::ParentClosePolicy::Abandon,
                task_queue: Some("child-queue".to_string()),
            }]
        }

        fn on_child_workflow_started(
            &mut self,
            _ctx: &mut WorkflowContext,
            _child_workflow_id: &str,
        ) -> Vec<WorkflowAction> {
            self.child_started = true;
            vec![]
        }

        fn on_child_workflow_closed(
            &mut self,
            _ctx: &mut WorkflowContext,
            _child_workflow_id: &str,
            outcome: &ChildWorkflowOutcome,
        ) -> Vec<WorkflowAction> {
            match outcome {
                ChildWorkflowOutcome::Completed(result) => {
                    self.child_result = Some(result.clone());
                    vec![WorkflowAction::complete(result.clone())]
                }
                ChildWorkflowOutcome::Failed(error) => {
                    vec![WorkflowAction::fail(error.clone())]
                }
            }
        }

        fn on_activity_completed(
            &mut self,
            _ctx: &mut WorkflowContext,
            _activity_id: &str,
            _result: serde_json::Value,
        ) -> Vec<WorkflowAction> {
            vec![]
        }

        fn on_activity_failed(
            &mut self,
            _ctx: &mut WorkflowContext,
            _activity_id: &str,
            _error: &ActivityError,
        ) -> Vec<WorkflowAction> {
            vec![]
        }

        fn is_completed(&self) -> bool {
            self.child_result.is_some()
        }

        fn result(&self) -> Option<serde_json::Value> {
            self.child_result.clone()
        }
    }

    #[tokio::test]
    async fn test_child_workflow_lifecycle() {
        let executor = executor_with(|r| {
            r.register::<ParentWorkflow>();
            r.register::<GreetWorkflow>();
        });

        executor
            .start_workflow::<ParentWorkflow>(
                "parent-1",
                ParentInput {
                    child_id: "flow_child".to_string(),
                },
                default_options(),
            )
            .await
            .unwrap();

        // Child was created on its own queue and observed as started.
        let child = executor.get_workflow_info("flow_child").await.unwrap();
        assert_eq!(child.task_queue, "child-queue");
        assert_eq!(child.parent.as_ref().unwrap().workflow_id, "parent-1");

        let parent_events = executor.store().load_events("parent-1").await.unwrap();
        assert!(parent_events
            .iter()
            .any(|(_, e)| matches!(e, WorkflowEvent::ChildWorkflowStarted { .. })));

        // Completing the child's activity closes the child and notifies the
        // parent, which completes with the child's result.
        executor
            .on_activity_completed("flow_child", "greet-1", json!({ "greeting": "hi child" }))
            .await
            .unwrap();

        let parent = executor.get_workflow_info("parent-1").await.unwrap();
        assert_eq!(parent.status, WorkflowStatus::Completed);
        assert_eq!(parent.result, Some(json!("hi child")));
    }

    #[tokio::test]
    async fn test_request_cancel_closes_workflow() {
        let executor = executor_with(|r| r.register::<GreetWorkflow>());
        executor
            .start_workflow::<GreetWorkflow>(
                "wf-1",
                GreetInput {
                    name: "side".to_string(),
                },
                default_options(),
            )
            .await
            .unwrap();

        executor.request_cancel("wf-1", "user requested").await.unwrap();

        let info = executor.get_workflow_info("wf-1").await.unwrap();
        assert_eq!(info.status, WorkflowStatus::Cancelled);
        // Pending activity tasks were dropped with the workflow.
        assert_eq!(executor.store().pending_task_count(), 0);
    }

    // Continue-as-new: counts signals, restarts with carried-over input.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct CounterInput {
        total: u64,
    }

    struct CounterWorkflow {
        total: u64,
        seen_this_run: u64,
    }

    impl Workflow for CounterWorkflow {
        const TYPE: &'static str = "counter";
        type Input = CounterInput;
        type Output = serde_json::Value;

        fn new(input: Self::Input) -> Self {
            Self {
                total: input.total,
                seen_this_run: 0,
            }
        }

        fn on_start(&mut self, _ctx: &mut WorkflowContext) -> Vec<WorkflowAction> {
            vec![]
        }

        fn on_signal(
            &mut self,
            _ctx: &mut WorkflowContext,
            _signal: &WorkflowSignal,
        ) -> Vec<WorkflowAction> {
            self.total += 1;
            self.seen_this_run += 1;
            if self.seen_this_run >= 3 {
                vec![WorkflowAction::ContinueAsNew {
                    input: json!({ "total": self.total }),
                }]
            } else {
                vec![]
            }
        }

        fn on_activity_completed(
            &mut self,
            _ctx: &mut WorkflowContext,
            _activity_id: &str,
            _result: serde_json::Value,
        ) -> Vec<WorkflowAction> {
            vec![]
        }

        fn on_activity_failed(
            &mut self,
            _ctx: &mut WorkflowContext,
            _activity_id: &str,
            _error: &ActivityError,
        ) -> Vec<WorkflowAction> {
            vec![]
        }

        fn is_completed(&self) -> bool {
            false
        }

        fn result(&self) -> Option<serde_json::Value> {
            None
        }
    }

    #[tokio::test]
    async fn test_continue_as_new_truncates_and_carries_input() {
        let executor = executor_with(|r| r.register::<CounterWorkflow>());
        executor
            .start_workflow::<CounterWorkflow>(
                "counter-1",
                CounterInput { total: 0 },
                default_options(),
            )
            .await
            .unwrap();

        for _ in 0..3 {
            executor
                .signal_workflow("counter-1", WorkflowSignal::new("bump", json!({})))
                .await
                .unwrap();
        }

        // After the third signal the workflow continued as new: the history
        // was truncated to a fresh start carrying the accumulated total.
        let events = executor.store().load_events("counter-1").await.unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0].1,
            WorkflowEvent::WorkflowStarted { input } if input["total"] == 3
        ));
        assert_eq!(
            executor.get_workflow_info("counter-1").await.unwrap().status,
            WorkflowStatus::Running
        );

        // The new run keeps counting from the carried-over input.
        executor
            .signal_workflow("counter-1", WorkflowSignal::new("bump", json!({})))
            .await
            .unwrap();
        let events = executor.store().load_events("counter-1").await.unwrap();
        assert!(events.len() > 1);
    }
}
