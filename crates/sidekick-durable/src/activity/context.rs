//! Activity execution context

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use uuid::Uuid;

/// Context provided to activities during execution: attempt information and
/// cancellation detection.
///
/// Cancellation is advisory. Long-running activities should check
/// [`ActivityContext::is_cancelled`] (or select on
/// [`ActivityContext::cancelled`]) and exit promptly.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    /// Unique execution attempt id.
    pub attempt_id: Uuid,

    /// 1-based attempt number.
    pub attempt: u32,

    pub max_attempts: u32,

    /// Workflow execution that owns this activity.
    pub workflow_id: String,

    /// Activity id within the workflow.
    pub activity_id: String,

    cancelled: Arc<AtomicBool>,
    cancel_notify: Arc<Notify>,
}

impl ActivityContext {
    pub fn new(
        workflow_id: impl Into<String>,
        activity_id: impl Into<String>,
        attempt: u32,
        max_attempts: u32,
    ) -> Self {
        Self {
            attempt_id: Uuid::now_v7(),
            attempt,
            max_attempts,
            workflow_id: workflow_id.into(),
            activity_id: activity_id.into(),
            cancelled: Arc::new(AtomicBool::new(false)),
            cancel_notify: Arc::new(Notify::new()),
        }
    }

    /// A handle that can cancel this activity from outside.
    pub fn cancellation_handle(&self) -> CancellationHandle {
        CancellationHandle {
            cancelled: self.cancelled.clone(),
            notify: self.cancel_notify.clone(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Resolves when cancellation is requested. Useful in select! patterns:
    ///
    /// ```ignore
    /// tokio::select! {
    ///     result = run_tests() => { ... }
    ///     _ = ctx.cancelled() => {
    ///         return Err(ActivityError::non_retryable("cancelled"));
    ///     }
    /// }
    /// ```
    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            self.cancel_notify.notified().await;
        }
    }

    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Handle to cancel a running activity.
#[derive(Debug, Clone)]
pub struct CancellationHandle {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancellationHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_creation() {
        let ctx = ActivityContext::new("flow_1", "edit-1", 1, 3);
        assert_eq!(ctx.workflow_id, "flow_1");
        assert_eq!(ctx.activity_id, "edit-1");
        assert!(!ctx.is_cancelled());
        assert!(!ctx.is_last_attempt());
    }

    #[test]
    fn test_is_last_attempt() {
        assert!(ActivityContext::new("wf", "a", 3, 3).is_last_attempt());
        assert!(!ActivityContext::new("wf", "a", 2, 3).is_last_attempt());
    }

    #[tokio::test]
    async fn test_cancellation() {
        let ctx = ActivityContext::new("wf", "a", 1, 3);
        let handle = ctx.cancellation_handle();

        assert!(!ctx.is_cancelled());
        handle.cancel();
        assert!(ctx.is_cancelled());

        // The cancelled future resolves immediately once cancelled.
        ctx.cancelled().await;
    }
}
