//! Streaming capability traits
//!
//! At-least-once append-and-replay streams. Within one stream key events are
//! totally ordered; cursors are opaque monotone strings. `"0"` (or empty)
//! replays from the beginning, `"$"` delivers only new events, anything else
//! resumes after a previously observed cursor.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::flow_action::FlowAction;
use crate::flow_event::{FlowEvent, FlowEventSubscription};
use crate::storage::Result;
use crate::task::Task;

/// Replay from the beginning of the stream.
pub const CURSOR_ALL: &str = "0";
/// Deliver only events appended after subscription.
pub const CURSOR_NEW: &str = "$";

#[async_trait]
pub trait TaskStreamer: Send + Sync {
    async fn add_task_change(&self, task: Task) -> Result<()>;

    /// Stream task changes for a workspace starting at `cursor`.
    async fn stream_task_changes(
        &self,
        workspace_id: &str,
        cursor: &str,
    ) -> Result<mpsc::Receiver<Task>>;
}

#[async_trait]
pub trait FlowActionStreamer: Send + Sync {
    async fn add_flow_action_change(&self, action: FlowAction) -> Result<()>;

    /// Stream flow-action changes for one flow. The consumer closes when it
    /// sees the synthetic action whose id is
    /// [`FlowAction::END_OF_STREAM_ID`].
    async fn stream_flow_action_changes(
        &self,
        workspace_id: &str,
        flow_id: &str,
        cursor: &str,
    ) -> Result<mpsc::Receiver<FlowAction>>;
}

#[async_trait]
pub trait FlowEventStreamer: Send + Sync {
    async fn add_flow_event(&self, workspace_id: &str, event: FlowEvent) -> Result<()>;

    /// Publish the end-of-stream sentinel for `parent_id`.
    async fn end_flow_event_stream(&self, workspace_id: &str, parent_id: &str) -> Result<()>;

    /// Multiplexed flow-event consumer. New parent ids to follow arrive over
    /// `subscriptions`; each parent id is subscribed at most once. A
    /// sub-stream ends at its end-of-stream event; the output channel closes
    /// once the subscription channel is closed and every sub-stream has
    /// drained.
    async fn stream_flow_events(
        &self,
        workspace_id: &str,
        subscriptions: mpsc::Receiver<FlowEventSubscription>,
    ) -> Result<mpsc::Receiver<FlowEvent>>;
}

/// The full streaming contract of the Sidekick core.
pub trait Streamer: TaskStreamer + FlowActionStreamer + FlowEventStreamer {}

impl<T: TaskStreamer + FlowActionStreamer + FlowEventStreamer> Streamer for T {}
