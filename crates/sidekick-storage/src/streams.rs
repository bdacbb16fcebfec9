//! In-memory append-and-replay streams
//!
//! Every stream key holds an append-only log plus a broadcast channel for
//! live delivery. A subscriber first replays the suffix after its cursor
//! from the log, then follows live appends, de-duplicating by sequence
//! number — at-least-once overall, exactly-once per consumer position.
//!
//! Dropping a returned receiver cancels its pumps; the output channel closes
//! once every pump has finished.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use sidekick_domain::storage::Result;
use sidekick_domain::streamer::{CURSOR_ALL, CURSOR_NEW};
use sidekick_domain::{
    FlowAction, FlowActionStreamer, FlowEvent, FlowEventStreamer, FlowEventSubscription, Task,
    TaskStreamer,
};

struct TopicInner<T> {
    entries: Vec<(u64, T)>,
    next_seq: u64,
    sender: broadcast::Sender<(u64, T)>,
}

type Topic<T> = Arc<RwLock<TopicInner<T>>>;
type TopicMap<T> = Arc<RwLock<HashMap<String, Topic<T>>>>;

fn get_topic<T: Clone>(map: &TopicMap<T>, key: &str) -> Topic<T> {
    if let Some(topic) = map.read().get(key) {
        return topic.clone();
    }
    let mut topics = map.write();
    topics
        .entry(key.to_string())
        .or_insert_with(|| {
            let (sender, _) = broadcast::channel(256);
            Arc::new(RwLock::new(TopicInner {
                entries: Vec::new(),
                next_seq: 1,
                sender,
            }))
        })
        .clone()
}

fn append_to<T: Clone>(topic: &Topic<T>, item: T) -> u64 {
    let mut inner = topic.write();
    let seq = inner.next_seq;
    inner.next_seq += 1;
    inner.entries.push((seq, item.clone()));
    // Send errors just mean nobody is live-subscribed; the log still has it.
    let _ = inner.sender.send((seq, item));
    seq
}

/// Resolve a cursor to "last seen sequence": events with seq greater than
/// the returned value are delivered.
fn parse_cursor<T>(topic: &Topic<T>, cursor: &str) -> u64 {
    match cursor {
        "" | CURSOR_ALL => 0,
        CURSOR_NEW => topic.read().next_seq - 1,
        other => match other.parse::<u64>() {
            Ok(seq) => seq,
            Err(_) => {
                warn!(cursor = other, "invalid stream cursor, replaying from the beginning");
                0
            }
        },
    }
}

/// Pump one topic into `tx`, starting after `last`. Stops at the first item
/// for which `is_end` returns true (after delivering it), or when the
/// receiving side goes away.
fn spawn_pump<T, F>(topic: Topic<T>, mut last: u64, tx: mpsc::Sender<T>, is_end: F)
where
    T: Clone + Send + 'static,
    F: Fn(&T) -> bool + Send + 'static,
{
    tokio::spawn(async move {
        // Subscribe before snapshotting so nothing falls between replay and
        // live delivery; duplicates are dropped by sequence below.
        let mut live = { topic.read().sender.subscribe() };

        let replay: Vec<(u64, T)> = {
            topic
                .read()
                .entries
                .iter()
                .filter(|(seq, _)| *seq > last)
                .cloned()
                .collect()
        };
        for (seq, item) in replay {
            let end = is_end(&item);
            if tx.send(item).await.is_err() {
                return;
            }
            last = seq;
            if end {
                return;
            }
        }

        loop {
            let (seq, item) = match live.recv().await {
                Ok(entry) => entry,
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    // Fell behind the broadcast buffer; catch up from the log.
                    let missed: Vec<(u64, T)> = {
                        topic
                            .read()
                            .entries
                            .iter()
                            .filter(|(seq, _)| *seq > last)
                            .cloned()
                            .collect()
                    };
                    for (seq, item) in missed {
                        let end = is_end(&item);
                        if tx.send(item).await.is_err() {
                            return;
                        }
                        last = seq;
                        if end {
                            return;
                        }
                    }
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return,
            };

            if seq <= last {
                continue;
            }
            let end = is_end(&item);
            if tx.send(item).await.is_err() {
                return;
            }
            last = seq;
            if end {
                return;
            }
        }
    });
}

/// In-memory streamer for task changes, flow-action changes and flow events.
#[derive(Default)]
pub struct MemoryStreamer {
    task_topics: TopicMap<Task>,
    action_topics: TopicMap<FlowAction>,
    event_topics: TopicMap<FlowEvent>,
}

impl MemoryStreamer {
    pub fn new() -> Self {
        Self::default()
    }

    fn task_key(workspace_id: &str) -> String {
        format!("tasks.changes.{workspace_id}")
    }

    fn action_key(workspace_id: &str, flow_id: &str) -> String {
        format!("flow_actions.changes.{workspace_id}.{flow_id}")
    }

    fn event_key(workspace_id: &str, parent_id: &str) -> String {
        format!("flow_events.{workspace_id}.{parent_id}")
    }
}

#[async_trait]
impl TaskStreamer for MemoryStreamer {
    async fn add_task_change(&self, task: Task) -> Result<()> {
        let topic = get_topic(&self.task_topics, &Self::task_key(&task.workspace_id));
        append_to(&topic, task);
        Ok(())
    }

    async fn stream_task_changes(
        &self,
        workspace_id: &str,
        cursor: &str,
    ) -> Result<mpsc::Receiver<Task>> {
        let topic = get_topic(&self.task_topics, &Self::task_key(workspace_id));
        let last = parse_cursor(&topic, cursor);
        let (tx, rx) = mpsc::channel(64);
        spawn_pump(topic, last, tx, |_| false);
        Ok(rx)
    }
}

#[async_trait]
impl FlowActionStreamer for MemoryStreamer {
    async fn add_flow_action_change(&self, action: FlowAction) -> Result<()> {
        let topic = get_topic(
            &self.action_topics,
            &Self::action_key(&action.workspace_id, &action.flow_id),
        );
        append_to(&topic, action);
        Ok(())
    }

    async fn stream_flow_action_changes(
        &self,
        workspace_id: &str,
        flow_id: &str,
        cursor: &str,
    ) -> Result<mpsc::Receiver<FlowAction>> {
        let topic = get_topic(
            &self.action_topics,
            &Self::action_key(workspace_id, flow_id),
        );
        let last = parse_cursor(&topic, cursor);
        let (tx, rx) = mpsc::channel(64);
        spawn_pump(topic, last, tx, |action: &FlowAction| {
            action.is_end_of_stream()
        });
        Ok(rx)
    }
}

#[async_trait]
impl FlowEventStreamer for MemoryStreamer {
    async fn add_flow_event(&self, workspace_id: &str, event: FlowEvent) -> Result<()> {
        let topic = get_topic(
            &self.event_topics,
            &Self::event_key(workspace_id, event.parent_id()),
        );
        append_to(&topic, event);
        Ok(())
    }

    async fn end_flow_event_stream(&self, workspace_id: &str, parent_id: &str) -> Result<()> {
        self.add_flow_event(workspace_id, FlowEvent::end_stream(parent_id))
            .await
    }

    async fn stream_flow_events(
        &self,
        workspace_id: &str,
        mut subscriptions: mpsc::Receiver<FlowEventSubscription>,
    ) -> Result<mpsc::Receiver<FlowEvent>> {
        let (tx, rx) = mpsc::channel(64);
        let topics = self.event_topics.clone();
        let workspace_id = workspace_id.to_string();

        tokio::spawn(async move {
            let mut subscribed: HashSet<String> = HashSet::new();
            loop {
                tokio::select! {
                    // The consumer went away: stop accepting subscriptions.
                    // Dropping our tx lets the pumps drain out and close the
                    // output once they all finish.
                    _ = tx.closed() => break,
                    subscription = subscriptions.recv() => {
                        let Some(subscription) = subscription else { break };
                        if !subscribed.insert(subscription.parent_id.clone()) {
                            continue;
                        }
                        let key = MemoryStreamer::event_key(&workspace_id, &subscription.parent_id);
                        let topic = get_topic(&topics, &key);
                        let last = parse_cursor(&topic, &subscription.stream_message_start_id);
                        spawn_pump(topic, last, tx.clone(), |event: &FlowEvent| {
                            event.is_end_of_stream()
                        });
                    }
                }
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sidekick_domain::{FlowActionStatus, TaskStatus};

    fn action(id: &str, status: FlowActionStatus) -> FlowAction {
        FlowAction {
            id: id.to_string(),
            workspace_id: "ws_1".to_string(),
            flow_id: "flow_1".to_string(),
            action_type: "edit_code".to_string(),
            status,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_replay_from_zero_yields_everything_in_order() {
        let streamer = MemoryStreamer::new();
        for i in 0..5 {
            streamer
                .add_flow_action_change(action(&format!("fa_{i}"), FlowActionStatus::Started))
                .await
                .unwrap();
        }

        let mut rx = streamer
            .stream_flow_action_changes("ws_1", "flow_1", "0")
            .await
            .unwrap();
        for i in 0..5 {
            let received = rx.recv().await.unwrap();
            assert_eq!(received.id, format!("fa_{i}"));
        }
    }

    #[tokio::test]
    async fn test_dollar_cursor_only_delivers_new_events() {
        let streamer = MemoryStreamer::new();
        streamer
            .add_flow_action_change(action("fa_old", FlowActionStatus::Completed))
            .await
            .unwrap();

        let mut rx = streamer
            .stream_flow_action_changes("ws_1", "flow_1", "$")
            .await
            .unwrap();
        streamer
            .add_flow_action_change(action("fa_new", FlowActionStatus::Started))
            .await
            .unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.id, "fa_new");
    }

    #[tokio::test]
    async fn test_numeric_cursor_resumes_with_suffix() {
        let streamer = MemoryStreamer::new();
        for i in 0..4 {
            streamer
                .add_flow_action_change(action(&format!("fa_{i}"), FlowActionStatus::Started))
                .await
                .unwrap();
        }

        // Cursor "2" = the first two events were already seen.
        let mut rx = streamer
            .stream_flow_action_changes("ws_1", "flow_1", "2")
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().id, "fa_2");
        assert_eq!(rx.recv().await.unwrap().id, "fa_3");
    }

    #[tokio::test]
    async fn test_end_sentinel_closes_flow_action_stream() {
        let streamer = MemoryStreamer::new();
        streamer
            .add_flow_action_change(action("fa_1", FlowActionStatus::Completed))
            .await
            .unwrap();
        streamer
            .add_flow_action_change(FlowAction::end_of_stream("ws_1", "flow_1"))
            .await
            .unwrap();

        let mut rx = streamer
            .stream_flow_action_changes("ws_1", "flow_1", "0")
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().id, "fa_1");
        assert!(rx.recv().await.unwrap().is_end_of_stream());
        // Stream is closed after the sentinel.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_task_changes_per_workspace() {
        let streamer = MemoryStreamer::new();
        let mut rx = streamer.stream_task_changes("ws_1", "$").await.unwrap();

        let task = Task {
            id: "task_1".to_string(),
            workspace_id: "ws_1".to_string(),
            status: TaskStatus::InProgress,
            ..Default::default()
        };
        streamer.add_task_change(task.clone()).await.unwrap();

        let other_ws = Task {
            workspace_id: "ws_2".to_string(),
            ..task.clone()
        };
        streamer.add_task_change(other_ws).await.unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.workspace_id, "ws_1");
    }

    #[tokio::test]
    async fn test_flow_event_multiplexing_and_end() {
        let streamer = MemoryStreamer::new();
        let (sub_tx, sub_rx) = mpsc::channel(8);
        let mut rx = streamer.stream_flow_events("ws_1", sub_rx).await.unwrap();

        streamer
            .add_flow_event(
                "ws_1",
                FlowEvent::ProgressText {
                    parent_id: "fa_1".to_string(),
                    text: "editing".to_string(),
                },
            )
            .await
            .unwrap();

        sub_tx
            .send(FlowEventSubscription {
                parent_id: "fa_1".to_string(),
                stream_message_start_id: "0".to_string(),
            })
            .await
            .unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.parent_id(), "fa_1");

        // A second subscription multiplexes onto the same output channel.
        sub_tx
            .send(FlowEventSubscription {
                parent_id: "fa_2".to_string(),
                stream_message_start_id: "0".to_string(),
            })
            .await
            .unwrap();
        streamer
            .add_flow_event(
                "ws_1",
                FlowEvent::StatusChange {
                    parent_id: "fa_2".to_string(),
                    status: "completed".to_string(),
                },
            )
            .await
            .unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(second.parent_id(), "fa_2");

        // Ending both sub-streams and dropping the subscription channel
        // closes the output after the sentinels drain.
        streamer.end_flow_event_stream("ws_1", "fa_1").await.unwrap();
        streamer.end_flow_event_stream("ws_1", "fa_2").await.unwrap();
        drop(sub_tx);

        let mut ends = 0;
        while let Some(event) = rx.recv().await {
            if event.is_end_of_stream() {
                ends += 1;
            }
        }
        assert_eq!(ends, 2);
    }
}
