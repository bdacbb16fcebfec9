//! Flow events
//!
//! Flow events are user-visible progress published under a parent id (a flow
//! action id, a subflow id, or the flow itself). Each parent id gets its own
//! sub-stream; [`EndStreamEvent`] closes it.

use serde::{Deserialize, Serialize};

pub const END_STREAM_EVENT_TYPE: &str = "end_stream";

/// Closes the sub-stream for `parent_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndStreamEvent {
    pub parent_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "eventType", rename_all = "snake_case")]
pub enum FlowEvent {
    /// Incremental progress text shown while a step runs.
    ProgressText {
        parent_id: String,
        text: String,
    },
    /// A status change of the entity identified by `parent_id`.
    StatusChange {
        parent_id: String,
        status: String,
    },
    EndStream(EndStreamEvent),
}

impl FlowEvent {
    pub fn parent_id(&self) -> &str {
        match self {
            Self::ProgressText { parent_id, .. } => parent_id,
            Self::StatusChange { parent_id, .. } => parent_id,
            Self::EndStream(end) => &end.parent_id,
        }
    }

    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Self::EndStream(_))
    }

    pub fn end_stream(parent_id: impl Into<String>) -> Self {
        Self::EndStream(EndStreamEvent {
            parent_id: parent_id.into(),
        })
    }
}

/// Request to start consuming flow events for one parent id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowEventSubscription {
    pub parent_id: String,
    /// Cursor: `""`/`"0"` = all, `"$"` = only new, otherwise resume point.
    #[serde(default)]
    pub stream_message_start_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_tagging() {
        let event = FlowEvent::end_stream("fa_1");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["eventType"], "end_stream");
        assert_eq!(json["parentId"], "fa_1");

        let parsed: FlowEvent = serde_json::from_value(json).unwrap();
        assert!(parsed.is_end_of_stream());
        assert_eq!(parsed.parent_id(), "fa_1");
    }
}
