//! Signals and updates for external communication

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named one-way message delivered to a running workflow.
///
/// Signals are queued by the store and drained in order the next time the
/// workflow is processed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowSignal {
    pub signal_type: String,
    pub payload: serde_json::Value,
    pub sent_at: DateTime<Utc>,
}

impl WorkflowSignal {
    pub fn new(signal_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            signal_type: signal_type.into(),
            payload,
            sent_at: Utc::now(),
        }
    }

    /// A cancellation request.
    pub fn cancel(reason: impl Into<String>) -> Self {
        Self::new(
            signal_types::CANCEL,
            serde_json::json!({ "reason": reason.into() }),
        )
    }

    pub fn is_cancel(&self) -> bool {
        self.signal_type == signal_types::CANCEL
    }
}

/// Common signal type constants.
pub mod signal_types {
    /// Request workflow cancellation.
    pub const CANCEL: &str = "cancel";
}

/// A named request/response message delivered to a running workflow.
///
/// Unlike a signal, an update has a caller waiting on the other end: the
/// workflow resolves it with a `CompleteUpdate` or `FailUpdate` action,
/// possibly only after intermediate activities have run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowUpdate {
    /// Unique id correlating the response to the waiting caller.
    pub update_id: String,
    pub name: String,
    pub payload: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_signal() {
        let signal = WorkflowSignal::cancel("user cancelled");
        assert!(signal.is_cancel());
        assert_eq!(signal.payload["reason"], "user cancelled");
    }

    #[test]
    fn test_signal_serialization() {
        let signal = WorkflowSignal::new("userResponse", serde_json::json!({"x": 1}));
        let json = serde_json::to_string(&signal).unwrap();
        let parsed: WorkflowSignal = serde_json::from_str(&json).unwrap();
        assert_eq!(signal.signal_type, parsed.signal_type);
        assert_eq!(signal.payload, parsed.payload);
    }
}
