//! Replay-safe workflow context
//!
//! Handlers receive a [`WorkflowContext`] for the two nondeterministic
//! primitives workflow code is allowed: recorded side effects and version
//! markers. On first execution the value is computed and recorded as an
//! event; on replay the recorded value is returned, in invocation order, so
//! control flow that branches on it is stable across replays.

use std::collections::{HashMap, VecDeque};

use super::WorkflowEvent;

pub struct WorkflowContext {
    workflow_id: String,
    replaying: bool,
    /// Side-effect values recorded in the history, consumed in invocation
    /// order during replay.
    recorded_effects: VecDeque<serde_json::Value>,
    /// Version markers recorded in the history.
    recorded_versions: HashMap<String, i32>,
    /// Markers recorded during this dispatch, appended to the history by the
    /// executor after the handler returns.
    new_records: Vec<WorkflowEvent>,
}

impl WorkflowContext {
    /// Build a context for one dispatch. Normally done by the executor;
    /// public so workflow state machines can be driven directly in tests.
    pub fn new(
        workflow_id: String,
        recorded_effects: VecDeque<serde_json::Value>,
        recorded_versions: HashMap<String, i32>,
    ) -> Self {
        Self {
            workflow_id,
            replaying: false,
            recorded_effects,
            recorded_versions,
            new_records: Vec::new(),
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// True while the executor is rebuilding state from history. Handlers
    /// must not branch on this; it exists for logging suppression.
    pub fn is_replaying(&self) -> bool {
        self.replaying
    }

    pub(crate) fn set_replaying(&mut self, replaying: bool) {
        self.replaying = replaying;
    }

    /// Run a nondeterministic computation exactly once.
    ///
    /// The first execution evaluates `f` and records the value; replays
    /// return the recorded value without calling `f`.
    pub fn side_effect<F>(&mut self, f: F) -> serde_json::Value
    where
        F: FnOnce() -> serde_json::Value,
    {
        if let Some(recorded) = self.recorded_effects.pop_front() {
            return recorded;
        }
        let value = f();
        self.new_records.push(WorkflowEvent::SideEffectRecorded {
            value: value.clone(),
        });
        value
    }

    /// Choose a branch for a versioned behavior change.
    ///
    /// The first execution records `current` for `change_id`; replays return
    /// whatever was recorded, so histories written before the change keep
    /// running the old branch. `min_supported` documents the oldest branch
    /// this code still implements.
    pub fn version(&mut self, change_id: &str, min_supported: i32, current: i32) -> i32 {
        debug_assert!(min_supported <= current);
        if let Some(recorded) = self.recorded_versions.get(change_id) {
            return *recorded;
        }
        self.new_records.push(WorkflowEvent::VersionMarked {
            change_id: change_id.to_string(),
            version: current,
        });
        self.recorded_versions.insert(change_id.to_string(), current);
        current
    }

    /// Markers recorded during this dispatch, drained by the executor.
    pub(crate) fn take_new_records(&mut self) -> Vec<WorkflowEvent> {
        std::mem::take(&mut self.new_records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn live_context() -> WorkflowContext {
        WorkflowContext::new("wf-1".to_string(), VecDeque::new(), HashMap::new())
    }

    #[test]
    fn test_side_effect_records_once() {
        let mut ctx = live_context();
        let value = ctx.side_effect(|| json!("flow_abc"));
        assert_eq!(value, json!("flow_abc"));

        let records = ctx.take_new_records();
        assert_eq!(records.len(), 1);
        assert!(matches!(
            &records[0],
            WorkflowEvent::SideEffectRecorded { value } if *value == json!("flow_abc")
        ));
    }

    #[test]
    fn test_side_effect_replay_returns_recorded() {
        let mut recorded = VecDeque::new();
        recorded.push_back(json!("flow_recorded"));
        let mut ctx = WorkflowContext::new("wf-1".to_string(), recorded, HashMap::new());

        let value = ctx.side_effect(|| json!("flow_fresh"));
        assert_eq!(value, json!("flow_recorded"));
        assert!(ctx.take_new_records().is_empty());
    }

    #[test]
    fn test_version_stable_within_dispatch() {
        let mut ctx = live_context();
        assert_eq!(ctx.version("git-worktree-merge", 0, 1), 1);
        // Second lookup in the same dispatch returns the recorded branch
        // without recording again.
        assert_eq!(ctx.version("git-worktree-merge", 0, 1), 1);
        assert_eq!(ctx.take_new_records().len(), 1);
    }

    #[test]
    fn test_version_replay_returns_recorded_branch() {
        let mut versions = HashMap::new();
        versions.insert("git-worktree-merge".to_string(), 0);
        let mut ctx = WorkflowContext::new("wf-1".to_string(), VecDeque::new(), versions);

        // Old history recorded version 0; new code asks for 1 but must keep
        // running the old branch.
        assert_eq!(ctx.version("git-worktree-merge", 0, 1), 0);
        assert!(ctx.take_new_records().is_empty());
    }
}
