//! Prefixed entity ids
//!
//! Every entity id is a ksuid with a kind prefix, e.g. `flow_2a5K...`. The
//! prefix makes ids self-describing wherever they travel (signals, streams,
//! parent references) and the ksuid body keeps them sortable by creation
//! time.

use svix_ksuid::{Ksuid, KsuidLike};

/// Generate an id with the given kind prefix.
pub fn new_id(prefix: &str) -> String {
    format!("{}_{}", prefix, Ksuid::new(None, None))
}

pub fn new_task_id() -> String {
    new_id("task")
}

pub fn new_flow_id() -> String {
    new_id("flow")
}

pub fn new_subflow_id() -> String {
    new_id("sf")
}

pub fn new_flow_action_id() -> String {
    new_id("fa")
}

pub fn new_worktree_id() -> String {
    new_id("wt")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_encodes_kind() {
        assert!(new_task_id().starts_with("task_"));
        assert!(new_flow_id().starts_with("flow_"));
        assert!(new_subflow_id().starts_with("sf_"));
        assert!(new_flow_action_id().starts_with("fa_"));
        assert!(new_worktree_id().starts_with("wt_"));
    }

    #[test]
    fn test_ids_are_unique() {
        let a = new_flow_id();
        let b = new_flow_id();
        assert_ne!(a, b);
    }
}
