use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An isolated git working directory bound to a flow, so concurrent flows do
/// not collide on the shared repository. Deleted after a successful merge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Worktree {
    /// Unique identifier, prefixed with `wt_`.
    pub id: String,
    pub workspace_id: String,
    pub flow_id: String,
    /// Branch and directory name of the worktree.
    pub name: String,
    pub created: DateTime<Utc>,
}
