use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowType {
    #[default]
    BasicDev,
    PlannedDev,
}

impl std::fmt::Display for FlowType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BasicDev => write!(f, "basic_dev"),
            Self::PlannedDev => write!(f, "planned_dev"),
        }
    }
}

impl std::str::FromStr for FlowType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "basic_dev" => Ok(Self::BasicDev),
            "planned_dev" => Ok(Self::PlannedDev),
            other => Err(format!(
                "invalid flow type '{other}'. Valid values are 'basic_dev' and 'planned_dev'"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    #[default]
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl FlowStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }

    /// Map a workflow closure reason onto a flow status. Unknown reasons are
    /// treated as failures so a flow never stays in progress after closing.
    pub fn from_closure_reason(reason: &str) -> Self {
        match reason {
            "completed" => Self::Completed,
            "cancelled" => Self::Cancelled,
            _ => Self::Failed,
        }
    }
}

impl std::fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// One durable workflow execution working on a task. The flow id doubles as
/// the workflow-execution id. At most one in-progress flow per task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flow {
    pub id: String,
    pub workspace_id: String,
    #[serde(rename = "type")]
    pub flow_type: FlowType,
    /// `task_...` id, or empty for ad-hoc flows.
    #[serde(default)]
    pub parent_id: String,
    pub status: FlowStatus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_flow_type_parsing() {
        assert_eq!(FlowType::from_str("basic_dev").unwrap(), FlowType::BasicDev);
        assert_eq!(
            FlowType::from_str("planned_dev").unwrap(),
            FlowType::PlannedDev
        );
        assert!(FlowType::from_str("mystery").is_err());
    }

    #[test]
    fn test_closure_reason_mapping() {
        assert_eq!(
            FlowStatus::from_closure_reason("completed"),
            FlowStatus::Completed
        );
        assert_eq!(
            FlowStatus::from_closure_reason("cancelled"),
            FlowStatus::Cancelled
        );
        assert_eq!(
            FlowStatus::from_closure_reason("failed"),
            FlowStatus::Failed
        );
        assert_eq!(
            FlowStatus::from_closure_reason("exploded"),
            FlowStatus::Failed
        );
    }

    #[test]
    fn test_flow_serialization_uses_type_key() {
        let flow = Flow {
            id: "flow_1".to_string(),
            workspace_id: "ws_1".to_string(),
            flow_type: FlowType::BasicDev,
            parent_id: "task_1".to_string(),
            status: FlowStatus::InProgress,
        };
        let json = serde_json::to_value(&flow).unwrap();
        assert_eq!(json["type"], "basic_dev");
        assert_eq!(json["parentId"], "task_1");
    }
}
