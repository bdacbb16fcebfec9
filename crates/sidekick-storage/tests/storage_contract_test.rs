//! Contract tests run against every Storage backend.

use chrono::Utc;
use svix_ksuid::{Ksuid, KsuidLike};

use sidekick_domain::{
    Flow, FlowAction, FlowActionStatus, FlowStatus, FlowType, Storage, Subflow, SubflowStatus,
    Task, TaskStatus, Workspace, WorkspaceConfig, Worktree,
};
use sidekick_storage::{MemoryStorage, SqliteStorage};

fn ksuid() -> String {
    Ksuid::new(None, None).to_string()
}

async fn subflow_membership(storage: &dyn Storage) {
    let workspace_id = ksuid();
    let flow_id = format!("flow_{}", ksuid());
    let other_flow_id = format!("flow_{}", ksuid());

    let mut persisted = vec![];
    for (name, flow) in [
        ("Subflow 1", &flow_id),
        ("Subflow 2", &flow_id),
        ("Other", &other_flow_id),
    ] {
        let subflow = Subflow {
            workspace_id: workspace_id.clone(),
            id: format!("sf_{}", ksuid()),
            flow_id: flow.clone(),
            name: name.to_string(),
            status: SubflowStatus::Started,
            ..Default::default()
        };
        storage.persist_subflow(subflow.clone()).await.unwrap();
        persisted.push(subflow);
    }

    let subflows = storage
        .get_subflows(&workspace_id, &flow_id)
        .await
        .unwrap();
    assert_eq!(subflows.len(), 2);
    assert!(subflows.iter().all(|sf| sf.flow_id == flow_id));
    assert!(subflows.contains(&persisted[0]));
    assert!(subflows.contains(&persisted[1]));

    let loaded = storage
        .get_subflow(&workspace_id, &persisted[0].id)
        .await
        .unwrap();
    assert_eq!(loaded, persisted[0]);
}

async fn worktree_set_semantics(storage: &dyn Storage) {
    let workspace_id = ksuid();
    let worktree = Worktree {
        id: format!("wt_{}", ksuid()),
        workspace_id: workspace_id.clone(),
        flow_id: format!("flow_{}", ksuid()),
        name: "side/feature-branch".to_string(),
        created: Utc::now(),
    };

    storage.persist_worktree(worktree.clone()).await.unwrap();
    assert_eq!(
        storage
            .get_worktree(&workspace_id, &worktree.id)
            .await
            .unwrap(),
        worktree
    );
    assert!(storage
        .get_worktrees(&workspace_id)
        .await
        .unwrap()
        .contains(&worktree));

    storage
        .delete_worktree(&workspace_id, &worktree.id)
        .await
        .unwrap();
    assert!(storage
        .get_worktree(&workspace_id, &worktree.id)
        .await
        .unwrap_err()
        .is_not_found());
    assert!(!storage
        .get_worktrees(&workspace_id)
        .await
        .unwrap()
        .contains(&worktree));
}

async fn entity_round_trips(storage: &dyn Storage) {
    let workspace = Workspace {
        id: ksuid(),
        name: "sidekick".to_string(),
        local_repo_dir: "/home/user/project".to_string(),
    };
    storage.persist_workspace(workspace.clone()).await.unwrap();
    assert_eq!(
        storage.get_workspace(&workspace.id).await.unwrap(),
        workspace
    );

    let config = WorkspaceConfig::default();
    storage
        .persist_workspace_config(&workspace.id, config.clone())
        .await
        .unwrap();
    assert_eq!(
        storage.get_workspace_config(&workspace.id).await.unwrap(),
        config
    );

    let now = Utc::now();
    let task = Task {
        id: format!("task_{}", ksuid()),
        workspace_id: workspace.id.clone(),
        status: TaskStatus::InProgress,
        flow_type: FlowType::BasicDev,
        created: now,
        updated: now,
        ..Default::default()
    };
    storage.persist_task(task.clone()).await.unwrap();
    assert_eq!(
        storage.get_task(&workspace.id, &task.id).await.unwrap(),
        task
    );

    let flow = Flow {
        id: format!("flow_{}", ksuid()),
        workspace_id: workspace.id.clone(),
        flow_type: FlowType::BasicDev,
        parent_id: task.id.clone(),
        status: FlowStatus::InProgress,
    };
    storage.persist_flow(flow.clone()).await.unwrap();
    assert_eq!(
        storage.get_flow(&workspace.id, &flow.id).await.unwrap(),
        flow
    );
    assert_eq!(
        storage
            .get_flows_for_task(&workspace.id, &task.id)
            .await
            .unwrap(),
        vec![flow.clone()]
    );

    let action = FlowAction {
        id: format!("fa_{}", ksuid()),
        workspace_id: workspace.id.clone(),
        flow_id: flow.id.clone(),
        action_type: "edit_code".to_string(),
        action_params: serde_json::json!({"file": "src/main.rs"}),
        status: FlowActionStatus::Pending,
        created: now,
        updated: now,
        ..Default::default()
    };
    storage.persist_flow_action(action.clone()).await.unwrap();
    assert_eq!(
        storage
            .get_flow_action(&workspace.id, &action.id)
            .await
            .unwrap(),
        action
    );
    assert_eq!(
        storage
            .get_flow_actions(&workspace.id, &flow.id)
            .await
            .unwrap(),
        vec![action]
    );
}

async fn archived_task_pagination(storage: &dyn Storage) {
    let workspace_id = ksuid();
    for i in 0..5 {
        let task = Task {
            id: format!("task_{i}_{}", ksuid()),
            workspace_id: workspace_id.clone(),
            status: TaskStatus::Archived,
            created: Utc::now(),
            updated: Utc::now() + chrono::Duration::seconds(i),
            ..Default::default()
        };
        storage.persist_task(task).await.unwrap();
    }
    // One non-archived task must not show up.
    storage
        .persist_task(Task {
            id: format!("task_live_{}", ksuid()),
            workspace_id: workspace_id.clone(),
            status: TaskStatus::InProgress,
            created: Utc::now(),
            updated: Utc::now(),
            ..Default::default()
        })
        .await
        .unwrap();

    let (page1, total) = storage
        .get_archived_tasks(&workspace_id, 1, 2)
        .await
        .unwrap();
    assert_eq!(total, 5);
    assert_eq!(page1.len(), 2);
    // Newest first.
    assert!(page1[0].updated >= page1[1].updated);

    let (page3, _) = storage
        .get_archived_tasks(&workspace_id, 3, 2)
        .await
        .unwrap();
    assert_eq!(page3.len(), 1);
}

async fn flow_action_validation(storage: &dyn Storage) {
    let valid = FlowAction {
        id: format!("fa_{}", ksuid()),
        workspace_id: ksuid(),
        flow_id: format!("flow_{}", ksuid()),
        action_type: "run_tests".to_string(),
        ..Default::default()
    };

    for (field, action) in [
        (
            "workspaceId",
            FlowAction {
                workspace_id: String::new(),
                ..valid.clone()
            },
        ),
        (
            "flowAction.Id",
            FlowAction {
                id: String::new(),
                ..valid.clone()
            },
        ),
        (
            "flowAction.FlowId",
            FlowAction {
                flow_id: String::new(),
                ..valid.clone()
            },
        ),
    ] {
        let err = storage.persist_flow_action(action).await.unwrap_err();
        assert!(
            err.to_string().contains(field),
            "expected validation error naming {field}, got: {err}"
        );
    }
}

macro_rules! backend_tests {
    ($module:ident, $make:expr) => {
        mod $module {
            use super::*;

            #[tokio::test]
            async fn test_subflow_membership() {
                let storage = $make;
                subflow_membership(&storage).await;
            }

            #[tokio::test]
            async fn test_worktree_set_semantics() {
                let storage = $make;
                worktree_set_semantics(&storage).await;
            }

            #[tokio::test]
            async fn test_entity_round_trips() {
                let storage = $make;
                entity_round_trips(&storage).await;
            }

            #[tokio::test]
            async fn test_archived_task_pagination() {
                let storage = $make;
                archived_task_pagination(&storage).await;
            }

            #[tokio::test]
            async fn test_flow_action_validation() {
                let storage = $make;
                flow_action_validation(&storage).await;
            }
        }
    };
}

backend_tests!(memory_backend, MemoryStorage::new());
backend_tests!(sqlite_backend, SqliteStorage::in_memory().await.unwrap());
