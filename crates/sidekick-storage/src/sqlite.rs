//! SQLite storage implementation
//!
//! Relational counterpart of [`crate::MemoryStorage`], satisfying the same
//! contract. Entities are stored as JSON in a `data` column with the id and
//! parent columns extracted for indexed lookups, mirroring the
//! `<wsId>:<entityId>` / `<wsId>:<parent>:<kind>` layout of the KV backends.

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use sidekick_domain::storage::Result;
use sidekick_domain::{
    Flow, FlowAction, KvStorage, Storage, StorageError, Subflow, Task, TaskStatus, Workspace,
    WorkspaceConfig, Worktree,
};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS workspaces (
        id TEXT PRIMARY KEY,
        data TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS workspace_configs (
        workspace_id TEXT PRIMARY KEY,
        data TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS tasks (
        workspace_id TEXT NOT NULL,
        id TEXT NOT NULL,
        status TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        data TEXT NOT NULL,
        PRIMARY KEY (workspace_id, id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks (workspace_id, status)",
    "CREATE TABLE IF NOT EXISTS flows (
        workspace_id TEXT NOT NULL,
        id TEXT NOT NULL,
        parent_id TEXT NOT NULL,
        data TEXT NOT NULL,
        PRIMARY KEY (workspace_id, id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_flows_parent ON flows (workspace_id, parent_id)",
    "CREATE TABLE IF NOT EXISTS subflows (
        workspace_id TEXT NOT NULL,
        id TEXT NOT NULL,
        flow_id TEXT NOT NULL,
        data TEXT NOT NULL,
        PRIMARY KEY (workspace_id, id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_subflows_flow ON subflows (workspace_id, flow_id)",
    "CREATE TABLE IF NOT EXISTS flow_actions (
        workspace_id TEXT NOT NULL,
        id TEXT NOT NULL,
        flow_id TEXT NOT NULL,
        data TEXT NOT NULL,
        PRIMARY KEY (workspace_id, id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_flow_actions_flow ON flow_actions (workspace_id, flow_id)",
    "CREATE TABLE IF NOT EXISTS worktrees (
        workspace_id TEXT NOT NULL,
        id TEXT NOT NULL,
        data TEXT NOT NULL,
        PRIMARY KEY (workspace_id, id)
    )",
    "CREATE TABLE IF NOT EXISTS kv (
        workspace_id TEXT NOT NULL,
        key TEXT NOT NULL,
        value TEXT NOT NULL,
        PRIMARY KEY (workspace_id, key)
    )",
];

pub struct SqliteStorage {
    pool: SqlitePool,
}

fn db_err(e: sqlx::Error) -> StorageError {
    StorageError::Io(e.to_string())
}

fn encode<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| StorageError::Io(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(data: &str) -> Result<T> {
    serde_json::from_str(data).map_err(|e| StorageError::Io(e.to_string()))
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(StorageError::validation(field));
    }
    Ok(())
}

impl SqliteStorage {
    /// Open (or create) a database at the given sqlx connection url, e.g.
    /// `sqlite:///path/to/side.db?mode=rwc`.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(url)
            .await
            .map_err(db_err)?;
        let storage = Self { pool };
        storage.migrate().await?;
        Ok(storage)
    }

    /// A fresh private in-memory database.
    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:").await
    }

    async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }
        Ok(())
    }

    async fn fetch_data(&self, query: &str, binds: &[&str]) -> Result<Option<String>> {
        let mut q = sqlx::query(query);
        for bind in binds {
            q = q.bind(*bind);
        }
        let row = q.fetch_optional(&self.pool).await.map_err(db_err)?;
        match row {
            Some(row) => Ok(Some(row.try_get::<String, _>("data").map_err(db_err)?)),
            None => Ok(None),
        }
    }

    async fn fetch_all_data(&self, query: &str, binds: &[&str]) -> Result<Vec<String>> {
        let mut q = sqlx::query(query);
        for bind in binds {
            q = q.bind(*bind);
        }
        let rows = q.fetch_all(&self.pool).await.map_err(db_err)?;
        rows.into_iter()
            .map(|row| row.try_get::<String, _>("data").map_err(db_err))
            .collect()
    }
}

#[async_trait]
impl KvStorage for SqliteStorage {
    async fn mget(
        &self,
        workspace_id: &str,
        keys: &[String],
    ) -> Result<Vec<Option<serde_json::Value>>> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            let row = sqlx::query("SELECT value FROM kv WHERE workspace_id = ?1 AND key = ?2")
                .bind(workspace_id)
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
            match row {
                Some(row) => {
                    let raw: String = row.try_get("value").map_err(db_err)?;
                    values.push(Some(decode(&raw)?));
                }
                None => values.push(None),
            }
        }
        Ok(values)
    }

    async fn mset(
        &self,
        workspace_id: &str,
        values: &[(String, serde_json::Value)],
    ) -> Result<()> {
        for (key, value) in values {
            sqlx::query(
                "INSERT INTO kv (workspace_id, key, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT (workspace_id, key) DO UPDATE SET value = excluded.value",
            )
            .bind(workspace_id)
            .bind(key)
            .bind(encode(value)?)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn persist_workspace(&self, workspace: Workspace) -> Result<()> {
        require("workspace.Id", &workspace.id)?;
        sqlx::query(
            "INSERT INTO workspaces (id, data) VALUES (?1, ?2)
             ON CONFLICT (id) DO UPDATE SET data = excluded.data",
        )
        .bind(&workspace.id)
        .bind(encode(&workspace)?)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_workspace(&self, workspace_id: &str) -> Result<Workspace> {
        let data = self
            .fetch_data("SELECT data FROM workspaces WHERE id = ?1", &[workspace_id])
            .await?
            .ok_or(StorageError::NotFound)?;
        decode(&data)
    }

    async fn get_all_workspaces(&self) -> Result<Vec<Workspace>> {
        let rows = self
            .fetch_all_data("SELECT data FROM workspaces ORDER BY id", &[])
            .await?;
        rows.iter().map(|data| decode(data)).collect()
    }

    async fn persist_workspace_config(
        &self,
        workspace_id: &str,
        config: WorkspaceConfig,
    ) -> Result<()> {
        require("workspaceId", workspace_id)?;
        sqlx::query(
            "INSERT INTO workspace_configs (workspace_id, data) VALUES (?1, ?2)
             ON CONFLICT (workspace_id) DO UPDATE SET data = excluded.data",
        )
        .bind(workspace_id)
        .bind(encode(&config)?)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_workspace_config(&self, workspace_id: &str) -> Result<WorkspaceConfig> {
        let data = self
            .fetch_data(
                "SELECT data FROM workspace_configs WHERE workspace_id = ?1",
                &[workspace_id],
            )
            .await?
            .ok_or(StorageError::NotFound)?;
        decode(&data)
    }

    async fn persist_task(&self, task: Task) -> Result<()> {
        require("workspaceId", &task.workspace_id)?;
        require("task.Id", &task.id)?;
        sqlx::query(
            "INSERT INTO tasks (workspace_id, id, status, updated_at, data)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (workspace_id, id) DO UPDATE
             SET status = excluded.status,
                 updated_at = excluded.updated_at,
                 data = excluded.data",
        )
        .bind(&task.workspace_id)
        .bind(&task.id)
        .bind(task.status.to_string())
        .bind(task.updated.to_rfc3339())
        .bind(encode(&task)?)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_task(&self, workspace_id: &str, task_id: &str) -> Result<Task> {
        let data = self
            .fetch_data(
                "SELECT data FROM tasks WHERE workspace_id = ?1 AND id = ?2",
                &[workspace_id, task_id],
            )
            .await?
            .ok_or(StorageError::NotFound)?;
        decode(&data)
    }

    async fn get_tasks(&self, workspace_id: &str, statuses: &[TaskStatus]) -> Result<Vec<Task>> {
        let rows = self
            .fetch_all_data(
                "SELECT data FROM tasks WHERE workspace_id = ?1 ORDER BY id",
                &[workspace_id],
            )
            .await?;
        let tasks: Result<Vec<Task>> = rows.iter().map(|data| decode(data)).collect();
        Ok(tasks?
            .into_iter()
            .filter(|t| statuses.is_empty() || statuses.contains(&t.status))
            .collect())
    }

    async fn get_archived_tasks(
        &self,
        workspace_id: &str,
        page: u64,
        page_size: u64,
    ) -> Result<(Vec<Task>, u64)> {
        let total_row = sqlx::query(
            "SELECT COUNT(*) AS total FROM tasks WHERE workspace_id = ?1 AND status = 'archived'",
        )
        .bind(workspace_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        let total: i64 = total_row.try_get("total").map_err(db_err)?;

        let page = page.max(1);
        let rows = sqlx::query(
            "SELECT data FROM tasks WHERE workspace_id = ?1 AND status = 'archived'
             ORDER BY updated_at DESC LIMIT ?2 OFFSET ?3",
        )
        .bind(workspace_id)
        .bind(page_size as i64)
        .bind(((page - 1) * page_size) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let tasks: Result<Vec<Task>> = rows
            .into_iter()
            .map(|row| {
                let data: String = row.try_get("data").map_err(db_err)?;
                decode(&data)
            })
            .collect();
        Ok((tasks?, total as u64))
    }

    async fn persist_flow(&self, flow: Flow) -> Result<()> {
        require("workspaceId", &flow.workspace_id)?;
        require("flow.Id", &flow.id)?;
        sqlx::query(
            "INSERT INTO flows (workspace_id, id, parent_id, data) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (workspace_id, id) DO UPDATE
             SET parent_id = excluded.parent_id, data = excluded.data",
        )
        .bind(&flow.workspace_id)
        .bind(&flow.id)
        .bind(&flow.parent_id)
        .bind(encode(&flow)?)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_flow(&self, workspace_id: &str, flow_id: &str) -> Result<Flow> {
        let data = self
            .fetch_data(
                "SELECT data FROM flows WHERE workspace_id = ?1 AND id = ?2",
                &[workspace_id, flow_id],
            )
            .await?
            .ok_or(StorageError::NotFound)?;
        decode(&data)
    }

    async fn get_flows_for_task(&self, workspace_id: &str, task_id: &str) -> Result<Vec<Flow>> {
        let rows = self
            .fetch_all_data(
                "SELECT data FROM flows WHERE workspace_id = ?1 AND parent_id = ?2 ORDER BY id",
                &[workspace_id, task_id],
            )
            .await?;
        rows.iter().map(|data| decode(data)).collect()
    }

    async fn persist_subflow(&self, subflow: Subflow) -> Result<()> {
        require("workspaceId", &subflow.workspace_id)?;
        require("subflow.Id", &subflow.id)?;
        require("subflow.FlowId", &subflow.flow_id)?;
        sqlx::query(
            "INSERT INTO subflows (workspace_id, id, flow_id, data) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (workspace_id, id) DO UPDATE
             SET flow_id = excluded.flow_id, data = excluded.data",
        )
        .bind(&subflow.workspace_id)
        .bind(&subflow.id)
        .bind(&subflow.flow_id)
        .bind(encode(&subflow)?)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_subflows(&self, workspace_id: &str, flow_id: &str) -> Result<Vec<Subflow>> {
        let rows = self
            .fetch_all_data(
                "SELECT data FROM subflows WHERE workspace_id = ?1 AND flow_id = ?2
                 ORDER BY rowid",
                &[workspace_id, flow_id],
            )
            .await?;
        rows.iter().map(|data| decode(data)).collect()
    }

    async fn get_subflow(&self, workspace_id: &str, subflow_id: &str) -> Result<Subflow> {
        let data = self
            .fetch_data(
                "SELECT data FROM subflows WHERE workspace_id = ?1 AND id = ?2",
                &[workspace_id, subflow_id],
            )
            .await?
            .ok_or(StorageError::NotFound)?;
        decode(&data)
    }

    async fn persist_flow_action(&self, action: FlowAction) -> Result<()> {
        require("workspaceId", &action.workspace_id)?;
        require("flowAction.Id", &action.id)?;
        require("flowAction.FlowId", &action.flow_id)?;
        sqlx::query(
            "INSERT INTO flow_actions (workspace_id, id, flow_id, data) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (workspace_id, id) DO UPDATE
             SET flow_id = excluded.flow_id, data = excluded.data",
        )
        .bind(&action.workspace_id)
        .bind(&action.id)
        .bind(&action.flow_id)
        .bind(encode(&action)?)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_flow_actions(
        &self,
        workspace_id: &str,
        flow_id: &str,
    ) -> Result<Vec<FlowAction>> {
        let rows = self
            .fetch_all_data(
                "SELECT data FROM flow_actions WHERE workspace_id = ?1 AND flow_id = ?2
                 ORDER BY rowid",
                &[workspace_id, flow_id],
            )
            .await?;
        rows.iter().map(|data| decode(data)).collect()
    }

    async fn get_flow_action(&self, workspace_id: &str, action_id: &str) -> Result<FlowAction> {
        let data = self
            .fetch_data(
                "SELECT data FROM flow_actions WHERE workspace_id = ?1 AND id = ?2",
                &[workspace_id, action_id],
            )
            .await?
            .ok_or(StorageError::NotFound)?;
        decode(&data)
    }

    async fn persist_worktree(&self, worktree: Worktree) -> Result<()> {
        require("workspaceId", &worktree.workspace_id)?;
        require("worktree.Id", &worktree.id)?;
        require("worktree.FlowId", &worktree.flow_id)?;
        sqlx::query(
            "INSERT INTO worktrees (workspace_id, id, data) VALUES (?1, ?2, ?3)
             ON CONFLICT (workspace_id, id) DO UPDATE SET data = excluded.data",
        )
        .bind(&worktree.workspace_id)
        .bind(&worktree.id)
        .bind(encode(&worktree)?)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_worktree(&self, workspace_id: &str, worktree_id: &str) -> Result<Worktree> {
        let data = self
            .fetch_data(
                "SELECT data FROM worktrees WHERE workspace_id = ?1 AND id = ?2",
                &[workspace_id, worktree_id],
            )
            .await?
            .ok_or(StorageError::NotFound)?;
        decode(&data)
    }

    async fn get_worktrees(&self, workspace_id: &str) -> Result<Vec<Worktree>> {
        let rows = self
            .fetch_all_data(
                "SELECT data FROM worktrees WHERE workspace_id = ?1 ORDER BY id",
                &[workspace_id],
            )
            .await?;
        rows.iter().map(|data| decode(data)).collect()
    }

    async fn delete_worktree(&self, workspace_id: &str, worktree_id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM worktrees WHERE workspace_id = ?1 AND id = ?2")
            .bind(workspace_id)
            .bind(worktree_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    async fn check_connection(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_workspace_round_trip() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let workspace = Workspace {
            id: "ws_1".to_string(),
            name: "demo".to_string(),
            local_repo_dir: "/tmp/demo".to_string(),
        };
        storage.persist_workspace(workspace.clone()).await.unwrap();
        assert_eq!(storage.get_workspace("ws_1").await.unwrap(), workspace);
        assert!(storage.get_workspace("ws_2").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_persist_is_full_replace() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let mut flow = Flow {
            id: "flow_1".to_string(),
            workspace_id: "ws_1".to_string(),
            parent_id: "task_1".to_string(),
            ..Default::default()
        };
        storage.persist_flow(flow.clone()).await.unwrap();

        flow.status = sidekick_domain::FlowStatus::Completed;
        storage.persist_flow(flow.clone()).await.unwrap();

        let loaded = storage.get_flow("ws_1", "flow_1").await.unwrap();
        assert_eq!(loaded.status, sidekick_domain::FlowStatus::Completed);
        assert_eq!(
            storage.get_flows_for_task("ws_1", "task_1").await.unwrap(),
            vec![flow]
        );
    }
}
