//! Git activities

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use svix_ksuid::{Ksuid, KsuidLike};

use sidekick_domain::{Storage, Worktree};
use sidekick_durable::{Activity, ActivityContext, ActivityError};

use crate::config::data_home;
use crate::env::git::{self, GitError, MergeResult};
use crate::env::EnvContainer;

use super::storage_err;

fn git_err(e: GitError) -> ActivityError {
    match e {
        GitError::Io(e) => ActivityError::retryable(e.to_string()),
        GitError::Command { .. } => ActivityError::non_retryable(e.to_string()).with_type("GIT"),
    }
}

/// Create a dedicated worktree (and branch) for a flow and persist its
/// record.
pub struct CreateWorktreeActivity {
    pub storage: Arc<dyn Storage>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateWorktreeInput {
    pub workspace_id: String,
    pub flow_id: String,
    pub repo_dir: String,
    #[serde(default)]
    pub start_branch: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateWorktreeOutput {
    pub worktree: Worktree,
    pub env: EnvContainer,
}

#[async_trait]
impl Activity for CreateWorktreeActivity {
    const TYPE: &'static str = "create_worktree";
    type Input = CreateWorktreeInput;
    type Output = CreateWorktreeOutput;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        let branch = format!("side/{}", input.flow_id);
        let worktree_dir = data_home().join("worktrees").join(&input.flow_id);
        if let Some(parent) = worktree_dir.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ActivityError::retryable(e.to_string()))?;
        }
        let worktree_dir = worktree_dir.to_string_lossy().into_owned();
        let start_branch = input.start_branch.as_deref().unwrap_or("main");

        git::git_worktree_add(&input.repo_dir, &worktree_dir, &branch, start_branch)
            .await
            .map_err(git_err)?;

        let worktree = Worktree {
            id: format!("wt_{}", Ksuid::new(None, None)),
            workspace_id: input.workspace_id.clone(),
            flow_id: input.flow_id.clone(),
            name: branch.clone(),
            created: Utc::now(),
        };
        self.storage
            .persist_worktree(worktree.clone())
            .await
            .map_err(storage_err)?;

        Ok(CreateWorktreeOutput {
            worktree,
            env: EnvContainer::LocalGitWorktree {
                work_dir: worktree_dir,
                base_dir: input.repo_dir,
                branch,
            },
        })
    }
}

/// Remove a merged flow's worktree and delete its record.
pub struct CleanupWorktreeActivity {
    pub storage: Arc<dyn Storage>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CleanupWorktreeInput {
    pub workspace_id: String,
    pub worktree: Worktree,
    pub env: EnvContainer,
}

#[async_trait]
impl Activity for CleanupWorktreeActivity {
    const TYPE: &'static str = "cleanup_worktree";
    type Input = CleanupWorktreeInput;
    type Output = ();

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        if let EnvContainer::LocalGitWorktree {
            work_dir,
            base_dir,
            branch,
        } = &input.env
        {
            git::git_worktree_remove(base_dir, work_dir, branch)
                .await
                .map_err(git_err)?;
        }
        self.storage
            .delete_worktree(&input.workspace_id, &input.worktree.id)
            .await
            .map_err(storage_err)?;
        Ok(())
    }
}

pub struct GitDiffActivity;

#[derive(Debug, Serialize, Deserialize)]
pub struct GitDiffInput {
    pub env: EnvContainer,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GitDiffOutput {
    pub diff: String,
}

#[async_trait]
impl Activity for GitDiffActivity {
    const TYPE: &'static str = "git_diff";
    type Input = GitDiffInput;
    type Output = GitDiffOutput;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        let diff = git::git_diff(&input.env).await.map_err(git_err)?;
        Ok(GitDiffOutput { diff })
    }
}

pub struct GitAddActivity;

#[derive(Debug, Serialize, Deserialize)]
pub struct GitAddInput {
    pub env: EnvContainer,
}

#[async_trait]
impl Activity for GitAddActivity {
    const TYPE: &'static str = "git_add";
    type Input = GitAddInput;
    type Output = ();

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        git::git_add_all(&input.env).await.map_err(git_err)
    }
}

pub struct GitCommitActivity;

#[derive(Debug, Serialize, Deserialize)]
pub struct GitCommitInput {
    pub env: EnvContainer,
    pub commit_message: String,
}

#[async_trait]
impl Activity for GitCommitActivity {
    const TYPE: &'static str = "git_commit";
    type Input = GitCommitInput;
    type Output = ();

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        git::git_commit(&input.env, &input.commit_message)
            .await
            .map_err(git_err)
    }
}

pub struct GitMergeActivity;

#[derive(Debug, Serialize, Deserialize)]
pub struct GitMergeInput {
    pub env: EnvContainer,
    pub source_branch: String,
    pub target_branch: String,
}

#[async_trait]
impl Activity for GitMergeActivity {
    const TYPE: &'static str = "git_merge";
    type Input = GitMergeInput;
    type Output = MergeResult;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        let EnvContainer::LocalGitWorktree { base_dir, .. } = &input.env else {
            return Err(
                ActivityError::non_retryable("merge requires a git worktree environment")
                    .with_type("GIT"),
            );
        };
        git::git_merge(base_dir, &input.source_branch, &input.target_branch)
            .await
            .map_err(git_err)
    }
}
