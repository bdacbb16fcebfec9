//! Git plumbing used by the dev activities
//!
//! Thin wrappers over the `git` CLI. Helpers that answer questions return
//! values; helpers that mutate return the raw [`CommandOutput`] so callers
//! can surface git's own message on failure.

use std::io;
use std::path::Path;

use super::{run_in, CommandOutput, EnvContainer};

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("failed to run git: {0}")]
    Io(#[from] io::Error),

    #[error("git {command} failed: {message}")]
    Command { command: String, message: String },
}

fn check(command: &str, output: CommandOutput) -> Result<CommandOutput, GitError> {
    if output.success() {
        Ok(output)
    } else {
        Err(GitError::Command {
            command: command.to_string(),
            message: output.combined().trim().to_string(),
        })
    }
}

pub async fn is_git_repo(dir: impl AsRef<Path>) -> bool {
    match run_in(dir, "git", &["rev-parse", "--is-inside-work-tree"]).await {
        Ok(output) => output.success() && output.stdout.trim() == "true",
        Err(_) => false,
    }
}

pub async fn git_base_dir(dir: impl AsRef<Path>) -> Result<String, GitError> {
    let output = check(
        "rev-parse",
        run_in(dir, "git", &["rev-parse", "--show-toplevel"]).await?,
    )?;
    Ok(output.stdout.trim().to_string())
}

/// Diff of the working tree against HEAD, staged changes included.
pub async fn git_diff(env: &EnvContainer) -> Result<String, GitError> {
    let output = check("diff", env.run_command("git", &["diff", "HEAD"]).await?)?;
    Ok(output.stdout)
}

pub async fn git_add_all(env: &EnvContainer) -> Result<(), GitError> {
    check("add", env.run_command("git", &["add", "-A"]).await?)?;
    Ok(())
}

/// Commit staged changes; an empty index is not an error.
pub async fn git_commit(env: &EnvContainer, message: &str) -> Result<(), GitError> {
    let output = env
        .run_command("git", &["commit", "-m", message])
        .await?;
    if output.success() || output.combined().contains("nothing to commit") {
        return Ok(());
    }
    check("commit", output)?;
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeResult {
    pub has_conflicts: bool,
}

/// Merge `source_branch` into `target_branch` inside `base_dir`. A conflict
/// is a result, not an error; the merge is left in progress for the user to
/// resolve.
pub async fn git_merge(
    base_dir: &str,
    source_branch: &str,
    target_branch: &str,
) -> Result<MergeResult, GitError> {
    check(
        "checkout",
        run_in(base_dir, "git", &["checkout", target_branch]).await?,
    )?;

    let output = run_in(base_dir, "git", &["merge", "--no-ff", source_branch]).await?;
    if output.success() {
        return Ok(MergeResult {
            has_conflicts: false,
        });
    }
    if output.combined().contains("CONFLICT") {
        return Ok(MergeResult {
            has_conflicts: true,
        });
    }
    check("merge", output)?;
    unreachable!("checked output above");
}

/// Create a worktree with its own branch starting from `start_branch`.
pub async fn git_worktree_add(
    base_dir: &str,
    worktree_dir: &str,
    branch: &str,
    start_branch: &str,
) -> Result<(), GitError> {
    check(
        "worktree add",
        run_in(
            base_dir,
            "git",
            &["worktree", "add", "-b", branch, worktree_dir, start_branch],
        )
        .await?,
    )?;
    Ok(())
}

/// Remove a worktree directory and its branch after a successful merge.
pub async fn git_worktree_remove(
    base_dir: &str,
    worktree_dir: &str,
    branch: &str,
) -> Result<(), GitError> {
    check(
        "worktree remove",
        run_in(
            base_dir,
            "git",
            &["worktree", "remove", "--force", worktree_dir],
        )
        .await?,
    )?;
    // Branch deletion is best effort; the merge already landed.
    let _ = run_in(base_dir, "git", &["branch", "-D", branch]).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn init_repo(dir: &Path) {
        for args in [
            vec!["init", "-b", "main"],
            vec!["config", "user.email", "dev@example.com"],
            vec!["config", "user.name", "Dev"],
        ] {
            let output = run_in(dir, "git", &args).await.unwrap();
            assert!(output.success(), "git {args:?}: {}", output.combined());
        }
        std::fs::write(dir.join("README.md"), "# demo\n").unwrap();
        run_in(dir, "git", &["add", "-A"]).await.unwrap();
        run_in(dir, "git", &["commit", "-m", "init"]).await.unwrap();
    }

    #[tokio::test]
    async fn test_is_git_repo() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_git_repo(dir.path()).await);

        init_repo(dir.path()).await;
        assert!(is_git_repo(dir.path()).await);
        assert_eq!(
            git_base_dir(dir.path()).await.unwrap(),
            dir.path().canonicalize().unwrap().to_string_lossy()
        );
    }

    #[tokio::test]
    async fn test_diff_commit_cycle() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path()).await;
        let env = EnvContainer::local(dir.path().to_string_lossy());

        std::fs::write(dir.path().join("README.md"), "# demo\nchanged\n").unwrap();
        git_add_all(&env).await.unwrap();
        let diff = git_diff(&env).await.unwrap();
        assert!(diff.contains("changed"));

        git_commit(&env, "update readme").await.unwrap();
        let diff = git_diff(&env).await.unwrap();
        assert!(diff.is_empty());

        // Committing again with a clean tree is fine.
        git_commit(&env, "noop").await.unwrap();
    }

    #[tokio::test]
    async fn test_worktree_merge_cycle() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path()).await;
        let base_dir = dir.path().to_string_lossy().to_string();
        let worktree_dir = dir.path().join(".worktrees").join("flow_test");
        let worktree_dir = worktree_dir.to_string_lossy().to_string();

        git_worktree_add(&base_dir, &worktree_dir, "side/flow_test", "main")
            .await
            .unwrap();

        let env = EnvContainer::LocalGitWorktree {
            work_dir: worktree_dir.clone(),
            base_dir: base_dir.clone(),
            branch: "side/flow_test".to_string(),
        };
        std::fs::write(Path::new(&worktree_dir).join("feature.txt"), "done\n").unwrap();
        git_add_all(&env).await.unwrap();
        git_commit(&env, "add feature").await.unwrap();

        let result = git_merge(&base_dir, "side/flow_test", "main").await.unwrap();
        assert!(!result.has_conflicts);
        assert!(dir.path().join("feature.txt").exists());

        git_worktree_remove(&base_dir, &worktree_dir, "side/flow_test")
            .await
            .unwrap();
        assert!(!Path::new(&worktree_dir).exists());
    }
}
