//! Execution environments
//!
//! An [`EnvContainer`] is where a flow's commands run: the repository itself
//! (`local`) or a dedicated git worktree (`local_git_worktree`) so
//! concurrent flows do not collide. Containers are serializable and ride in
//! activity inputs.

pub mod git;

use std::path::Path;
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::process::Command;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvType {
    #[default]
    Local,
    LocalGitWorktree,
}

impl std::fmt::Display for EnvType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::LocalGitWorktree => write!(f, "local_git_worktree"),
        }
    }
}

/// Captured output of one command run.
///
/// A non-zero exit status is a result, never an `Err`: test commands fail
/// routinely and the caller decides what that means.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }

    /// Stdout and stderr interleaved the way test output is shown to users.
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EnvContainer {
    Local {
        work_dir: String,
    },
    LocalGitWorktree {
        /// The worktree checkout commands run in.
        work_dir: String,
        /// The repository the worktree was created from.
        base_dir: String,
        /// Worktree branch name.
        branch: String,
    },
}

impl EnvContainer {
    pub fn local(work_dir: impl Into<String>) -> Self {
        Self::Local {
            work_dir: work_dir.into(),
        }
    }

    pub fn env_type(&self) -> EnvType {
        match self {
            Self::Local { .. } => EnvType::Local,
            Self::LocalGitWorktree { .. } => EnvType::LocalGitWorktree,
        }
    }

    pub fn working_directory(&self) -> &str {
        match self {
            Self::Local { work_dir } => work_dir,
            Self::LocalGitWorktree { work_dir, .. } => work_dir,
        }
    }

    /// Run a command in the environment's working directory, capturing
    /// output. Only spawn failures (missing binary, bad directory) error.
    pub async fn run_command(&self, command: &str, args: &[&str]) -> std::io::Result<CommandOutput> {
        run_in(self.working_directory(), command, args).await
    }

    /// Run a shell command line, as configured test/format commands are.
    pub async fn run_shell(&self, command_line: &str) -> std::io::Result<CommandOutput> {
        self.run_command("sh", &["-c", command_line]).await
    }
}

pub(crate) async fn run_in(
    dir: impl AsRef<Path>,
    command: &str,
    args: &[&str],
) -> std::io::Result<CommandOutput> {
    let output = Command::new(command)
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_status: output.status.code().unwrap_or(-1),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_command_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        let env = EnvContainer::local(dir.path().to_string_lossy());

        let output = env.run_command("echo", &["hello"]).await.unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let env = EnvContainer::local(dir.path().to_string_lossy());

        let output = env.run_shell("exit 3").await.unwrap();
        assert!(!output.success());
        assert_eq!(output.exit_status, 3);
    }

    #[test]
    fn test_container_serialization() {
        let env = EnvContainer::LocalGitWorktree {
            work_dir: "/tmp/wt".to_string(),
            base_dir: "/tmp/repo".to_string(),
            branch: "side/flow_1".to_string(),
        };
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains("\"type\":\"local_git_worktree\""));
        let parsed: EnvContainer = serde_json::from_str(&json).unwrap();
        assert_eq!(env, parsed);
        assert_eq!(parsed.env_type(), EnvType::LocalGitWorktree);
    }
}
