//! Repo configuration (`side.toml`)
//!
//! Recognized sections:
//!
//! ```toml
//! [[test_commands]]
//! command = "cargo test"
//!
//! [[integration_test_commands]]
//! command = "cargo test --test integration"
//!
//! [ai]
//! default = [{ provider = "anthropic" }]
//!
//! max_iterations = 17
//!
//! [[formatters]]
//! command = "cargo fmt"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use sidekick_domain::ModelConfig;

pub const CONFIG_FILE_NAME: &str = "side.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// `side.toml` does not exist in the repo.
    #[error("missing config file: {0}")]
    Missing(PathBuf),

    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCommand {
    pub command: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatterCommand {
    pub command: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AiConfig {
    #[serde(default)]
    pub default: Vec<ModelConfig>,
}

/// Per-repository configuration parsed from `side.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepoConfig {
    #[serde(default)]
    pub test_commands: Vec<TestCommand>,

    #[serde(default)]
    pub integration_test_commands: Vec<TestCommand>,

    #[serde(default)]
    pub ai: AiConfig,

    /// Cap on coding-loop attempts; 0 means "use the built-in default".
    #[serde(default)]
    pub max_iterations: u32,

    #[serde(default)]
    pub formatters: Vec<FormatterCommand>,
}

impl RepoConfig {
    /// Load `side.toml` from a repository directory.
    pub fn load(repo_dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = repo_dir.as_ref().join(CONFIG_FILE_NAME);
        if !path.exists() {
            return Err(ConfigError::Missing(path));
        }
        let raw = std::fs::read_to_string(&path)?;
        Ok(toml::from_str(&raw)?)
    }

    pub fn save(&self, repo_dir: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = repo_dir.as_ref().join(CONFIG_FILE_NAME);
        let raw = toml::to_string_pretty(self).map_err(|e| {
            ConfigError::Io(std::io::Error::other(format!(
                "failed to serialize config: {e}"
            )))
        })?;
        std::fs::write(path, raw)?;
        Ok(())
    }

    pub fn has_test_commands(&self) -> bool {
        !self.test_commands.is_empty()
    }
}

/// Sidekick's per-user data directory, for worktrees and local databases.
pub fn data_home() -> PathBuf {
    if let Ok(dir) = std::env::var("SIDE_DATA_HOME") {
        return PathBuf::from(dir);
    }
    directories::ProjectDirs::from("", "", "sidekick")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".sidekick"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let raw = r#"
            max_iterations = 5

            [[test_commands]]
            command = "jest"

            [[integration_test_commands]]
            command = "jest --config integration.config.js"

            [ai]
            default = [{ provider = "openai" }, { provider = "anthropic" }]

            [[formatters]]
            command = "prettier --write ."
        "#;
        let config: RepoConfig = toml::from_str(raw).unwrap();

        assert!(config.has_test_commands());
        assert_eq!(config.test_commands[0].command, "jest");
        assert_eq!(config.integration_test_commands.len(), 1);
        assert_eq!(config.ai.default.len(), 2);
        assert_eq!(config.ai.default[0].provider, "openai");
        assert_eq!(config.max_iterations, 5);
        assert_eq!(config.formatters[0].command, "prettier --write .");
    }

    #[test]
    fn test_parse_minimal_config() {
        let config: RepoConfig = toml::from_str(
            "[[test_commands]]\ncommand = \"jest\"\n\n[ai]\ndefault = [{ provider = \"openai\" }]\n",
        )
        .unwrap();
        assert!(config.has_test_commands());
        assert!(config.integration_test_commands.is_empty());
        assert_eq!(config.max_iterations, 0);
    }

    #[test]
    fn test_missing_file_is_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let err = RepoConfig::load(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Missing(_)));
    }

    #[test]
    fn test_save_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = RepoConfig {
            test_commands: vec![TestCommand {
                command: "pytest".to_string(),
            }],
            ..Default::default()
        };
        config.save(dir.path()).unwrap();

        let raw = std::fs::read_to_string(dir.path().join(CONFIG_FILE_NAME)).unwrap();
        assert!(raw.contains("command = \"pytest\""));

        let loaded = RepoConfig::load(dir.path()).unwrap();
        assert_eq!(loaded, config);
    }
}
