//! `side init` — repository and workspace bootstrap
//!
//! Ensures `side.toml` exists (prompting for a test command when none is
//! configured), registers the workspace, and replaces the workspace model
//! defaults with the configured providers.

use std::io::{BufRead, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use svix_ksuid::{Ksuid, KsuidLike};

use sidekick_dev::config::{data_home, RepoConfig, TestCommand, CONFIG_FILE_NAME};
use sidekick_dev::secrets::SecretManager;
use sidekick_domain::workspace::ModelDefaults;
use sidekick_domain::{ModelConfig, Storage, StorageError, Workspace, WorkspaceConfig};
use sidekick_storage::SqliteStorage;

pub struct ConfigCheck {
    pub config: RepoConfig,
    pub created: bool,
    pub has_test_commands: bool,
}

/// Ensure `side.toml` exists, creating an empty one if missing.
pub fn check_config(repo_dir: &Path) -> anyhow::Result<ConfigCheck> {
    let path = repo_dir.join(CONFIG_FILE_NAME);
    let (config, created) = if path.exists() {
        (RepoConfig::load(repo_dir)?, false)
    } else {
        let config = RepoConfig::default();
        config.save(repo_dir)?;
        (config, true)
    };
    let has_test_commands = config.has_test_commands();
    Ok(ConfigCheck {
        config,
        created,
        has_test_commands,
    })
}

/// Prompt for a test command when none is configured, and persist it.
pub fn ensure_test_commands<R: BufRead, W: Write>(
    repo_dir: &Path,
    mut config: RepoConfig,
    input: &mut R,
    output: &mut W,
) -> anyhow::Result<RepoConfig> {
    if config.has_test_commands() {
        return Ok(config);
    }

    write!(output, "Enter the command that runs your tests: ")?;
    output.flush()?;
    let mut line = String::new();
    input.read_line(&mut line)?;
    let command = line.trim().to_string();
    if command.is_empty() {
        anyhow::bail!("a test command is required");
    }

    config.test_commands.push(TestCommand { command });
    config.save(repo_dir)?;
    Ok(config)
}

/// Prompt for provider API keys, storing them under the secret manager.
/// Returns the provider names that were configured.
pub fn ensure_providers<R: BufRead, W: Write>(
    secrets: &SecretManager,
    input: &mut R,
    output: &mut W,
) -> anyhow::Result<Vec<String>> {
    writeln!(output, "Which LLM provider do you want to use? (e.g. Anthropic)")?;
    let mut provider = String::new();
    input.read_line(&mut provider)?;
    let provider = provider.trim().trim_end_matches('\r').to_string();
    if provider.is_empty() {
        anyhow::bail!("a provider is required");
    }

    write!(output, "Enter your {provider} API key: ")?;
    output.flush()?;
    let mut key = String::new();
    input.read_line(&mut key)?;
    let key = key.trim().trim_end_matches('\r');
    if key.is_empty() {
        anyhow::bail!("an API key is required");
    }

    let secret_name = format!("{}_API_KEY", provider.to_uppercase());
    secrets
        .set_secret(&secret_name, key)
        .with_context(|| format!("failed to store {secret_name}"))?;

    Ok(vec![provider])
}

/// Replace the workspace model defaults with the given providers, one
/// default per category.
pub async fn ensure_workspace_config(
    storage: &dyn Storage,
    workspace_id: &str,
    llm_providers: &[String],
    embedding_providers: &[String],
) -> anyhow::Result<WorkspaceConfig> {
    let config = WorkspaceConfig {
        llm: ModelDefaults {
            defaults: llm_providers.iter().map(ModelConfig::new).collect(),
        },
        embedding: ModelDefaults {
            defaults: embedding_providers.iter().map(ModelConfig::new).collect(),
        },
    };
    storage
        .persist_workspace_config(workspace_id, config.clone())
        .await?;
    Ok(config)
}

/// Find the workspace registered for this repo dir, or create one.
pub async fn ensure_workspace(
    storage: &dyn Storage,
    repo_dir: &Path,
) -> anyhow::Result<Workspace> {
    let repo_dir_str = repo_dir.to_string_lossy().into_owned();
    for workspace in storage.get_all_workspaces().await? {
        if workspace.local_repo_dir == repo_dir_str {
            return Ok(workspace);
        }
    }

    let workspace = Workspace {
        id: format!("ws_{}", Ksuid::new(None, None)),
        name: repo_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "workspace".to_string()),
        local_repo_dir: repo_dir_str,
    };
    storage.persist_workspace(workspace.clone()).await?;
    Ok(workspace)
}

pub async fn open_storage() -> anyhow::Result<Arc<SqliteStorage>> {
    let home = data_home();
    std::fs::create_dir_all(&home)
        .with_context(|| format!("failed to create data dir {}", home.display()))?;
    let url = format!("sqlite://{}?mode=rwc", home.join("sidekick.db").display());
    Ok(Arc::new(SqliteStorage::connect(&url).await.map_err(
        |e| anyhow::anyhow!("failed to open sidekick database: {e}"),
    )?))
}

pub async fn run() -> anyhow::Result<()> {
    let repo_dir = std::env::current_dir()?;
    let check = check_config(&repo_dir)?;
    if check.created {
        println!("Created {CONFIG_FILE_NAME}");
    }

    let stdin = std::io::stdin();
    let mut input = stdin.lock();
    let mut output = std::io::stdout();
    let config = ensure_test_commands(&repo_dir, check.config, &mut input, &mut output)?;

    let storage = open_storage().await?;
    let workspace = ensure_workspace(storage.as_ref(), &repo_dir).await?;

    let providers: Vec<String> = config
        .ai
        .default
        .iter()
        .map(|m| m.provider.clone())
        .collect();
    let existing = storage.get_workspace_config(&workspace.id).await;
    match existing {
        Ok(_) => {}
        Err(StorageError::NotFound) => {
            let defaults = if providers.is_empty() {
                vec!["anthropic".to_string()]
            } else {
                providers
            };
            ensure_workspace_config(storage.as_ref(), &workspace.id, &defaults, &defaults).await?;
        }
        Err(e) => return Err(e.into()),
    }

    println!("Workspace {} ready. Run 'side start' to begin.", workspace.id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_check_config_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let check = check_config(dir.path()).unwrap();
        assert!(check.created);
        assert!(!check.has_test_commands);
        assert!(dir.path().join(CONFIG_FILE_NAME).exists());
    }

    #[test]
    fn test_ensure_test_commands_prompts_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let check = check_config(dir.path()).unwrap();

        let mut input = Cursor::new(b"pytest\n".to_vec());
        let mut output = Vec::new();
        let config =
            ensure_test_commands(dir.path(), check.config, &mut input, &mut output).unwrap();

        assert_eq!(config.test_commands[0].command, "pytest");
        let raw = std::fs::read_to_string(dir.path().join(CONFIG_FILE_NAME)).unwrap();
        assert!(raw.contains("command = \"pytest\""));
    }

    #[test]
    fn test_existing_config_reports_test_commands() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            "[[test_commands]]\ncommand = \"jest\"\n\n[ai]\ndefault = [{ provider = \"openai\" }]\n",
        )
        .unwrap();

        let check = check_config(dir.path()).unwrap();
        assert!(!check.created);
        assert!(check.has_test_commands);
        assert_eq!(check.config.ai.default[0].provider, "openai");
    }

    #[test]
    fn test_ensure_providers_reads_provider_and_key() {
        let secrets = SecretManager::Mock;
        let mut input = Cursor::new(b"Anthropic\r\ndummy-api-key-anthropic\r\n".to_vec());
        let mut output = Vec::new();

        let providers = ensure_providers(&secrets, &mut input, &mut output).unwrap();
        assert_eq!(providers, vec!["Anthropic".to_string()]);
    }

    #[tokio::test]
    async fn test_ensure_workspace_config_replaces_defaults() {
        use sidekick_storage::MemoryStorage;

        let storage = MemoryStorage::new();
        // Seed an existing config with old providers.
        ensure_workspace_config(
            &storage,
            "ws_1",
            &["old".to_string()],
            &["old".to_string()],
        )
        .await
        .unwrap();

        let updated = ensure_workspace_config(
            &storage,
            "ws_1",
            &["new".to_string()],
            &["new".to_string()],
        )
        .await
        .unwrap();

        assert_eq!(updated.llm.defaults.len(), 1);
        assert_eq!(updated.llm.defaults[0].provider, "new");
        assert_eq!(updated.embedding.defaults.len(), 1);
        assert_eq!(updated.embedding.defaults[0].provider, "new");

        let stored = storage.get_workspace_config("ws_1").await.unwrap();
        assert_eq!(stored, updated);
    }

    #[tokio::test]
    async fn test_ensure_workspace_is_idempotent() {
        use sidekick_storage::MemoryStorage;

        let storage = MemoryStorage::new();
        let dir = tempfile::tempdir().unwrap();

        let first = ensure_workspace(&storage, dir.path()).await.unwrap();
        let second = ensure_workspace(&storage, dir.path()).await.unwrap();
        assert_eq!(first.id, second.id);
    }
}
