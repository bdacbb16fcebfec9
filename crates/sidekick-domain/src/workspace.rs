use serde::{Deserialize, Serialize};

/// A user's repository scope. Top-level id namespace for everything else.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub local_repo_dir: String,
}

/// A model selection entry, e.g. `{provider: "anthropic"}`. Providers may
/// optionally pin a specific model name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl ModelConfig {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: None,
        }
    }
}

/// Per-workspace model defaults, replaced atomically on update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceConfig {
    pub llm: ModelDefaults,
    pub embedding: ModelDefaults,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDefaults {
    pub defaults: Vec<ModelConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workspace_config_round_trip() {
        let config = WorkspaceConfig {
            llm: ModelDefaults {
                defaults: vec![ModelConfig::new("anthropic"), ModelConfig::new("openai")],
            },
            embedding: ModelDefaults {
                defaults: vec![ModelConfig::new("openai")],
            },
        };

        let json = serde_json::to_string(&config).unwrap();
        let parsed: WorkspaceConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, parsed);
    }
}
