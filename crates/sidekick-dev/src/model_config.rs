//! Model configuration resolution
//!
//! The coding loop rotates through configured model defaults as attempts
//! fail: every third attempt moves to the next configured bucket, wrapping
//! at the end. Falls back to a named default when nothing is configured.

use serde::{Deserialize, Serialize};

use sidekick_domain::ModelConfig;

/// Which kind of model call is being resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKey {
    Coding,
    Embedding,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelConfigResolver {
    defaults: Vec<ModelConfig>,
}

impl ModelConfigResolver {
    pub fn new(defaults: Vec<ModelConfig>) -> Self {
        Self { defaults }
    }

    /// Resolve the model config for the given rotation bucket.
    ///
    /// `bucket` is typically `attempt / 3`, so the selection only changes
    /// every third attempt. When the bucket runs past the configured list,
    /// selection wraps around rather than failing.
    pub fn get_model_config(
        &self,
        _key: ModelKey,
        bucket: u32,
        fallback_provider: &str,
    ) -> ModelConfig {
        if self.defaults.is_empty() {
            return ModelConfig::new(fallback_provider);
        }
        let index = (bucket as usize) % self.defaults.len();
        self.defaults[index].clone()
    }
}
