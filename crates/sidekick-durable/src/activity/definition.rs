//! Activity trait definition

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::ActivityContext;

/// Error type for activity failures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityError {
    pub message: String,

    /// Error type/code for programmatic handling.
    pub error_type: Option<String>,

    /// Non-retryable errors fail the activity immediately, without further
    /// attempts.
    pub retryable: bool,

    pub details: Option<serde_json::Value>,
}

impl ActivityError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: true,
            details: None,
        }
    }

    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: false,
            details: None,
        }
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for ActivityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ActivityError {}

impl From<anyhow::Error> for ActivityError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(format!("{err:#}"))
    }
}

/// How one activity execution ended, as seen by interceptors.
#[derive(Debug, Clone, PartialEq)]
pub enum ActivityOutcome {
    Completed(serde_json::Value),
    Failed {
        error: ActivityError,
        will_retry: bool,
    },
}

/// A unit of work that may fail and be retried.
///
/// Return [`ActivityError::retryable`] for transient failures and
/// [`ActivityError::non_retryable`] for permanent ones. A subprocess exiting
/// non-zero is a result, not an error.
#[async_trait]
pub trait Activity: Send + Sync + 'static {
    /// Unique type identifier, used to look the activity up in the registry.
    const TYPE: &'static str;

    type Input: Serialize + DeserializeOwned + Send;
    type Output: Serialize + DeserializeOwned + Send;

    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_flag() {
        assert!(ActivityError::retryable("timeout").retryable);
        assert!(!ActivityError::non_retryable("invalid input").retryable);
    }

    #[test]
    fn test_error_serialization() {
        let error = ActivityError::retryable("test error")
            .with_type("TEST")
            .with_details(serde_json::json!({"key": "value"}));

        let json = serde_json::to_string(&error).unwrap();
        let parsed: ActivityError = serde_json::from_str(&json).unwrap();
        assert_eq!(error, parsed);
    }
}
