//! Activity registry for type-erased activity execution

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use super::{Activity, ActivityContext, ActivityError};

type ActivityFn =
    Arc<dyn Fn(ActivityContext, Value) -> BoxFuture<'static, Result<Value, ActivityError>> + Send + Sync>;

/// Maps activity type names to executable closures. The worker resolves
/// claimed tasks through this registry; payloads cross as JSON so the
/// registry needs no knowledge of concrete types.
#[derive(Default)]
pub struct ActivityRegistry {
    activities: HashMap<String, ActivityFn>,
}

impl ActivityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an activity implementation under its `TYPE`.
    pub fn register<A: Activity>(&mut self, activity: A) {
        let activity = Arc::new(activity);
        let f: ActivityFn = Arc::new(move |ctx, input| {
            let activity = activity.clone();
            Box::pin(async move {
                let typed: A::Input = serde_json::from_value(input).map_err(|e| {
                    ActivityError::non_retryable(format!(
                        "failed to deserialize activity input: {e}"
                    ))
                    .with_type("SERIALIZATION")
                })?;
                let output = activity.execute(&ctx, typed).await?;
                serde_json::to_value(output).map_err(|e| {
                    ActivityError::non_retryable(format!(
                        "failed to serialize activity output: {e}"
                    ))
                    .with_type("SERIALIZATION")
                })
            })
        });
        self.activities.insert(A::TYPE.to_string(), f);
    }

    pub fn contains(&self, activity_type: &str) -> bool {
        self.activities.contains_key(activity_type)
    }

    pub fn activity_types(&self) -> impl Iterator<Item = &str> {
        self.activities.keys().map(|s| s.as_str())
    }

    /// Execute an activity by type name.
    pub async fn execute(
        &self,
        activity_type: &str,
        ctx: ActivityContext,
        input: Value,
    ) -> Result<Value, ActivityError> {
        let f = self.activities.get(activity_type).ok_or_else(|| {
            ActivityError::non_retryable(format!("unknown activity type: {activity_type}"))
                .with_type("UNKNOWN_ACTIVITY")
        })?;
        f(ctx, input).await
    }
}

impl fmt::Debug for ActivityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityRegistry")
            .field("activity_types", &self.activities.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct DoubleInput {
        value: i64,
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct DoubleOutput {
        value: i64,
    }

    struct DoubleActivity;

    #[async_trait]
    impl Activity for DoubleActivity {
        const TYPE: &'static str = "double";
        type Input = DoubleInput;
        type Output = DoubleOutput;

        async fn execute(
            &self,
            _ctx: &ActivityContext,
            input: Self::Input,
        ) -> Result<Self::Output, ActivityError> {
            Ok(DoubleOutput {
                value: input.value * 2,
            })
        }
    }

    #[tokio::test]
    async fn test_register_and_execute() {
        let mut registry = ActivityRegistry::new();
        registry.register(DoubleActivity);
        assert!(registry.contains("double"));

        let ctx = ActivityContext::new("wf", "a", 1, 3);
        let result = registry
            .execute("double", ctx, serde_json::json!({"value": 21}))
            .await
            .unwrap();
        assert_eq!(result["value"], 42);
    }

    #[tokio::test]
    async fn test_unknown_activity_type() {
        let registry = ActivityRegistry::new();
        let ctx = ActivityContext::new("wf", "a", 1, 3);
        let err = registry
            .execute("missing", ctx, serde_json::json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.error_type.as_deref(), Some("UNKNOWN_ACTIVITY"));
        assert!(!err.retryable);
    }

    #[tokio::test]
    async fn test_bad_input_is_non_retryable() {
        let mut registry = ActivityRegistry::new();
        registry.register(DoubleActivity);

        let ctx = ActivityContext::new("wf", "a", 1, 3);
        let err = registry
            .execute("double", ctx, serde_json::json!({"value": "nope"}))
            .await
            .unwrap_err();
        assert!(!err.retryable);
        assert_eq!(err.error_type.as_deref(), Some("SERIALIZATION"));
    }
}
