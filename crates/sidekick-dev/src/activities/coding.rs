//! Coding-loop activities

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use sidekick_durable::{Activity, ActivityContext, ActivityError};

use crate::coding_agent::{
    CodeContext, CodingAgent, CriteriaFulfillment, DevRequirements, EditCodeRequest, TestResult,
};
use crate::config::{ConfigError, FormatterCommand, RepoConfig, TestCommand};
use crate::env::EnvContainer;

fn agent_err(e: anyhow::Error) -> ActivityError {
    ActivityError::retryable(format!("{e:#}"))
}

/// Read and parse the repository's `side.toml`.
pub struct LoadRepoConfigActivity;

#[derive(Debug, Serialize, Deserialize)]
pub struct LoadRepoConfigInput {
    pub repo_dir: String,
}

#[async_trait]
impl Activity for LoadRepoConfigActivity {
    const TYPE: &'static str = "load_repo_config";
    type Input = LoadRepoConfigInput;
    type Output = RepoConfig;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        RepoConfig::load(&input.repo_dir).map_err(|e| match e {
            ConfigError::Missing(_) => {
                ActivityError::non_retryable(e.to_string()).with_type("MISSING_CONFIG")
            }
            ConfigError::Parse(_) => {
                ActivityError::non_retryable(e.to_string()).with_type("INVALID_CONFIG")
            }
            ConfigError::Io(_) => ActivityError::retryable(e.to_string()),
        })
    }
}

/// Produce a structured requirements document from raw input.
pub struct BuildDevRequirementsActivity {
    pub agent: Arc<dyn CodingAgent>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BuildDevRequirementsInput {
    pub env: EnvContainer,
    pub requirements: String,
}

#[async_trait]
impl Activity for BuildDevRequirementsActivity {
    const TYPE: &'static str = "build_dev_requirements";
    type Input = BuildDevRequirementsInput;
    type Output = DevRequirements;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        self.agent
            .build_requirements(&input.env, &input.requirements)
            .await
            .map_err(agent_err)
    }
}

pub struct PrepareCodeContextActivity {
    pub agent: Arc<dyn CodingAgent>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PrepareCodeContextInput {
    pub env: EnvContainer,
    pub requirements: String,
}

#[async_trait]
impl Activity for PrepareCodeContextActivity {
    const TYPE: &'static str = "prepare_code_context";
    type Input = PrepareCodeContextInput;
    type Output = CodeContext;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        self.agent
            .prepare_code_context(&input.env, &input.requirements)
            .await
            .map_err(agent_err)
    }
}

/// One LLM editing pass over the working tree.
pub struct EditCodeActivity {
    pub agent: Arc<dyn CodingAgent>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EditCodeInput {
    pub env: EnvContainer,
    pub request: EditCodeRequest,
}

#[async_trait]
impl Activity for EditCodeActivity {
    const TYPE: &'static str = "edit_code";
    type Input = EditCodeInput;
    type Output = ();

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        self.agent
            .edit_code(&input.env, input.request)
            .await
            .map_err(agent_err)
    }
}

/// Run the configured test commands, concatenating their output.
pub struct RunTestsActivity;

#[derive(Debug, Serialize, Deserialize)]
pub struct RunTestsInput {
    pub env: EnvContainer,
    pub commands: Vec<TestCommand>,
}

#[async_trait]
impl Activity for RunTestsActivity {
    const TYPE: &'static str = "run_tests";
    type Input = RunTestsInput;
    type Output = TestResult;

    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        let mut passed = true;
        let mut output = String::new();
        for command in &input.commands {
            if ctx.is_cancelled() {
                return Err(ActivityError::non_retryable("cancelled").with_type("CANCELLED"));
            }
            let result = input
                .env
                .run_shell(&command.command)
                .await
                .map_err(|e| ActivityError::retryable(e.to_string()))?;
            if !result.success() {
                passed = false;
            }
            output.push_str(&format!("$ {}\n{}\n", command.command, result.combined()));
        }
        Ok(TestResult {
            tests_passed: passed,
            output,
        })
    }
}

/// Judge whether the current work fulfills the requirements.
pub struct CheckCriteriaActivity {
    pub agent: Arc<dyn CodingAgent>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CheckCriteriaInput {
    pub env: EnvContainer,
    pub requirements: String,
}

#[async_trait]
impl Activity for CheckCriteriaActivity {
    const TYPE: &'static str = "check_criteria";
    type Input = CheckCriteriaInput;
    type Output = CriteriaFulfillment;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        self.agent
            .check_criteria(&input.env, &input.requirements)
            .await
            .map_err(agent_err)
    }
}

/// Run the configured formatters as one step.
pub struct AutoFormatActivity;

#[derive(Debug, Serialize, Deserialize)]
pub struct AutoFormatInput {
    pub env: EnvContainer,
    pub formatters: Vec<FormatterCommand>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AutoFormatOutput {
    pub output: String,
}

#[async_trait]
impl Activity for AutoFormatActivity {
    const TYPE: &'static str = "auto_format";
    type Input = AutoFormatInput;
    type Output = AutoFormatOutput;

    async fn execute(
        &self,
        _ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError> {
        let mut output = String::new();
        for formatter in &input.formatters {
            let result = input
                .env
                .run_shell(&formatter.command)
                .await
                .map_err(|e| ActivityError::retryable(e.to_string()))?;
            output.push_str(&result.combined());
            if !result.success() {
                return Err(ActivityError::non_retryable(format!(
                    "formatter '{}' failed: {}",
                    formatter.command,
                    result.combined().trim()
                ))
                .with_type("FORMATTER"));
            }
        }
        Ok(AutoFormatOutput { output })
    }
}
