//! `side start` — boot the per-workspace agent runtime
//!
//! Brings up storage, streaming, the workflow engine and its workers, and
//! the dev agent manager for the workspace registered for the current
//! repository, then runs until interrupted. LLM provider bindings plug in
//! behind the coding-agent seam; without one configured, the scripted agent
//! is used so the orchestration surface still runs end to end.

use std::sync::Arc;

use sidekick_dev::{DevAgentRuntime, ScriptedCodingAgent};
use sidekick_storage::MemoryStreamer;
use tracing::info;

use crate::init::{ensure_workspace, open_storage};

pub async fn run() -> anyhow::Result<()> {
    let repo_dir = std::env::current_dir()?;
    let storage = open_storage().await?;
    let workspace = ensure_workspace(storage.as_ref(), &repo_dir).await?;

    let streamer = Arc::new(MemoryStreamer::new());
    let runtime = DevAgentRuntime::start(
        storage,
        streamer,
        ScriptedCodingAgent::always_fulfilled(),
        &workspace.id,
    )
    .await?;

    info!(workspace_id = %workspace.id, "Sidekick runtime started; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    runtime.shutdown().await;
    Ok(())
}
