//! Activities backing the dev workflows
//!
//! Everything side-effectful runs here, on the worker: storage lookups and
//! writes for the manager, git plumbing, test/format subprocesses, and the
//! LLM-backed coding operations behind the [`CodingAgent`](crate::CodingAgent)
//! seam.

pub mod coding;
pub mod git;
pub mod manager;
pub mod tracking;

use sidekick_domain::StorageError;
use sidekick_durable::ActivityError;

/// Map storage errors onto activity errors: lookups that miss and
/// validation failures must not be retried, transient I/O may be.
pub(crate) fn storage_err(e: StorageError) -> ActivityError {
    match e {
        StorageError::NotFound => {
            ActivityError::non_retryable(e.to_string()).with_type("NOT_FOUND")
        }
        StorageError::Validation { .. } => {
            ActivityError::non_retryable(e.to_string()).with_type("VALIDATION")
        }
        StorageError::Io(_) => ActivityError::retryable(e.to_string()),
    }
}
