//! Activity abstractions
//!
//! Activities are the side-effectful building blocks of workflows: discrete
//! operations executed by workers outside the deterministic workflow thread,
//! with retries, timeouts and cancellation.

mod context;
mod definition;
mod registry;

pub use context::{ActivityContext, CancellationHandle};
pub use definition::{Activity, ActivityError, ActivityOutcome};
pub use registry::ActivityRegistry;
