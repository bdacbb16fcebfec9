//! Storage and streaming backends
//!
//! Two interchangeable [`sidekick_domain::Storage`] implementations — an
//! in-memory store (the dev/test substrate) and a SQLite store — plus the
//! in-memory [`sidekick_domain::Streamer`] providing append-and-replay
//! change streams.

pub mod memory;
pub mod sqlite;
pub mod streams;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;
pub use streams::MemoryStreamer;
