//! # sqlx-sqlite-conn-pool
//!
//! Connection handles and sharing policies for a single-writer SQLite database,
//! built on SQLx.
//!
//! ## Core Types
//!
//! - **[`ConnectionHandle`]**: One session against a database file (open, prepare, step, close)
//! - **[`PreparedStatement`]**: A compiled statement stepped row by row
//! - **[`ConnectionPool`]**: Hands out handles according to a [`SharingMode`]
//! - **[`PooledHandle`]**: RAII access to a pooled handle; in shared mode, the admission token
//! - **[`HandleConfig`]**: Options applied when a handle opens
//! - **[`Error`]**: Engine errors classified as busy, constraint, compile, open or other
//!
//! ## Sharing Modes
//!
//! - **Isolated**: each caller opens its own handle; the engine's file lock is
//!   the only arbiter between writers, and contention surfaces as busy errors
//! - **Shared**: one handle, lent to one caller at a time in FIFO order;
//!   writes never overlap
//!
//! Busy errors are reported, never retried, at this level. Retrying and
//! transactions live in `sqlx-sqlite-coordinator`.

mod config;
mod error;
mod handle;
mod pool;
mod statement;

// Re-export public types
pub use config::{AttachedDatabase, HandleConfig, JournalMode};
pub use error::{Error, Result};
pub use handle::ConnectionHandle;
pub use pool::{ConnectionPool, PooledHandle, SharingMode};
pub use statement::{PreparedStatement, Statement, StepResult, WriteQueryResult};

// Row types callers need to read results
pub use sqlx::sqlite::SqliteRow;
