//! # sqlx-sqlite-coordinator
//!
//! Busy-retry and atomic transactions on top of `sqlx-sqlite-conn-pool`.
//!
//! ## Core Types
//!
//! - **[`RetryPolicy`]**: Bounded backoff for operations that hit a busy database
//! - **[`TransactionScope`]**: Begin/execute/commit/rollback with rollback on every failure path
//! - **[`Row`] / [`RowSet`]**: Query results decoded to JSON values, columns in order
//! - **[`Error`]**: Retry exhaustion, transaction misuse and the underlying pool errors
//!
//! ## Transactions
//!
//! [`run_transaction`] applies a list of statements atomically.
//! [`with_transaction`] runs an async body and commits only if it returns `Ok`.
//! Either way, a failure anywhere inside leaves the database exactly as it
//! was before `BEGIN`.

mod decode;
mod error;
mod retry;
mod transaction;

pub use decode::{Row, RowSet, decode_row, decode_rows, to_json};
pub use error::{Error, Result};
pub use retry::{
   Backoff, RetryPolicy, RetryState, exec_with_retry, execute_with_retry, fetch_all_with_retry,
};
pub use transaction::{
   TransactionBehavior, TransactionScope, TransactionState, run_transaction, with_transaction,
};
