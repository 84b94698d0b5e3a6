//! # serialized-sqlite
//!
//! Coordinates concurrent workers against one SQLite database file, which
//! accepts a single writer at a time.
//!
//! - Writes through a shared handle never overlap: callers are admitted one
//!   at a time, in arrival order.
//! - A busy database is retried with bounded backoff before the error
//!   reaches the caller.
//! - Groups of statements commit together or not at all, including when
//!   the caller panics or drops the future halfway through.
//!
//! ```no_run
//! use serialized_sqlite::{Database, DatabaseConfig, Error, Statement};
//!
//! # async fn example() -> Result<(), Error> {
//! let db = Database::open("students.db", DatabaseConfig::default()).await?;
//!
//! db.execute("CREATE TABLE IF NOT EXISTS students (sid INTEGER PRIMARY KEY)").await?;
//! db.execute(Statement::new("INSERT INTO students VALUES (?)").bind(2000)).await?;
//!
//! db.transaction_with(|tx| {
//!    Box::pin(async move {
//!       tx.execute("DELETE FROM students WHERE sid = 2000").await?;
//!       tx.execute("INSERT INTO students VALUES (2001)").await?;
//!       Ok::<_, Error>(())
//!    })
//! })
//! .await?;
//!
//! let rows = db.run("SELECT sid FROM students").await?;
//! assert_eq!(rows.len(), 1);
//! # Ok(())
//! # }
//! ```

mod config;
mod database;

pub use config::DatabaseConfig;
pub use database::Database;

pub use sqlx_sqlite_conn_pool::{
   AttachedDatabase, ConnectionHandle, HandleConfig, JournalMode, PooledHandle, SharingMode,
   Statement, WriteQueryResult,
};
pub use sqlx_sqlite_coordinator::{
   Backoff, Error, Result, RetryPolicy, Row, RowSet, TransactionBehavior, TransactionScope,
   TransactionState,
};
