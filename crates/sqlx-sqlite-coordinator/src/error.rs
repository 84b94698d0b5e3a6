use std::time::Duration;

/// Result type alias for coordinator operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for retry and transaction coordination.
#[derive(Debug, thiserror::Error)]
pub enum Error {
   /// Error from a connection handle or pool.
   #[error(transparent)]
   Pool(#[from] sqlx_sqlite_conn_pool::Error),

   /// Error from SQLx while reading rows.
   #[error(transparent)]
   Sqlx(#[from] sqlx::Error),

   /// The statement stayed busy for the whole retry budget.
   #[error(
      "database still busy after {attempts} attempt(s) over {elapsed:?} running `{query}`: {last_error}"
   )]
   BusyExhausted {
      query: String,
      attempts: u32,
      elapsed: Duration,
      last_error: String,
   },

   /// Transaction failed and rollback also failed.
   #[error("transaction failed: {transaction_error}; rollback also failed: {rollback_error}")]
   TransactionRollbackFailed {
      transaction_error: String,
      rollback_error: String,
   },

   /// The handle already has an open transaction.
   #[error("transaction already active on handle {0}")]
   TransactionAlreadyActive(u64),

   /// The transaction has not been started with `begin`.
   #[error("transaction has not been started")]
   TransactionNotActive,

   /// Transaction has already been committed or rolled back.
   #[error("transaction has already been finalized (committed or rolled back)")]
   TransactionAlreadyFinalized,

   /// SQLite type that cannot be mapped to JSON.
   #[error("unsupported datatype: {0}")]
   UnsupportedDatatype(String),

   /// Multiple rows returned from a single-row query.
   #[error("fetch_one() query returned {0} rows, expected 0 or 1")]
   MultipleRowsReturned(usize),

   /// Generic error for operations that don't fit other categories.
   #[error("{0}")]
   Other(String),
}

impl Error {
   /// True when the error came from a statement violating a constraint.
   pub fn is_constraint_violation(&self) -> bool {
      matches!(self, Error::Pool(e) if e.is_constraint_violation())
   }

   pub fn is_busy_exhausted(&self) -> bool {
      matches!(self, Error::BusyExhausted { .. })
   }

   /// Extract a structured error code from the error type.
   ///
   /// This provides machine-readable error codes for error handling.
   pub fn error_code(&self) -> String {
      use sqlx_sqlite_conn_pool::Error as PoolError;

      match self {
         Error::Pool(e) => match e {
            PoolError::OpenFailed { .. } => "OPEN_FAILED".to_string(),
            PoolError::CompileFailed { .. } => "COMPILE_FAILED".to_string(),
            PoolError::Busy { code, .. } | PoolError::ConstraintViolation { code, .. } => {
               format!("SQLITE_{code}")
            }
            PoolError::Engine { source, .. } => {
               if let Some(code) = source.as_database_error().and_then(|db_err| db_err.code()) {
                  return format!("SQLITE_{}", code);
               }
               "SQLX_ERROR".to_string()
            }
            PoolError::HandleClosed | PoolError::AlreadyClosed(_) => "HANDLE_CLOSED".to_string(),
            PoolError::PoolClosed => "POOL_CLOSED".to_string(),
            PoolError::InvalidSchemaName(_) => "INVALID_SCHEMA_NAME".to_string(),
            PoolError::Io(_) => "IO_ERROR".to_string(),
         },
         Error::Sqlx(_) => "SQLX_ERROR".to_string(),
         Error::BusyExhausted { .. } => "BUSY_EXHAUSTED".to_string(),
         Error::TransactionRollbackFailed { .. } => "TRANSACTION_ROLLBACK_FAILED".to_string(),
         Error::TransactionAlreadyActive(_) => "TRANSACTION_ALREADY_ACTIVE".to_string(),
         Error::TransactionNotActive => "TRANSACTION_NOT_ACTIVE".to_string(),
         Error::TransactionAlreadyFinalized => "TRANSACTION_ALREADY_FINALIZED".to_string(),
         Error::UnsupportedDatatype(_) => "UNSUPPORTED_DATATYPE".to_string(),
         Error::MultipleRowsReturned(_) => "MULTIPLE_ROWS_RETURNED".to_string(),
         Error::Other(_) => "ERROR".to_string(),
      }
   }
}
