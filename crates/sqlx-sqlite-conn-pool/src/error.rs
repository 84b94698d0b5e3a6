//! Error types for sqlx-sqlite-conn-pool

use std::path::PathBuf;

use libsqlite3_sys as ffi;
use thiserror::Error;

/// Errors that may occur when working with connection handles and pools
#[derive(Error, Debug)]
pub enum Error {
   /// The database file could not be opened. Never retried.
   #[error("could not open database {}: {source}", path.display())]
   OpenFailed {
      path: PathBuf,
      #[source]
      source: sqlx::Error,
   },

   /// The statement text could not be compiled by the engine. Never retried.
   #[error("could not compile statement `{query}`: {source}")]
   CompileFailed {
      query: String,
      #[source]
      source: sqlx::Error,
   },

   /// Another connection holds the lock this statement needs. Transient.
   #[error("database busy (code {code}) while running `{query}`: {message}")]
   Busy {
      query: String,
      code: i32,
      message: String,
   },

   /// The statement violated a constraint (UNIQUE, NOT NULL, CHECK, ...)
   #[error("constraint violation (code {code}) while running `{query}`: {message}")]
   ConstraintViolation {
      query: String,
      code: i32,
      message: String,
   },

   /// Any other engine failure, surfaced verbatim
   #[error("engine error while running `{query}`: {source}")]
   Engine {
      query: String,
      #[source]
      source: sqlx::Error,
   },

   /// The handle has been closed and cannot be used
   #[error("connection handle has been closed")]
   HandleClosed,

   /// `close` was called on a handle that was already closed
   #[error("connection handle {0} was already closed")]
   AlreadyClosed(u64),

   /// The pool has been closed and cannot hand out handles
   #[error("connection pool has been closed")]
   PoolClosed,

   /// Attached database schema names must match `[A-Za-z_][A-Za-z0-9_]*`
   #[error("invalid schema name '{0}': must match [A-Za-z_][A-Za-z0-9_]*")]
   InvalidSchemaName(String),

   /// IO error when accessing database files
   #[error("IO error: {0}")]
   Io(#[from] std::io::Error),
}

impl Error {
   /// True for transient lock contention that may succeed when retried.
   pub fn is_busy(&self) -> bool {
      matches!(self, Error::Busy { .. })
   }

   pub fn is_constraint_violation(&self) -> bool {
      matches!(self, Error::ConstraintViolation { .. })
   }

   /// Text of the statement that failed, when the error is tied to one.
   pub fn query(&self) -> Option<&str> {
      match self {
         Error::CompileFailed { query, .. }
         | Error::Busy { query, .. }
         | Error::ConstraintViolation { query, .. }
         | Error::Engine { query, .. } => Some(query),
         _ => None,
      }
   }

   /// Classify an engine error raised while stepping `query`.
   pub(crate) fn from_engine(query: &str, err: sqlx::Error) -> Self {
      match ErrorClass::of(&err) {
         ErrorClass::Busy(code) => Error::Busy {
            query: query.to_string(),
            code,
            message: database_message(&err),
         },
         ErrorClass::Constraint(code) => Error::ConstraintViolation {
            query: query.to_string(),
            code,
            message: database_message(&err),
         },
         ErrorClass::Other => Error::Engine {
            query: query.to_string(),
            source: err,
         },
      }
   }

   /// Classify an engine error raised while compiling `query`.
   ///
   /// Busy is still reported as such: reading the schema during compilation
   /// needs a shared lock.
   pub(crate) fn from_prepare(query: &str, err: sqlx::Error) -> Self {
      match ErrorClass::of(&err) {
         ErrorClass::Busy(code) => Error::Busy {
            query: query.to_string(),
            code,
            message: database_message(&err),
         },
         _ => Error::CompileFailed {
            query: query.to_string(),
            source: err,
         },
      }
   }
}

enum ErrorClass {
   Busy(i32),
   Constraint(i32),
   Other,
}

impl ErrorClass {
   fn of(err: &sqlx::Error) -> Self {
      // sqlx reports extended result codes; the low byte is the primary code
      let Some(code) = err
         .as_database_error()
         .and_then(|db_err| db_err.code())
         .and_then(|code| code.parse::<i32>().ok())
      else {
         return ErrorClass::Other;
      };

      Self::from_code(code)
   }

   /// `SQLITE_LOCKED` is a conflict inside this connection (a table locked
   /// by one of its own statements), so waiting never clears it.
   fn from_code(code: i32) -> Self {
      match code & 0xff {
         ffi::SQLITE_BUSY => ErrorClass::Busy(code),
         ffi::SQLITE_CONSTRAINT => ErrorClass::Constraint(code),
         _ => ErrorClass::Other,
      }
   }
}

fn database_message(err: &sqlx::Error) -> String {
   err.as_database_error()
      .map(|db_err| db_err.message().to_string())
      .unwrap_or_else(|| err.to_string())
}

/// A type alias for Results with our Error type
pub type Result<T> = std::result::Result<T, Error>;
