//! A single session against one SQLite database file

use std::fmt;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use futures::TryStreamExt;
use libsqlite3_sys as ffi;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteRow};
use sqlx::{Column, ConnectOptions, Connection, Executor, Statement as _};
use tracing::{debug, trace};

use crate::config::{AttachedDatabase, HandleConfig};
use crate::statement::{PreparedStatement, Statement, WriteQueryResult};
use crate::{Error, Result};

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// One logical session with the storage engine.
///
/// ## Invariants
///
/// - Every engine call takes `&mut self`, so at most one operation is in
///   flight per handle. Sharing a handle between tasks requires the
///   [`ConnectionPool`](crate::ConnectionPool) in shared mode.
/// - Once closed, every call returns [`Error::HandleClosed`] and a second
///   `close` returns [`Error::AlreadyClosed`].
/// - A rollback scheduled with [`defer_rollback`](Self::defer_rollback) runs
///   before the next statement, so an abandoned transaction never leaks into
///   later work on the same handle.
pub struct ConnectionHandle {
   id: u64,
   path: PathBuf,
   conn: Option<SqliteConnection>,
   rollback_pending: bool,
}

impl ConnectionHandle {
   /// Open a new session on the database at `path`
   pub async fn open(path: impl AsRef<Path>, config: &HandleConfig) -> Result<Self> {
      let path = path.as_ref().to_path_buf();

      let mut options = SqliteConnectOptions::new()
         .filename(&path)
         .create_if_missing(config.create_if_missing)
         .busy_timeout(config.busy_timeout())
         .foreign_keys(config.foreign_keys);

      if let Some(mode) = config.journal_mode {
         options = options.journal_mode(mode.into());
      }

      let conn = options
         .connect()
         .await
         .map_err(|source| Error::OpenFailed {
            path: path.clone(),
            source,
         })?;

      let mut handle = Self {
         id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
         path,
         conn: Some(conn),
         rollback_pending: false,
      };

      for attached in &config.attached {
         handle.attach(attached).await?;
      }

      debug!(handle = handle.id, path = %handle.path.display(), "handle opened");
      Ok(handle)
   }

   pub fn id(&self) -> u64 {
      self.id
   }

   pub fn path(&self) -> &Path {
      &self.path
   }

   pub fn is_closed(&self) -> bool {
      self.conn.is_none()
   }

   /// Threading mode the engine library was compiled with: 0 single-thread,
   /// 1 serialized, 2 multi-thread
   pub fn threadsafe_mode() -> i32 {
      // SAFETY: reads a compile-time constant, no connection involved
      unsafe { ffi::sqlite3_threadsafe() }
   }

   /// Close the session. Closing twice is a programming error and is rejected.
   pub async fn close(&mut self) -> Result<()> {
      let conn = self.conn.take().ok_or(Error::AlreadyClosed(self.id))?;

      // The engine rolls back any open transaction when the connection closes
      self.rollback_pending = false;
      conn.close().await.map_err(|source| Error::Engine {
         query: "close".into(),
         source,
      })?;

      debug!(handle = self.id, path = %self.path.display(), "handle closed");
      Ok(())
   }

   /// Compile `query` for stepping
   pub async fn prepare<'h>(&'h mut self, query: &'h str) -> Result<PreparedStatement<'h>> {
      let id = self.id;
      let conn = self.connection().await?;
      let columns = compile(conn, query).await?;

      trace!(handle = id, query, "statement prepared");
      Ok(PreparedStatement::new(id, query, columns, conn))
   }

   /// Run a statement to completion, discarding any rows
   pub async fn execute(&mut self, statement: &Statement) -> Result<WriteQueryResult> {
      let id = self.id;
      let conn = self.connection().await?;
      compile(conn, &statement.query).await?;

      let result = statement
         .to_query()
         .execute(&mut *conn)
         .await
         .map_err(|e| Error::from_engine(&statement.query, e))?;

      trace!(handle = id, query = %statement.query, rows_affected = result.rows_affected(), "statement executed");
      Ok(WriteQueryResult {
         rows_affected: result.rows_affected(),
         last_insert_id: result.last_insert_rowid(),
      })
   }

   /// Run a statement and collect every row
   pub async fn fetch_all(&mut self, statement: &Statement) -> Result<Vec<SqliteRow>> {
      let id = self.id;
      let conn = self.connection().await?;
      compile(conn, &statement.query).await?;

      let rows = statement
         .to_query()
         .fetch_all(&mut *conn)
         .await
         .map_err(|e| Error::from_engine(&statement.query, e))?;

      trace!(handle = id, query = %statement.query, rows = rows.len(), "statement fetched");
      Ok(rows)
   }

   /// Run a statement, handing each row to `callback` as it is produced.
   ///
   /// The callback stops iteration early by returning `ControlFlow::Break`.
   /// Returns the number of rows delivered to the callback.
   pub async fn exec_with<F>(&mut self, statement: &Statement, mut callback: F) -> Result<usize>
   where
      F: FnMut(&SqliteRow) -> ControlFlow<()>,
   {
      let conn = self.connection().await?;
      compile(conn, &statement.query).await?;

      let mut rows = statement.to_query().fetch(&mut *conn);
      let mut delivered = 0;

      while let Some(row) = rows
         .try_next()
         .await
         .map_err(|e| Error::from_engine(&statement.query, e))?
      {
         delivered += 1;
         if callback(&row).is_break() {
            break;
         }
      }

      Ok(delivered)
   }

   /// True while the engine has an open transaction on this handle
   pub async fn in_transaction(&mut self) -> Result<bool> {
      let conn = self.connection().await?;
      autocommit_disabled(conn).await
   }

   /// Attach another database file under `schema_name`
   pub async fn attach(&mut self, attached: &AttachedDatabase) -> Result<()> {
      validate_schema_name(&attached.schema_name)?;

      let statement = Statement::new(format!(
         "ATTACH DATABASE ? AS \"{}\"",
         attached.schema_name
      ))
      .bind(attached.path.to_string_lossy().into_owned());

      self.execute(&statement).await?;
      debug!(handle = self.id, schema = %attached.schema_name, path = %attached.path.display(), "database attached");
      Ok(())
   }

   pub async fn detach(&mut self, schema_name: &str) -> Result<()> {
      validate_schema_name(schema_name)?;
      self
         .execute(&Statement::new(format!("DETACH DATABASE \"{schema_name}\"")))
         .await?;
      debug!(handle = self.id, schema = schema_name, "database detached");
      Ok(())
   }

   /// Schedule a ROLLBACK to run before the next statement on this handle.
   ///
   /// Used when a transaction is abandoned without a chance to roll back
   /// asynchronously (drop during unwind or cancellation).
   pub fn defer_rollback(&mut self) {
      self.rollback_pending = true;
   }

   pub fn rollback_pending(&self) -> bool {
      self.rollback_pending
   }

   /// Run any deferred rollback now
   pub async fn recover(&mut self) -> Result<()> {
      self.connection().await.map(|_| ())
   }

   /// Live engine connection, after settling any deferred rollback
   async fn connection(&mut self) -> Result<&mut SqliteConnection> {
      let conn = self.conn.as_mut().ok_or(Error::HandleClosed)?;

      if self.rollback_pending {
         if autocommit_disabled(conn).await? {
            debug!(handle = self.id, "running deferred rollback");
            sqlx::query("ROLLBACK")
               .execute(&mut *conn)
               .await
               .map_err(|e| Error::from_engine("ROLLBACK", e))?;
         }
         self.rollback_pending = false;
      }

      Ok(conn)
   }
}

impl fmt::Debug for ConnectionHandle {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("ConnectionHandle")
         .field("id", &self.id)
         .field("path", &self.path)
         .field("closed", &self.is_closed())
         .field("rollback_pending", &self.rollback_pending)
         .finish()
   }
}

/// Compile `query`, returning its result column names
async fn compile(conn: &mut SqliteConnection, query: &str) -> Result<Vec<String>> {
   let statement = (&mut *conn)
      .prepare(query)
      .await
      .map_err(|e| Error::from_prepare(query, e))?;

   Ok(statement
      .columns()
      .iter()
      .map(|column| column.name().to_string())
      .collect())
}

async fn autocommit_disabled(conn: &mut SqliteConnection) -> Result<bool> {
   let mut handle = conn
      .lock_handle()
      .await
      .map_err(|e| Error::from_engine("sqlite3_get_autocommit", e))?;

   let db: *mut ffi::sqlite3 = handle.as_raw_handle().as_ptr();

   // SAFETY: the pointer stays valid while the handle lock is held
   Ok(unsafe { ffi::sqlite3_get_autocommit(db) } == 0)
}

pub(crate) fn validate_schema_name(name: &str) -> Result<()> {
   let mut chars = name.chars();
   let valid = match chars.next() {
      Some(first) => {
         (first.is_ascii_alphabetic() || first == '_')
            && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
      }
      None => false,
   };

   if valid {
      Ok(())
   } else {
      Err(Error::InvalidSchemaName(name.to_string()))
   }
}
