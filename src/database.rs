use std::fmt::Display;
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::Arc;

use futures::future::BoxFuture;
use sqlx_sqlite_conn_pool::{
   ConnectionPool, PooledHandle, SharingMode, Statement, WriteQueryResult,
};
use sqlx_sqlite_coordinator::{
   Error, Result, RetryPolicy, Row, RowSet, TransactionBehavior, TransactionScope, decode_row,
   decode_rows, exec_with_retry, execute_with_retry, fetch_all_with_retry, run_transaction,
   with_transaction,
};
use tracing::debug;

use crate::DatabaseConfig;

/// Entry point for application workers.
///
/// Every call acquires a handle from the pool (waiting for admission in
/// shared mode), runs under the busy-retry policy, and releases the handle
/// again. Clones share the same pool.
#[derive(Debug, Clone)]
pub struct Database {
   inner: Arc<DatabaseInner>,
}

#[derive(Debug)]
struct DatabaseInner {
   pool: ConnectionPool,
   retry: RetryPolicy,
   behavior: TransactionBehavior,
}

impl Database {
   /// Open the database at `path`.
   ///
   /// In shared mode the handle is opened here, so a bad path fails now
   /// instead of on first use.
   pub async fn open(path: impl AsRef<Path>, config: DatabaseConfig) -> Result<Self> {
      let pool = ConnectionPool::new(path, config.sharing_mode, config.handle).await?;

      debug!(path = %pool.path().display(), mode = ?config.sharing_mode, "database opened");
      Ok(Self {
         inner: Arc::new(DatabaseInner {
            pool,
            retry: config.retry,
            behavior: config.transaction_behavior,
         }),
      })
   }

   pub fn path(&self) -> &Path {
      self.inner.pool.path()
   }

   pub fn sharing_mode(&self) -> SharingMode {
      self.inner.pool.mode()
   }

   pub fn retry_policy(&self) -> &RetryPolicy {
      &self.inner.retry
   }

   /// Run a query and return every row
   pub async fn run(&self, statement: impl Into<Statement>) -> Result<RowSet> {
      let statement = statement.into();
      let mut handle = self.acquire().await?;
      let rows = fetch_all_with_retry(&mut handle, &self.inner.retry, &statement).await;
      self.finish(handle, rows).await.and_then(decode_rows)
   }

   /// Run a query expected to produce at most one row
   pub async fn fetch_one(&self, statement: impl Into<Statement>) -> Result<Option<Row>> {
      let statement = statement.into();
      let mut handle = self.acquire().await?;

      // Two rows are enough to tell "one" from "too many"
      let mut rows = Vec::with_capacity(2);
      let result = exec_with_retry(&mut handle, &self.inner.retry, &statement, |row| {
         rows.push(decode_row(row));
         if rows.len() == 2 {
            ControlFlow::Break(())
         } else {
            ControlFlow::Continue(())
         }
      })
      .await;
      self.finish(handle, result).await?;

      match rows.len() {
         0 => Ok(None),
         1 => rows.pop().transpose(),
         count => Err(Error::MultipleRowsReturned(count)),
      }
   }

   /// Run a single write statement
   pub async fn execute(&self, statement: impl Into<Statement>) -> Result<WriteQueryResult> {
      let statement = statement.into();
      let mut handle = self.acquire().await?;
      let result = execute_with_retry(&mut handle, &self.inner.retry, &statement).await;
      self.finish(handle, result).await
   }

   /// Run statements one after another on a single handle.
   ///
   /// Not atomic: statements before a failure stay applied. Use
   /// [`transaction`](Self::transaction) for all-or-nothing.
   pub async fn exec_many(&self, statements: Vec<Statement>) -> Result<Vec<WriteQueryResult>> {
      let mut handle = self.acquire().await?;

      let result = async {
         let mut results = Vec::with_capacity(statements.len());
         for statement in &statements {
            results.push(execute_with_retry(&mut handle, &self.inner.retry, statement).await?);
         }
         Ok::<_, Error>(results)
      }
      .await;

      self.finish(handle, result).await
   }

   /// Hand each decoded row to `callback` as the query produces it.
   ///
   /// Returning `ControlFlow::Break` stops the query. Returns the number of
   /// rows delivered.
   pub async fn for_each_row<F>(
      &self,
      statement: impl Into<Statement>,
      mut callback: F,
   ) -> Result<usize>
   where
      F: FnMut(Row) -> ControlFlow<()>,
   {
      let statement = statement.into();
      let mut handle = self.acquire().await?;

      let mut decode_error = None;
      let result = exec_with_retry(&mut handle, &self.inner.retry, &statement, |row| {
         match decode_row(row) {
            Ok(row) => callback(row),
            Err(e) => {
               decode_error = Some(e);
               ControlFlow::Break(())
            }
         }
      })
      .await;

      let delivered = self.finish(handle, result).await?;
      match decode_error {
         Some(e) => Err(e),
         None => Ok(delivered),
      }
   }

   /// Apply `statements` atomically
   pub async fn transaction(&self, statements: Vec<Statement>) -> Result<Vec<WriteQueryResult>> {
      let mut handle = self.acquire().await?;
      let result =
         run_transaction(&mut handle, &self.inner.retry, self.inner.behavior, statements).await;
      self.finish(handle, result).await
   }

   /// Run `body` in a transaction; see
   /// [`with_transaction`](sqlx_sqlite_coordinator::with_transaction)
   pub async fn transaction_with<T, E, F>(&self, body: F) -> std::result::Result<T, E>
   where
      F: for<'t> FnOnce(&'t mut TransactionScope<'_>) -> BoxFuture<'t, std::result::Result<T, E>>,
      E: From<Error> + Display,
   {
      let mut handle = self.acquire().await?;
      let result =
         with_transaction(&mut handle, &self.inner.retry, self.inner.behavior, body).await;

      let released = self.inner.pool.release(handle).await;
      let value = result?;
      released.map_err(Error::from)?;
      Ok(value)
   }

   /// Take a handle for several calls in a row.
   ///
   /// In shared mode nobody else gets in until the handle is released or
   /// dropped.
   pub async fn acquire(&self) -> Result<PooledHandle> {
      Ok(self.inner.pool.acquire().await?)
   }

   pub async fn release(&self, handle: PooledHandle) -> Result<()> {
      Ok(self.inner.pool.release(handle).await?)
   }

   /// Close the database; later calls fail with a pool-closed error
   pub async fn close(&self) -> Result<()> {
      self.inner.pool.close().await?;
      debug!(path = %self.path().display(), "database closed");
      Ok(())
   }

   /// Close the database and delete its files
   pub async fn remove(&self) -> Result<()> {
      Ok(self.inner.pool.remove().await?)
   }

   /// Release `handle`, preferring the operation's error over a release error
   async fn finish<T>(&self, handle: PooledHandle, result: Result<T>) -> Result<T> {
      let released = self.inner.pool.release(handle).await;
      let value = result?;
      released?;
      Ok(value)
   }
}
