//! Atomic multi-statement transactions with rollback on every exit path

use std::fmt::Display;

use futures::future::BoxFuture;
use serde::Deserialize;
use sqlx_sqlite_conn_pool::{ConnectionHandle, Statement, WriteQueryResult};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::decode::{RowSet, decode_rows};
use crate::retry::{RetryPolicy, execute_with_retry, fetch_all_with_retry};
use crate::{Error, Result};

/// Lock taken by `BEGIN`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionBehavior {
   /// Locks are taken by the first read or write
   Deferred,
   /// The write lock is taken up front, so contention surfaces at `BEGIN`
   /// (where it can be retried) instead of halfway through the body
   #[default]
   Immediate,
   Exclusive,
}

impl TransactionBehavior {
   fn begin_statement(self) -> &'static str {
      match self {
         TransactionBehavior::Deferred => "BEGIN DEFERRED",
         TransactionBehavior::Immediate => "BEGIN IMMEDIATE",
         TransactionBehavior::Exclusive => "BEGIN EXCLUSIVE",
      }
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
   NotStarted,
   Active,
   Committed,
   RolledBack,
}

/// A transaction on one handle.
///
/// ```text
/// NotStarted --begin--> Active --commit--> Committed
///                       Active --rollback / failed statement--> RolledBack
/// ```
///
/// Every statement goes through the busy-retry policy. Any other failure
/// rolls the transaction back before the error is returned, so the caller
/// never sees a half-applied transaction. A scope dropped while still
/// active (early return, panic, cancelled future) schedules a rollback on
/// the handle that runs before its next statement.
#[must_use = "if unused, the transaction is immediately rolled back"]
pub struct TransactionScope<'h> {
   id: Uuid,
   handle: &'h mut ConnectionHandle,
   policy: RetryPolicy,
   behavior: TransactionBehavior,
   state: TransactionState,
}

impl<'h> TransactionScope<'h> {
   pub fn new(
      handle: &'h mut ConnectionHandle,
      policy: &RetryPolicy,
      behavior: TransactionBehavior,
   ) -> Self {
      Self {
         id: Uuid::new_v4(),
         handle,
         policy: policy.clone(),
         behavior,
         state: TransactionState::NotStarted,
      }
   }

   /// Identifier used in log output
   pub fn id(&self) -> Uuid {
      self.id
   }

   pub fn state(&self) -> TransactionState {
      self.state
   }

   pub fn handle_id(&self) -> u64 {
      self.handle.id()
   }

   /// Start the transaction
   pub async fn begin(&mut self) -> Result<()> {
      match self.state {
         TransactionState::NotStarted => {}
         TransactionState::Active => {
            return Err(Error::TransactionAlreadyActive(self.handle.id()));
         }
         TransactionState::Committed | TransactionState::RolledBack => {
            return Err(Error::TransactionAlreadyFinalized);
         }
      }

      if self.handle.in_transaction().await? {
         return Err(Error::TransactionAlreadyActive(self.handle.id()));
      }

      // Marked active before BEGIN runs, so a cancelled begin still rolls back
      self.state = TransactionState::Active;

      let begin = Statement::new(self.behavior.begin_statement());
      if let Err(e) = execute_with_retry(&mut *self.handle, &self.policy, &begin).await {
         self.state = TransactionState::NotStarted;
         return Err(e);
      }

      debug!(tx = %self.id, handle = self.handle.id(), behavior = ?self.behavior, "transaction started");
      Ok(())
   }

   /// Run a statement inside the transaction
   pub async fn execute(&mut self, statement: impl Into<Statement>) -> Result<WriteQueryResult> {
      self.ensure_active()?;

      let statement = statement.into();
      let result = execute_with_retry(&mut *self.handle, &self.policy, &statement).await;
      self.settle(result).await
   }

   /// Run a query inside the transaction, seeing its uncommitted writes
   pub async fn fetch_all(&mut self, statement: impl Into<Statement>) -> Result<RowSet> {
      self.ensure_active()?;

      let statement = statement.into();
      let result = fetch_all_with_retry(&mut *self.handle, &self.policy, &statement)
         .await
         .and_then(decode_rows);
      self.settle(result).await
   }

   /// Make the transaction's writes durable and visible
   pub async fn commit(mut self) -> Result<()> {
      self.ensure_active()?;

      let commit = Statement::new("COMMIT");
      match execute_with_retry(&mut *self.handle, &self.policy, &commit).await {
         Ok(_) => {
            self.state = TransactionState::Committed;
            debug!(tx = %self.id, handle = self.handle.id(), "transaction committed");
            Ok(())
         }
         Err(e) => Err(self.abort(e).await),
      }
   }

   /// Discard every write made by the transaction
   pub async fn rollback(mut self) -> Result<()> {
      self.ensure_active()?;
      self.rollback_active().await
   }

   fn ensure_active(&self) -> Result<()> {
      match self.state {
         TransactionState::Active => Ok(()),
         TransactionState::NotStarted => Err(Error::TransactionNotActive),
         TransactionState::Committed | TransactionState::RolledBack => {
            Err(Error::TransactionAlreadyFinalized)
         }
      }
   }

   async fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
      match result {
         Ok(value) => Ok(value),
         Err(e) => Err(self.abort(e).await),
      }
   }

   /// Roll back after `cause`, returning the error to surface
   async fn abort(&mut self, cause: Error) -> Error {
      warn!(tx = %self.id, handle = self.handle.id(), error = %cause, "transaction failed, rolling back");

      match self.rollback_active().await {
         Ok(()) => cause,
         Err(rollback_err) => Error::TransactionRollbackFailed {
            transaction_error: cause.to_string(),
            rollback_error: rollback_err.to_string(),
         },
      }
   }

   async fn rollback_active(&mut self) -> Result<()> {
      self.state = TransactionState::RolledBack;

      // Set before the first await so a dropped rollback still runs before
      // the handle's next statement; cleared once ROLLBACK succeeds
      self.handle.defer_rollback();

      match self.handle.recover().await {
         Ok(()) => {
            debug!(tx = %self.id, handle = self.handle.id(), "transaction rolled back");
            Ok(())
         }
         Err(e) => {
            warn!(tx = %self.id, handle = self.handle.id(), error = %e, "rollback failed, deferring to next use of handle");
            Err(e.into())
         }
      }
   }
}

impl Drop for TransactionScope<'_> {
   fn drop(&mut self) {
      if self.state == TransactionState::Active {
         warn!(
            tx = %self.id,
            handle = self.handle.id(),
            "transaction dropped while active, rollback deferred"
         );
         self.handle.defer_rollback();
      }
   }
}

/// Run `statements` as one atomic unit: all of them commit, or none do
pub async fn run_transaction(
   handle: &mut ConnectionHandle,
   policy: &RetryPolicy,
   behavior: TransactionBehavior,
   statements: Vec<Statement>,
) -> Result<Vec<WriteQueryResult>> {
   let mut scope = TransactionScope::new(handle, policy, behavior);
   scope.begin().await?;

   let mut results = Vec::with_capacity(statements.len());
   for statement in statements {
      // A failed statement has already rolled the scope back
      results.push(scope.execute(statement).await?);
   }

   scope.commit().await?;
   Ok(results)
}

/// Run `body` inside a transaction.
///
/// Commits when `body` returns `Ok`; rolls back and returns the error when
/// it returns `Err`. If `body` panics or the future is dropped, the rollback
/// runs before the handle's next statement.
///
/// ```no_run
/// # use sqlx_sqlite_coordinator::{Error, RetryPolicy, TransactionBehavior, with_transaction};
/// # async fn example(handle: &mut sqlx_sqlite_conn_pool::ConnectionHandle) -> Result<(), Error> {
/// let policy = RetryPolicy::default();
/// with_transaction(handle, &policy, TransactionBehavior::Immediate, |tx| {
///    Box::pin(async move {
///       tx.execute("DELETE FROM students WHERE sid = 2000").await?;
///       tx.execute("INSERT INTO students VALUES (2000)").await?;
///       Ok::<_, Error>(())
///    })
/// })
/// .await
/// # }
/// ```
pub async fn with_transaction<T, E, F>(
   handle: &mut ConnectionHandle,
   policy: &RetryPolicy,
   behavior: TransactionBehavior,
   body: F,
) -> std::result::Result<T, E>
where
   F: for<'t> FnOnce(&'t mut TransactionScope<'_>) -> BoxFuture<'t, std::result::Result<T, E>>,
   E: From<Error> + Display,
{
   let mut scope = TransactionScope::new(handle, policy, behavior);
   scope.begin().await?;

   let result = body(&mut scope).await;
   match result {
      Ok(value) => {
         // The body swallowed a failed statement; its writes are already gone
         if scope.state() != TransactionState::Active {
            return Err(Error::TransactionAlreadyFinalized.into());
         }
         scope.commit().await?;
         Ok(value)
      }
      Err(e) => {
         if scope.state() == TransactionState::Active
            && let Err(rollback_err) = scope.rollback().await
         {
            return Err(
               Error::TransactionRollbackFailed {
                  transaction_error: e.to_string(),
                  rollback_error: rollback_err.to_string(),
               }
               .into(),
            );
         }
         Err(e)
      }
   }
}
