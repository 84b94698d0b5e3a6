//! Bounded backoff-and-retry for busy engine responses

use std::future::Future;
use std::ops::ControlFlow;
use std::time::Duration;

use serde::Deserialize;
use sqlx_sqlite_conn_pool::{ConnectionHandle, SqliteRow, Statement, WriteQueryResult};
use tracing::{debug, warn};

use crate::{Error, Result};

/// How the wait between attempts grows
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
   /// Wait `initial_delay_ms` before every retry
   Fixed,
   /// Double the wait after every retry, up to `max_delay_ms`
   #[default]
   Exponential,
}

/// Retry budget for operations that may report the database as busy.
///
/// Only busy errors are retried. Everything else, including constraint
/// violations and compile failures, is returned on first occurrence.
///
/// # Examples
///
/// ```
/// use sqlx_sqlite_coordinator::RetryPolicy;
/// use std::time::Duration;
///
/// // Up to 10 retries: 5ms, 10ms, 20ms, ... capped at 250ms
/// let policy = RetryPolicy::default();
///
/// // Report contention immediately
/// let policy = RetryPolicy::none();
///
/// // Retry every 20ms, at most 50 times
/// let policy = RetryPolicy::fixed(50, Duration::from_millis(20));
/// assert_eq!(policy.delay_for(7), Duration::from_millis(20));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
   /// Retries after the first attempt. Zero disables retrying.
   ///
   /// Default: 10
   pub max_retries: u32,

   /// Default: exponential
   pub backoff: Backoff,

   /// Wait before the first retry
   ///
   /// Default: 5ms
   pub initial_delay_ms: u64,

   /// Upper bound on any single wait
   ///
   /// Default: 250ms
   pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
   fn default() -> Self {
      Self {
         max_retries: 10,
         backoff: Backoff::Exponential,
         initial_delay_ms: 5,
         max_delay_ms: 250,
      }
   }
}

impl RetryPolicy {
   /// A policy that never retries
   pub fn none() -> Self {
      Self {
         max_retries: 0,
         ..Default::default()
      }
   }

   pub fn fixed(max_retries: u32, delay: Duration) -> Self {
      let delay_ms = whole_millis(delay);
      Self {
         max_retries,
         backoff: Backoff::Fixed,
         initial_delay_ms: delay_ms,
         max_delay_ms: delay_ms,
      }
   }

   pub fn exponential(max_retries: u32, initial: Duration, max: Duration) -> Self {
      Self {
         max_retries,
         backoff: Backoff::Exponential,
         initial_delay_ms: whole_millis(initial),
         max_delay_ms: whole_millis(max),
      }
   }

   /// Wait before retry number `retry` (the first retry is 1)
   pub fn delay_for(&self, retry: u32) -> Duration {
      let initial = Duration::from_millis(self.initial_delay_ms);
      let max = Duration::from_millis(self.max_delay_ms.max(self.initial_delay_ms));

      match self.backoff {
         Backoff::Fixed => initial,
         Backoff::Exponential => {
            let factor = 2u32.saturating_pow(retry.saturating_sub(1));
            initial.saturating_mul(factor).min(max)
         }
      }
   }

   /// Start tracking one logical operation against this budget
   pub fn start<'a>(&'a self, query: &'a str) -> RetryState<'a> {
      RetryState {
         policy: self,
         query,
         attempts: 0,
         elapsed: Duration::ZERO,
      }
   }

   /// Run `op` until it stops reporting busy or the budget runs out.
   ///
   /// `query` identifies the operation in logs and in
   /// [`Error::BusyExhausted`].
   pub async fn retry<T, F, Fut>(&self, query: &str, mut op: F) -> Result<T>
   where
      F: FnMut() -> Fut,
      Fut: Future<Output = sqlx_sqlite_conn_pool::Result<T>>,
   {
      let mut state = self.start(query);
      loop {
         match op().await {
            Err(e) if e.is_busy() => state.backoff(e).await?,
            result => return Ok(result?),
         }
      }
   }
}

/// Milliseconds in `duration`, clamped to `u64::MAX`
fn whole_millis(duration: Duration) -> u64 {
   u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Attempt bookkeeping for one operation under a [`RetryPolicy`]
#[derive(Debug)]
pub struct RetryState<'a> {
   policy: &'a RetryPolicy,
   query: &'a str,
   attempts: u32,
   elapsed: Duration,
}

impl RetryState<'_> {
   /// Attempts that have failed so far
   pub fn attempts(&self) -> u32 {
      self.attempts
   }

   /// Total time spent waiting between attempts
   pub fn elapsed(&self) -> Duration {
      self.elapsed
   }

   /// Record a failed attempt.
   ///
   /// Busy errors sleep for the next backoff interval and return `Ok` while
   /// budget remains, then [`Error::BusyExhausted`]. Any other error is
   /// returned as is.
   pub async fn backoff(&mut self, err: sqlx_sqlite_conn_pool::Error) -> Result<()> {
      if !err.is_busy() {
         return Err(err.into());
      }

      self.attempts = self.attempts.saturating_add(1);

      if self.attempts > self.policy.max_retries {
         warn!(
            query = self.query,
            attempts = self.attempts,
            elapsed = ?self.elapsed,
            "busy retry budget exhausted"
         );
         return Err(Error::BusyExhausted {
            query: self.query.to_string(),
            attempts: self.attempts,
            elapsed: self.elapsed,
            last_error: err.to_string(),
         });
      }

      let delay = self.policy.delay_for(self.attempts);
      debug!(query = self.query, attempt = self.attempts, ?delay, "database busy, backing off");

      tokio::time::sleep(delay).await;
      self.elapsed = self.elapsed.saturating_add(delay);
      Ok(())
   }
}

/// [`ConnectionHandle::execute`] under a retry budget
pub async fn execute_with_retry(
   handle: &mut ConnectionHandle,
   policy: &RetryPolicy,
   statement: &Statement,
) -> Result<WriteQueryResult> {
   let mut state = policy.start(&statement.query);
   loop {
      match handle.execute(statement).await {
         Err(e) if e.is_busy() => state.backoff(e).await?,
         result => return Ok(result?),
      }
   }
}

/// [`ConnectionHandle::fetch_all`] under a retry budget
pub async fn fetch_all_with_retry(
   handle: &mut ConnectionHandle,
   policy: &RetryPolicy,
   statement: &Statement,
) -> Result<Vec<SqliteRow>> {
   let mut state = policy.start(&statement.query);
   loop {
      match handle.fetch_all(statement).await {
         Err(e) if e.is_busy() => state.backoff(e).await?,
         result => return Ok(result?),
      }
   }
}

/// [`ConnectionHandle::exec_with`] under a retry budget.
///
/// Only retried while no row has reached the callback yet; a busy error
/// after that is returned so rows are never delivered twice.
pub async fn exec_with_retry<F>(
   handle: &mut ConnectionHandle,
   policy: &RetryPolicy,
   statement: &Statement,
   mut callback: F,
) -> Result<usize>
where
   F: FnMut(&SqliteRow) -> ControlFlow<()>,
{
   let mut state = policy.start(&statement.query);
   loop {
      let mut delivered = 0;
      let result = handle
         .exec_with(statement, |row| {
            delivered += 1;
            callback(row)
         })
         .await;

      match result {
         Err(e) if e.is_busy() && delivered == 0 => state.backoff(e).await?,
         result => return Ok(result?),
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use sqlx_sqlite_conn_pool::Error as PoolError;

   fn busy() -> PoolError {
      PoolError::Busy {
         query: "INSERT INTO students VALUES (100)".into(),
         code: 5,
         message: "database is locked".into(),
      }
   }

   #[test]
   fn test_fixed_delay() {
      let policy = RetryPolicy::fixed(3, Duration::from_millis(20));
      assert_eq!(policy.delay_for(1), Duration::from_millis(20));
      assert_eq!(policy.delay_for(3), Duration::from_millis(20));
   }

   #[test]
   fn test_exponential_delay_is_capped() {
      let policy =
         RetryPolicy::exponential(10, Duration::from_millis(5), Duration::from_millis(30));
      assert_eq!(policy.delay_for(1), Duration::from_millis(5));
      assert_eq!(policy.delay_for(2), Duration::from_millis(10));
      assert_eq!(policy.delay_for(3), Duration::from_millis(20));
      assert_eq!(policy.delay_for(4), Duration::from_millis(30));
      assert_eq!(policy.delay_for(40), Duration::from_millis(30));
   }

   #[test]
   fn test_oversized_durations_clamp_to_max_millis() {
      let policy = RetryPolicy::fixed(1, Duration::MAX);
      assert_eq!(policy.initial_delay_ms, u64::MAX);
      assert_eq!(policy.delay_for(1), Duration::from_millis(u64::MAX));

      let policy = RetryPolicy::exponential(1, Duration::from_millis(5), Duration::MAX);
      assert_eq!(policy.max_delay_ms, u64::MAX);
   }

   #[tokio::test(start_paused = true)]
   async fn test_unbounded_budget_does_not_overflow_attempts() {
      let policy =
         RetryPolicy::exponential(u32::MAX, Duration::from_millis(5), Duration::from_millis(30));
      let mut state = policy.start("INSERT INTO students VALUES (100)");
      state.attempts = u32::MAX - 1;

      state.backoff(busy()).await.unwrap();
      assert_eq!(state.attempts(), u32::MAX);

      state.backoff(busy()).await.unwrap();
      assert_eq!(state.attempts(), u32::MAX);
   }

   #[test]
   fn test_deserialize_policy() {
      let policy: RetryPolicy =
         serde_json::from_str(r#"{ "max_retries": 3, "backoff": "fixed" }"#).unwrap();
      assert_eq!(policy.max_retries, 3);
      assert_eq!(policy.backoff, Backoff::Fixed);
      assert_eq!(policy.initial_delay_ms, 5);
   }

   #[tokio::test(start_paused = true)]
   async fn test_retry_succeeds_after_transient_busy() {
      let policy = RetryPolicy::fixed(5, Duration::from_millis(10));
      let mut calls = 0;

      let value = policy
         .retry("INSERT INTO students VALUES (100)", || {
            calls += 1;
            let attempt = calls;
            async move {
               if attempt <= 3 {
                  Err(busy())
               } else {
                  Ok(attempt)
               }
            }
         })
         .await
         .unwrap();

      assert_eq!(value, 4);
      assert_eq!(calls, 4);
   }

   #[tokio::test(start_paused = true)]
   async fn test_retry_exhaustion_reports_attempts() {
      let policy = RetryPolicy::fixed(2, Duration::from_millis(10));
      let mut calls = 0;

      let err = policy
         .retry("INSERT INTO students VALUES (100)", || {
            calls += 1;
            async { Err::<(), _>(busy()) }
         })
         .await
         .unwrap_err();

      assert_eq!(calls, 3);
      match err {
         Error::BusyExhausted {
            query,
            attempts,
            elapsed,
            last_error,
         } => {
            assert_eq!(query, "INSERT INTO students VALUES (100)");
            assert_eq!(attempts, 3);
            assert_eq!(elapsed, Duration::from_millis(20));
            assert!(last_error.contains("database is locked"));
         }
         other => panic!("expected BusyExhausted, got {other:?}"),
      }
   }

   #[tokio::test(start_paused = true)]
   async fn test_zero_budget_fails_on_first_busy() {
      let policy = RetryPolicy::none();
      let mut calls = 0;

      let err = policy
         .retry("INSERT INTO students VALUES (100)", || {
            calls += 1;
            async { Err::<(), _>(busy()) }
         })
         .await
         .unwrap_err();

      assert_eq!(calls, 1);
      assert!(matches!(err, Error::BusyExhausted { attempts: 1, .. }));
   }

   #[tokio::test(start_paused = true)]
   async fn test_non_busy_errors_are_not_retried() {
      let policy = RetryPolicy::default();
      let mut calls = 0;

      let err = policy
         .retry("INSERT INTO t VALUES (1)", || {
            calls += 1;
            async {
               Err::<(), _>(PoolError::ConstraintViolation {
                  query: "INSERT INTO t VALUES (1)".into(),
                  code: 1555,
                  message: "UNIQUE constraint failed: t.id".into(),
               })
            }
         })
         .await
         .unwrap_err();

      assert_eq!(calls, 1);
      assert!(err.is_constraint_violation());
   }

   #[tokio::test(start_paused = true)]
   async fn test_state_tracks_attempts_and_elapsed() {
      let policy = RetryPolicy::exponential(4, Duration::from_millis(5), Duration::from_millis(100));
      let mut state = policy.start("COMMIT");

      state.backoff(busy()).await.unwrap();
      state.backoff(busy()).await.unwrap();
      assert_eq!(state.attempts(), 2);
      assert_eq!(state.elapsed(), Duration::from_millis(15));

      let err = state.backoff(PoolError::HandleClosed).await.unwrap_err();
      assert!(matches!(err, Error::Pool(PoolError::HandleClosed)));
      assert_eq!(state.attempts(), 2);
   }
}
