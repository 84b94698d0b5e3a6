//! Configuration for a [`Database`](crate::Database)

use serde::Deserialize;
use sqlx_sqlite_conn_pool::{HandleConfig, SharingMode};
use sqlx_sqlite_coordinator::{RetryPolicy, TransactionBehavior};

/// Everything needed to open a [`Database`](crate::Database)
///
/// # Examples
///
/// ```
/// use serialized_sqlite::{DatabaseConfig, RetryPolicy, SharingMode};
///
/// // One shared handle, default retry budget
/// let config = DatabaseConfig::default();
/// assert_eq!(config.sharing_mode, SharingMode::Shared);
///
/// // Handle per caller, contention reported immediately
/// let config = DatabaseConfig {
///     sharing_mode: SharingMode::Isolated,
///     retry: RetryPolicy::none(),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
   /// Default: shared
   pub sharing_mode: SharingMode,

   /// Options applied to every handle the database opens
   pub handle: HandleConfig,

   /// Busy-retry budget applied to every statement
   pub retry: RetryPolicy,

   /// Lock taken when a transaction begins
   ///
   /// Default: immediate
   pub transaction_behavior: TransactionBehavior,
}
