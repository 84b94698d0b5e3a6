//! Configuration for opening SQLite connection handles

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use sqlx::sqlite::SqliteJournalMode;

/// Options applied every time a [`ConnectionHandle`](crate::ConnectionHandle) is opened
///
/// # Examples
///
/// ```
/// use sqlx_sqlite_conn_pool::{AttachedDatabase, HandleConfig, JournalMode};
///
/// // Use defaults
/// let config = HandleConfig::default();
///
/// // Let the engine wait up to 100ms on a lock before reporting busy,
/// // and attach a second database file under the `ext` schema
/// let config = HandleConfig {
///     busy_timeout_ms: 100,
///     journal_mode: Some(JournalMode::Delete),
///     attached: vec![AttachedDatabase::new("extension.db", "ext")],
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HandleConfig {
   /// Create the database file if it does not exist yet
   ///
   /// Default: true
   pub create_if_missing: bool,

   /// How long the engine itself blocks on a lock before reporting busy
   ///
   /// Zero makes contention surface immediately so the busy-retry layer
   /// decides how long to wait.
   ///
   /// Default: 0
   pub busy_timeout_ms: u64,

   /// Journal mode to set when the handle opens
   ///
   /// `None` keeps whatever the database file already uses (a rollback
   /// journal for fresh files). Setting it takes a lock, so it can itself
   /// fail with busy under contention.
   ///
   /// Default: None
   pub journal_mode: Option<JournalMode>,

   /// Enforce foreign key constraints
   ///
   /// Default: true
   pub foreign_keys: bool,

   /// Additional database files attached on open
   ///
   /// Default: none
   pub attached: Vec<AttachedDatabase>,
}

impl Default for HandleConfig {
   fn default() -> Self {
      Self {
         create_if_missing: true,
         busy_timeout_ms: 0,
         journal_mode: None,
         foreign_keys: true,
         attached: Vec::new(),
      }
   }
}

impl HandleConfig {
   pub fn busy_timeout(&self) -> Duration {
      Duration::from_millis(self.busy_timeout_ms)
   }
}

/// SQLite journal modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalMode {
   Delete,
   Truncate,
   Persist,
   Memory,
   Wal,
   Off,
}

impl From<JournalMode> for SqliteJournalMode {
   fn from(mode: JournalMode) -> Self {
      match mode {
         JournalMode::Delete => SqliteJournalMode::Delete,
         JournalMode::Truncate => SqliteJournalMode::Truncate,
         JournalMode::Persist => SqliteJournalMode::Persist,
         JournalMode::Memory => SqliteJournalMode::Memory,
         JournalMode::Wal => SqliteJournalMode::Wal,
         JournalMode::Off => SqliteJournalMode::Off,
      }
   }
}

/// A database file attached to every handle under its own schema name
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AttachedDatabase {
   /// Path to the attached database file
   pub path: PathBuf,

   /// Schema name used to qualify its tables (`schema.table`)
   pub schema_name: String,
}

impl AttachedDatabase {
   pub fn new(path: impl Into<PathBuf>, schema_name: impl Into<String>) -> Self {
      Self {
         path: path.into(),
         schema_name: schema_name.into(),
      }
   }
}
