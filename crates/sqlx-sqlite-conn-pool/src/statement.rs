//! Statements, prepared statements and their results

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::sqlite::{SqliteArguments, SqliteConnection, SqliteRow};
use sqlx::{Row as _, Sqlite};
use tracing::trace;

use crate::{Error, Result};

pub(crate) type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

/// Statement text with positional bind values
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Statement {
   pub query: String,
   #[serde(default)]
   pub values: Vec<JsonValue>,
}

impl Statement {
   pub fn new(query: impl Into<String>) -> Self {
      Self {
         query: query.into(),
         values: Vec::new(),
      }
   }

   /// Append a positional bind value (`?`, `?N` or `$N` placeholders)
   pub fn bind(mut self, value: impl Into<JsonValue>) -> Self {
      self.values.push(value.into());
      self
   }

   pub(crate) fn to_query(&self) -> SqliteQuery<'_> {
      let mut q = sqlx::query(&self.query);
      for value in &self.values {
         q = bind_value(q, value.clone());
      }
      q
   }
}

impl From<&str> for Statement {
   fn from(query: &str) -> Self {
      Self::new(query)
   }
}

impl From<String> for Statement {
   fn from(query: String) -> Self {
      Self::new(query)
   }
}

/// Result returned from write operations (e.g. INSERT, UPDATE, DELETE).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteQueryResult {
   /// The number of rows affected by the write operation.
   pub rows_affected: u64,
   /// The last inserted row ID (SQLite ROWID).
   ///
   /// Only meaningful after an INSERT into a table with a ROWID.
   pub last_insert_id: i64,
}

/// Outcome of a single [`PreparedStatement::step`]
pub enum StepResult {
   Row(SqliteRow),
   Done,
}

impl std::fmt::Debug for StepResult {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      match self {
         StepResult::Row(row) => f.debug_tuple("Row").field(&row.columns().len()).finish(),
         StepResult::Done => f.write_str("Done"),
      }
   }
}

/// A statement compiled against one handle and stepped row by row.
///
/// The statement mutably borrows its handle, so it has to be finalized
/// (or dropped) before the handle can run anything else or be closed.
/// The first step runs the statement; later steps hand out its rows.
/// A step that fails (busy included) leaves the statement unrun with its
/// bind values intact, so stepping again re-runs it. After `Done`, further
/// steps return `Done`.
#[must_use = "a prepared statement does nothing until it is stepped"]
pub struct PreparedStatement<'h> {
   handle_id: u64,
   query: &'h str,
   columns: Vec<String>,
   values: Vec<JsonValue>,
   conn: &'h mut SqliteConnection,
   rows: Option<VecDeque<SqliteRow>>,
   attempts: u32,
   finished: bool,
}

impl<'h> PreparedStatement<'h> {
   pub(crate) fn new(
      handle_id: u64,
      query: &'h str,
      columns: Vec<String>,
      conn: &'h mut SqliteConnection,
   ) -> Self {
      Self {
         handle_id,
         query,
         columns,
         values: Vec::new(),
         conn,
         rows: None,
         attempts: 0,
         finished: false,
      }
   }

   /// Bind the next positional value. Ignored once stepping has started.
   pub fn bind(&mut self, value: impl Into<JsonValue>) -> &mut Self {
      if self.attempts == 0 {
         self.values.push(value.into());
      }
      self
   }

   pub fn query(&self) -> &str {
      self.query
   }

   /// Id of the handle this statement was prepared on
   pub fn handle_id(&self) -> u64 {
      self.handle_id
   }

   /// Result column names, empty for statements that return no rows
   pub fn columns(&self) -> &[String] {
      &self.columns
   }

   /// Advance to the next row
   pub async fn step(&mut self) -> Result<StepResult> {
      if self.finished {
         return Ok(StepResult::Done);
      }

      if self.rows.is_none() {
         self.attempts = self.attempts.saturating_add(1);

         let mut q = sqlx::query(self.query);
         for value in &self.values {
            q = bind_value(q, value.clone());
         }

         let rows = q
            .fetch_all(&mut *self.conn)
            .await
            .map_err(|e| Error::from_engine(self.query, e))?;

         if self.attempts > 1 {
            trace!(handle = self.handle_id, query = %self.query, attempts = self.attempts, "statement re-run after failed step");
         }
         self.rows = Some(rows.into());
      }

      match self.rows.as_mut().and_then(VecDeque::pop_front) {
         Some(row) => Ok(StepResult::Row(row)),
         None => {
            self.finished = true;
            self.rows = None;
            Ok(StepResult::Done)
         }
      }
   }

   /// Release the statement and give the handle back
   pub fn finalize(self) {
      trace!(handle = self.handle_id, query = %self.query, "statement finalized");
   }
}

impl std::fmt::Debug for PreparedStatement<'_> {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("PreparedStatement")
         .field("handle_id", &self.handle_id)
         .field("query", &self.query)
         .field("columns", &self.columns)
         .field("attempts", &self.attempts)
         .field("finished", &self.finished)
         .finish()
   }
}

/// Helper function to bind a JSON value to a SQLx query
pub(crate) fn bind_value(query: SqliteQuery<'_>, value: JsonValue) -> SqliteQuery<'_> {
   match value {
      JsonValue::Null => query.bind(None::<JsonValue>),
      JsonValue::Bool(flag) => query.bind(flag),
      JsonValue::String(text) => query.bind(text),
      JsonValue::Number(number) => {
         // Preserve integer precision by binding as i64 when possible
         if let Some(int_val) = number.as_i64() {
            query.bind(int_val)
         } else if let Some(uint_val) = number.as_u64() {
            // Value too large for i64, use f64 (will lose precision)
            query.bind(uint_val as f64)
         } else {
            query.bind(number.as_f64().unwrap_or_default())
         }
      }
      other => query.bind(other),
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use serde_json::json;

   #[test]
   fn test_statement_from_text() {
      let stmt: Statement = "SELECT 1".into();
      assert_eq!(stmt.query, "SELECT 1");
      assert!(stmt.values.is_empty());
   }

   #[test]
   fn test_statement_bind_keeps_order() {
      let stmt = Statement::new("INSERT INTO t VALUES (?, ?, ?)")
         .bind(1)
         .bind("two")
         .bind(JsonValue::Null);

      assert_eq!(stmt.values, vec![json!(1), json!("two"), JsonValue::Null]);
   }

   #[test]
   fn test_statement_deserializes_without_values() {
      let stmt: Statement = serde_json::from_str(r#"{ "query": "DELETE FROM t" }"#).unwrap();
      assert_eq!(stmt, Statement::new("DELETE FROM t"));
   }
}
