//! Decoding SQLite rows into JSON maps

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use indexmap::IndexMap;
use serde_json::Value as JsonValue;
use sqlx::sqlite::{SqliteRow, SqliteValueRef};
use sqlx::{Column, Decode, Row as _, Sqlite, TypeInfo, ValueRef};

use crate::{Error, Result};

/// One decoded row, columns in result order
pub type Row = IndexMap<String, JsonValue>;

/// Every row a query produced
pub type RowSet = Vec<Row>;

/// Convert a single SQLite value to JSON.
///
/// Integers and booleans become numbers, text stays text, and BLOBs are
/// base64 encoded.
pub fn to_json(value: SqliteValueRef<'_>) -> Result<JsonValue> {
   if value.is_null() {
      return Ok(JsonValue::Null);
   }

   let type_name = value.type_info().name().to_string();

   let json = match type_name.as_str() {
      "INTEGER" | "BOOLEAN" => JsonValue::from(decode::<i64>(value)?),
      "REAL" | "NUMERIC" => JsonValue::from(decode::<f64>(value)?),
      "TEXT" | "DATE" | "TIME" | "DATETIME" => JsonValue::String(decode::<String>(value)?),
      "BLOB" => JsonValue::String(BASE64.encode(decode::<Vec<u8>>(value)?)),
      _ => return Err(Error::UnsupportedDatatype(type_name)),
   };

   Ok(json)
}

pub fn decode_row(row: &SqliteRow) -> Result<Row> {
   let mut value = IndexMap::default();
   for (i, column) in row.columns().iter().enumerate() {
      let v = row.try_get_raw(i)?;
      value.insert(column.name().to_string(), to_json(v)?);
   }
   Ok(value)
}

pub fn decode_rows(rows: Vec<SqliteRow>) -> Result<RowSet> {
   rows.iter().map(decode_row).collect()
}

fn decode<'r, T: Decode<'r, Sqlite>>(value: SqliteValueRef<'r>) -> Result<T> {
   T::decode(value).map_err(|e| Error::Sqlx(sqlx::Error::Decode(e)))
}
