//! `CqlSession` - the statement-execution seam between the migration engine and a cluster
//!
//! Connection establishment is left to the embedding application. Anything that can run
//! a CQL statement with positional values and hand back rows implements [`CqlSession`];
//! the migration engine, the schema history table and the migration lock are all written
//! against this trait.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors raised by a [`CqlSession`] implementation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The cluster rejected or failed the statement
    #[error("statement failed: {0}")]
    Execution(String),
    /// The cluster could not be reached (timeouts, unavailable replicas, ...)
    #[error("cluster unavailable: {0}")]
    Unavailable(String),
    /// A row did not contain the expected column or type
    #[error("decode error: {0}")]
    Decode(String),
}

/// A bound value or a decoded column value
#[derive(Debug, Clone, PartialEq)]
pub enum CqlValue {
    Null,
    Boolean(bool),
    Int(i32),
    BigInt(i64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl From<bool> for CqlValue {
    fn from(value: bool) -> Self {
        CqlValue::Boolean(value)
    }
}

impl From<i32> for CqlValue {
    fn from(value: i32) -> Self {
        CqlValue::Int(value)
    }
}

impl From<i64> for CqlValue {
    fn from(value: i64) -> Self {
        CqlValue::BigInt(value)
    }
}

impl From<&str> for CqlValue {
    fn from(value: &str) -> Self {
        CqlValue::Text(value.to_string())
    }
}

impl From<String> for CqlValue {
    fn from(value: String) -> Self {
        CqlValue::Text(value)
    }
}

impl From<DateTime<Utc>> for CqlValue {
    fn from(value: DateTime<Utc>) -> Self {
        CqlValue::Timestamp(value)
    }
}

impl<T: Into<CqlValue>> From<Option<T>> for CqlValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(CqlValue::Null, Into::into)
    }
}

/// Conversion from a column value into a Rust type
pub trait FromCqlValue: Sized {
    fn from_cql(value: &CqlValue) -> Option<Self>;
}

impl FromCqlValue for bool {
    fn from_cql(value: &CqlValue) -> Option<Self> {
        match value {
            CqlValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }
}

impl FromCqlValue for i32 {
    fn from_cql(value: &CqlValue) -> Option<Self> {
        match value {
            CqlValue::Int(v) => Some(*v),
            CqlValue::BigInt(v) => i32::try_from(*v).ok(),
            _ => None,
        }
    }
}

impl FromCqlValue for i64 {
    fn from_cql(value: &CqlValue) -> Option<Self> {
        match value {
            CqlValue::Int(v) => Some(i64::from(*v)),
            CqlValue::BigInt(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromCqlValue for String {
    fn from_cql(value: &CqlValue) -> Option<Self> {
        match value {
            CqlValue::Text(s) => Some(s.clone()),
            _ => None,
        }
    }
}

impl FromCqlValue for DateTime<Utc> {
    fn from_cql(value: &CqlValue) -> Option<Self> {
        match value {
            CqlValue::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }
}

impl<T: FromCqlValue> FromCqlValue for Option<T> {
    fn from_cql(value: &CqlValue) -> Option<Self> {
        match value {
            CqlValue::Null => Some(None),
            other => T::from_cql(other).map(Some),
        }
    }
}

/// A single result row, columns addressed by name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: Vec<(String, CqlValue)>,
}

impl Row {
    pub fn new(columns: Vec<(String, CqlValue)>) -> Self {
        Self { columns }
    }

    /// Builder-style helper used by session implementations and tests
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<CqlValue>) -> Self {
        self.columns.push((name.into(), value.into()));
        self
    }

    pub fn value(&self, name: &str) -> Option<&CqlValue> {
        self.columns
            .iter()
            .find(|(column, _)| column == name)
            .map(|(_, value)| value)
    }

    /// Read a column and convert it
    ///
    /// A missing column is treated as `NULL`, so `Option<T>` targets decode absent
    /// columns as `None`.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Decode` if the column cannot be converted into `T`.
    pub fn get<T: FromCqlValue>(&self, name: &str) -> Result<T, SessionError> {
        let value = self.value(name).unwrap_or(&CqlValue::Null);
        T::from_cql(value).ok_or_else(|| {
            SessionError::Decode(format!(
                "column '{name}' holds {value:?}, which cannot be decoded as {}",
                std::any::type_name::<T>()
            ))
        })
    }
}

/// Rows returned by a statement
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    rows: Vec<Row>,
}

impl ResultSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_rows(rows: Vec<Row>) -> Self {
        Self { rows }
    }

    /// Result of a lightweight transaction, reporting only whether it was applied
    pub fn applied(applied: bool) -> Self {
        Self::from_rows(vec![Row::default().with(APPLIED_COLUMN, applied)])
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }

    /// Whether a conditional (`IF ...`) statement took effect
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Decode` when the result carries no `[applied]` column,
    /// which means the statement was not a lightweight transaction.
    pub fn was_applied(&self) -> Result<bool, SessionError> {
        self.first()
            .and_then(|row| row.value(APPLIED_COLUMN))
            .and_then(bool::from_cql)
            .ok_or_else(|| {
                SessionError::Decode("result has no [applied] column".to_string())
            })
    }
}

/// Column name Cassandra uses to report the outcome of a lightweight transaction
pub const APPLIED_COLUMN: &str = "[applied]";

/// Trait for executing CQL statements against a cluster
///
/// Implementations are shared between the coordinator and the lock heartbeat, so they
/// must be usable from more than one thread.
pub trait CqlSession: Send + Sync {
    /// Execute one CQL statement with positional (`?`) values
    ///
    /// # Errors
    ///
    /// Returns `SessionError` if the statement fails.
    fn execute(&self, cql: &str, values: &[CqlValue]) -> Result<ResultSet, SessionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_get_typed_columns() {
        let now = Utc::now();
        let row = Row::default()
            .with("rank", 3i32)
            .with("checksum", -42i64)
            .with("success", true)
            .with("installed_on", now)
            .with("version", CqlValue::Null);

        assert_eq!(row.get::<i32>("rank"), Ok(3));
        assert_eq!(row.get::<i64>("checksum"), Ok(-42));
        assert_eq!(row.get::<bool>("success"), Ok(true));
        assert_eq!(row.get::<DateTime<Utc>>("installed_on"), Ok(now));
        assert_eq!(row.get::<Option<String>>("version"), Ok(None));
        assert_eq!(row.get::<Option<String>>("not_selected"), Ok(None));
    }

    #[test]
    fn test_row_get_wrong_type_is_decode_error() {
        let row = Row::default().with("success", "yes");
        let err = row.get::<bool>("success").unwrap_err();
        assert!(matches!(err, SessionError::Decode(_)));
        assert!(err.to_string().contains("success"));
    }

    #[test]
    fn test_was_applied() {
        assert_eq!(ResultSet::applied(true).was_applied(), Ok(true));
        assert_eq!(ResultSet::applied(false).was_applied(), Ok(false));
        assert!(ResultSet::empty().was_applied().is_err());
    }
}
