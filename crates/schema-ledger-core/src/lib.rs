use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

mod context;
mod executor;
mod history;
mod reader;
mod reconciler;

pub use context::{CancelHandle, Interruption, RunContext};
pub use executor::{DriverError, ExecTransaction, Executor};
pub use history::{check_contiguous, history_fingerprint, ContiguityError};
pub use reader::{SourceReadError, StatementReader};
pub use reconciler::{
    ReconcileError, ReconcileErrorKind, ReconcilePlan, ReconcileReport, Reconciler,
};

const MAX_IDENTIFIER_LEN: usize = 64;

/// Position of a statement in the source, counted over non-blank lines from 1.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct Sequence(pub u32);

impl Sequence {
    pub const FIRST: Self = Self(1);

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn next(self) -> Option<Self> {
        self.0.checked_add(1).map(Self)
    }
}

impl Display for Sequence {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Sequence> for i64 {
    fn from(value: Sequence) -> Self {
        i64::from(value.0)
    }
}

/// One logical statement assembled from the source stream.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StatementRecord {
    pub sequence: Sequence,
    /// Physical line number (1-based, blank lines included) the statement ended on.
    pub line: u64,
    pub text: String,
}

/// A persisted row of the migration log.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LogEntry {
    pub sequence: Sequence,
    pub text: String,
    #[serde(with = "time::serde::rfc3339")]
    pub applied_at: OffsetDateTime,
}

/// Typed bind parameter or scalar result exchanged with an [`Executor`].
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl SqlValue {
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Integer(_) => "integer",
            Self::Real(_) => "real",
            Self::Text(_) => "text",
            Self::Blob(_) => "blob",
        }
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        Self::Real(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Blob(value)
    }
}

impl From<Sequence> for SqlValue {
    fn from(value: Sequence) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl<T> From<Option<T>> for SqlValue
where
    T: Into<SqlValue>,
{
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum IdentifierError {
    #[error("identifier MUST be non-empty")]
    Empty,
    #[error("identifier `{0}` exceeds {MAX_IDENTIFIER_LEN} bytes")]
    TooLong(String),
    #[error("identifier `{0}` MUST match [A-Za-z_][A-Za-z0-9_]*")]
    InvalidCharacter(String),
}

/// A table or column name that is safe to splice into SQL text.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct Identifier(String);

impl Identifier {
    /// Validate a raw table or column name.
    ///
    /// # Errors
    /// Returns [`IdentifierError`] when the name is empty, too long, or contains
    /// characters outside `[A-Za-z0-9_]` (or starts with a digit).
    pub fn parse(raw: &str) -> Result<Self, IdentifierError> {
        if raw.is_empty() {
            return Err(IdentifierError::Empty);
        }
        if raw.len() > MAX_IDENTIFIER_LEN {
            return Err(IdentifierError::TooLong(raw.to_string()));
        }

        let mut chars = raw.chars();
        let leading_ok = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
        if !leading_ok || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(IdentifierError::InvalidCharacter(raw.to_string()));
        }

        Ok(Self(raw.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Identifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Identifier {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Identifier {
    type Error = IdentifierError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Identifier> for String {
    fn from(value: Identifier) -> Self {
        value.0
    }
}

/// SQL for the migration log table, generated once per table name.
///
/// Placeholders use the positional `?` form understood by `SQLite` and `MySQL`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LogTable {
    name: Identifier,
    create_sql: String,
    lookup_sql: String,
    insert_sql: String,
    delete_sql: String,
    list_sql: String,
}

impl LogTable {
    pub const DEFAULT_NAME: &'static str = "schema_log";

    #[must_use]
    pub fn new(name: Identifier) -> Self {
        let create_sql = format!(
            "CREATE TABLE IF NOT EXISTS {name} (\
             sequence INTEGER NOT NULL PRIMARY KEY, \
             statement_text TEXT NOT NULL, \
             applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP)"
        );
        let lookup_sql = format!("SELECT statement_text FROM {name} WHERE sequence = ?");
        let insert_sql = format!("INSERT INTO {name} (sequence, statement_text) VALUES (?, ?)");
        let delete_sql = format!("DELETE FROM {name} WHERE sequence = ?");
        let list_sql = format!(
            "SELECT sequence, statement_text, applied_at FROM {name} ORDER BY sequence ASC"
        );

        Self { name, create_sql, lookup_sql, insert_sql, delete_sql, list_sql }
    }

    /// Build the log table SQL for a raw table name.
    ///
    /// # Errors
    /// Returns [`IdentifierError`] when `raw` is not a valid identifier.
    pub fn named(raw: &str) -> Result<Self, IdentifierError> {
        Identifier::parse(raw).map(Self::new)
    }

    #[must_use]
    pub fn name(&self) -> &Identifier {
        &self.name
    }

    #[must_use]
    pub fn create_sql(&self) -> &str {
        &self.create_sql
    }

    #[must_use]
    pub fn lookup_sql(&self) -> &str {
        &self.lookup_sql
    }

    #[must_use]
    pub fn insert_sql(&self) -> &str {
        &self.insert_sql
    }

    #[must_use]
    pub fn delete_sql(&self) -> &str {
        &self.delete_sql
    }

    #[must_use]
    pub fn list_sql(&self) -> &str {
        &self.list_sql
    }
}

impl Default for LogTable {
    fn default() -> Self {
        Self::new(Identifier(Self::DEFAULT_NAME.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_accepts_plain_names() {
        for raw in ["schema_log", "_private", "Log2", "a"] {
            assert_eq!(Identifier::parse(raw).map(|id| id.to_string()), Ok(raw.to_string()));
        }
    }

    #[test]
    fn identifier_rejects_injection_and_bad_shapes() {
        assert_eq!(Identifier::parse(""), Err(IdentifierError::Empty));
        for raw in ["1log", "schema-log", "log; DROP TABLE users", "log name", "lög"] {
            assert_eq!(
                Identifier::parse(raw),
                Err(IdentifierError::InvalidCharacter(raw.to_string()))
            );
        }
        let long = "x".repeat(MAX_IDENTIFIER_LEN + 1);
        assert_eq!(Identifier::parse(&long), Err(IdentifierError::TooLong(long.clone())));
    }

    #[test]
    fn log_table_sql_uses_the_configured_name() -> Result<(), IdentifierError> {
        let table = LogTable::named("dbSchemaLog")?;
        assert!(table.create_sql().starts_with("CREATE TABLE IF NOT EXISTS dbSchemaLog ("));
        assert_eq!(table.lookup_sql(), "SELECT statement_text FROM dbSchemaLog WHERE sequence = ?");
        assert_eq!(
            table.insert_sql(),
            "INSERT INTO dbSchemaLog (sequence, statement_text) VALUES (?, ?)"
        );
        assert_eq!(table.delete_sql(), "DELETE FROM dbSchemaLog WHERE sequence = ?");
        assert_eq!(LogTable::default().name().as_str(), LogTable::DEFAULT_NAME);
        Ok(())
    }

    #[test]
    fn optional_values_map_to_null() {
        assert_eq!(SqlValue::from(None::<i64>), SqlValue::Null);
        assert_eq!(SqlValue::from(Some("x")), SqlValue::Text("x".to_string()));
        assert_eq!(SqlValue::from(Sequence(7)), SqlValue::Integer(7));
    }
}
