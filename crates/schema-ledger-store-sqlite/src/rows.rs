//! Typed select/insert/update/delete helpers over a SQLite connection.
//!
//! Table and column names are [`Identifier`]s, so they are safe to splice into SQL text.
//! Every value travels as a bound parameter.

use anyhow::{bail, Context, Result};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use schema_ledger_core::{Identifier, IdentifierError, SqlValue};
use serde::Serialize;

use crate::{from_sqlite, to_sqlite};

/// Ordered `(column, value)` pairs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnValues(Vec<(Identifier, SqlValue)>);

impl ColumnValues {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a column, validating its name.
    ///
    /// # Errors
    /// Returns [`IdentifierError`] when `column` is not a valid identifier.
    pub fn with(
        mut self,
        column: &str,
        value: impl Into<SqlValue>,
    ) -> std::result::Result<Self, IdentifierError> {
        self.push(Identifier::parse(column)?, value.into());
        Ok(self)
    }

    pub fn push(&mut self, column: Identifier, value: SqlValue) {
        self.0.push((column, value));
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn contains(&self, column: &Identifier) -> bool {
        self.0.iter().any(|(name, _)| name == column)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Identifier, &SqlValue)> {
        self.0.iter().map(|(column, value)| (column, value))
    }

    fn values(&self) -> impl Iterator<Item = Value> + '_ {
        self.0.iter().map(|(_, value)| to_sqlite(value))
    }
}

/// The uniquely named column identifying the rows an update or delete touches.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyColumn {
    pub column: Identifier,
    pub value: SqlValue,
}

impl KeyColumn {
    /// # Errors
    /// Returns [`IdentifierError`] when `column` is not a valid identifier.
    pub fn new(
        column: &str,
        value: impl Into<SqlValue>,
    ) -> std::result::Result<Self, IdentifierError> {
        Ok(Self { column: Identifier::parse(column)?, value: value.into() })
    }
}

/// One result row, columns in select order.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Vec<(String, SqlValue)>,
}

impl Row {
    #[must_use]
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns.iter().find(|(name, _)| name == column).map(|(_, value)| value)
    }

    #[must_use]
    pub fn columns(&self) -> &[(String, SqlValue)] {
        &self.columns
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct InsertOutcome {
    pub last_insert_id: i64,
    pub rows_affected: usize,
}

/// Select every row of `table` matching all of `filter`. An empty filter selects all rows.
///
/// `NULL` filter values match `NULL` columns.
///
/// # Errors
/// Returns an error when the query fails.
pub fn fetch(conn: &Connection, table: &Identifier, filter: &ColumnValues) -> Result<Vec<Row>> {
    let mut sql = format!("SELECT * FROM {table}");
    if !filter.is_empty() {
        let predicates = filter
            .iter()
            .map(|(column, value)| match value {
                SqlValue::Null => format!("{column} IS ?"),
                _ => format!("{column} = ?"),
            })
            .collect::<Vec<_>>();
        sql.push_str(" WHERE ");
        sql.push_str(&predicates.join(" AND "));
    }
    query_rows(conn, &sql, filter.values())
}

/// Run a caller-trusted query with bound parameters.
///
/// # Errors
/// Returns an error when the query fails.
pub fn fetch_any(conn: &Connection, query: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
    query_rows(conn, query, params.iter().map(to_sqlite))
}

/// # Errors
/// Returns an error when `values` is empty or the insert fails.
pub fn insert(conn: &Connection, table: &Identifier, values: &ColumnValues) -> Result<InsertOutcome> {
    if values.is_empty() {
        bail!("insert into {table} requires at least one column");
    }

    let columns = values.iter().map(|(column, _)| column.as_str()).collect::<Vec<_>>();
    let placeholders = vec!["?"; columns.len()];
    let sql = format!(
        "INSERT INTO {table} ({}) VALUES ({})",
        columns.join(", "),
        placeholders.join(", ")
    );

    let rows_affected = conn
        .execute(&sql, params_from_iter(values.values()))
        .with_context(|| format!("failed to insert into {table}"))?;
    Ok(InsertOutcome { last_insert_id: conn.last_insert_rowid(), rows_affected })
}

/// Set `values` on the rows identified by `key`. Returns the number of rows changed.
///
/// # Errors
/// Returns an error when `values` is empty, also sets the key column, or the update fails.
pub fn update(
    conn: &Connection,
    table: &Identifier,
    key: &KeyColumn,
    values: &ColumnValues,
) -> Result<usize> {
    if values.is_empty() {
        bail!("update of {table} requires at least one column to set");
    }
    if values.contains(&key.column) {
        bail!("update of {table} may not change its key column {}", key.column);
    }

    let assignments =
        values.iter().map(|(column, _)| format!("{column} = ?")).collect::<Vec<_>>();
    let sql = format!("UPDATE {table} SET {} WHERE {} = ?", assignments.join(", "), key.column);

    conn.execute(&sql, params_from_iter(values.values().chain([to_sqlite(&key.value)])))
        .with_context(|| format!("failed to update {table}"))
}

/// Delete the rows identified by `key`. Returns the number of rows removed.
///
/// # Errors
/// Returns an error when the delete fails.
pub fn delete(conn: &Connection, table: &Identifier, key: &KeyColumn) -> Result<usize> {
    let sql = format!("DELETE FROM {table} WHERE {} = ?", key.column);
    conn.execute(&sql, [to_sqlite(&key.value)])
        .with_context(|| format!("failed to delete from {table}"))
}

fn query_rows(
    conn: &Connection,
    sql: &str,
    params: impl Iterator<Item = Value>,
) -> Result<Vec<Row>> {
    let mut stmt = conn.prepare(sql).with_context(|| format!("failed to prepare `{sql}`"))?;
    let names = stmt.column_names().into_iter().map(str::to_string).collect::<Vec<_>>();

    let mut rows = stmt.query(params_from_iter(params))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut columns = Vec::with_capacity(names.len());
        for (index, name) in names.iter().enumerate() {
            columns.push((name.clone(), from_sqlite(row.get::<_, Value>(index)?)));
        }
        out.push(Row { columns });
    }
    Ok(out)
}
