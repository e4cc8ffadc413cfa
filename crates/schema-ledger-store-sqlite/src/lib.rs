use std::io::Read;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Batch, Connection, OpenFlags, OptionalExtension};
use schema_ledger_core::{
    check_contiguous, history_fingerprint, DriverError, ExecTransaction, Executor, LogEntry,
    LogTable, ReconcileError, ReconcilePlan, ReconcileReport, Reconciler, RunContext, Sequence,
    SqlValue,
};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};
use tracing::debug;

pub mod rows;

/// A migration log hosted in one SQLite database.
pub struct SqliteStore {
    conn: Connection,
    reconciler: Reconciler,
}

/// [`Executor`] over a borrowed SQLite connection.
pub struct SqliteExecutor<'conn> {
    conn: &'conn mut Connection,
}

pub struct SqliteTransaction<'conn> {
    tx: rusqlite::Transaction<'conn>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogReport {
    pub table: String,
    pub entries: Vec<LogEntry>,
    pub count: usize,
    pub contiguous: bool,
    pub contiguity_error: Option<String>,
    pub fingerprint: String,
}

impl SqliteStore {
    /// Open a SQLite database hosting the migration log and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path, table: LogTable) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        debug!(path = %path.display(), table = %table.name(), "opened sqlite store");
        Ok(Self::from_connection(conn, table))
    }

    /// Open an existing database without creating it or changing its journal mode.
    ///
    /// # Errors
    /// Returns an error when the file does not exist or cannot be opened.
    pub fn open_read_only(path: &Path, table: LogTable) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| {
            format!("failed to open sqlite database at {} read-only", path.display())
        })?;
        conn.busy_timeout(std::time::Duration::from_millis(5000))
            .context("failed to configure sqlite busy timeout")?;

        debug!(path = %path.display(), table = %table.name(), "opened sqlite store read-only");
        Ok(Self::from_connection(conn, table))
    }

    #[must_use]
    pub fn from_connection(conn: Connection, table: LogTable) -> Self {
        Self { conn, reconciler: Reconciler::new(table) }
    }

    #[must_use]
    pub fn table(&self) -> &LogTable {
        self.reconciler.table()
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn executor(&mut self) -> SqliteExecutor<'_> {
        SqliteExecutor::new(&mut self.conn)
    }

    /// Reconcile `source` against this database's migration log.
    ///
    /// # Errors
    /// Returns the [`ReconcileError`] that halted the run.
    pub fn apply<R: Read>(
        &mut self,
        ctx: &RunContext,
        source: R,
    ) -> std::result::Result<ReconcileReport, ReconcileError> {
        let mut executor = SqliteExecutor::new(&mut self.conn);
        self.reconciler.reconcile(&mut executor, ctx, source)
    }

    /// Classify `source` against the log without applying anything.
    ///
    /// # Errors
    /// Returns the [`ReconcileError`] a real run would stop on before its first write.
    pub fn plan<R: Read>(
        &mut self,
        ctx: &RunContext,
        source: R,
    ) -> std::result::Result<ReconcilePlan, ReconcileError> {
        let mut executor = SqliteExecutor::new(&mut self.conn);
        self.reconciler.plan(&mut executor, ctx, source)
    }

    /// Every log row ordered by sequence. A missing log table reads as an empty log.
    ///
    /// # Errors
    /// Returns an error when the log cannot be queried or a row is malformed.
    pub fn entries(&self) -> Result<Vec<LogEntry>> {
        let table = self.table();
        if !table_exists(&self.conn, table.name().as_str())? {
            return Ok(Vec::new());
        }

        let mut stmt = self
            .conn
            .prepare(table.list_sql())
            .with_context(|| format!("failed to prepare listing of {}", table.name()))?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (sequence, text, applied_at) = row?;
            entries.push(LogEntry {
                sequence: parse_sequence(sequence)?,
                text,
                applied_at: parse_applied_at(&applied_at)?,
            });
        }
        Ok(entries)
    }

    /// Summarize the log: its rows, whether they form `1..=N`, and a history fingerprint.
    ///
    /// # Errors
    /// Returns an error when the log cannot be read.
    pub fn log_report(&self) -> Result<LogReport> {
        let entries = self.entries()?;
        let contiguity_error = check_contiguous(&entries).err().map(|err| err.to_string());
        let fingerprint = history_fingerprint(&entries);

        Ok(LogReport {
            table: self.table().name().to_string(),
            count: entries.len(),
            contiguous: contiguity_error.is_none(),
            contiguity_error,
            fingerprint,
            entries,
        })
    }
}

impl LogReport {
    /// The report of a log that has never been written.
    #[must_use]
    pub fn empty(table: &LogTable) -> Self {
        Self {
            table: table.name().to_string(),
            entries: Vec::new(),
            count: 0,
            contiguous: true,
            contiguity_error: None,
            fingerprint: history_fingerprint(&[]),
        }
    }
}

impl<'conn> SqliteExecutor<'conn> {
    pub fn new(conn: &'conn mut Connection) -> Self {
        Self { conn }
    }
}

impl Executor for SqliteExecutor<'_> {
    type Transaction<'a> = SqliteTransaction<'a> where Self: 'a;

    fn begin_transaction(
        &mut self,
        ctx: &RunContext,
    ) -> std::result::Result<SqliteTransaction<'_>, DriverError> {
        ctx.check()?;
        let tx = self.conn.transaction().map_err(DriverError::driver)?;
        Ok(SqliteTransaction { tx })
    }

    fn query_scalar(
        &mut self,
        ctx: &RunContext,
        query: &str,
        params: &[SqlValue],
    ) -> std::result::Result<Option<SqlValue>, DriverError> {
        ctx.check()?;
        self.conn
            .query_row(query, params_from_iter(params.iter().map(to_sqlite)), |row| {
                row.get::<_, Value>(0)
            })
            .optional()
            .map(|value| value.map(from_sqlite))
            .map_err(DriverError::driver)
    }
}

impl SqliteTransaction<'_> {
    /// Run exactly one source statement, stepping through any rows it returns (PRAGMA, SELECT).
    /// A line holding a second statement is rejected before any of it runs.
    fn execute_source_line(&self, line: &str) -> std::result::Result<usize, DriverError> {
        let mut batch = Batch::new(&self.tx, line);
        let Some(mut stmt) = batch.next().map_err(DriverError::driver)? else {
            return Ok(0);
        };
        if batch.next().map_err(DriverError::driver)?.is_some() {
            return Err(DriverError::message("source line holds more than one statement"));
        }

        let mut rows = stmt.raw_query();
        while rows.next().map_err(DriverError::driver)?.is_some() {}
        Ok(usize::try_from(self.tx.changes()).unwrap_or(usize::MAX))
    }
}

impl ExecTransaction for SqliteTransaction<'_> {
    fn execute(
        &mut self,
        statement: &str,
        params: &[SqlValue],
    ) -> std::result::Result<usize, DriverError> {
        if params.is_empty() {
            return self.execute_source_line(statement);
        }
        self.tx
            .execute(statement, params_from_iter(params.iter().map(to_sqlite)))
            .map_err(DriverError::driver)
    }

    fn commit(self) -> std::result::Result<(), DriverError> {
        self.tx.commit().map_err(DriverError::driver)
    }

    fn rollback(self) -> std::result::Result<(), DriverError> {
        self.tx.rollback().map_err(DriverError::driver)
    }
}

pub(crate) fn to_sqlite(value: &SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(value) => Value::Integer(*value),
        SqlValue::Real(value) => Value::Real(*value),
        SqlValue::Text(value) => Value::Text(value.clone()),
        SqlValue::Blob(value) => Value::Blob(value.clone()),
    }
}

pub(crate) fn from_sqlite(value: Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Integer(value) => SqlValue::Integer(value),
        Value::Real(value) => SqlValue::Real(value),
        Value::Text(value) => SqlValue::Text(value),
        Value::Blob(value) => SqlValue::Blob(value),
    }
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists: i64 = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            [table_name],
            |row| row.get(0),
        )
        .with_context(|| format!("failed to inspect sqlite_master for {table_name}"))?;
    Ok(exists == 1)
}

fn parse_sequence(raw: i64) -> Result<Sequence> {
    u32::try_from(raw)
        .ok()
        .filter(|value| *value >= 1)
        .map(Sequence)
        .ok_or_else(|| anyhow!("log row has invalid sequence {raw}"))
}

fn parse_applied_at(raw: &str) -> Result<OffsetDateTime> {
    // `CURRENT_TIMESTAMP` text as SQLite stores it.
    let sqlite_format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    if let Ok(value) = PrimitiveDateTime::parse(raw, sqlite_format) {
        return Ok(value.assume_utc());
    }
    OffsetDateTime::parse(raw, &Rfc3339)
        .with_context(|| format!("log row has unparseable applied_at `{raw}`"))
}
