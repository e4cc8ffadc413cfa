use std::io::{BufReader, Read};

use serde::Serialize;
use tracing::{debug, error, info, info_span, warn};
use ulid::Ulid;

use crate::{
    DriverError, ExecTransaction, Executor, Interruption, LogTable, RunContext, Sequence,
    SourceReadError, SqlValue, StatementReader, StatementRecord,
};

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileErrorKind {
    SourceRead,
    LogTableUnavailable,
    Divergence,
    LogLookup,
    TransactionUnavailable,
    LogWrite,
    Apply,
    CompensationFailed,
    CommitAmbiguous,
    Cancelled,
}

impl ReconcileErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SourceRead => "source_read",
            Self::LogTableUnavailable => "log_table_unavailable",
            Self::Divergence => "divergence",
            Self::LogLookup => "log_lookup",
            Self::TransactionUnavailable => "transaction_unavailable",
            Self::LogWrite => "log_write",
            Self::Apply => "apply",
            Self::CompensationFailed => "compensation_failed",
            Self::CommitAmbiguous => "commit_ambiguous",
            Self::Cancelled => "cancelled",
        }
    }

    /// Kinds that a plain re-run cannot fix: the source or the log must be corrected first.
    #[must_use]
    pub fn requires_manual_intervention(self) -> bool {
        matches!(self, Self::Divergence | Self::CompensationFailed | Self::CommitAmbiguous)
    }

    #[must_use]
    pub fn is_retryable(self) -> bool {
        !self.requires_manual_intervention()
    }
}

/// Every way a reconciliation run can halt. All of them are fatal to the run.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    SourceRead(#[from] SourceReadError),
    #[error("unable to ensure log table {table}: {source}")]
    LogTableUnavailable {
        table: String,
        #[source]
        source: DriverError,
    },
    #[error(
        "log does not match source at sequence {sequence}: log has {stored:?}, source has {incoming:?}"
    )]
    Divergence { sequence: Sequence, stored: String, incoming: String },
    #[error("unable to read log entry for sequence {sequence}: {source}")]
    LogLookup {
        sequence: Sequence,
        #[source]
        source: DriverError,
    },
    #[error("unable to start transaction for sequence {sequence}: {source}")]
    TransactionUnavailable {
        sequence: Sequence,
        #[source]
        source: DriverError,
    },
    #[error("unable to record log entry for sequence {sequence}: {source}")]
    LogWrite {
        sequence: Sequence,
        #[source]
        source: DriverError,
    },
    #[error("statement {sequence} failed and its log entry was removed: {statement:?}: {source}")]
    Apply {
        sequence: Sequence,
        statement: String,
        #[source]
        source: DriverError,
    },
    #[error(
        "statement {sequence} failed ({source}) and its log entry could not be removed \
         ({compensation}); the log may record a statement that never applied: {statement:?}"
    )]
    CompensationFailed {
        sequence: Sequence,
        statement: String,
        #[source]
        source: DriverError,
        compensation: DriverError,
    },
    #[error(
        "unable to commit statement {sequence}; log state relative to the schema is unknown \
         and requires manual inspection: {statement:?}: {source}"
    )]
    CommitAmbiguous {
        sequence: Sequence,
        statement: String,
        #[source]
        source: DriverError,
    },
    #[error("run interrupted at sequence {sequence}: {source}")]
    Cancelled {
        sequence: Sequence,
        #[source]
        source: Interruption,
    },
}

impl ReconcileError {
    #[must_use]
    pub fn kind(&self) -> ReconcileErrorKind {
        match self {
            Self::SourceRead(_) => ReconcileErrorKind::SourceRead,
            Self::LogTableUnavailable { .. } => ReconcileErrorKind::LogTableUnavailable,
            Self::Divergence { .. } => ReconcileErrorKind::Divergence,
            Self::LogLookup { .. } => ReconcileErrorKind::LogLookup,
            Self::TransactionUnavailable { .. } => ReconcileErrorKind::TransactionUnavailable,
            Self::LogWrite { .. } => ReconcileErrorKind::LogWrite,
            Self::Apply { .. } => ReconcileErrorKind::Apply,
            Self::CompensationFailed { .. } => ReconcileErrorKind::CompensationFailed,
            Self::CommitAmbiguous { .. } => ReconcileErrorKind::CommitAmbiguous,
            Self::Cancelled { .. } => ReconcileErrorKind::Cancelled,
        }
    }

    #[must_use]
    pub fn sequence(&self) -> Option<Sequence> {
        match self {
            Self::SourceRead(_) | Self::LogTableUnavailable { .. } => None,
            Self::Divergence { sequence, .. }
            | Self::LogLookup { sequence, .. }
            | Self::TransactionUnavailable { sequence, .. }
            | Self::LogWrite { sequence, .. }
            | Self::Apply { sequence, .. }
            | Self::CompensationFailed { sequence, .. }
            | Self::CommitAmbiguous { sequence, .. }
            | Self::Cancelled { sequence, .. } => Some(*sequence),
        }
    }

    /// The statement text the run halted on, when one was being applied.
    #[must_use]
    pub fn statement(&self) -> Option<&str> {
        match self {
            Self::Divergence { incoming, .. } => Some(incoming),
            Self::Apply { statement, .. }
            | Self::CompensationFailed { statement, .. }
            | Self::CommitAmbiguous { statement, .. } => Some(statement),
            _ => None,
        }
    }

    /// The log's text for the divergent sequence.
    #[must_use]
    pub fn stored(&self) -> Option<&str> {
        match self {
            Self::Divergence { stored, .. } => Some(stored),
            _ => None,
        }
    }
}

/// Per-run counters. Created fresh for every run and never shared between runs; the first
/// error ends the run, so no failure flag outlives it.
#[derive(Debug, Default)]
pub(crate) struct RunState {
    statements_seen: u32,
    skipped: u32,
    applied: Vec<Sequence>,
}

impl RunState {
    fn admit(&mut self, record: &StatementRecord) -> Result<Sequence, ReconcileError> {
        let seen = self
            .statements_seen
            .checked_add(1)
            .ok_or(ReconcileError::SourceRead(SourceReadError::TooManyStatements))?;
        self.statements_seen = seen;
        let sequence = Sequence(seen);
        debug_assert_eq!(sequence, record.sequence, "reader and run state disagree on position");
        Ok(sequence)
    }

    fn into_report(self, run_id: Ulid) -> ReconcileReport {
        ReconcileReport {
            run_id,
            statements_seen: self.statements_seen,
            skipped: self.skipped,
            applied: self.applied,
        }
    }
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct ReconcileReport {
    pub run_id: Ulid,
    pub statements_seen: u32,
    pub skipped: u32,
    pub applied: Vec<Sequence>,
}

#[derive(Debug, Clone, Default, Serialize, Eq, PartialEq)]
pub struct ReconcilePlan {
    pub already_applied: u32,
    pub pending: Vec<StatementRecord>,
}

impl ReconcilePlan {
    #[must_use]
    pub fn up_to_date(&self) -> bool {
        self.pending.is_empty()
    }
}

enum Classification {
    Applied,
    Pending,
}

/// Applies a statement source against the migration log, one statement at a time.
#[derive(Debug, Clone, Default)]
pub struct Reconciler {
    table: LogTable,
}

impl Reconciler {
    #[must_use]
    pub fn new(table: LogTable) -> Self {
        Self { table }
    }

    #[must_use]
    pub fn table(&self) -> &LogTable {
        &self.table
    }

    /// Create the log table if it is missing, in its own committed transaction.
    ///
    /// # Errors
    /// Returns [`ReconcileError::LogTableUnavailable`] when the table cannot be created.
    pub fn ensure_log_table<E: Executor>(
        &self,
        executor: &mut E,
        ctx: &RunContext,
    ) -> Result<(), ReconcileError> {
        let unavailable = |source| ReconcileError::LogTableUnavailable {
            table: self.table.name().to_string(),
            source,
        };

        let mut tx = executor.begin_transaction(ctx).map_err(unavailable)?;
        if let Err(source) = tx.execute(self.table.create_sql(), &[]) {
            discard(tx);
            return Err(unavailable(source));
        }
        tx.commit().map_err(unavailable)
    }

    /// Apply every statement of `source` not yet in the log, halting at the first failure.
    ///
    /// On success every statement of the source is recorded in the log with identical text.
    ///
    /// # Errors
    /// Returns the [`ReconcileError`] that halted the run; statements after it are not read.
    pub fn reconcile<E: Executor, R: Read>(
        &self,
        executor: &mut E,
        ctx: &RunContext,
        source: R,
    ) -> Result<ReconcileReport, ReconcileError> {
        let run_id = Ulid::new();
        let span = info_span!("reconcile", %run_id, table = %self.table.name());
        let _entered = span.enter();

        self.ensure_log_table(executor, ctx)?;

        let mut state = RunState::default();
        for record in StatementReader::new(BufReader::new(source)) {
            let outcome = record
                .map_err(ReconcileError::from)
                .and_then(|record| self.step(executor, ctx, &mut state, &record));
            if let Err(err) = outcome {
                error!(
                    kind = err.kind().as_str(),
                    sequence = err.sequence().map(Sequence::get),
                    statements = state.statements_seen,
                    applied = state.applied.len(),
                    error = %err,
                    "reconciliation halted"
                );
                return Err(err);
            }
        }

        info!(
            statements = state.statements_seen,
            applied = state.applied.len(),
            skipped = state.skipped,
            "reconciliation complete"
        );
        Ok(state.into_report(run_id))
    }

    /// Classify every statement of `source` the way [`Self::reconcile`] would, without
    /// applying anything. Only the log table itself may be created.
    ///
    /// # Errors
    /// Returns the same read, lookup and divergence errors `reconcile` would hit first.
    pub fn plan<E: Executor, R: Read>(
        &self,
        executor: &mut E,
        ctx: &RunContext,
        source: R,
    ) -> Result<ReconcilePlan, ReconcileError> {
        let span = info_span!("plan", table = %self.table.name());
        let _entered = span.enter();

        self.ensure_log_table(executor, ctx)?;

        let mut state = RunState::default();
        let mut plan = ReconcilePlan::default();
        for record in StatementReader::new(BufReader::new(source)) {
            let record = record?;
            let sequence = state.admit(&record)?;
            match self.classify(executor, ctx, sequence, &record)? {
                Classification::Applied => plan.already_applied += 1,
                Classification::Pending => plan.pending.push(record),
            }
        }

        debug!(
            already_applied = plan.already_applied,
            pending = plan.pending.len(),
            "plan complete"
        );
        Ok(plan)
    }

    fn step<E: Executor>(
        &self,
        executor: &mut E,
        ctx: &RunContext,
        state: &mut RunState,
        record: &StatementRecord,
    ) -> Result<(), ReconcileError> {
        let sequence = state.admit(record)?;
        match self.classify(executor, ctx, sequence, record)? {
            Classification::Applied => {
                debug!(%sequence, "statement already applied");
                state.skipped += 1;
            }
            Classification::Pending => {
                self.apply(executor, ctx, sequence, &record.text)?;
                state.applied.push(sequence);
            }
        }
        Ok(())
    }

    fn classify<E: Executor>(
        &self,
        executor: &mut E,
        ctx: &RunContext,
        sequence: Sequence,
        record: &StatementRecord,
    ) -> Result<Classification, ReconcileError> {
        match self.lookup(executor, ctx, sequence)? {
            None => Ok(Classification::Pending),
            Some(stored) if stored == record.text => Ok(Classification::Applied),
            Some(stored) => {
                Err(ReconcileError::Divergence { sequence, stored, incoming: record.text.clone() })
            }
        }
    }

    fn lookup<E: Executor>(
        &self,
        executor: &mut E,
        ctx: &RunContext,
        sequence: Sequence,
    ) -> Result<Option<String>, ReconcileError> {
        ctx.check().map_err(|source| ReconcileError::Cancelled { sequence, source })?;

        let value = executor
            .query_scalar(ctx, self.table.lookup_sql(), &[SqlValue::from(sequence)])
            .map_err(|source| match source.interruption() {
                Some(interruption) => ReconcileError::Cancelled { sequence, source: interruption },
                None => ReconcileError::LogLookup { sequence, source },
            })?;

        match value {
            None => Ok(None),
            Some(SqlValue::Text(text)) => Ok(Some(text)),
            Some(other) => Err(ReconcileError::LogLookup {
                sequence,
                source: DriverError::message(format!(
                    "log entry holds a {} value instead of statement text",
                    other.type_name()
                )),
            }),
        }
    }

    fn apply<E: Executor>(
        &self,
        executor: &mut E,
        ctx: &RunContext,
        sequence: Sequence,
        statement: &str,
    ) -> Result<(), ReconcileError> {
        ctx.check().map_err(|source| ReconcileError::Cancelled { sequence, source })?;

        let mut tx = executor.begin_transaction(ctx).map_err(|source| match source.interruption() {
            Some(interruption) => ReconcileError::Cancelled { sequence, source: interruption },
            None => ReconcileError::TransactionUnavailable { sequence, source },
        })?;

        let key = [SqlValue::from(sequence)];
        let row = [SqlValue::from(sequence), SqlValue::from(statement)];
        if let Err(source) = tx.execute(self.table.insert_sql(), &row) {
            discard(tx);
            return Err(ReconcileError::LogWrite { sequence, source });
        }

        // From here on the log row may already be durable through an implicit commit.
        let executed =
            ctx.check().map_err(DriverError::from).and_then(|()| tx.execute(statement, &[]));
        if let Err(source) = executed {
            warn!(%sequence, error = %source, "statement failed; removing its log entry");
            let in_place = match tx.execute(self.table.delete_sql(), &key) {
                Ok(_) => tx.commit(),
                Err(err) => {
                    discard(tx);
                    Err(err)
                }
            };
            let compensated = in_place.or_else(|first| {
                debug!(%sequence, error = %first, "retrying log entry removal in a new transaction");
                self.delete_entry(executor, &ctx.detached(), &key)
            });

            let statement = statement.to_string();
            return Err(match compensated {
                Ok(()) => ReconcileError::Apply { sequence, statement, source },
                Err(compensation) => {
                    ReconcileError::CompensationFailed { sequence, statement, source, compensation }
                }
            });
        }

        if let Err(interruption) = ctx.check() {
            discard(tx);
            return Err(ReconcileError::CommitAmbiguous {
                sequence,
                statement: statement.to_string(),
                source: interruption.into(),
            });
        }

        tx.commit().map_err(|source| ReconcileError::CommitAmbiguous {
            sequence,
            statement: statement.to_string(),
            source,
        })?;

        info!(%sequence, "statement applied");
        Ok(())
    }

    fn delete_entry<E: Executor>(
        &self,
        executor: &mut E,
        ctx: &RunContext,
        key: &[SqlValue],
    ) -> Result<(), DriverError> {
        let mut tx = executor.begin_transaction(ctx)?;
        if let Err(err) = tx.execute(self.table.delete_sql(), key) {
            discard(tx);
            return Err(err);
        }
        tx.commit()
    }
}

fn discard<T: ExecTransaction>(tx: T) {
    if let Err(err) = tx.rollback() {
        debug!(error = %err, "rollback failed");
    }
}
