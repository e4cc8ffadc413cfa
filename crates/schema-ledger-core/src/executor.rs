use std::error::Error as StdError;

use crate::{Interruption, RunContext, SqlValue};

/// Failure reported by an [`Executor`] or one of its transactions.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error(transparent)]
    Interrupted(#[from] Interruption),
    #[error(transparent)]
    Driver(Box<dyn StdError + Send + Sync + 'static>),
    #[error("{0}")]
    Message(String),
}

impl DriverError {
    pub fn driver<E>(source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Driver(Box::new(source))
    }

    pub fn message(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    #[must_use]
    pub fn interruption(&self) -> Option<Interruption> {
        match self {
            Self::Interrupted(interruption) => Some(*interruption),
            Self::Driver(_) | Self::Message(_) => None,
        }
    }
}

/// The database the reconciler talks to.
///
/// Implementations must honor `ctx` before each round trip they perform.
pub trait Executor {
    type Transaction<'a>: ExecTransaction
    where
        Self: 'a;

    /// # Errors
    /// Returns [`DriverError`] when the transaction cannot be started or `ctx` is interrupted.
    fn begin_transaction(&mut self, ctx: &RunContext) -> Result<Self::Transaction<'_>, DriverError>;

    /// Run `query` and return the first column of the first row, or `None` when no row matched.
    ///
    /// # Errors
    /// Returns [`DriverError`] for any failure other than an empty result.
    fn query_scalar(
        &mut self,
        ctx: &RunContext,
        query: &str,
        params: &[SqlValue],
    ) -> Result<Option<SqlValue>, DriverError>;
}

/// A transaction opened by [`Executor::begin_transaction`].
pub trait ExecTransaction {
    /// Execute one statement and return the number of rows it changed.
    ///
    /// # Errors
    /// Returns [`DriverError`] when the statement fails.
    fn execute(&mut self, statement: &str, params: &[SqlValue]) -> Result<usize, DriverError>;

    /// # Errors
    /// Returns [`DriverError`] when the commit fails.
    fn commit(self) -> Result<(), DriverError>;

    /// # Errors
    /// Returns [`DriverError`] when the rollback fails.
    fn rollback(self) -> Result<(), DriverError>;
}
