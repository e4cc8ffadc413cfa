use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Why a run stopped waiting on the database.
#[derive(Debug, Clone, Copy, thiserror::Error, Eq, PartialEq)]
pub enum Interruption {
    #[error("run cancelled")]
    Cancelled,
    #[error("run deadline exceeded")]
    DeadlineExceeded,
}

/// Caller-supplied cancellation and deadline, checked at every database round trip.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    deadline: Option<Instant>,
    cancelled: Arc<AtomicBool>,
}

/// Cancels the [`RunContext`] it was taken from, from any thread.
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl RunContext {
    /// A context that is never cancelled and has no deadline.
    #[must_use]
    pub fn background() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_deadline(deadline: Instant) -> Self {
        Self { deadline: Some(deadline), cancelled: Arc::default() }
    }

    /// Deadline `timeout` from now. Overflowing timeouts mean "no deadline".
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => Self::with_deadline(deadline),
            None => Self::background(),
        }
    }

    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(Arc::clone(&self.cancelled))
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Context for compensating writes that must run even after this one is interrupted.
    #[must_use]
    pub fn detached(&self) -> Self {
        Self::background()
    }

    /// # Errors
    /// Returns the [`Interruption`] when the context was cancelled or its deadline passed.
    pub fn check(&self) -> Result<(), Interruption> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(Interruption::Cancelled);
        }
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(Interruption::DeadlineExceeded);
        }
        Ok(())
    }
}
