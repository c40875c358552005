//! Cancellation and deadline propagation for store and dispatcher calls

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// A cloneable cancellation handle with an optional deadline
///
/// Clones share the cancellation flag, so cancelling any clone cancels all
/// of them. Derived contexts (`with_timeout`) share the flag too but may
/// carry an earlier deadline.
#[derive(Debug, Clone, Default)]
pub struct Context {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

/// Why a context is done
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Done {
    Cancelled,
    DeadlineExceeded,
}

impl Context {
    /// A context that is never done unless cancelled
    pub fn background() -> Self {
        Self::default()
    }

    /// Derive a context that expires after `timeout`
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a context that expires at `deadline` (or earlier, if the parent does)
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(parent) if parent < deadline => parent,
            _ => deadline,
        };
        Self {
            cancelled: Arc::clone(&self.cancelled),
            deadline: Some(deadline),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, `None` when there is no deadline
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_done(&self) -> bool {
        self.check().is_err()
    }

    /// `Err` once the context is cancelled or past its deadline
    pub fn check(&self) -> Result<(), Done> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(Done::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(Done::DeadlineExceeded),
            _ => Ok(()),
        }
    }
}
