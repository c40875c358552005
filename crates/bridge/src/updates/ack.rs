//! One-shot acknowledgment handles attached to delivered updates

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::time::Duration;

use crate::context::Context;

/// Upper bound on a single blocking wait, so cancellation is noticed promptly
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How a delivered update ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    /// The engine applied the update
    Applied,
    /// The engine reported an application error
    Failed(String),
    /// The update was dropped without an acknowledgment
    Dropped,
    /// The waiter gave up (context cancelled or deadline passed)
    Cancelled,
}

/// Engine side of the handle. Consumed by the first acknowledgment.
#[derive(Debug)]
pub struct AckSender(SyncSender<Result<(), String>>);

/// Dispatcher side of the handle
#[derive(Debug)]
pub struct AckWaiter(Receiver<Result<(), String>>);

pub(crate) fn channel() -> (AckSender, AckWaiter) {
    let (tx, rx) = mpsc::sync_channel(1);
    (AckSender(tx), AckWaiter(rx))
}

impl AckSender {
    pub fn send(self, result: Result<(), String>) {
        // The waiter may have given up already
        let _ = self.0.send(result);
    }
}

impl AckWaiter {
    /// Block until the update is acknowledged, dropped, or `ctx` is done
    pub fn wait(&self, ctx: &Context) -> AckOutcome {
        loop {
            if ctx.is_done() {
                return AckOutcome::Cancelled;
            }
            let slice = ctx
                .remaining()
                .map_or(POLL_INTERVAL, |left| left.min(POLL_INTERVAL));

            match self.0.recv_timeout(slice) {
                Ok(Ok(())) => return AckOutcome::Applied,
                Ok(Err(reason)) => return AckOutcome::Failed(reason),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return AckOutcome::Dropped,
            }
        }
    }
}
