//! Ordered update delivery with per-update acknowledgment
//!
//! Producers push [`UpdateKind`]s into a pending FIFO. A flush thread wakes
//! on a fixed interval, moves pending updates one at a time onto a bounded
//! delivery channel read by the engine, and waits for each acknowledgment
//! before delivering the next. A full delivery channel blocks the flush (and
//! through the pending cap, producers); `close` always unblocks it.

use std::collections::VecDeque;
use std::sync::mpsc::{
    self, Receiver, RecvTimeoutError, Sender, SyncSender, TryRecvError, TrySendError,
};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use super::ack::{self, AckOutcome};
use super::{Update, UpdateKind};
use crate::context::Context;
use crate::error::DispatchError;

/// Sleep between attempts to push onto a full delivery channel
const SEND_POLL: Duration = Duration::from_millis(10);
/// How often a blocked wait re-checks whether the dispatcher was closed
const CLOSE_POLL: Duration = Duration::from_millis(50);

/// What to do when the engine reports it could not apply an update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailPolicy {
    /// Stop serving the session: no further deliveries, producers get
    /// `SessionAborted`
    #[default]
    FailClosed,
    /// Log the failure and discard the update
    FailOpen,
}

/// What `enqueue` does once the pending queue holds `pending_limit` updates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Wait for the flush loop to make room
    #[default]
    Block,
    /// Fail with `QueueFull`; the next resync repairs the engine cache
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    pub flush_interval: Duration,
    /// Bound of the engine-facing delivery channel
    pub delivery_capacity: usize,
    /// Bound of the pending queue; unbounded when `None`
    pub pending_limit: Option<usize>,
    pub overflow_policy: OverflowPolicy,
    pub fail_policy: FailPolicy,
    /// Give up on an acknowledgment after this long; wait forever when `None`
    pub ack_timeout: Option<Duration>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(1),
            delivery_capacity: 100,
            pending_limit: None,
            overflow_policy: OverflowPolicy::Block,
            fail_policy: FailPolicy::FailClosed,
            ack_timeout: None,
        }
    }
}

/// The engine's end of the delivery channel
///
/// Clones share one receiver. Every call returns `None`/`Disconnected` once
/// the dispatcher is closed or the session aborted.
#[derive(Debug, Clone)]
pub struct UpdateStream {
    rx: Arc<Mutex<Receiver<Update>>>,
}

impl UpdateStream {
    fn lock(&self) -> MutexGuard<'_, Receiver<Update>> {
        self.rx.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until the next update arrives
    pub fn recv(&self) -> Option<Update> {
        self.lock().recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Update, RecvTimeoutError> {
        self.lock().recv_timeout(timeout)
    }

    pub fn try_recv(&self) -> Result<Update, TryRecvError> {
        self.lock().try_recv()
    }
}

impl Iterator for UpdateStream {
    type Item = Update;

    fn next(&mut self) -> Option<Update> {
        self.recv()
    }
}

struct Shared {
    label: String,
    config: DispatcherConfig,
    /// Cancelled by `close`
    lifetime: Context,
    pending: Mutex<VecDeque<UpdateKind>>,
    space: Condvar,
    /// Held for a whole drain so deliveries never interleave
    delivery: Mutex<Option<SyncSender<Update>>>,
    aborted: Mutex<Option<String>>,
}

/// Per-connector update queue and flush loop
pub struct Dispatcher {
    shared: Arc<Shared>,
    stream: UpdateStream,
    stop: Mutex<Option<Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Create the queues and spawn the flush thread
    ///
    /// `label` identifies the session in log lines (usually the user email).
    pub fn start(label: impl Into<String>, config: DispatcherConfig) -> Self {
        let (tx, rx) = mpsc::sync_channel(config.delivery_capacity.max(1));
        let (stop_tx, stop_rx) = mpsc::channel();

        let shared = Arc::new(Shared {
            label: label.into(),
            config,
            lifetime: Context::background(),
            pending: Mutex::new(VecDeque::new()),
            space: Condvar::new(),
            delivery: Mutex::new(Some(tx)),
            aborted: Mutex::new(None),
        });

        let worker = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || run(shared, stop_rx))
        };

        Self {
            shared,
            stream: UpdateStream {
                rx: Arc::new(Mutex::new(rx)),
            },
            stop: Mutex::new(Some(stop_tx)),
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.shared.config
    }

    /// The engine-facing update source
    pub fn updates(&self) -> UpdateStream {
        self.stream.clone()
    }

    /// Queue an update for the next flush cycle
    pub fn enqueue(&self, kind: UpdateKind) -> Result<(), DispatchError> {
        let shared = &self.shared;
        let mut pending = shared.lock_pending();

        loop {
            shared.status()?;
            match shared.config.pending_limit {
                Some(limit) if pending.len() >= limit => match shared.config.overflow_policy {
                    OverflowPolicy::Reject => {
                        warn!(
                            "Pending update queue for {} is full, rejecting {}",
                            shared.label, kind
                        );
                        return Err(DispatchError::QueueFull { limit });
                    }
                    OverflowPolicy::Block => {
                        pending = shared
                            .space
                            .wait_timeout(pending, CLOSE_POLL)
                            .unwrap_or_else(PoisonError::into_inner)
                            .0;
                    }
                },
                _ => break,
            }
        }

        debug!("Queued {} for {}", kind, shared.label);
        pending.push_back(kind);
        Ok(())
    }

    /// Deliver everything pending now, waiting for each acknowledgment
    ///
    /// Returns the number of updates delivered. If `ctx` ends first the
    /// remaining updates stay queued.
    pub fn flush(&self, ctx: &Context) -> Result<usize, DispatchError> {
        let shared = &self.shared;
        shared.with_delivery(|tx| shared.drain(tx, ctx))
    }

    /// Flush pending updates, then deliver `kind` and wait for its acknowledgment
    ///
    /// Used where later updates depend on the engine having applied this
    /// one. Under fail-open a rejection is returned as `Rejected` so the
    /// caller can skip dependent work.
    pub fn deliver_and_wait(&self, kind: UpdateKind, ctx: &Context) -> Result<(), DispatchError> {
        let shared = &self.shared;
        shared.with_delivery(|tx| {
            shared.drain(tx, ctx)?;
            shared.deliver_one(tx, kind, ctx)
        })
    }

    pub fn pending_len(&self) -> usize {
        self.shared.lock_pending().len()
    }

    pub fn is_aborted(&self) -> bool {
        self.abort_reason().is_some()
    }

    /// Why the session was aborted, if it was
    pub fn abort_reason(&self) -> Option<String> {
        self.shared.lock_aborted().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lifetime.is_done()
    }

    /// Stop the flush loop and close the update stream
    ///
    /// Pending updates are dropped. Idempotent.
    pub fn close(&self) {
        let shared = &self.shared;
        shared.lifetime.cancel();
        shared.space.notify_all();

        drop(
            self.stop
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = worker {
            if handle.join().is_err() {
                error!("Update flush loop for {} panicked", shared.label);
            }
        }

        shared.lock_delivery().take();

        let dropped = {
            let mut pending = shared.lock_pending();
            let n = pending.len();
            pending.clear();
            n
        };
        if dropped > 0 {
            info!(
                "Dropped {} undelivered updates while closing {}",
                dropped, shared.label
            );
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.close();
    }
}

impl Shared {
    fn lock_pending(&self) -> MutexGuard<'_, VecDeque<UpdateKind>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_delivery(&self) -> MutexGuard<'_, Option<SyncSender<Update>>> {
        self.delivery.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_aborted(&self) -> MutexGuard<'_, Option<String>> {
        self.aborted.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn status(&self) -> Result<(), DispatchError> {
        if let Some(reason) = self.lock_aborted().as_ref() {
            return Err(DispatchError::SessionAborted {
                reason: reason.clone(),
            });
        }
        if self.lifetime.is_done() {
            return Err(DispatchError::Closed);
        }
        Ok(())
    }

    /// Run `f` with exclusive use of the delivery channel
    ///
    /// Once the session is aborted or the engine hung up, the channel is
    /// dropped so the engine's stream ends.
    fn with_delivery<T>(
        &self,
        f: impl FnOnce(&SyncSender<Update>) -> Result<T, DispatchError>,
    ) -> Result<T, DispatchError> {
        let mut delivery = self.lock_delivery();
        self.status()?;
        let Some(tx) = delivery.as_ref() else {
            return Err(DispatchError::Closed);
        };

        let result = f(tx);
        if matches!(
            result,
            Err(DispatchError::SessionAborted { .. }) | Err(DispatchError::Closed)
        ) {
            delivery.take();
        }
        result
    }

    fn pop_pending(&self) -> Option<UpdateKind> {
        let kind = self.lock_pending().pop_front();
        if kind.is_some() {
            self.space.notify_all();
        }
        kind
    }

    fn drain(&self, tx: &SyncSender<Update>, ctx: &Context) -> Result<usize, DispatchError> {
        let mut delivered = 0;
        loop {
            if ctx.is_done() {
                return Err(DispatchError::Cancelled);
            }
            let Some(kind) = self.pop_pending() else {
                return Ok(delivered);
            };
            match self.deliver_one(tx, kind, ctx) {
                Ok(()) | Err(DispatchError::Rejected { .. }) => delivered += 1,
                Err(e) => return Err(e),
            }
        }
    }

    fn deliver_one(
        &self,
        tx: &SyncSender<Update>,
        kind: UpdateKind,
        ctx: &Context,
    ) -> Result<(), DispatchError> {
        let description = kind.to_string();
        let (ack_tx, waiter) = ack::channel();

        if let Err((err, update)) = self.send(tx, Update::new(kind, ack_tx), ctx) {
            if matches!(err, DispatchError::Cancelled) {
                // Not delivered, so it goes back to the head of the queue
                self.lock_pending().push_front(update.kind);
            }
            return Err(err);
        }

        let wait_ctx = match self.config.ack_timeout {
            Some(timeout) => ctx.with_timeout(timeout),
            None => ctx.clone(),
        };

        let outcome = loop {
            match waiter.wait(&wait_ctx.with_timeout(CLOSE_POLL)) {
                AckOutcome::Cancelled => {
                    if self.lifetime.is_done() {
                        return Err(DispatchError::Closed);
                    }
                    if wait_ctx.is_done() {
                        warn!(
                            "Gave up waiting for the engine to acknowledge {} for {}",
                            description, self.label
                        );
                        return Err(DispatchError::Cancelled);
                    }
                }
                outcome => break outcome,
            }
        };

        match outcome {
            AckOutcome::Applied => {
                debug!("Engine applied {} for {}", description, self.label);
                Ok(())
            }
            AckOutcome::Dropped => {
                warn!(
                    "Engine dropped {} for {} without acknowledging it",
                    description, self.label
                );
                Ok(())
            }
            AckOutcome::Failed(reason) => self.on_failure(description, reason),
            AckOutcome::Cancelled => Err(DispatchError::Cancelled),
        }
    }

    fn send(
        &self,
        tx: &SyncSender<Update>,
        mut update: Update,
        ctx: &Context,
    ) -> Result<(), (DispatchError, Update)> {
        let mut logged = false;
        loop {
            match tx.try_send(update) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Disconnected(returned)) => {
                    return Err((DispatchError::Closed, returned));
                }
                Err(TrySendError::Full(returned)) => {
                    if self.lifetime.is_done() {
                        return Err((DispatchError::Closed, returned));
                    }
                    if ctx.is_done() {
                        return Err((DispatchError::Cancelled, returned));
                    }
                    if !logged {
                        debug!("Delivery queue for {} is full, waiting", self.label);
                        logged = true;
                    }
                    update = returned;
                    thread::sleep(SEND_POLL);
                }
            }
        }
    }

    fn on_failure(&self, update: String, reason: String) -> Result<(), DispatchError> {
        match self.config.fail_policy {
            FailPolicy::FailOpen => {
                error!(
                    "Engine failed to apply {} for {}: {}; discarding",
                    update, self.label, reason
                );
                Err(DispatchError::Rejected { update, reason })
            }
            FailPolicy::FailClosed => {
                error!(
                    "Engine failed to apply {} for {}: {}; aborting session",
                    update, self.label, reason
                );
                let reason = format!("{}: {}", update, reason);
                self.abort(reason.clone());
                Err(DispatchError::SessionAborted { reason })
            }
        }
    }

    fn abort(&self, reason: String) {
        *self.lock_aborted() = Some(reason);
        let dropped = {
            let mut pending = self.lock_pending();
            let n = pending.len();
            pending.clear();
            n
        };
        self.space.notify_all();
        if dropped > 0 {
            warn!(
                "Discarded {} pending updates for aborted session {}",
                dropped, self.label
            );
        }
    }
}

fn run(shared: Arc<Shared>, stop: Receiver<()>) {
    debug!("Update flush loop started for {}", shared.label);

    loop {
        match stop.recv_timeout(shared.config.flush_interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }

        let lifetime = shared.lifetime.clone();
        match shared.with_delivery(|tx| shared.drain(tx, &lifetime)) {
            Ok(0) => {}
            Ok(n) => debug!("Flushed {} updates for {}", n, shared.label),
            // Ack timeout or close; whatever is left stays queued
            Err(DispatchError::Cancelled) => {}
            Err(DispatchError::Closed) => break,
            Err(DispatchError::SessionAborted { reason }) => {
                warn!(
                    "Stopping update delivery for {}: {}",
                    shared.label, reason
                );
                break;
            }
            Err(e) => warn!("Update flush for {} failed: {}", shared.label, e),
        }
    }

    debug!("Update flush loop stopped for {}", shared.label);
}
