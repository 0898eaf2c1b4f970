//! Shared cancellation context.
//!
//! A `Cancellation` is created once per process and cloned into every layer
//! that performs I/O or waits. Tripping it (usually from the interrupt
//! handler) makes every pending and future check fail with `Cancelled`.
//!
//! Waiters block on a crossbeam channel whose only sender is dropped on
//! cancel, so a sleeping rate limiter or login prompt wakes immediately
//! instead of polling the flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use thiserror::Error;

/// Returned by [`Cancellation::check`] once the context fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

struct Inner {
    fired: AtomicBool,
    trigger: Mutex<Option<Sender<()>>>,
    signal: Receiver<()>,
}

/// Clonable, process-wide cancellation context.
#[derive(Clone)]
pub struct Cancellation {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Cancellation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cancellation")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

impl Cancellation {
    /// Creates a context that has not fired.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = bounded::<()>(0);
        Self {
            inner: Arc::new(Inner {
                fired: AtomicBool::new(false),
                trigger: Mutex::new(Some(tx)),
                signal: rx,
            }),
        }
    }

    /// Fires the context. Idempotent.
    pub fn cancel(&self) {
        self.inner.fired.store(true, Ordering::SeqCst);
        // Dropping the sender disconnects every receiver clone at once.
        let sender = match self.inner.trigger.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(sender);
    }

    /// Returns true once [`cancel`](Self::cancel) has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.fired.load(Ordering::SeqCst)
    }

    /// Fails with [`Cancelled`] if the context fired.
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleeps for `timeout` unless cancelled first.
    ///
    /// Returns `Err(Cancelled)` as soon as the context fires.
    pub fn sleep(&self, timeout: Duration) -> Result<(), Cancelled> {
        self.check()?;
        match self.inner.signal.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => self.check(),
            // Nothing is ever sent; a wake-up always means disconnect.
            Ok(()) | Err(RecvTimeoutError::Disconnected) => Err(Cancelled),
        }
    }

    /// Blocks until the context fires.
    pub fn wait(&self) {
        if self.is_cancelled() {
            return;
        }
        let _ = self.inner.signal.recv();
    }

    /// Receiver that becomes ready (disconnected) when the context fires.
    ///
    /// Intended for `crossbeam_channel::select!` alongside other channels.
    #[must_use]
    pub fn receiver(&self) -> Receiver<()> {
        self.inner.signal.clone()
    }
}
