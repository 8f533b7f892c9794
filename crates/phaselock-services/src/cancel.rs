//! Cancellation shared by every loop of a coordinator

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};
use thiserror::Error;

/// A wait was interrupted because its token fired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("wait cancelled")]
pub struct Cancelled;

struct Inner {
    cancelled: AtomicBool,
    // Dropping the senders wakes every blocked receiver at once.
    blocking_tx: Mutex<Option<Sender<()>>>,
    blocking_rx: Receiver<()>,
    async_tx: Mutex<Option<oneshot::Sender<()>>>,
    async_rx: Shared<oneshot::Receiver<()>>,
}

/// Cloneable stop signal.
///
/// Firing it interrupts blocked threads (`sleep_blocking`) and pending futures
/// (`cancelled`) immediately.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        let (blocking_tx, blocking_rx) = bounded(0);
        let (async_tx, async_rx) = oneshot::channel();
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                blocking_tx: Mutex::new(Some(blocking_tx)),
                blocking_rx,
                async_tx: Mutex::new(Some(async_tx)),
                async_rx: async_rx.shared(),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        drop(
            self.inner
                .blocking_tx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        drop(
            self.inner
                .async_tx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Block the current thread for `duration` or until cancelled
    pub fn sleep_blocking(&self, duration: Duration) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            return Err(Cancelled);
        }
        match self.inner.blocking_rx.recv_timeout(duration) {
            Err(RecvTimeoutError::Timeout) if !self.is_cancelled() => Ok(()),
            _ => Err(Cancelled),
        }
    }

    /// Resolves once the token fires
    pub fn cancelled(&self) -> impl Future<Output = ()> + Send + Unpin + 'static {
        self.inner.async_rx.clone().map(|_| ())
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
