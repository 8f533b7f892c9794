//! Wait-until-beat scheduling on top of a shared tempo clock

use std::future::{self, Future};
use std::pin::{pin, Pin};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::thread;
use std::time::Duration;

use futures::future::{select, Either};
use futures::task::{noop_waker_ref, AtomicWaker};
use phaselock_core::{ManualTime, TempoClock, TimeSource};
use thiserror::Error;

use crate::cancel::{CancellationToken, Cancelled};

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum WaitError {
    #[error("wait cancelled")]
    Cancelled(#[from] Cancelled),
    #[error("invalid wait target: {0}")]
    InvalidTarget(f64),
}

/// How a scheduler suspends the calling routine.
///
/// This is the only place a loop is allowed to block or yield.
pub trait Suspend: Send + Sync {
    fn suspend(
        &self,
        duration: Duration,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<(), Cancelled>> + Send;
}

/// Parks the calling thread; the returned future is already complete.
///
/// Meant for one-thread-per-loop execution under `block_on`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockingSleep;

impl Suspend for BlockingSleep {
    fn suspend(
        &self,
        duration: Duration,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<(), Cancelled>> + Send {
        future::ready(cancel.sleep_blocking(duration))
    }
}

/// Yields to the executor so many loops can share one thread
#[derive(Debug, Clone, Copy, Default)]
pub struct CooperativeSleep;

impl Suspend for CooperativeSleep {
    fn suspend(
        &self,
        duration: Duration,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<(), Cancelled>> + Send {
        let cancel = cancel.clone();
        async move {
            if cancel.is_cancelled() {
                return Err(Cancelled);
            }
            let sleep = async_std::task::sleep(duration);
            futures::pin_mut!(sleep);
            match select(sleep, cancel.cancelled()).await {
                Either::Left(_) if !cancel.is_cancelled() => Ok(()),
                _ => Err(Cancelled),
            }
        }
    }
}

/// Suspensions that hand control back to the executor, so several loops can
/// share one thread. [`BlockingSleep`] parks the whole thread and is not one.
pub trait Cooperative: Suspend {}

impl Cooperative for CooperativeSleep {}
impl Cooperative for VirtualSleep {}

struct Parked {
    wake_at: f64,
    waker: Arc<AtomicWaker>,
    cancel: CancellationToken,
}

/// Virtual-time suspension driven by [`VirtualSleep::block_on`].
///
/// Every wait parks until the driver finds nothing else can make progress,
/// then time jumps to the earliest parked wake. Loops sharing one driver
/// therefore interleave exactly as they would in real time.
///
/// `jitter` is added to every suspension to model scheduler latency. With a
/// horizon set, a wake that would carry time past it fires the waiting
/// tokens instead, which ends an offline run deterministically.
#[derive(Clone)]
pub struct VirtualSleep {
    time: Arc<ManualTime>,
    parked: Arc<Mutex<Vec<Parked>>>,
    jitter: Duration,
    horizon: Option<f64>,
}

impl VirtualSleep {
    pub fn new(time: Arc<ManualTime>) -> Self {
        Self {
            time,
            parked: Arc::new(Mutex::new(Vec::new())),
            jitter: Duration::ZERO,
            horizon: None,
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_horizon(mut self, horizon_secs: f64) -> Self {
        self.horizon = Some(horizon_secs);
        self
    }

    /// Poll `future` to completion, advancing virtual time whenever every
    /// wait inside it is parked
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        let mut future = pin!(future);
        let mut cx = Context::from_waker(noop_waker_ref());
        loop {
            if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                return output;
            }
            if !self.advance() {
                // Pending on something other than virtual time
                thread::yield_now();
            }
        }
    }

    /// Wake the earliest parked waits; false if nothing is parked
    fn advance(&self) -> bool {
        let mut parked = self.parked.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(next) = parked.iter().map(|p| p.wake_at).min_by(f64::total_cmp) else {
            return false;
        };

        match self.horizon {
            Some(horizon) if next > horizon => {
                for p in parked.drain(..) {
                    p.cancel.cancel();
                    p.waker.wake();
                }
            }
            _ => {
                if next > self.time.now() {
                    self.time.set(next);
                }
                let now = self.time.now();
                parked.retain(|p| {
                    if p.wake_at <= now {
                        p.waker.wake();
                        false
                    } else {
                        true
                    }
                });
            }
        }
        true
    }
}

impl std::fmt::Debug for VirtualSleep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualSleep")
            .field("now", &self.time.now())
            .field("jitter", &self.jitter)
            .field("horizon", &self.horizon)
            .finish()
    }
}

/// One parked virtual wait
struct VirtualWait {
    time: Arc<ManualTime>,
    parked: Arc<Mutex<Vec<Parked>>>,
    wake_at: f64,
    waker: Arc<AtomicWaker>,
    registered: bool,
    cancel: CancellationToken,
}

impl Future for VirtualWait {
    type Output = Result<(), Cancelled>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.cancel.is_cancelled() {
            return Poll::Ready(Err(Cancelled));
        }
        if self.time.now() >= self.wake_at {
            return Poll::Ready(Ok(()));
        }
        self.waker.register(cx.waker());
        if !self.registered {
            self.registered = true;
            self.parked
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(Parked {
                    wake_at: self.wake_at,
                    waker: self.waker.clone(),
                    cancel: self.cancel.clone(),
                });
        }
        Poll::Pending
    }
}

impl Drop for VirtualWait {
    fn drop(&mut self) {
        if self.registered {
            self.parked
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|p| !Arc::ptr_eq(&p.waker, &self.waker));
        }
    }
}

impl Suspend for VirtualSleep {
    fn suspend(
        &self,
        duration: Duration,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<(), Cancelled>> + Send {
        VirtualWait {
            time: self.time.clone(),
            parked: self.parked.clone(),
            wake_at: self.time.now() + (duration + self.jitter).as_secs_f64(),
            waker: Arc::new(AtomicWaker::new()),
            registered: false,
            cancel: cancel.clone(),
        }
    }
}

/// What a completed wait observed
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Wake {
    /// Beat the wait aimed for
    pub target_beat: f64,
    /// Clock position right after waking
    pub beat: f64,
    /// Time actually requested from the suspension capability
    pub suspended: Duration,
}

impl Wake {
    /// How far past the target the routine woke, in beats
    pub fn lateness(&self) -> f64 {
        self.beat - self.target_beat
    }
}

/// Tempo clock composed with a suspension capability.
///
/// Cloning is cheap: the clock and the cancellation token are shared.
#[derive(Debug, Clone)]
pub struct Scheduler<S = BlockingSleep> {
    clock: Arc<TempoClock>,
    suspend: S,
    cancel: CancellationToken,
}

impl<S: Suspend> Scheduler<S> {
    pub fn new(clock: Arc<TempoClock>, suspend: S, cancel: CancellationToken) -> Self {
        Self {
            clock,
            suspend,
            cancel,
        }
    }

    pub fn clock(&self) -> &Arc<TempoClock> {
        &self.clock
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Suspend until the clock reaches `target_beat`.
    ///
    /// The wake time is derived from the clock origin on every call, so
    /// lateness on one call never carries into the next. Targets already in the
    /// past return immediately.
    pub async fn wait_until_beat(&self, target_beat: f64) -> Result<Wake, WaitError> {
        if !target_beat.is_finite() {
            return Err(WaitError::InvalidTarget(target_beat));
        }
        if self.cancel.is_cancelled() {
            return Err(Cancelled.into());
        }

        let remaining = self.clock.beat_to_time(target_beat) - self.clock.now();
        let suspended = if remaining > 0.0 {
            let duration = Duration::try_from_secs_f64(remaining)
                .map_err(|_| WaitError::InvalidTarget(target_beat))?;
            self.suspend.suspend(duration, &self.cancel).await?;
            duration
        } else {
            Duration::ZERO
        };

        Ok(Wake {
            target_beat,
            beat: self.clock.current_beat(),
            suspended,
        })
    }

    /// Suspend for `beats` beats measured from now.
    ///
    /// Unlike [`Scheduler::wait_until_beat`] this is relative, so repeated
    /// calls accumulate every bit of scheduler latency.
    pub async fn wait_for_beats(&self, beats: f64) -> Result<Wake, WaitError> {
        if !(beats.is_finite() && beats >= 0.0) {
            return Err(WaitError::InvalidTarget(beats));
        }
        if self.cancel.is_cancelled() {
            return Err(Cancelled.into());
        }

        let start_beat = self.clock.current_beat();
        let duration = Duration::try_from_secs_f64(beats * self.clock.beat_duration())
            .map_err(|_| WaitError::InvalidTarget(beats))?;
        if !duration.is_zero() {
            self.suspend.suspend(duration, &self.cancel).await?;
        }

        Ok(Wake {
            target_beat: start_beat + beats,
            beat: self.clock.current_beat(),
            suspended: duration,
        })
    }

    /// Wait for the next whole beat
    pub async fn sync_to_next_beat(&self) -> Result<Wake, WaitError> {
        self.wait_until_beat(self.clock.next_whole_beat()).await
    }
}

impl Scheduler<BlockingSleep> {
    pub fn blocking(clock: Arc<TempoClock>, cancel: CancellationToken) -> Self {
        Self::new(clock, BlockingSleep, cancel)
    }

    pub fn block_until_beat(&self, target_beat: f64) -> Result<Wake, WaitError> {
        futures::executor::block_on(self.wait_until_beat(target_beat))
    }

    pub fn block_for_beats(&self, beats: f64) -> Result<Wake, WaitError> {
        futures::executor::block_on(self.wait_for_beats(beats))
    }
}

impl Scheduler<VirtualSleep> {
    /// Drive `future` on this scheduler's virtual time
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.suspend.block_on(future)
    }
}
