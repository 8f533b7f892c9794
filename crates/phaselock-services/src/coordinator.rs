//! Runs a set of sequencer loops against one clock and one sink

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use futures::executor::block_on;
use futures::future::join_all;
use phaselock_core::{PhaselockError, TempoClock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::cancel::CancellationToken;
use crate::scheduler::{Cooperative, CooperativeSleep, Scheduler};
use crate::sequencer::{LoopReport, SequencerLoop};
use crate::sink::SinkHandle;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Core(#[from] PhaselockError),
    #[error("No loops to run")]
    NoLoops,
    #[error("Coordinator already stopped")]
    AlreadyStopped,
    #[error("Loop thread panicked: {0}")]
    LoopPanicked(String),
    #[error("Failed to spawn loop thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// How loops are mapped onto threads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One OS thread per loop, parked between iterations
    #[default]
    Threaded,
    /// All loops multiplexed on a single thread
    Cooperative,
}

/// Launches loops, all sharing one clock, sink and cancellation token.
///
/// Holds no musical state and never touches the tempo.
pub struct Coordinator {
    clock: Arc<TempoClock>,
    sink: SinkHandle,
    cancel: CancellationToken,
    loops: Vec<SequencerLoop>,
}

impl Coordinator {
    pub fn new(clock: Arc<TempoClock>, sink: SinkHandle) -> Self {
        Self {
            clock,
            sink,
            cancel: CancellationToken::new(),
            loops: Vec::new(),
        }
    }

    pub fn clock(&self) -> &Arc<TempoClock> {
        &self.clock
    }

    /// Token that stops every loop of this coordinator
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn add_loop(&mut self, sequencer: SequencerLoop) -> &mut Self {
        self.loops.push(sequencer);
        self
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    /// Start every loop in the background
    pub fn spawn(self, mode: ExecutionMode) -> Result<CoordinatorHandle, CoordinatorError> {
        if self.loops.is_empty() {
            return Err(CoordinatorError::NoLoops);
        }

        let loop_count = self.loops.len();
        let mut handle = CoordinatorHandle {
            cancel: self.cancel.clone(),
            sink: self.sink.clone(),
            threads: Vec::new(),
            stopped: false,
        };

        match mode {
            ExecutionMode::Threaded => {
                for sequencer in self.loops {
                    let scheduler = Scheduler::blocking(self.clock.clone(), self.cancel.clone());
                    let sink = self.sink.clone();
                    let spawned = thread::Builder::new()
                        .name(format!("loop-{}", sequencer.name()))
                        .spawn(move || vec![block_on(sequencer.run(&scheduler, &sink))]);
                    match spawned {
                        Ok(thread) => handle.threads.push(thread),
                        Err(e) => {
                            // Drop stops whatever already started
                            drop(handle);
                            return Err(e.into());
                        }
                    }
                }
            }
            ExecutionMode::Cooperative => {
                let scheduler =
                    Scheduler::new(self.clock.clone(), CooperativeSleep, self.cancel.clone());
                let sink = self.sink.clone();
                let loops = self.loops;
                let thread = thread::Builder::new()
                    .name("loops".into())
                    .spawn(move || {
                        let runs = loops
                            .into_iter()
                            .map(|sequencer| sequencer.run(&scheduler, &sink));
                        block_on(join_all(runs))
                    })?;
                handle.threads.push(thread);
            }
        }

        info!(
            loops = loop_count,
            mode = ?mode,
            bpm = self.clock.bpm(),
            "Coordinator started"
        );
        Ok(handle)
    }

    /// Drive every loop on the caller's executor until they all stop, then
    /// release the sink.
    ///
    /// All loops share one task, so `suspend` must yield rather than park the
    /// thread.
    pub async fn run<S: Cooperative>(
        self,
        suspend: S,
    ) -> Result<Vec<LoopReport>, CoordinatorError> {
        if self.loops.is_empty() {
            return Err(CoordinatorError::NoLoops);
        }
        info!(loops = self.loops.len(), bpm = self.clock.bpm(), "Coordinator running");

        let scheduler = Scheduler::new(self.clock.clone(), suspend, self.cancel.clone());
        let runs = self
            .loops
            .into_iter()
            .map(|sequencer| sequencer.run(&scheduler, &self.sink));
        let reports = join_all(runs).await;

        release(&self.sink);
        info!(loops = reports.len(), "Coordinator stopped");
        Ok(reports)
    }
}

fn release(sink: &SinkHandle) {
    if let Err(e) = sink.release() {
        warn!(error = %e, "Failed to release sink");
    }
}

/// Running loops. Dropping the handle stops them.
pub struct CoordinatorHandle {
    cancel: CancellationToken,
    sink: SinkHandle,
    threads: Vec<JoinHandle<Vec<LoopReport>>>,
    stopped: bool,
}

impl CoordinatorHandle {
    /// Signal every loop to stop without waiting for them
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Cancel, wait for every loop and release the sink
    pub fn stop(&mut self) -> Result<Vec<LoopReport>, CoordinatorError> {
        if self.stopped {
            return Err(CoordinatorError::AlreadyStopped);
        }
        self.cancel.cancel();
        self.finish()
    }

    /// Wait for loops that end on their own (fatal sink errors, a token
    /// fired elsewhere), then release the sink
    pub fn join(mut self) -> Result<Vec<LoopReport>, CoordinatorError> {
        self.finish()
    }

    fn finish(&mut self) -> Result<Vec<LoopReport>, CoordinatorError> {
        self.stopped = true;
        let mut reports = Vec::new();
        let mut panicked = None;
        for thread in self.threads.drain(..) {
            match thread.join() {
                Ok(done) => reports.extend(done),
                Err(payload) => {
                    let message = payload
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".into());
                    warn!(error = %message, "Loop thread panicked");
                    panicked.get_or_insert(message);
                }
            }
        }

        release(&self.sink);
        info!(loops = reports.len(), "Coordinator stopped");
        match panicked {
            Some(message) => Err(CoordinatorError::LoopPanicked(message)),
            None => Ok(reports),
        }
    }
}

impl Drop for CoordinatorHandle {
    fn drop(&mut self) {
        if !self.stopped {
            if let Err(e) = self.stop() {
                warn!(error = %e, "Coordinator stop failed on drop");
            }
        }
    }
}
