//! phaselock-services: Scheduling, sequencer loops, output sinks and coordination

pub mod cancel;
pub mod coordinator;
pub mod drift;
pub mod scheduler;
pub mod sequencer;
pub mod sink;

pub use cancel::{CancellationToken, Cancelled};
pub use coordinator::{Coordinator, CoordinatorError, CoordinatorHandle, ExecutionMode};
pub use drift::{interval_drift, waveform_drift, DriftMonitor, DriftReport};
pub use scheduler::{
    BlockingSleep, Cooperative, CooperativeSleep, Scheduler, Suspend, VirtualSleep, WaitError,
    Wake,
};
pub use sequencer::{
    Advance, Depth, FailurePolicy, Gate, LoopEvent, LoopReport, LoopState, Restart, RestartMode,
    SequencerLoop, StopReason, TriggerVoice, Voice, WaveOutput, WaveVoice,
};
pub use sink::{
    DacMonitor, MemoryDac, OutputSink, SinkError, SinkHandle, DAC_CHANNELS, DAC_MAX_CODE,
};
