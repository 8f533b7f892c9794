//! Sequencer loops: pattern and waveform routines locked to a shared clock

use std::sync::Arc;

use crossbeam_channel::Sender;
use phaselock_core::{
    Indexing, Pattern, PhaselockError, Result, ScheduleCursor, TempoClock, VoltageRange,
    WaveCycle, Waveform,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::drift::{DriftMonitor, DriftReport};
use crate::scheduler::{Scheduler, Suspend, WaitError};
use crate::sink::{SinkError, SinkHandle, DAC_MAX_CODE};

/// Loop lifecycle; the only transition is `Running -> Stopped`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LoopState {
    #[default]
    Running,
    Stopped,
}

/// How the loop waits between iterations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Advance {
    /// `wait_until_beat(target)`: drift-free
    #[default]
    Absolute,
    /// `wait_for_beats(step)`: accumulates scheduler latency
    Relative,
}

/// What a loop does when the sink rejects a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Report and keep going
    #[default]
    Continue,
    /// Stop once the sink reports it is unavailable
    StopOnFatal,
}

/// Gate output raised on trigger and dropped after `length_beats`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Gate {
    pub channel: u8,
    pub length_beats: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartMode {
    /// Restart on every sample while the pattern step is active
    #[default]
    Level,
    /// Restart once when an active step begins
    Edge,
}

/// Pattern that restarts a waveform at phase 0
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Restart {
    pub pattern: Pattern,
    #[serde(default)]
    pub indexing: Indexing,
    #[serde(default)]
    pub mode: RestartMode,
}

/// Output scaling of a waveform, re-evaluated at each new trigger step
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Depth {
    Fixed(f64),
    Random { min: f64, max: f64 },
}

impl Default for Depth {
    fn default() -> Self {
        Depth::Fixed(1.0)
    }
}

impl Depth {
    fn validate(&self) -> Result<()> {
        let ok = match *self {
            Depth::Fixed(depth) => depth.is_finite(),
            Depth::Random { min, max } => min.is_finite() && max.is_finite() && min <= max,
        };
        if ok {
            Ok(())
        } else {
            Err(PhaselockError::InvalidArgument(format!("invalid depth {self:?}")))
        }
    }

    fn sample(&self, rng: &mut fastrand::Rng) -> f64 {
        match *self {
            Depth::Fixed(depth) => depth,
            Depth::Random { min, max } => min + rng.f64() * (max - min),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct WaveOutput {
    /// `None` writes to the sink's default channel
    pub channel: Option<u8>,
    pub range: VoltageRange,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TriggerVoice {
    pub pattern: Pattern,
    pub indexing: Indexing,
    pub gate: Option<Gate>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WaveVoice {
    pub waveform: Waveform,
    pub restart: Option<Restart>,
    pub output: WaveOutput,
    pub depth: Depth,
    /// Publish a `Sample` event every this many iterations
    pub report_every: u64,
}

/// Per-iteration behaviour of a loop
#[derive(Debug, Clone, PartialEq)]
pub enum Voice {
    /// Report the beat and its position in a sequence of `sequence_length` beats
    Counter { sequence_length: usize },
    Trigger(TriggerVoice),
    Wave(WaveVoice),
}

/// Observability events published by running loops
#[derive(Debug, Clone, PartialEq)]
pub enum LoopEvent {
    Tick {
        loop_name: Arc<str>,
        beat: f64,
        index: usize,
    },
    Trigger {
        loop_name: Arc<str>,
        beat: f64,
        index: usize,
        value: f64,
    },
    Sample {
        loop_name: Arc<str>,
        beat: f64,
        wave_position: f64,
        amplitude: f64,
        voltage: f64,
    },
    SinkFailure {
        loop_name: Arc<str>,
        beat: f64,
        error: SinkError,
    },
    Stopped {
        loop_name: Arc<str>,
        iterations: u64,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum StopReason {
    Cancelled,
    SinkFailure(SinkError),
    InvalidTarget(f64),
}

/// Summary returned when a loop stops
#[derive(Debug, Clone, PartialEq)]
pub struct LoopReport {
    pub name: Arc<str>,
    pub state: LoopState,
    pub iterations: u64,
    pub triggers: u64,
    pub sink_failures: u64,
    pub stop_reason: StopReason,
    pub drift: DriftReport,
}

/// Collects the outputs of one iteration
struct Emitter<'a> {
    name: &'a Arc<str>,
    events: Option<&'a Sender<LoopEvent>>,
    sink: &'a SinkHandle,
    policy: FailurePolicy,
    triggers: u64,
    failures: u64,
    fatal: Option<SinkError>,
}

impl Emitter<'_> {
    fn publish(&self, event: LoopEvent) {
        if let Some(tx) = self.events {
            // Never block the loop on a slow observer
            let _ = tx.try_send(event);
        }
    }

    fn trigger(&mut self, beat: f64, index: usize, value: f64) {
        self.triggers += 1;
        debug!(loop_name = %self.name, beat, index, value, "Trigger");
        self.publish(LoopEvent::Trigger {
            loop_name: self.name.clone(),
            beat,
            index,
            value,
        });
    }

    fn check(&mut self, beat: f64, result: std::result::Result<(), SinkError>) {
        let Err(error) = result else { return };
        self.failures += 1;
        warn!(loop_name = %self.name, beat, error = %error, "Sink rejected value");
        if error.is_fatal() && self.policy == FailurePolicy::StopOnFatal && self.fatal.is_none() {
            self.fatal = Some(error.clone());
        }
        self.publish(LoopEvent::SinkFailure {
            loop_name: self.name.clone(),
            beat,
            error,
        });
    }
}

#[derive(Debug, Clone)]
enum Runtime {
    Counter {
        sequence_length: usize,
    },
    Trigger {
        voice: TriggerVoice,
        gate_open_until: Option<f64>,
    },
    Wave {
        voice: WaveVoice,
        cycle: WaveCycle,
        last_trigger_step: Option<i64>,
        depth: f64,
        rng: fastrand::Rng,
    },
}

impl Runtime {
    fn new(voice: Voice) -> Result<Self> {
        match voice {
            Voice::Counter { sequence_length } => {
                if sequence_length == 0 {
                    return Err(PhaselockError::InvalidArgument(
                        "sequence length must be positive".into(),
                    ));
                }
                Ok(Runtime::Counter { sequence_length })
            }
            Voice::Trigger(voice) => {
                voice.indexing.validate()?;
                if let Some(gate) = voice.gate {
                    if !(gate.length_beats.is_finite() && gate.length_beats > 0.0) {
                        return Err(PhaselockError::InvalidArgument(format!(
                            "gate length must be positive, got {}",
                            gate.length_beats
                        )));
                    }
                }
                Ok(Runtime::Trigger {
                    voice,
                    gate_open_until: None,
                })
            }
            Voice::Wave(voice) => {
                if let Some(restart) = &voice.restart {
                    restart.indexing.validate()?;
                }
                voice.depth.validate()?;
                if voice.report_every == 0 {
                    return Err(PhaselockError::InvalidArgument(
                        "report interval must be positive".into(),
                    ));
                }
                let mut rng = fastrand::Rng::new();
                let depth = voice.depth.sample(&mut rng);
                Ok(Runtime::Wave {
                    voice,
                    cycle: WaveCycle::default(),
                    last_trigger_step: None,
                    depth,
                    rng,
                })
            }
        }
    }

    fn step(&mut self, beat: f64, iteration: u64, out: &mut Emitter<'_>) {
        match self {
            Runtime::Counter { sequence_length } => {
                let index = (beat.floor() as i64).rem_euclid(*sequence_length as i64) as usize;
                debug!(loop_name = %out.name, beat, index, "Tick");
                out.publish(LoopEvent::Tick {
                    loop_name: out.name.clone(),
                    beat,
                    index,
                });
            }
            Runtime::Trigger {
                voice,
                gate_open_until,
            } => {
                if let (Some(gate), Some(until)) = (voice.gate, *gate_open_until) {
                    if beat >= until {
                        let closed = out.sink.set_channel(gate.channel, 0);
                        out.check(beat, closed);
                        *gate_open_until = None;
                    }
                }

                let index = voice.pattern.index_for(voice.indexing, beat, iteration);
                let value = voice.pattern.value(index);
                if value > 0.0 {
                    out.trigger(beat, index, value);
                    if let Some(gate) = voice.gate {
                        let opened = out.sink.set_channel(gate.channel, DAC_MAX_CODE);
                        out.check(beat, opened);
                        *gate_open_until = Some(beat + gate.length_beats);
                    }
                }
            }
            Runtime::Wave {
                voice,
                cycle,
                last_trigger_step,
                depth,
                rng,
            } => {
                if let Some(restart) = &voice.restart {
                    let step = restart.indexing.step_number(beat, iteration);
                    let index = restart.pattern.wrap(step);
                    let value = restart.pattern.value(index);
                    if value > 0.0 {
                        let new_step = *last_trigger_step != Some(step);
                        if new_step || restart.mode == RestartMode::Level {
                            cycle.restart(beat);
                        }
                        if new_step {
                            *depth = voice.depth.sample(rng);
                            out.trigger(beat, index, value);
                        }
                        *last_trigger_step = Some(step);
                    }
                }

                let wave_position = cycle.position(beat);
                let amplitude = voice.waveform.amplitude(wave_position);
                let voltage = voice.output.range.scale_bipolar(amplitude * *depth);
                let written = out.sink.set_voltage(voice.output.channel, voltage);
                out.check(beat, written);

                if iteration % voice.report_every == 0 {
                    out.publish(LoopEvent::Sample {
                        loop_name: out.name.clone(),
                        beat,
                        wave_position,
                        amplitude,
                        voltage,
                    });
                }
            }
        }
    }
}

/// One periodic routine reading the shared clock.
///
/// Each iteration reads the current beat, runs its voice, advances its own
/// target beat and suspends. Suspension happens only inside the scheduler.
#[derive(Debug)]
pub struct SequencerLoop {
    name: Arc<str>,
    runtime: Runtime,
    cursor: ScheduleCursor,
    advance: Advance,
    policy: FailurePolicy,
    state: LoopState,
    iterations: u64,
    triggers: u64,
    sink_failures: u64,
    drift: DriftMonitor,
    events: Option<Sender<LoopEvent>>,
}

impl SequencerLoop {
    pub fn new(name: impl Into<Arc<str>>, voice: Voice, step_beats: f64) -> Result<Self> {
        let cursor = ScheduleCursor::new(0.0, step_beats)?;
        let drift = match &voice {
            Voice::Wave(wave) => DriftMonitor::new(step_beats).with_waveform(wave.waveform),
            _ => DriftMonitor::new(step_beats),
        };
        Ok(Self {
            name: name.into(),
            runtime: Runtime::new(voice)?,
            cursor,
            advance: Advance::default(),
            policy: FailurePolicy::default(),
            state: LoopState::Running,
            iterations: 0,
            triggers: 0,
            sink_failures: 0,
            drift,
            events: None,
        })
    }

    /// Report the position in a `sequence_length`-beat sequence every
    /// `interval_beats`
    pub fn counter(
        name: impl Into<Arc<str>>,
        sequence_length: usize,
        interval_beats: f64,
    ) -> Result<Self> {
        Self::new(name, Voice::Counter { sequence_length }, interval_beats)
    }

    /// Check `pattern` every `step_beats`, indexing by the same subdivision
    pub fn trigger(name: impl Into<Arc<str>>, pattern: Pattern, step_beats: f64) -> Result<Self> {
        let indexing = if step_beats == 1.0 {
            Indexing::WholeBeat
        } else {
            Indexing::Subdivision(step_beats)
        };
        let voice = TriggerVoice {
            pattern,
            indexing,
            gate: None,
        };
        Self::new(name, Voice::Trigger(voice), step_beats)
    }

    /// Continuous waveform output sampled at `sample_rate_hz`.
    ///
    /// The sample interval is converted to beats at the clock's current tempo.
    pub fn wave(
        name: impl Into<Arc<str>>,
        voice: WaveVoice,
        clock: &TempoClock,
        sample_rate_hz: f64,
    ) -> Result<Self> {
        if !(sample_rate_hz.is_finite() && sample_rate_hz > 0.0) {
            return Err(PhaselockError::InvalidArgument(format!(
                "sample rate must be positive, got {sample_rate_hz}"
            )));
        }
        let step = clock.seconds_to_beats(1.0 / sample_rate_hz);
        Self::new(name, Voice::Wave(voice), step)
    }

    pub fn with_advance(mut self, advance: Advance) -> Self {
        self.advance = advance;
        self
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_events(mut self, events: Sender<LoopEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Reseed the random depth generator of a wave voice
    pub fn with_seed(mut self, seed: u64) -> Self {
        if let Runtime::Wave {
            voice, depth, rng, ..
        } = &mut self.runtime
        {
            *rng = fastrand::Rng::with_seed(seed);
            *depth = voice.depth.sample(rng);
        }
        self
    }

    pub fn with_start_beat(mut self, start_beat: f64) -> Result<Self> {
        self.cursor = ScheduleCursor::new(start_beat, self.cursor.step())?;
        Ok(self)
    }

    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    pub fn target_beat(&self) -> f64 {
        self.cursor.target_beat()
    }

    pub fn step_beats(&self) -> f64 {
        self.cursor.step()
    }

    /// Run one iteration's output work at `beat` without waiting.
    ///
    /// Returns the sink error that should stop the loop, if any.
    pub fn step(&mut self, beat: f64, sink: &SinkHandle) -> Option<SinkError> {
        let iteration = self.iterations;
        self.iterations += 1;

        let mut out = Emitter {
            name: &self.name,
            events: self.events.as_ref(),
            sink,
            policy: self.policy,
            triggers: 0,
            failures: 0,
            fatal: None,
        };
        self.runtime.step(beat, iteration, &mut out);

        self.triggers += out.triggers;
        self.sink_failures += out.failures;
        out.fatal
    }

    /// Run until cancelled (or stopped by a fatal sink error)
    pub async fn run<S: Suspend>(
        mut self,
        scheduler: &Scheduler<S>,
        sink: &SinkHandle,
    ) -> LoopReport {
        let clock = scheduler.clock().clone();
        info!(
            loop_name = %self.name,
            step = self.cursor.step(),
            advance = ?self.advance,
            "Sequencer loop started"
        );

        let reason = loop {
            if scheduler.cancellation().is_cancelled() {
                break StopReason::Cancelled;
            }

            let beat = clock.current_beat();
            if let Some(error) = self.step(beat, sink) {
                break StopReason::SinkFailure(error);
            }

            let target = self.cursor.advance();
            let waited = match self.advance {
                Advance::Absolute => scheduler.wait_until_beat(target).await,
                Advance::Relative => scheduler.wait_for_beats(self.cursor.step()).await,
            };
            match waited {
                Ok(wake) => self.drift.record(&wake, clock.beat_duration()),
                Err(WaitError::Cancelled(_)) => break StopReason::Cancelled,
                Err(WaitError::InvalidTarget(target)) => break StopReason::InvalidTarget(target),
            }
        };

        self.finish(reason)
    }

    fn finish(mut self, stop_reason: StopReason) -> LoopReport {
        self.state = LoopState::Stopped;
        info!(
            loop_name = %self.name,
            iterations = self.iterations,
            sink_failures = self.sink_failures,
            reason = ?stop_reason,
            "Sequencer loop stopped"
        );
        if let Some(tx) = &self.events {
            let _ = tx.try_send(LoopEvent::Stopped {
                loop_name: self.name.clone(),
                iterations: self.iterations,
            });
        }
        LoopReport {
            name: self.name.clone(),
            state: self.state,
            iterations: self.iterations,
            triggers: self.triggers,
            sink_failures: self.sink_failures,
            stop_reason,
            drift: self.drift.report(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crossbeam_channel::{unbounded, Receiver};
    use float_cmp::approx_eq;
    use more_asserts::{assert_gt, assert_lt};
    use phaselock_core::ManualTime;

    use crate::cancel::CancellationToken;
    use crate::scheduler::VirtualSleep;
    use crate::sink::{DacMonitor, MemoryDac};

    struct Rig {
        time: Arc<ManualTime>,
        clock: Arc<TempoClock>,
        sink: SinkHandle,
        dac: DacMonitor,
    }

    fn rig(bpm: f64, vref: f64) -> Rig {
        let time = Arc::new(ManualTime::new(0.0));
        let clock = Arc::new(TempoClock::with_source(bpm, time.clone()).unwrap());
        let dac = MemoryDac::new(vref).unwrap();
        let monitor = dac.monitor();
        Rig {
            time,
            clock,
            sink: SinkHandle::new(dac),
            dac: monitor,
        }
    }

    impl Rig {
        fn scheduler(&self, horizon: f64) -> Scheduler<VirtualSleep> {
            Scheduler::new(
                self.clock.clone(),
                VirtualSleep::new(self.time.clone()).with_horizon(horizon),
                CancellationToken::new(),
            )
        }

        /// Run `lp` on virtual time until `horizon` seconds
        fn run(&self, lp: SequencerLoop, horizon: f64) -> LoopReport {
            let scheduler = self.scheduler(horizon);
            scheduler.block_on(lp.run(&scheduler, &self.sink))
        }
    }

    fn drain(rx: &Receiver<LoopEvent>) -> Vec<LoopEvent> {
        rx.try_iter().collect()
    }

    fn beat_pattern() -> Pattern {
        Pattern::new(vec![
            1.0, 0.0, 1.0, 0.0, 1.0, 1.0, 1.0, 0.0, 1.0, 1.0, 1.0, 0.0, 1.0, 0.0, 0.0, 0.0,
        ])
        .unwrap()
    }

    fn sine_voice(mode: RestartMode) -> WaveVoice {
        WaveVoice {
            waveform: Waveform::cycle_of(4.0).unwrap(),
            restart: Some(Restart {
                pattern: Pattern::from_gates(&[true, false, false, false]).unwrap(),
                indexing: Indexing::WholeBeat,
                mode,
            }),
            output: WaveOutput::default(),
            depth: Depth::Fixed(1.0),
            report_every: 1,
        }
    }

    #[test]
    fn test_counter_wraps_sequence() {
        let rig = rig(120.0, 5.0);
        let (tx, rx) = unbounded();
        let lp = SequencerLoop::counter("print", 16, 4.0).unwrap().with_events(tx);

        // beats 0, 4, 8, 12, 16 fit before 9 s; the wait for beat 20 does not
        let report = rig.run(lp, 9.0);
        assert_eq!(report.iterations, 5);
        assert_eq!(report.state, LoopState::Stopped);
        assert_eq!(report.stop_reason, StopReason::Cancelled);

        let indexes: Vec<usize> = drain(&rx)
            .into_iter()
            .filter_map(|e| match e {
                LoopEvent::Tick { index, .. } => Some(index),
                _ => None,
            })
            .collect();
        assert_eq!(indexes, vec![0, 4, 8, 12, 0]);
    }

    #[test]
    fn test_trigger_fires_on_active_steps() {
        let rig = rig(120.0, 5.0);
        let (tx, rx) = unbounded();
        let lp = SequencerLoop::trigger("array", beat_pattern(), 1.0)
            .unwrap()
            .with_events(tx);

        let report = rig.run(lp, 7.9);
        assert_eq!(report.iterations, 16);
        assert_eq!(report.triggers, 9);

        let events = drain(&rx);
        let fired: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                LoopEvent::Trigger { index, beat, .. } => {
                    assert_eq!(*beat, *index as f64);
                    Some(*index)
                }
                _ => None,
            })
            .collect();
        assert_eq!(fired, vec![0, 2, 4, 5, 6, 8, 9, 10, 12]);
        assert!(matches!(events.last(), Some(LoopEvent::Stopped { iterations: 16, .. })));
    }

    #[test]
    fn test_subdivision_trigger_indexing() {
        let rig = rig(120.0, 5.0);
        let pattern = Pattern::from_gates(&[true, false, true, true]).unwrap();
        let mut lp = SequencerLoop::trigger("hat", pattern, 0.25).unwrap();
        for i in 0..8 {
            lp.step(i as f64 * 0.25, &rig.sink);
        }
        assert_eq!(lp.triggers, 6);
    }

    #[test]
    fn test_step_indexing_follows_iterations() {
        let rig = rig(120.0, 5.0);
        let voice = TriggerVoice {
            pattern: Pattern::from_gates(&[true, false]).unwrap(),
            indexing: Indexing::Step,
            gate: None,
        };
        let mut lp = SequencerLoop::new("kick", Voice::Trigger(voice), 0.5).unwrap();
        // the beat never changes, only the iteration does
        for _ in 0..6 {
            lp.step(0.0, &rig.sink);
        }
        assert_eq!(lp.triggers, 3);
    }

    #[test]
    fn test_gate_opens_and_closes() {
        let rig = rig(120.0, 5.0);
        let voice = TriggerVoice {
            pattern: Pattern::from_gates(&[true, false, false, false]).unwrap(),
            indexing: Indexing::Subdivision(0.25),
            gate: Some(Gate {
                channel: 1,
                length_beats: 0.5,
            }),
        };
        let mut lp = SequencerLoop::new("gate", Voice::Trigger(voice), 0.25).unwrap();

        lp.step(0.0, &rig.sink);
        assert_eq!(rig.dac.codes()[1], DAC_MAX_CODE);
        lp.step(0.25, &rig.sink);
        assert_eq!(rig.dac.codes()[1], DAC_MAX_CODE);
        lp.step(0.5, &rig.sink);
        assert_eq!(rig.dac.codes()[1], 0);
        lp.step(1.0, &rig.sink);
        assert_eq!(rig.dac.codes()[1], DAC_MAX_CODE);
    }

    #[test]
    fn test_level_restart_holds_phase_while_active() {
        let rig = rig(120.0, 5.0);
        let mut lp = SequencerLoop::new("sine", Voice::Wave(sine_voice(RestartMode::Level)), 0.5)
            .unwrap();
        let range = VoltageRange::default();

        lp.step(0.0, &rig.sink);
        assert_eq!(rig.dac.codes()[0], range.to_code(2.5, DAC_MAX_CODE));
        lp.step(0.5, &rig.sink);
        assert_eq!(rig.dac.codes()[0], range.to_code(2.5, DAC_MAX_CODE));

        // restarted at 0.5, so beat 1.0 is an eighth of the 4-beat cycle in
        lp.step(1.0, &rig.sink);
        let expected = range.scale_bipolar((std::f64::consts::TAU * 0.125).sin());
        assert_eq!(rig.dac.codes()[0], range.to_code(expected, DAC_MAX_CODE));
        assert_eq!(lp.triggers, 1);
    }

    #[test]
    fn test_edge_restart_runs_through_active_step() {
        let rig = rig(120.0, 5.0);
        let (tx, rx) = unbounded();
        let mut lp = SequencerLoop::new("sine", Voice::Wave(sine_voice(RestartMode::Edge)), 0.5)
            .unwrap()
            .with_events(tx);

        for beat in [0.0, 0.5, 1.0] {
            lp.step(beat, &rig.sink);
        }
        assert_eq!(rig.dac.codes()[0], DAC_MAX_CODE);

        // next cycle restarts on beat 4
        lp.step(4.25, &rig.sink);
        let samples: Vec<(f64, f64)> = drain(&rx)
            .into_iter()
            .filter_map(|e| match e {
                LoopEvent::Sample {
                    wave_position,
                    voltage,
                    ..
                } => Some((wave_position, voltage)),
                _ => None,
            })
            .collect();
        assert_eq!(samples.len(), 4);
        assert_eq!(samples[3].0, 0.0);
        assert!(approx_eq!(f64, samples[2].1, 5.0, epsilon = 1e-12));
    }

    #[test]
    fn test_random_depth_is_bounded_and_seeded() {
        let rig = rig(120.0, 5.0);
        let voice = WaveVoice {
            depth: Depth::Random { min: 0.2, max: 1.0 },
            ..sine_voice(RestartMode::Edge)
        };
        let (tx, rx) = unbounded();
        let mut a = SequencerLoop::new("a", Voice::Wave(voice.clone()), 0.25)
            .unwrap()
            .with_seed(7)
            .with_events(tx.clone());
        let mut b = SequencerLoop::new("b", Voice::Wave(voice), 0.25)
            .unwrap()
            .with_seed(7)
            .with_events(tx);

        for i in 0..64 {
            let beat = i as f64 * 0.25 + 1.0;
            a.step(beat, &rig.sink);
            b.step(beat, &rig.sink);
        }

        let mut by_loop: [Vec<f64>; 2] = [Vec::new(), Vec::new()];
        for event in drain(&rx) {
            if let LoopEvent::Sample {
                loop_name, voltage, ..
            } = event
            {
                let slot = if &*loop_name == "a" { 0 } else { 1 };
                by_loop[slot].push(voltage);
            }
        }
        assert_eq!(by_loop[0], by_loop[1]);
        for voltage in &by_loop[0] {
            assert_gt!(*voltage, 2.5 - 2.5 * 1.0 - 1e-9);
            assert_lt!(*voltage, 2.5 + 2.5 * 1.0 + 1e-9);
        }
    }

    #[test]
    fn test_sink_failures_do_not_stop_loop() {
        // a 0-5 V waveform into a 3.3 V DAC fails on every high sample
        let rig = rig(120.0, 3.3);
        let (tx, rx) = unbounded();
        let voice = WaveVoice {
            restart: None,
            ..sine_voice(RestartMode::Level)
        };
        let lp = SequencerLoop::new("sine", Voice::Wave(voice), 0.25)
            .unwrap()
            .with_events(tx);

        let report = rig.run(lp, 4.0);
        assert_eq!(report.stop_reason, StopReason::Cancelled);
        assert_eq!(report.iterations, 33);
        assert_gt!(report.sink_failures, 0);
        assert_lt!(report.sink_failures, report.iterations);

        let failures = drain(&rx)
            .into_iter()
            .filter(|e| {
                matches!(
                    e,
                    LoopEvent::SinkFailure {
                        error: SinkError::OutOfRange { .. },
                        ..
                    }
                )
            })
            .count() as u64;
        assert_eq!(failures, report.sink_failures);
    }

    #[test]
    fn test_fatal_sink_error_policy() {
        let rig = rig(120.0, 5.0);
        rig.dac.set_available(false);
        let voice = TriggerVoice {
            pattern: Pattern::from_gates(&[true]).unwrap(),
            indexing: Indexing::WholeBeat,
            gate: Some(Gate {
                channel: 0,
                length_beats: 0.5,
            }),
        };

        let keep_going = SequencerLoop::new("gate", Voice::Trigger(voice.clone()), 1.0).unwrap();
        let report = rig.run(keep_going, 2.0);
        assert_eq!(report.stop_reason, StopReason::Cancelled);
        assert_eq!(report.iterations, 5);

        let stopping = SequencerLoop::new("gate", Voice::Trigger(voice), 1.0)
            .unwrap()
            .with_policy(FailurePolicy::StopOnFatal);
        let report = rig.run(stopping, 100.0);
        assert!(matches!(
            report.stop_reason,
            StopReason::SinkFailure(SinkError::Unavailable(_))
        ));
        assert_eq!(report.iterations, 1);
        assert_eq!(report.state, LoopState::Stopped);
    }

    #[test]
    fn test_loops_sharing_clock_see_same_beat() {
        let rig = rig(180.0, 5.0);
        let (tx, rx) = unbounded();
        let mut counter = SequencerLoop::counter("print", 16, 4.0)
            .unwrap()
            .with_events(tx.clone());
        let mut trigger = SequencerLoop::trigger("array", Pattern::from_gates(&[true]).unwrap(), 1.0)
            .unwrap()
            .with_events(tx);

        rig.time.set(12.345);
        counter.step(rig.clock.current_beat(), &rig.sink);
        trigger.step(rig.clock.current_beat(), &rig.sink);

        let beats: Vec<f64> = drain(&rx)
            .into_iter()
            .filter_map(|e| match e {
                LoopEvent::Tick { beat, .. } | LoopEvent::Trigger { beat, .. } => Some(beat),
                _ => None,
            })
            .collect();
        assert_eq!(beats.len(), 2);
        assert_eq!(beats[0], beats[1]);
    }

    #[test]
    fn test_absolute_and_relative_drift() {
        let jitter = Duration::from_millis(1);
        let run = |advance: Advance| {
            let rig = rig(120.0, 5.0);
            let scheduler = Scheduler::new(
                rig.clock.clone(),
                VirtualSleep::new(rig.time.clone())
                    .with_jitter(jitter)
                    .with_horizon(10.0),
                CancellationToken::new(),
            );
            let lp = SequencerLoop::counter("tick", 16, 0.25)
                .unwrap()
                .with_advance(advance);
            scheduler.block_on(lp.run(&scheduler, &rig.sink)).drift
        };

        let absolute = run(Advance::Absolute);
        let relative = run(Advance::Relative);
        assert_lt!(absolute.max_interval_drift_ms, 1e-3);
        assert!(approx_eq!(f64, absolute.max_lateness_ms, 1.0, epsilon = 1e-3));
        assert!(approx_eq!(f64, relative.mean_interval_drift_ms, 1.0, epsilon = 1e-3));
    }

    #[test]
    fn test_wave_drift_absolute_vs_relative() {
        let run = |advance: Advance| {
            let rig = rig(120.0, 5.0);
            let scheduler = Scheduler::new(
                rig.clock.clone(),
                VirtualSleep::new(rig.time.clone())
                    .with_jitter(Duration::from_millis(1))
                    .with_horizon(4.0),
                CancellationToken::new(),
            );
            let voice = WaveVoice {
                restart: None,
                ..sine_voice(RestartMode::Level)
            };
            let lp = SequencerLoop::new("sine", Voice::Wave(voice), 0.25)
                .unwrap()
                .with_advance(advance);
            scheduler.block_on(lp.run(&scheduler, &rig.sink)).drift
        };

        let absolute = run(Advance::Absolute);
        let relative = run(Advance::Relative);
        assert_gt!(absolute.samples, 8);
        assert_lt!(absolute.max_waveform_drift, 1e-6);
        assert_gt!(relative.mean_waveform_drift, 1e-4);
        assert_gt!(relative.max_waveform_drift, absolute.max_waveform_drift);

        // counters have no waveform to drift
        let rig = rig(120.0, 5.0);
        let counter = SequencerLoop::counter("tick", 16, 0.25).unwrap();
        assert_eq!(rig.run(counter, 2.0).drift.max_waveform_drift, 0.0);
    }

    #[test]
    fn test_start_beat_anchors_grid() {
        let rig = rig(120.0, 5.0);
        let (tx, rx) = unbounded();
        rig.time.set(4.0);
        let lp = SequencerLoop::counter("late", 16, 1.0)
            .unwrap()
            .with_start_beat(8.0)
            .unwrap()
            .with_events(tx);
        assert_eq!(lp.target_beat(), 8.0);

        // joins at beat 8 and keeps the whole-beat grid, no catch-up burst
        let report = rig.run(lp, 6.0);
        assert_eq!(report.iterations, 5);
        let beats: Vec<f64> = drain(&rx)
            .into_iter()
            .filter_map(|e| match e {
                LoopEvent::Tick { beat, .. } => Some(beat),
                _ => None,
            })
            .collect();
        assert_eq!(beats, [8.0, 9.0, 10.0, 11.0, 12.0]);

        let lp = SequencerLoop::counter("c", 16, 1.0).unwrap();
        assert!(lp.with_start_beat(f64::NAN).is_err());
    }

    #[test]
    fn test_wave_step_from_sample_rate() {
        let clock = TempoClock::new(180.0).unwrap();
        let lp = SequencerLoop::wave("sine", sine_voice(RestartMode::Level), &clock, 100.0).unwrap();
        // 10 ms at 333 ms per beat
        assert!(approx_eq!(f64, lp.step_beats(), 0.03, epsilon = 1e-12));
        assert!(SequencerLoop::wave("sine", sine_voice(RestartMode::Level), &clock, 0.0).is_err());
    }

    #[test]
    fn test_construction_validates() {
        assert!(SequencerLoop::counter("c", 0, 1.0).is_err());
        assert!(SequencerLoop::counter("c", 16, 0.0).is_err());
        let bad_gate = TriggerVoice {
            pattern: Pattern::from_gates(&[true]).unwrap(),
            indexing: Indexing::WholeBeat,
            gate: Some(Gate {
                channel: 0,
                length_beats: 0.0,
            }),
        };
        assert!(SequencerLoop::new("g", Voice::Trigger(bad_gate), 1.0).is_err());
        let bad_depth = WaveVoice {
            depth: Depth::Random { min: 1.0, max: 0.5 },
            ..sine_voice(RestartMode::Level)
        };
        assert!(SequencerLoop::new("w", Voice::Wave(bad_depth), 0.1).is_err());
        let silent = WaveVoice {
            report_every: 0,
            ..sine_voice(RestartMode::Level)
        };
        assert!(SequencerLoop::new("w", Voice::Wave(silent), 0.1).is_err());
    }
}
