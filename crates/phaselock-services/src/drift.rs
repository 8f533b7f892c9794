//! Timing drift diagnostics for sequencer loops

use phaselock_core::Waveform;
use serde::Serialize;

use crate::scheduler::Wake;

/// Aggregated timing quality of one loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DriftReport {
    pub samples: u64,
    /// Mean of |wake beat - target beat|, in milliseconds
    pub mean_lateness_ms: f64,
    pub max_lateness_ms: f64,
    /// Mean of |Δbeat - step| between consecutive iterations, in milliseconds
    pub mean_interval_drift_ms: f64,
    pub max_interval_drift_ms: f64,
    /// Mean amplitude error a waveform picks up from interval drift; zero
    /// for loops without one
    pub mean_waveform_drift: f64,
    pub max_waveform_drift: f64,
}

#[derive(Debug, Clone, Copy, Default)]
struct Stat {
    count: u64,
    sum: f64,
    max: f64,
}

impl Stat {
    fn push(&mut self, value: f64) {
        let value = value.abs();
        self.count += 1;
        self.sum += value;
        self.max = self.max.max(value);
    }

    fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Collects lateness and interval drift from consecutive wakes
#[derive(Debug, Clone)]
pub struct DriftMonitor {
    expected_step: f64,
    prev_beat: Option<f64>,
    waveform: Option<Waveform>,
    lateness: Stat,
    interval: Stat,
    wave: Stat,
}

impl DriftMonitor {
    pub fn new(expected_step: f64) -> Self {
        Self {
            expected_step,
            prev_beat: None,
            waveform: None,
            lateness: Stat::default(),
            interval: Stat::default(),
            wave: Stat::default(),
        }
    }

    /// Also track how far `waveform` strays between consecutive wakes
    pub fn with_waveform(mut self, waveform: Waveform) -> Self {
        self.waveform = Some(waveform);
        self
    }

    /// Record one wake. `beat_duration` converts beats to seconds at the
    /// tempo in effect when the wake happened.
    pub fn record(&mut self, wake: &Wake, beat_duration: f64) {
        let to_ms = beat_duration * 1000.0;
        self.lateness.push(wake.lateness() * to_ms);
        if let Some(prev) = self.prev_beat {
            self.interval
                .push(interval_drift(prev, wake.beat, self.expected_step) * to_ms);
            if let Some(waveform) = &self.waveform {
                self.wave.push(waveform_drift(
                    waveform,
                    prev,
                    waveform.amplitude(prev),
                    waveform.amplitude(wake.beat),
                    self.expected_step,
                ));
            }
        }
        self.prev_beat = Some(wake.beat);
    }

    pub fn report(&self) -> DriftReport {
        DriftReport {
            samples: self.lateness.count,
            mean_lateness_ms: self.lateness.mean(),
            max_lateness_ms: self.lateness.max,
            mean_interval_drift_ms: self.interval.mean(),
            max_interval_drift_ms: self.interval.max,
            mean_waveform_drift: self.wave.mean(),
            max_waveform_drift: self.wave.max,
        }
    }
}

/// Deviation of one iteration's beat advance from the intended step
pub fn interval_drift(prev_beat: f64, beat: f64, step: f64) -> f64 {
    (beat - prev_beat) - step
}

/// How far a waveform moved off the value a perfectly timed step would give
pub fn waveform_drift(
    waveform: &Waveform,
    prev_beat: f64,
    prev_amplitude: f64,
    amplitude: f64,
    step: f64,
) -> f64 {
    let expected = waveform.amplitude(prev_beat + step);
    (amplitude - prev_amplitude) - (expected - prev_amplitude)
}
