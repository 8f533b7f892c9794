//! Beat-driven waveform generation

use std::f64::consts::TAU;

use serde::{Deserialize, Serialize};

use crate::error::{PhaselockError, Result};

/// Sine oscillator expressed in musical time.
///
/// `amplitude(beat) = sin(2π · (beat · beat_multiplier + phase_offset))`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Waveform {
    /// Offset in cycles (1.0 = one full cycle)
    pub phase_offset: f64,
    /// Cycles per beat
    pub beat_multiplier: f64,
}

impl Default for Waveform {
    fn default() -> Self {
        Self {
            phase_offset: 0.0,
            beat_multiplier: 1.0,
        }
    }
}

impl Waveform {
    pub fn new(phase_offset: f64, beat_multiplier: f64) -> Self {
        Self {
            phase_offset,
            beat_multiplier,
        }
    }

    /// One full cycle every `beats` beats
    pub fn cycle_of(beats: f64) -> Result<Self> {
        if !(beats.is_finite() && beats > 0.0) {
            return Err(PhaselockError::invalid(format!(
                "wave length must be positive, got {beats} beats"
            )));
        }
        Ok(Self::new(0.0, 1.0 / beats))
    }

    /// Value in [-1, 1] at `beat`
    pub fn amplitude(&self, beat: f64) -> f64 {
        (TAU * (beat * self.beat_multiplier + self.phase_offset)).sin()
    }
}

/// Start point of a restartable waveform cycle.
///
/// Evaluating relative to `wave_start_beat` keeps the wave at phase 0 on every
/// restart instead of jumping to wherever the free-running phase happens to be.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WaveCycle {
    wave_start_beat: f64,
}

impl WaveCycle {
    pub fn new(wave_start_beat: f64) -> Self {
        Self { wave_start_beat }
    }

    pub fn start_beat(&self) -> f64 {
        self.wave_start_beat
    }

    pub fn restart(&mut self, beat: f64) {
        self.wave_start_beat = beat;
    }

    pub fn position(&self, beat: f64) -> f64 {
        beat - self.wave_start_beat
    }

    pub fn amplitude(&self, waveform: &Waveform, beat: f64) -> f64 {
        waveform.amplitude(self.position(beat))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::approx_eq;
    use more_asserts::{assert_ge, assert_le};

    #[test]
    fn test_unit_sine_quarter_points() {
        let wave = Waveform::default();
        assert_eq!(wave.amplitude(0.0), 0.0);
        assert!(approx_eq!(f64, wave.amplitude(0.25), 1.0, epsilon = 1e-12));
        assert!(approx_eq!(f64, wave.amplitude(0.5), 0.0, epsilon = 1e-12));
        assert!(approx_eq!(f64, wave.amplitude(0.75), -1.0, epsilon = 1e-12));
    }

    #[test]
    fn test_amplitude_bounded_and_repeatable() {
        let wave = Waveform::new(0.3, 2.75);
        for i in 0..1000 {
            let beat = i as f64 * 0.0173 - 3.0;
            let a = wave.amplitude(beat);
            assert_ge!(a, -1.0);
            assert_le!(a, 1.0);
            assert_eq!(a, wave.amplitude(beat));
        }
    }

    #[test]
    fn test_phase_offset_shifts_cycle() {
        let wave = Waveform::new(0.25, 1.0);
        assert!(approx_eq!(f64, wave.amplitude(0.0), 1.0, epsilon = 1e-12));
    }

    #[test]
    fn test_cycle_of() {
        let wave = Waveform::cycle_of(4.0).unwrap();
        assert_eq!(wave.beat_multiplier, 0.25);
        assert!(approx_eq!(f64, wave.amplitude(1.0), 1.0, epsilon = 1e-12));
        assert!(Waveform::cycle_of(0.0).is_err());
        assert!(Waveform::cycle_of(-2.0).is_err());
    }

    #[test]
    fn test_wave_cycle_restarts_at_phase_zero() {
        let wave = Waveform::cycle_of(4.0).unwrap();
        let mut cycle = WaveCycle::default();
        assert!(approx_eq!(f64, cycle.amplitude(&wave, 1.0), 1.0, epsilon = 1e-12));

        cycle.restart(7.3);
        assert_eq!(cycle.position(7.3), 0.0);
        assert_eq!(cycle.amplitude(&wave, 7.3), 0.0);
        assert!(approx_eq!(f64, cycle.amplitude(&wave, 8.3), 1.0, epsilon = 1e-9));
    }
}
