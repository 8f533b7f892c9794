//! Per-loop absolute target beat

use crate::error::{PhaselockError, Result};

/// Monotonic accumulator of the next beat a loop should wake at.
///
/// Targets are absolute, so an oversleep on one iteration never shifts the
/// following ones.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleCursor {
    target_beat: f64,
    step: f64,
}

impl ScheduleCursor {
    pub fn new(start_beat: f64, step: f64) -> Result<Self> {
        if !start_beat.is_finite() {
            return Err(PhaselockError::invalid(format!(
                "start beat must be finite, got {start_beat}"
            )));
        }
        if !(step.is_finite() && step > 0.0) {
            return Err(PhaselockError::invalid(format!(
                "cursor step must be positive, got {step}"
            )));
        }
        Ok(Self {
            target_beat: start_beat,
            step,
        })
    }

    pub fn target_beat(&self) -> f64 {
        self.target_beat
    }

    pub fn step(&self) -> f64 {
        self.step
    }

    /// Move to the next target and return it
    pub fn advance(&mut self) -> f64 {
        self.target_beat += self.step;
        self.target_beat
    }
}
