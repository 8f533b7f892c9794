//! Output voltage ranges

use serde::{Deserialize, Serialize};

use crate::error::{PhaselockError, Result};

/// Closed interval of output values a sink accepts or a voice targets
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoltageRange {
    pub min: f64,
    pub max: f64,
}

impl Default for VoltageRange {
    fn default() -> Self {
        Self { min: 0.0, max: 5.0 }
    }
}

impl VoltageRange {
    pub fn new(min: f64, max: f64) -> Result<Self> {
        if !(min.is_finite() && max.is_finite() && min < max) {
            return Err(PhaselockError::invalid(format!(
                "voltage range must satisfy min < max, got {min}..{max}"
            )));
        }
        Ok(Self { min, max })
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    pub fn center(&self) -> f64 {
        (self.max + self.min) / 2.0
    }

    pub fn half_span(&self) -> f64 {
        (self.max - self.min) / 2.0
    }

    /// Map a bipolar value in [-1, 1] onto the range
    pub fn scale_bipolar(&self, amplitude: f64) -> f64 {
        self.center() + amplitude * self.half_span()
    }

    /// Quantize `value` to a DAC code in `0..=max_code`, clamping outside values
    pub fn to_code(&self, value: f64, max_code: u16) -> u16 {
        let normalized = ((value - self.min) / (self.max - self.min)).clamp(0.0, 1.0);
        (normalized * max_code as f64).round() as u16
    }
}
