//! Fixed-length trigger patterns and how beats index into them

use serde::{Deserialize, Serialize};

use crate::error::{PhaselockError, Result};

/// How a sequencer maps its position onto a pattern step
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Indexing {
    /// `floor(beat) mod len`
    #[default]
    WholeBeat,
    /// `floor(beat / size) mod len`
    Subdivision(f64),
    /// Iteration counter mod len, independent of the clock
    Step,
}

impl Indexing {
    pub fn validate(&self) -> Result<()> {
        match *self {
            Indexing::Subdivision(size) if !(size.is_finite() && size > 0.0) => Err(
                PhaselockError::invalid(format!("subdivision must be positive, got {size}")),
            ),
            _ => Ok(()),
        }
    }

    /// Absolute (unwrapped) step number for a beat or iteration
    pub fn step_number(&self, beat: f64, iteration: u64) -> i64 {
        match *self {
            Indexing::WholeBeat => beat.floor() as i64,
            Indexing::Subdivision(size) => (beat / size).floor() as i64,
            Indexing::Step => iteration as i64,
        }
    }
}

/// Ordered trigger values: 0 is inactive, anything positive is active and may
/// double as an amplitude modifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub struct Pattern {
    values: Vec<f64>,
}

impl Pattern {
    pub fn new(values: Vec<f64>) -> Result<Self> {
        if values.is_empty() {
            return Err(PhaselockError::invalid("pattern must have at least one step"));
        }
        if let Some(bad) = values.iter().find(|v| !v.is_finite()) {
            return Err(PhaselockError::invalid(format!(
                "pattern values must be finite, got {bad}"
            )));
        }
        Ok(Self { values })
    }

    /// Build from on/off steps, active steps get 1.0
    pub fn from_gates(gates: &[bool]) -> Result<Self> {
        Self::new(gates.iter().map(|&on| if on { 1.0 } else { 0.0 }).collect())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Always false; kept for API symmetry with `len`
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn value(&self, index: usize) -> f64 {
        self.values[index % self.values.len()]
    }

    pub fn is_active(&self, index: usize) -> bool {
        self.value(index) > 0.0
    }

    /// Wrap an absolute step number into `0..len`
    pub fn wrap(&self, step: i64) -> usize {
        step.rem_euclid(self.values.len() as i64) as usize
    }

    pub fn index_for(&self, indexing: Indexing, beat: f64, iteration: u64) -> usize {
        self.wrap(indexing.step_number(beat, iteration))
    }
}

impl TryFrom<Vec<f64>> for Pattern {
    type Error = PhaselockError;

    fn try_from(values: Vec<f64>) -> Result<Self> {
        Self::new(values)
    }
}

impl From<Pattern> for Vec<f64> {
    fn from(pattern: Pattern) -> Self {
        pattern.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::ScheduleCursor;

    fn sixteen() -> Pattern {
        Pattern::new(vec![
            1.0, 0.0, 1.0, 0.0, 1.0, 1.0, 1.0, 0.0, 1.0, 1.0, 1.0, 0.0, 1.0, 0.0, 0.0, 0.0,
        ])
        .unwrap()
    }

    #[test]
    fn test_rejects_empty_and_non_finite() {
        assert!(matches!(
            Pattern::new(vec![]),
            Err(PhaselockError::InvalidArgument(_))
        ));
        assert!(Pattern::new(vec![1.0, f64::NAN]).is_err());
        assert!(Pattern::from_gates(&[]).is_err());
    }

    #[test]
    fn test_whole_beat_indexing() {
        let pattern = sixteen();
        assert_eq!(pattern.index_for(Indexing::WholeBeat, 0.0, 0), 0);
        assert_eq!(pattern.index_for(Indexing::WholeBeat, 5.99, 0), 5);
        assert_eq!(pattern.index_for(Indexing::WholeBeat, 16.0, 0), 0);
        assert_eq!(pattern.index_for(Indexing::WholeBeat, 33.5, 0), 1);
        assert_eq!(pattern.index_for(Indexing::WholeBeat, -0.5, 0), 15);
        assert!(pattern.is_active(4));
        assert!(!pattern.is_active(3));
    }

    #[test]
    fn test_subdivision_indexing() {
        let pattern = Pattern::from_gates(&[true, false, false, false]).unwrap();
        let half = Indexing::Subdivision(0.5);
        assert_eq!(pattern.index_for(half, 0.0, 0), 0);
        assert_eq!(pattern.index_for(half, 0.5, 0), 1);
        assert_eq!(pattern.index_for(half, 1.75, 0), 3);
        assert_eq!(pattern.index_for(half, 2.0, 0), 0);
        assert!(Indexing::Subdivision(0.0).validate().is_err());
        assert!(Indexing::Subdivision(0.25).validate().is_ok());
    }

    #[test]
    fn test_step_indexing_ignores_beat() {
        let pattern = Pattern::from_gates(&[true, true, false]).unwrap();
        assert_eq!(pattern.index_for(Indexing::Step, 100.3, 4), 1);
        assert_eq!(pattern.index_for(Indexing::Step, 0.0, 6), 0);
    }

    #[test]
    fn test_four_beat_steps_wrap_after_four_iterations() {
        let pattern = sixteen();
        let mut cursor = ScheduleCursor::new(0.0, 4.0).unwrap();
        let indexes: Vec<usize> = (0..4)
            .map(|_| pattern.index_for(Indexing::WholeBeat, cursor.advance(), 0))
            .collect();
        assert_eq!(cursor.target_beat(), 16.0);
        assert_eq!(indexes, vec![4, 8, 12, 0]);
    }

    #[test]
    fn test_try_from_vec_validates() {
        assert_eq!(Pattern::try_from(vec![1.0, 0.0]).unwrap().len(), 2);
        assert!(Pattern::try_from(Vec::<f64>::new()).is_err());
    }
}
