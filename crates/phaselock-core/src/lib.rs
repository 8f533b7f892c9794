//! phaselock-core: Tempo clock and musical-time domain types

pub mod clock;
mod cursor;
mod error;
pub mod pattern;
mod range;
pub mod waveform;

pub use clock::{ManualTime, MonotonicTime, TempoClock, TempoMap, TimeSource};
pub use cursor::ScheduleCursor;
pub use error::{PhaselockError, Result};
pub use pattern::{Indexing, Pattern};
pub use range::VoltageRange;
pub use waveform::{WaveCycle, Waveform};
