//! Output sinks (DAC channels) driven by sequencer loops

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use phaselock_core::{PhaselockError, VoltageRange};
use thiserror::Error;
use tracing::{trace, warn};

/// Full-scale code of a 12-bit DAC
pub const DAC_MAX_CODE: u16 = 4095;
/// Channels A-D
pub const DAC_CHANNELS: u8 = 4;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SinkError {
    #[error("{what} {value} outside {min}..={max}")]
    OutOfRange {
        what: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("Invalid channel: {0}")]
    InvalidChannel(u8),
    #[error("Sink unavailable: {0}")]
    Unavailable(String),
}

impl SinkError {
    /// Whether the sink can no longer accept any value
    pub fn is_fatal(&self) -> bool {
        matches!(self, SinkError::Unavailable(_))
    }
}

impl From<SinkError> for PhaselockError {
    fn from(err: SinkError) -> Self {
        match err {
            SinkError::OutOfRange { .. } | SinkError::InvalidChannel(_) => {
                PhaselockError::InvalidArgument(err.to_string())
            }
            SinkError::Unavailable(_) => PhaselockError::SinkFailure(err.to_string()),
        }
    }
}

/// Device consuming generated values
pub trait OutputSink: Send {
    /// Write a voltage; `None` targets the device's default channel
    fn set_voltage(&mut self, channel: Option<u8>, volts: f64) -> Result<(), SinkError>;

    /// Write a raw DAC code
    fn set_channel(&mut self, channel: u8, raw_value: u16) -> Result<(), SinkError>;

    fn channel_count(&self) -> u8 {
        DAC_CHANNELS
    }

    /// Drive every channel to zero
    fn release(&mut self) -> Result<(), SinkError> {
        for channel in 0..self.channel_count() {
            self.set_channel(channel, 0)?;
        }
        Ok(())
    }
}

struct SharedSink {
    sink: Mutex<Box<dyn OutputSink>>,
    released: AtomicBool,
}

impl Drop for SharedSink {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let sink = self.sink.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = sink.release() {
            warn!(error = %e, "Failed to release sink on drop");
        }
    }
}

/// Shared handle to one output device.
///
/// The device is released (all channels zeroed) exactly once: explicitly via
/// [`SinkHandle::release`] or when the last handle is dropped.
#[derive(Clone)]
pub struct SinkHandle {
    shared: Arc<SharedSink>,
}

impl SinkHandle {
    pub fn new(sink: impl OutputSink + 'static) -> Self {
        Self {
            shared: Arc::new(SharedSink {
                sink: Mutex::new(Box::new(sink)),
                released: AtomicBool::new(false),
            }),
        }
    }

    pub fn is_released(&self) -> bool {
        self.shared.released.load(Ordering::SeqCst)
    }

    fn with_sink<R>(
        &self,
        f: impl FnOnce(&mut dyn OutputSink) -> Result<R, SinkError>,
    ) -> Result<R, SinkError> {
        if self.is_released() {
            return Err(SinkError::Unavailable("sink released".into()));
        }
        let mut sink = self
            .shared
            .sink
            .lock()
            .map_err(|_| SinkError::Unavailable("sink lock poisoned".into()))?;
        // release may have won the lock while we waited for it
        if self.is_released() {
            return Err(SinkError::Unavailable("sink released".into()));
        }
        f(&mut **sink)
    }

    pub fn set_voltage(&self, channel: Option<u8>, volts: f64) -> Result<(), SinkError> {
        self.with_sink(|sink| sink.set_voltage(channel, volts))
    }

    pub fn set_channel(&self, channel: u8, raw_value: u16) -> Result<(), SinkError> {
        self.with_sink(|sink| sink.set_channel(channel, raw_value))
    }

    /// Zero every channel; later writes fail with `Unavailable`
    pub fn release(&self) -> Result<(), SinkError> {
        if self.shared.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut sink = self
            .shared
            .sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        sink.release()
    }
}

impl std::fmt::Debug for SinkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkHandle")
            .field("released", &self.is_released())
            .finish()
    }
}

#[derive(Debug)]
struct DacState {
    codes: [u16; DAC_CHANNELS as usize],
    writes: u64,
    available: bool,
}

/// Read side of a [`MemoryDac`], usable after the DAC moved into a handle
#[derive(Debug, Clone)]
pub struct DacMonitor {
    state: Arc<Mutex<DacState>>,
}

impl DacMonitor {
    pub fn codes(&self) -> [u16; DAC_CHANNELS as usize] {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).codes
    }

    pub fn writes(&self) -> u64 {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).writes
    }

    /// Simulate the bus going away (or coming back)
    pub fn set_available(&self, available: bool) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .available = available;
    }
}

/// In-memory model of a 4-channel 12-bit DAC with a fixed reference voltage
#[derive(Debug)]
pub struct MemoryDac {
    range: VoltageRange,
    default_channel: u8,
    state: Arc<Mutex<DacState>>,
}

impl MemoryDac {
    pub fn new(vref: f64) -> Result<Self, PhaselockError> {
        Ok(Self {
            range: VoltageRange::new(0.0, vref)?,
            default_channel: 0,
            state: Arc::new(Mutex::new(DacState {
                codes: [0; DAC_CHANNELS as usize],
                writes: 0,
                available: true,
            })),
        })
    }

    pub fn with_default_channel(mut self, channel: u8) -> Result<Self, SinkError> {
        if channel >= DAC_CHANNELS {
            return Err(SinkError::InvalidChannel(channel));
        }
        self.default_channel = channel;
        Ok(self)
    }

    pub fn range(&self) -> VoltageRange {
        self.range
    }

    pub fn monitor(&self) -> DacMonitor {
        DacMonitor {
            state: self.state.clone(),
        }
    }
}

impl OutputSink for MemoryDac {
    fn set_voltage(&mut self, channel: Option<u8>, volts: f64) -> Result<(), SinkError> {
        if !self.range.contains(volts) {
            return Err(SinkError::OutOfRange {
                what: "voltage",
                value: volts,
                min: self.range.min,
                max: self.range.max,
            });
        }
        let code = self.range.to_code(volts, DAC_MAX_CODE);
        self.set_channel(channel.unwrap_or(self.default_channel), code)
    }

    fn set_channel(&mut self, channel: u8, raw_value: u16) -> Result<(), SinkError> {
        if channel >= DAC_CHANNELS {
            return Err(SinkError::InvalidChannel(channel));
        }
        if raw_value > DAC_MAX_CODE {
            return Err(SinkError::OutOfRange {
                what: "code",
                value: raw_value as f64,
                min: 0.0,
                max: DAC_MAX_CODE as f64,
            });
        }
        let mut state = self
            .state
            .lock()
            .map_err(|_| SinkError::Unavailable("dac state poisoned".into()))?;
        if !state.available {
            return Err(SinkError::Unavailable("dac not responding".into()));
        }
        state.codes[channel as usize] = raw_value;
        state.writes += 1;
        trace!(channel, raw_value, "DAC write");
        Ok(())
    }
}
