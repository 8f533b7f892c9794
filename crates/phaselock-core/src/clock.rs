//! Tempo clock mapping a monotonic time source onto beats

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{PhaselockError, Result};

/// Source of monotonic timestamps, in seconds since an arbitrary epoch
pub trait TimeSource: Send + Sync + fmt::Debug {
    /// Must never go backwards.
    fn now(&self) -> f64;
}

/// Wall clock backed by `Instant`
#[derive(Debug, Clone, Copy)]
pub struct MonotonicTime {
    epoch: Instant,
}

impl MonotonicTime {
    pub fn new() -> Self {
        Self { epoch: Instant::now() }
    }
}

impl Default for MonotonicTime {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for MonotonicTime {
    fn now(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }
}

/// Settable time source for tests and offline simulation.
///
/// Callers are responsible for only moving it forward.
#[derive(Debug, Default)]
pub struct ManualTime {
    secs_raw: AtomicU64,
}

impl ManualTime {
    pub fn new(start_secs: f64) -> Self {
        Self {
            secs_raw: AtomicU64::new(start_secs.to_bits()),
        }
    }

    pub fn set(&self, secs: f64) {
        self.secs_raw.store(secs.to_bits(), Ordering::SeqCst);
    }

    /// Move time forward, returning the new timestamp
    pub fn advance(&self, secs: f64) -> f64 {
        let result = self.secs_raw.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |raw| {
            Some((f64::from_bits(raw) + secs).to_bits())
        });
        match result {
            Ok(prev) | Err(prev) => f64::from_bits(prev) + secs,
        }
    }
}

impl TimeSource for ManualTime {
    fn now(&self) -> f64 {
        f64::from_bits(self.secs_raw.load(Ordering::SeqCst))
    }
}

/// The affine mapping `beat(t) = (t - origin_time) / beat_duration`.
///
/// Always handled as one value so origin and duration can never be observed
/// from two different tempos.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TempoMap {
    pub bpm: f64,
    pub origin_time: f64,
    /// Seconds per beat, `60 / bpm`
    pub beat_duration: f64,
}

impl TempoMap {
    pub fn new(bpm: f64, origin_time: f64) -> Result<Self> {
        validate_bpm(bpm)?;
        if !origin_time.is_finite() {
            return Err(PhaselockError::invalid(format!(
                "origin time must be finite, got {origin_time}"
            )));
        }
        Ok(Self {
            bpm,
            origin_time,
            beat_duration: 60.0 / bpm,
        })
    }

    pub fn beat_at(&self, timestamp: f64) -> f64 {
        (timestamp - self.origin_time) / self.beat_duration
    }

    pub fn time_at(&self, beat: f64) -> f64 {
        self.origin_time + beat * self.beat_duration
    }
}

fn validate_bpm(bpm: f64) -> Result<()> {
    if bpm.is_finite() && bpm > 0.0 {
        Ok(())
    } else {
        Err(PhaselockError::invalid(format!("bpm must be positive, got {bpm}")))
    }
}

/// Fractional part of a beat position, always in [0, 1)
pub fn phase_of(beat: f64) -> f64 {
    let phase = beat.rem_euclid(1.0);
    // rem_euclid rounds tiny negative inputs up to exactly 1.0
    if phase >= 1.0 { 0.0 } else { phase }
}

/// Shared source of truth for tempo.
///
/// Reads copy the current [`TempoMap`] under a read lock; only
/// [`TempoClock::change_tempo`] takes the write lock.
#[derive(Debug)]
pub struct TempoClock {
    source: Arc<dyn TimeSource>,
    map: RwLock<TempoMap>,
}

impl TempoClock {
    /// Clock on the process monotonic timer, starting at beat 0 now
    pub fn new(bpm: f64) -> Result<Self> {
        Self::with_source(bpm, Arc::new(MonotonicTime::new()))
    }

    pub fn with_source(bpm: f64, source: Arc<dyn TimeSource>) -> Result<Self> {
        let origin = source.now();
        Self::with_origin(bpm, origin, source)
    }

    pub fn with_origin(bpm: f64, origin_time: f64, source: Arc<dyn TimeSource>) -> Result<Self> {
        let map = TempoMap::new(bpm, origin_time)?;
        Ok(Self {
            source,
            map: RwLock::new(map),
        })
    }

    /// Consistent copy of the current tempo mapping
    pub fn snapshot(&self) -> TempoMap {
        *self.map.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn now(&self) -> f64 {
        self.source.now()
    }

    pub fn bpm(&self) -> f64 {
        self.snapshot().bpm
    }

    pub fn beat_duration(&self) -> f64 {
        self.snapshot().beat_duration
    }

    pub fn origin_time(&self) -> f64 {
        self.snapshot().origin_time
    }

    pub fn current_beat(&self) -> f64 {
        let map = self.snapshot();
        map.beat_at(self.source.now())
    }

    pub fn current_bar(&self, beats_per_bar: f64) -> Result<f64> {
        if beats_per_bar.is_nan() || beats_per_bar <= 0.0 {
            return Err(PhaselockError::invalid(format!(
                "beats per bar must be positive, got {beats_per_bar}"
            )));
        }
        Ok(self.current_beat() / beats_per_bar)
    }

    pub fn time_to_beat(&self, timestamp: f64) -> f64 {
        self.snapshot().beat_at(timestamp)
    }

    pub fn beat_to_time(&self, beat: f64) -> f64 {
        self.snapshot().time_at(beat)
    }

    /// Position within the current beat, in [0, 1)
    pub fn phase(&self) -> f64 {
        phase_of(self.current_beat())
    }

    /// First whole beat strictly after the current position
    pub fn next_whole_beat(&self) -> f64 {
        self.current_beat().floor() + 1.0
    }

    pub fn seconds_to_beats(&self, secs: f64) -> f64 {
        secs / self.beat_duration()
    }

    pub fn beats_to_duration(&self, beats: f64) -> Result<Duration> {
        Duration::try_from_secs_f64(beats * self.beat_duration()).map_err(|e| {
            PhaselockError::invalid(format!("cannot express {beats} beats as a duration: {e}"))
        })
    }

    /// Switch to `new_bpm`.
    ///
    /// With `smooth` the origin is moved so the beat position is continuous
    /// across the change; otherwise the beat counter restarts at 0 now.
    pub fn change_tempo(&self, new_bpm: f64, smooth: bool) -> Result<()> {
        validate_bpm(new_bpm)?;
        let beat_duration = 60.0 / new_bpm;

        let mut map = self.map.write().unwrap_or_else(PoisonError::into_inner);
        let now = self.source.now();
        let origin_time = if smooth {
            now - map.beat_at(now) * beat_duration
        } else {
            now
        };
        *map = TempoMap {
            bpm: new_bpm,
            origin_time,
            beat_duration,
        };
        Ok(())
    }
}
