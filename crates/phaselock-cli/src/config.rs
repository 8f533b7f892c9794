use std::path::{Path, PathBuf};

use phaselock_core::{Indexing, Pattern, PhaselockError, TempoClock, VoltageRange, Waveform};
use phaselock_services::{
    Advance, Depth, ExecutionMode, FailurePolicy, Gate, Restart, RestartMode, SequencerLoop,
    TriggerVoice, Voice, WaveOutput, WaveVoice,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Invalid session: {0}")]
    Invalid(String),
    #[error(transparent)]
    Core(#[from] PhaselockError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub bpm: f64,
    pub beats_per_bar: f64,
    pub mode: ExecutionMode,
    /// Stop the session after this many beats
    pub run_beats: f64,
    pub tempo_change: Option<TempoChange>,
    pub dac: DacConfig,
    pub loops: Vec<LoopConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TempoChange {
    pub at_beat: f64,
    pub bpm: f64,
    #[serde(default)]
    pub smooth: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DacConfig {
    pub vref: f64,
    pub default_channel: u8,
}

impl Default for DacConfig {
    fn default() -> Self {
        Self {
            vref: 5.0,
            default_channel: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LoopConfig {
    Counter {
        name: String,
        sequence_length: usize,
        interval_beats: f64,
    },
    Trigger {
        name: String,
        pattern: Vec<f64>,
        step_beats: f64,
        /// Defaults to the subdivision given by `step_beats`
        indexing: Option<Indexing>,
        gate: Option<Gate>,
        #[serde(default)]
        advance: Advance,
        #[serde(default)]
        policy: FailurePolicy,
    },
    Wave {
        name: String,
        sample_rate_hz: f64,
        cycle_beats: f64,
        #[serde(default)]
        phase_offset: f64,
        restart: Option<RestartConfig>,
        channel: Option<u8>,
        #[serde(default)]
        range: VoltageRange,
        #[serde(default)]
        depth: Depth,
        #[serde(default = "default_report_every")]
        report_every: u64,
        seed: Option<u64>,
        #[serde(default)]
        policy: FailurePolicy,
    },
}

/// Restart pattern of a wave loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartConfig {
    pub pattern: Vec<f64>,
    #[serde(default)]
    pub indexing: Indexing,
    #[serde(default)]
    pub mode: RestartMode,
}

impl RestartConfig {
    fn build(&self) -> Result<Restart, PhaselockError> {
        Ok(Restart {
            pattern: Pattern::new(self.pattern.clone())?,
            indexing: self.indexing,
            mode: self.mode,
        })
    }
}

fn default_report_every() -> u64 {
    1
}

const BEAT_PATTERN: [f64; 16] = [
    1.0, 0.0, 1.0, 0.0, 1.0, 1.0, 1.0, 0.0, 1.0, 1.0, 1.0, 0.0, 1.0, 0.0, 0.0, 0.0,
];
const SINE_PATTERN: [f64; 16] = [
    1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0,
];

impl Default for SessionConfig {
    /// Counter, beat-pattern trigger and pattern-restarted sine at 180 bpm
    fn default() -> Self {
        Self {
            bpm: 180.0,
            beats_per_bar: 4.0,
            mode: ExecutionMode::default(),
            run_beats: 32.0,
            tempo_change: None,
            dac: DacConfig::default(),
            loops: vec![
                LoopConfig::Counter {
                    name: "print".into(),
                    sequence_length: 16,
                    interval_beats: 4.0,
                },
                LoopConfig::Trigger {
                    name: "array".into(),
                    pattern: BEAT_PATTERN.to_vec(),
                    step_beats: 1.0,
                    indexing: None,
                    gate: None,
                    advance: Advance::Absolute,
                    policy: FailurePolicy::Continue,
                },
                LoopConfig::Wave {
                    name: "sine".into(),
                    sample_rate_hz: 100.0,
                    cycle_beats: 4.0,
                    phase_offset: 0.0,
                    restart: Some(RestartConfig {
                        pattern: SINE_PATTERN.to_vec(),
                        indexing: Indexing::WholeBeat,
                        mode: RestartMode::Level,
                    }),
                    channel: None,
                    range: VoltageRange::default(),
                    depth: Depth::Fixed(1.0),
                    // 8 reports per second at 100 Hz
                    report_every: 12,
                    seed: None,
                    policy: FailurePolicy::Continue,
                },
            ],
        }
    }
}

impl LoopConfig {
    pub fn name(&self) -> &str {
        match self {
            LoopConfig::Counter { name, .. }
            | LoopConfig::Trigger { name, .. }
            | LoopConfig::Wave { name, .. } => name,
        }
    }

    /// Build the loop; wave sample intervals are converted at the clock's
    /// current tempo
    pub fn build(&self, clock: &TempoClock) -> Result<SequencerLoop, PhaselockError> {
        match self {
            LoopConfig::Counter {
                name,
                sequence_length,
                interval_beats,
            } => SequencerLoop::counter(name.as_str(), *sequence_length, *interval_beats),
            LoopConfig::Trigger {
                name,
                pattern,
                step_beats,
                indexing,
                gate,
                advance,
                policy,
            } => {
                let indexing = indexing.unwrap_or(if *step_beats == 1.0 {
                    Indexing::WholeBeat
                } else {
                    Indexing::Subdivision(*step_beats)
                });
                let voice = TriggerVoice {
                    pattern: Pattern::new(pattern.clone())?,
                    indexing,
                    gate: *gate,
                };
                Ok(SequencerLoop::new(name.as_str(), Voice::Trigger(voice), *step_beats)?
                    .with_advance(*advance)
                    .with_policy(*policy))
            }
            LoopConfig::Wave {
                name,
                sample_rate_hz,
                cycle_beats,
                phase_offset,
                restart,
                channel,
                range,
                depth,
                report_every,
                seed,
                policy,
            } => {
                let waveform = Waveform::cycle_of(*cycle_beats)?;
                let voice = WaveVoice {
                    waveform: Waveform::new(*phase_offset, waveform.beat_multiplier),
                    restart: restart.as_ref().map(RestartConfig::build).transpose()?,
                    output: WaveOutput {
                        channel: *channel,
                        range: VoltageRange::new(range.min, range.max)?,
                    },
                    depth: *depth,
                    report_every: *report_every,
                };
                let mut sequencer =
                    SequencerLoop::wave(name.as_str(), voice, clock, *sample_rate_hz)?;
                if let Some(seed) = seed {
                    sequencer = sequencer.with_seed(*seed);
                }
                Ok(sequencer.with_policy(*policy))
            }
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.run_beats.is_finite() && self.run_beats > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "run_beats must be positive, got {}",
                self.run_beats
            )));
        }
        if !(self.beats_per_bar.is_finite() && self.beats_per_bar > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "beats_per_bar must be positive, got {}",
                self.beats_per_bar
            )));
        }
        if self.loops.is_empty() {
            return Err(ConfigError::Invalid("no loops configured".into()));
        }
        if let Some(change) = self.tempo_change {
            if !(change.at_beat.is_finite() && change.at_beat >= 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "tempo change beat must be non-negative, got {}",
                    change.at_beat
                )));
            }
            TempoClock::new(change.bpm)?;
        }
        Ok(())
    }
}

pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("phaselock")
        .join("session.toml")
}

pub fn parse(path: &Path, contents: &str) -> Result<SessionConfig, ConfigError> {
    let config: SessionConfig = toml::from_str(contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    config.validate()?;
    Ok(config)
}

/// Load an explicit session file, or the default location if it exists
pub fn load_config(explicit: Option<&Path>) -> Result<SessionConfig, ConfigError> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => {
            let path = config_path();
            if !path.exists() {
                return Ok(SessionConfig::default());
            }
            path
        }
    };
    let contents = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;
    parse(&path, &contents)
}
