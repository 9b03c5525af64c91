//! # Configuration Module
//!
//! Every option the tuner and the metronome recognise, with its default.
//! Configurations deserialize from JSON with missing fields filled from
//! [`Default`], and are validated before anything is built from them.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::audio::BUFFER_SIZE;
use crate::error::{Error, Result};
use crate::metronome::{validate_accents, validate_beats_per_bar, validate_tempo};
use crate::tuning::{TuningPreset, TUNING_PITCH};

/// Smallest frame the detector accepts.
const MIN_FRAME_SIZE: usize = 64;

/// Pitch detector thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Frames with an RMS level below this are treated as silence.
    pub noise_floor: f32,
    /// RMS rise over the previous frame that starts a new assessment window.
    pub hysteresis: f32,
    /// How long candidate strings keep being scored once a window opens.
    pub assessment_window_ms: u64,
    /// Lags either side of the expected string lag searched during refinement.
    pub search_radius: usize,
    /// Mean difference below which a lag counts as an exact match.
    pub tolerance: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            noise_floor: 0.008,
            hysteresis: 0.006,
            assessment_window_ms: 250,
            search_radius: 10,
            tolerance: 0.001,
        }
    }
}

impl DetectorConfig {
    pub fn assessment_window(&self) -> Duration {
        Duration::from_millis(self.assessment_window_ms)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("noise_floor", self.noise_floor),
            ("hysteresis", self.hysteresis),
            ("tolerance", self.tolerance),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(Error::InvalidConfig(format!("{name} must be >= 0, got {value}")));
            }
        }
        Ok(())
    }
}

/// Tuner session settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunerConfig {
    /// Preset name; unknown names fall back to standard tuning.
    pub tuning: String,
    /// Frequency of A4 in Hz.
    pub reference_pitch: f32,
    /// Samples per analysis frame.
    pub frame_size: usize,
    /// Interval between analysis passes (display refresh rate).
    pub refresh_interval_ms: u64,
    pub detector: DetectorConfig,
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            tuning: TuningPreset::Standard.name().to_string(),
            reference_pitch: TUNING_PITCH,
            frame_size: BUFFER_SIZE,
            refresh_interval_ms: 16,
            detector: DetectorConfig::default(),
        }
    }
}

impl TunerConfig {
    pub fn preset(&self) -> TuningPreset {
        TuningPreset::from_name(&self.tuning)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.reference_pitch.is_finite() || self.reference_pitch <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "reference_pitch must be > 0, got {}",
                self.reference_pitch
            )));
        }
        if self.frame_size < MIN_FRAME_SIZE {
            return Err(Error::InvalidConfig(format!(
                "frame_size must be at least {MIN_FRAME_SIZE}, got {}",
                self.frame_size
            )));
        }
        if self.refresh_interval_ms == 0 {
            return Err(Error::InvalidConfig("refresh_interval_ms must be > 0".into()));
        }
        self.detector.validate()
    }
}

/// Metronome settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetronomeConfig {
    /// Beats per minute.
    pub tempo: f64,
    pub beats_per_bar: u32,
    /// Beat indices (0-based) sounded with the accent tone.
    pub accent_beats: Vec<u32>,
    /// Tone for ordinary beats, Hz.
    pub default_frequency: f32,
    /// Tone for the first beat of each bar, Hz.
    pub downbeat_frequency: f32,
    /// Tone for accented beats, Hz.
    pub accent_frequency: f32,
    /// Poll interval of the scheduling timer.
    pub lookahead_ms: u64,
    /// How far ahead of the audio clock beats are scheduled, seconds.
    pub schedule_ahead: f64,
    /// Delay between `start` and the first beat, seconds.
    pub start_delay: f64,
}

impl Default for MetronomeConfig {
    fn default() -> Self {
        Self {
            tempo: 120.0,
            beats_per_bar: 4,
            accent_beats: Vec::new(),
            default_frequency: 500.0,
            downbeat_frequency: 1000.0,
            accent_frequency: 1400.0,
            lookahead_ms: 25,
            schedule_ahead: 0.1,
            start_delay: 0.05,
        }
    }
}

impl MetronomeConfig {
    pub fn lookahead(&self) -> Duration {
        Duration::from_millis(self.lookahead_ms)
    }

    pub fn validate(&self) -> Result<()> {
        validate_tempo(self.tempo)?;
        validate_beats_per_bar(self.beats_per_bar)?;
        validate_accents(&self.accent_beats, self.beats_per_bar)?;

        for (name, value) in [
            ("default_frequency", self.default_frequency),
            ("downbeat_frequency", self.downbeat_frequency),
            ("accent_frequency", self.accent_frequency),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(Error::InvalidConfig(format!("{name} must be > 0, got {value}")));
            }
        }
        if self.lookahead_ms == 0 {
            return Err(Error::InvalidConfig("lookahead_ms must be > 0".into()));
        }
        if !self.schedule_ahead.is_finite() || self.schedule_ahead <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "schedule_ahead must be > 0, got {}",
                self.schedule_ahead
            )));
        }
        if !self.start_delay.is_finite() || self.start_delay < 0.0 {
            return Err(Error::InvalidConfig(format!(
                "start_delay must be >= 0, got {}",
                self.start_delay
            )));
        }
        Ok(())
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub tuner: TunerConfig,
    pub metronome: MetronomeConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        self.tuner.validate()?;
        self.metronome.validate()
    }

    /// Loads and validates a configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let mut file = File::open(path.as_ref())?;
        let mut data = String::new();
        file.read_to_string(&mut data)?;
        let config: AppConfig = serde_json::from_str(&data)?;
        config.validate()?;
        tracing::debug!(path = %path.as_ref().display(), "configuration loaded");
        Ok(config)
    }

    /// Writes the configuration as pretty-printed JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json_string = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path.as_ref())?;
        file.write_all(json_string.as_bytes())?;
        Ok(())
    }
}
