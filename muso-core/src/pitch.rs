//! # Pitch Detection Module
//!
//! This module implements the string-guided autocorrelation detector used by
//! the tuner. Rather than searching every possible period, it scores the
//! strings of the current tuning against the incoming audio and then refines
//! around the expected period of the best candidate.
//!
//! ## Features
//! - RMS noise gate for silence and background noise
//! - Candidate re-ranking only when the signal gets louder (a new pluck)
//! - Lag weighting to counter the harmonic bias towards higher strings
//! - Local lag refinement with an early exit on an exact match
//!
//! The detector is stateful: ranking decisions depend on earlier frames, so
//! frames must be fed in order from a single thread.

use std::time::Duration;

use crate::audio::AudioFrame;
use crate::config::DetectorConfig;
use crate::tuning::{TargetNote, Tuning};

/// State carried by the detector from one frame to the next.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectionState {
    /// RMS level of the last frame that made it past the noise gate.
    pub last_rms: f32,
    /// Candidate strings are re-scored until this timestamp.
    pub assess_until: Option<Duration>,
    /// Whether the previous frame scored the candidate strings.
    pub assessed_last_frame: bool,
}

/// Mean absolute difference between a signal and itself shifted by `lag`.
///
/// The comparison runs over the first half of the signal, shortened when the
/// lag would read past its end. Returns `None` for a zero lag or a lag that
/// leaves nothing to compare.
pub fn mean_abs_difference(signal: &[f32], lag: usize) -> Option<f32> {
    let search_size = (signal.len() / 2).min(signal.len().saturating_sub(lag));
    if lag == 0 || search_size == 0 {
        return None;
    }
    let sum: f32 = signal[..search_size]
        .iter()
        .zip(&signal[lag..lag + search_size])
        .map(|(a, b)| (a - b).abs())
        .sum();
    Some(sum / search_size as f32)
}

/// Shortest frame in which every string of `tuning` can be measured.
pub fn min_frame_len(tuning: &Tuning) -> usize {
    tuning
        .strings()
        .iter()
        .map(|s| s.sample_offset * 2)
        .max()
        .unwrap_or(0)
}

/// Autocorrelation pitch detector tuned to the strings of one instrument.
#[derive(Debug, Clone)]
pub struct PitchDetector {
    config: DetectorConfig,
    sample_rate: u32,
    tuning: Tuning,
    /// Indices into `tuning`, best candidate first.
    order: Vec<usize>,
    state: DetectionState,
}

impl PitchDetector {
    /// Creates a detector for `tuning`, whose lags must have been computed
    /// for `sample_rate`.
    pub fn new(tuning: Tuning, sample_rate: u32, config: DetectorConfig) -> Self {
        let order = (0..tuning.len()).collect();
        Self {
            config,
            sample_rate,
            tuning,
            order,
            state: DetectionState::default(),
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn tuning(&self) -> &Tuning {
        &self.tuning
    }

    pub fn state(&self) -> &DetectionState {
        &self.state
    }

    /// Strings in their current ranked order, best candidate first.
    pub fn ranking(&self) -> impl Iterator<Item = &TargetNote> {
        self.order.iter().map(|&i| &self.tuning.strings()[i])
    }

    /// Shortest frame the detector analyses: twice the longest string lag.
    pub fn min_frame_len(&self) -> usize {
        min_frame_len(&self.tuning)
    }

    /// The string the detector currently believes is being played.
    pub fn assumed_string(&self) -> Option<&TargetNote> {
        self.order.first().map(|&i| &self.tuning.strings()[i])
    }

    /// Estimates the fundamental frequency of one frame.
    ///
    /// Returns `None` when the frame is too quiet to analyse. `timestamp` is
    /// the time the frame was taken, on any clock that only moves forward.
    pub fn analyze(&mut self, frame: &AudioFrame, timestamp: Duration) -> Option<f32> {
        let signal = frame.samples();

        // --- Noise Gate ---
        let rms = frame.rms();
        if rms < self.config.noise_floor || self.tuning.is_empty() {
            return None;
        }

        // Every string's period has to fit twice into the frame, or the low
        // strings could never be measured and the ranking would be meaningless.
        if signal.len() < self.min_frame_len() {
            tracing::trace!(len = signal.len(), needed = self.min_frame_len(), "frame too short");
            return None;
        }

        // --- Re-assessment gating ---
        // Only look for a new string when the volume goes up; otherwise the
        // string is assumed to be the same as in the previous frame.
        let was_assessing = self.state.assessed_last_frame;
        if rms > self.state.last_rms + self.config.hysteresis {
            if !was_assessing {
                tracing::debug!(rms, "signal rose, opening assessment window");
            }
            self.state.assess_until = Some(timestamp + self.config.assessment_window());
        }

        let assessing = self
            .state
            .assess_until
            .is_some_and(|until| timestamp < until);

        if assessing {
            self.state.assessed_last_frame = true;
            for target in self.tuning.strings_mut() {
                if !was_assessing {
                    target.accumulated_difference = 0.0;
                }
                // Lower strings have longer lags; weighting by the lag keeps
                // their harmonics from winning over the higher strings.
                if let Some(difference) = mean_abs_difference(signal, target.sample_offset) {
                    target.accumulated_difference += difference * target.sample_offset as f32;
                }
            }
        } else {
            self.state.assessed_last_frame = false;
        }

        // The window just closed, so settle on the best scoring string.
        if was_assessing && !self.state.assessed_last_frame {
            self.rank_candidates();
        }

        // --- Refinement around the assumed string ---
        let expected_lag = self.assumed_string()?.sample_offset;
        let lag = self.refine_lag(signal, expected_lag);

        self.state.last_rms = rms;

        lag.map(|lag| self.sample_rate as f32 / lag as f32)
    }

    fn rank_candidates(&mut self) {
        let strings = self.tuning.strings();
        self.order.sort_by(|&a, &b| {
            strings[a]
                .accumulated_difference
                .total_cmp(&strings[b].accumulated_difference)
        });
        if let Some(best) = self.assumed_string() {
            tracing::debug!(string = %best.name, "assessment window closed");
        }
    }

    /// Sweeps lags around `expected_lag` and returns the one where the signal
    /// best repeats itself, or `None` if no lag in the sweep could be compared.
    fn refine_lag(&self, signal: &[f32], expected_lag: usize) -> Option<usize> {
        let radius = self.config.search_radius;
        let start = expected_lag.saturating_sub(radius).max(1);
        let end = expected_lag + radius;

        let mut best_lag = None;
        let mut smallest_difference = f32::INFINITY;

        for lag in start..=end {
            let Some(difference) = mean_abs_difference(signal, lag) else {
                continue;
            };
            if difference < smallest_difference {
                smallest_difference = difference;
                best_lag = Some(lag);
            }
            if difference < self.config.tolerance {
                // Close enough to a perfect repeat.
                best_lag = Some(lag);
                break;
            }
        }

        best_lag
    }
}
