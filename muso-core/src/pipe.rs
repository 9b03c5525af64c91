//! # Pitch Pipe Module
//!
//! Plays reference tones for the strings of a tuning. At most one tone sounds
//! at a time: choosing a new string stops the previous tone first, and
//! choosing the sounding string again silences it.

use std::time::Duration;

use crate::clock::AudioClock;
use crate::error::{Error, Result};
use crate::tone::{Tone, ToneId, ToneSink};
use crate::tuning::Tuning;

#[derive(Debug, Clone, PartialEq)]
struct Playing {
    label: String,
    id: ToneId,
    end: f64,
}

/// Reference tone player for one tuning.
pub struct PitchPipe<C: AudioClock, S: ToneSink> {
    clock: C,
    sink: S,
    tuning: Tuning,
    playing: Option<Playing>,
}

impl<C: AudioClock, S: ToneSink> PitchPipe<C, S> {
    pub fn new(tuning: Tuning, clock: C, sink: S) -> Self {
        Self {
            clock,
            sink,
            tuning,
            playing: None,
        }
    }

    pub fn tuning(&self) -> &Tuning {
        &self.tuning
    }

    /// Label of the string currently sounding, if any.
    pub fn playing(&self) -> Option<&str> {
        let now = self.clock.now();
        self.playing
            .as_ref()
            .filter(|playing| playing.end > now)
            .map(|playing| playing.label.as_str())
    }

    /// Starts the tone for `label`, stopping whatever was playing.
    ///
    /// With a `duration` the tone stops by itself; otherwise it sounds until
    /// [`PitchPipe::stop`] or until another string is chosen.
    pub fn play(&mut self, label: &str, duration: Option<Duration>) -> Result<ToneId> {
        let frequency = self
            .tuning
            .get(label)
            .ok_or_else(|| Error::InvalidNoteName(label.to_string()))?
            .frequency;

        self.stop();

        let tone = Tone::sustained(
            frequency,
            self.clock.now(),
            duration.map(|d| d.as_secs_f64()),
        );
        let id = self.sink.schedule(tone);
        tracing::debug!(string = label, frequency, "reference tone started");

        self.playing = Some(Playing {
            label: label.to_string(),
            id,
            end: tone.end(),
        });
        Ok(id)
    }

    /// Plays `label`, or silences it if it is the string already sounding.
    ///
    /// Returns the new tone, or `None` when the call silenced the pipe.
    pub fn toggle(&mut self, label: &str) -> Result<Option<ToneId>> {
        if self.playing() == Some(label) {
            self.stop();
            return Ok(None);
        }
        self.play(label, None).map(Some)
    }

    /// Silences the current tone. A tone that already ran out is fine to stop.
    pub fn stop(&mut self) {
        if let Some(playing) = self.playing.take() {
            self.sink.stop(playing.id);
        }
    }
}

impl<C: AudioClock, S: ToneSink> Drop for PitchPipe<C, S> {
    fn drop(&mut self) {
        self.stop();
    }
}
