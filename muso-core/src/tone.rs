//! # Tone Module
//!
//! Tones are the only thing the metronome and the pitch pipe ever ask the
//! audio output to do: start a generator at an exact clock time, shape it with
//! an envelope, and stop it. [`ToneSink`] is that output boundary and
//! [`ToneMixer`] is the sample-accurate renderer behind the cpal
//! implementation.

use std::f64::consts::TAU;

/// Attack of a metronome click, seconds.
pub const CLICK_ATTACK: f64 = 0.001;
/// Time at which a click has decayed to [`CLICK_FLOOR`], seconds.
pub const CLICK_DECAY: f64 = 0.02;
/// Total length of a click, seconds.
pub const CLICK_DURATION: f64 = 0.03;
/// Gain a click decays to before it is cut.
pub const CLICK_FLOOR: f64 = 0.001;

/// Output level of sustained reference tones.
const SUSTAIN_GAIN: f32 = 0.25;
/// Fade applied at both ends of a sustained tone, seconds.
const SUSTAIN_FADE: f64 = 0.005;

/// Identifies a scheduled tone so it can be stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ToneId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Waveform {
    Sine,
    Square,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Envelope {
    /// Full level for the attack, then an exponential fall to [`CLICK_FLOOR`].
    Click,
    /// Constant level with short fades at both ends.
    Sustain,
}

/// A tone generator scheduled on the audio clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tone {
    pub frequency: f32,
    /// Clock time the tone starts, seconds.
    pub start: f64,
    /// Length in seconds; `None` plays until stopped.
    pub duration: Option<f64>,
    pub waveform: Waveform,
    pub envelope: Envelope,
}

impl Tone {
    /// A percussive metronome click starting exactly at `start`.
    pub fn click(frequency: f32, start: f64) -> Self {
        Self {
            frequency,
            start,
            duration: Some(CLICK_DURATION),
            waveform: Waveform::Sine,
            envelope: Envelope::Click,
        }
    }

    /// A square-wave reference tone, optionally limited to `duration` seconds.
    pub fn sustained(frequency: f32, start: f64, duration: Option<f64>) -> Self {
        Self {
            frequency,
            start,
            duration,
            waveform: Waveform::Square,
            envelope: Envelope::Sustain,
        }
    }

    /// Clock time after which the tone is silent.
    pub fn end(&self) -> f64 {
        self.duration.map_or(f64::INFINITY, |d| self.start + d)
    }

    /// Envelope gain at clock time `t`.
    pub fn amplitude_at(&self, t: f64) -> f32 {
        let elapsed = t - self.start;
        if elapsed < 0.0 || t >= self.end() {
            return 0.0;
        }
        match self.envelope {
            Envelope::Click => {
                if elapsed < CLICK_ATTACK {
                    1.0
                } else if elapsed < CLICK_DECAY {
                    let progress = (elapsed - CLICK_ATTACK) / (CLICK_DECAY - CLICK_ATTACK);
                    CLICK_FLOOR.powf(progress) as f32
                } else {
                    CLICK_FLOOR as f32
                }
            }
            Envelope::Sustain => {
                let fade_in = (elapsed / SUSTAIN_FADE).min(1.0);
                let fade_out = ((self.end() - t) / SUSTAIN_FADE).min(1.0);
                SUSTAIN_GAIN * fade_in.min(fade_out) as f32
            }
        }
    }

    /// Output sample at clock time `t`.
    pub fn sample_at(&self, t: f64) -> f32 {
        let gain = self.amplitude_at(t);
        if gain == 0.0 {
            return 0.0;
        }
        let phase = (TAU * self.frequency as f64 * (t - self.start)).sin();
        let wave = match self.waveform {
            Waveform::Sine => phase,
            Waveform::Square => {
                if phase >= 0.0 {
                    1.0
                } else {
                    -1.0
                }
            }
        };
        wave as f32 * gain
    }
}

/// The audio output boundary: start and stop tone generators on the audio clock.
pub trait ToneSink: Send {
    /// Schedules `tone` to sound at `tone.start`.
    fn schedule(&mut self, tone: Tone) -> ToneId;

    /// Stops one tone. Stopping a tone that already finished is a no-op.
    fn stop(&mut self, id: ToneId);

    /// Stops every tone, including those scheduled in the future.
    fn stop_all(&mut self);
}

/// Mixes scheduled tones into interleaved output buffers.
#[derive(Debug, Default)]
pub struct ToneMixer {
    voices: Vec<(ToneId, Tone)>,
}

impl ToneMixer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, id: ToneId, tone: Tone) {
        self.voices.push((id, tone));
    }

    pub fn remove(&mut self, id: ToneId) {
        self.voices.retain(|(voice, _)| *voice != id);
    }

    pub fn clear(&mut self) {
        self.voices.clear();
    }

    pub fn active_voices(&self) -> usize {
        self.voices.len()
    }

    /// Renders `out.len() / channels` frames starting at frame number
    /// `first_frame`, writing the same mono mix to every channel. Voices that
    /// have finished by the end of the buffer are dropped.
    pub fn render(&mut self, out: &mut [f32], channels: usize, first_frame: u64, sample_rate: u32) {
        let channels = channels.max(1);
        let rate = sample_rate as f64;

        for (i, frame) in out.chunks_mut(channels).enumerate() {
            let t = (first_frame + i as u64) as f64 / rate;
            let mixed: f32 = self.voices.iter().map(|(_, tone)| tone.sample_at(t)).sum();
            frame.fill(mixed.clamp(-1.0, 1.0));
        }

        let frames = (out.len() / channels) as u64;
        let buffer_end = (first_frame + frames) as f64 / rate;
        self.voices.retain(|(_, tone)| tone.end() > buffer_end);
    }
}
