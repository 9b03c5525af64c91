//! # Tuner Module
//!
//! Ties the pitch detector to the note table. [`Tuner`] turns one frame into
//! an optional [`NoteReading`], and [`TunerSession`] runs a tuner on its own
//! thread at the display refresh rate, pulling the newest frame from a
//! [`FrameSource`] on every tick.
//!
//! Quiet frames produce no reading at all, so listeners only ever see real
//! notes.

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};

use crate::audio::{AudioFrame, FrameSource};
use crate::config::{DetectorConfig, TunerConfig};
use crate::error::{Error, Result};
use crate::pitch::{self, PitchDetector};
use crate::tuning::{self, TargetNote, Tuning};

/// The string the detector believes is sounding, and how far off it is.
#[derive(Debug, Clone, PartialEq)]
pub struct StringMatch {
    /// String label from the tuning, e.g. "a2"
    pub label: String,
    pub target_frequency: f32,
    /// Deviation of the reading from `target_frequency`
    pub cents: f32,
}

/// One tuner update.
#[derive(Debug, Clone, PartialEq)]
pub struct NoteReading {
    /// Detected fundamental in Hz
    pub frequency: f32,
    /// Pitch class of the nearest note, e.g. "F#"
    pub note_name: String,
    pub octave: i32,
    /// Frequency of the nearest note
    pub note_frequency: f32,
    /// Deviation from the nearest note
    pub cents: f32,
    pub string: Option<StringMatch>,
}

impl NoteReading {
    /// Maps a detected frequency to the nearest note, and optionally to the
    /// string it is being tuned towards.
    pub fn from_frequency(
        frequency: f32,
        reference_pitch: f32,
        string: Option<&TargetNote>,
    ) -> Option<Self> {
        let note = tuning::frequency_to_note(frequency, reference_pitch)?;
        let string = string.map(|target| StringMatch {
            label: target.name.clone(),
            target_frequency: target.frequency,
            cents: tuning::calculate_cents_deviation(frequency, target.frequency),
        });

        Some(Self {
            frequency,
            note_name: note.note_name,
            octave: note.octave,
            note_frequency: note.note_frequency,
            cents: note.cents,
            string,
        })
    }

    /// Note name with octave, e.g. "A4".
    pub fn full_name(&self) -> String {
        format!("{}{}", self.note_name, self.octave)
    }
}

/// A pitch detector plus the mapping of its output to notes.
#[derive(Debug, Clone)]
pub struct Tuner {
    detector: PitchDetector,
    reference_pitch: f32,
}

impl Tuner {
    /// Builds a tuner for `config` at the capture's sample rate.
    ///
    /// Fails when `config.frame_size` is too short to hold two periods of the
    /// lowest string at this rate.
    pub fn new(config: &TunerConfig, sample_rate: u32) -> Result<Self> {
        config.validate()?;
        let tuning = Tuning::from_preset(config.preset(), sample_rate, config.reference_pitch);
        let needed = pitch::min_frame_len(&tuning);
        if config.frame_size < needed {
            return Err(Error::InvalidConfig(format!(
                "frame_size {} is too short for {} at {sample_rate} Hz, needs at least {needed}",
                config.frame_size,
                tuning.name()
            )));
        }
        Ok(Self::with_tuning(
            tuning,
            sample_rate,
            config.reference_pitch,
            config.detector.clone(),
        ))
    }

    /// Builds a tuner for a custom tuning.
    pub fn with_tuning(
        tuning: Tuning,
        sample_rate: u32,
        reference_pitch: f32,
        detector: DetectorConfig,
    ) -> Self {
        Self {
            detector: PitchDetector::new(tuning, sample_rate, detector),
            reference_pitch,
        }
    }

    pub fn detector(&self) -> &PitchDetector {
        &self.detector
    }

    pub fn reference_pitch(&self) -> f32 {
        self.reference_pitch
    }

    /// Analyses one frame. Returns `None` when there is no usable signal.
    pub fn process(&mut self, frame: &AudioFrame, timestamp: Duration) -> Option<NoteReading> {
        let frequency = self.detector.analyze(frame, timestamp)?;
        let reading = NoteReading::from_frequency(
            frequency,
            self.reference_pitch,
            self.detector.assumed_string(),
        )?;
        tracing::trace!(frequency, note = %reading.full_name(), cents = reading.cents, "reading");
        Some(reading)
    }
}

/// A tuner running on a dedicated thread.
///
/// Dropping the session stops the thread and drops the frame source with it.
#[derive(Debug)]
pub struct TunerSession {
    shutdown_tx: Sender<()>,
    thread_handle: Option<JoinHandle<()>>,
}

impl TunerSession {
    /// Starts analysing frames from `source` every `config.refresh_interval()`,
    /// handing each reading to `on_reading`.
    pub fn start<F>(
        source: F,
        config: &TunerConfig,
        on_reading: impl FnMut(NoteReading) + Send + 'static,
    ) -> Result<Self>
    where
        F: FrameSource + 'static,
    {
        let tuner = Tuner::new(config, source.sample_rate())?;
        let refresh_interval = config.refresh_interval();
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(1);

        let thread_handle = thread::spawn(move || {
            tracing::info!(tuning = tuner.detector().tuning().name(), "tuner session started");
            let ticker = crossbeam_channel::tick(refresh_interval);
            run_session(tuner, source, on_reading, ticker, shutdown_rx);
            tracing::info!("tuner session finished");
        });

        Ok(Self {
            shutdown_tx,
            thread_handle: Some(thread_handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.thread_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stops the analysis thread and waits for it. Safe to call repeatedly.
    pub fn stop(&mut self) {
        if let Some(handle) = self.thread_handle.take() {
            let _ = self.shutdown_tx.send(());
            if handle.join().is_err() {
                tracing::error!("tuner thread panicked");
            }
        }
    }

    /// Stops this session, then starts a new one in its place.
    pub fn restart<F>(
        &mut self,
        source: F,
        config: &TunerConfig,
        on_reading: impl FnMut(NoteReading) + Send + 'static,
    ) -> Result<()>
    where
        F: FrameSource + 'static,
    {
        self.stop();
        *self = Self::start(source, config, on_reading)?;
        Ok(())
    }
}

impl Drop for TunerSession {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_session<F: FrameSource>(
    mut tuner: Tuner,
    mut source: F,
    mut on_reading: impl FnMut(NoteReading),
    ticker: Receiver<Instant>,
    shutdown: Receiver<()>,
) {
    let origin = Instant::now();
    loop {
        crossbeam_channel::select! {
            recv(ticker) -> _ => {
                if let Some(reading) = source
                    .latest_frame()
                    .and_then(|frame| tuner.process(&frame, origin.elapsed()))
                {
                    on_reading(reading);
                }
            },
            recv(shutdown) -> _ => break,
        }
    }
}
