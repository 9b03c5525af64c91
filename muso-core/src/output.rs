//! # Audio Output Module
//!
//! Owns the cpal output stream that metronome clicks and reference tones are
//! rendered into. The stream's own sample counter is the audio clock: every
//! frame written advances it by exactly `1 / sample_rate` seconds, so a tone
//! scheduled at clock time `t` starts on the frame nearest `t` regardless of
//! when the scheduling call arrived.
//!
//! The main thread keeps the [`ToneOutput`]; worker threads get cloned
//! [`OutputHandle`]s which talk to the callback over a channel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{Receiver, Sender};

use crate::clock::AudioClock;
use crate::error::{Error, Result};
use crate::tone::{Tone, ToneId, ToneMixer, ToneSink};

/// Commands sent from scheduling threads to the audio callback.
#[derive(Debug, Clone, PartialEq)]
enum ToneCommand {
    Schedule(ToneId, Tone),
    Stop(ToneId),
    StopAll,
}

/// Cloneable clock and tone sink backed by a running output stream.
#[derive(Debug, Clone)]
pub struct OutputHandle {
    commands: Sender<ToneCommand>,
    frames_rendered: Arc<AtomicU64>,
    next_id: Arc<AtomicU64>,
    sample_rate: u32,
}

impl OutputHandle {
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn send(&self, command: ToneCommand) {
        // The stream is gone; there is nothing left to start or stop.
        if self.commands.send(command).is_err() {
            tracing::trace!("output stream closed, dropping tone command");
        }
    }
}

impl AudioClock for OutputHandle {
    fn now(&self) -> f64 {
        self.frames_rendered.load(Ordering::Acquire) as f64 / self.sample_rate as f64
    }
}

impl ToneSink for OutputHandle {
    fn schedule(&mut self, tone: Tone) -> ToneId {
        let id = ToneId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.send(ToneCommand::Schedule(id, tone));
        id
    }

    fn stop(&mut self, id: ToneId) {
        self.send(ToneCommand::Stop(id));
    }

    fn stop_all(&mut self) {
        self.send(ToneCommand::StopAll);
    }
}

/// Runs on the audio thread: applies pending commands, then renders.
struct OutputCallback {
    commands: Receiver<ToneCommand>,
    mixer: ToneMixer,
    frames_rendered: Arc<AtomicU64>,
    channels: usize,
    sample_rate: u32,
}

impl OutputCallback {
    fn process(&mut self, data: &mut [f32]) {
        let first_frame = self.frames_rendered.load(Ordering::Acquire);
        let now = first_frame as f64 / self.sample_rate as f64;

        while let Ok(command) = self.commands.try_recv() {
            match command {
                ToneCommand::Schedule(id, mut tone) => {
                    // Already rendered past its start: play it late, not never.
                    if tone.start < now {
                        tracing::debug!(late = now - tone.start, "tone arrived late");
                        tone.start = now;
                    }
                    self.mixer.add(id, tone);
                }
                ToneCommand::Stop(id) => self.mixer.remove(id),
                ToneCommand::StopAll => self.mixer.clear(),
            }
        }

        self.mixer
            .render(data, self.channels, first_frame, self.sample_rate);

        let frames = (data.len() / self.channels) as u64;
        self.frames_rendered
            .store(first_frame + frames, Ordering::Release);
    }
}

/// The output stream. Dropping it silences every tone and releases the device.
pub struct ToneOutput {
    stream: Option<cpal::Stream>,
    handle: OutputHandle,
}

impl ToneOutput {
    /// Opens the default output device and starts rendering silence.
    pub fn open_default() -> Result<Self> {
        let host = cpal::default_host();
        let device = host.default_output_device().ok_or(Error::NoOutputDevice)?;

        match device.name() {
            Ok(name) => tracing::info!(device = %name, "using audio output device"),
            Err(e) => tracing::warn!("output device has no readable name: {e}"),
        }

        let config = device
            .default_output_config()
            .map_err(|e| Error::audio("querying output config", e))?;
        let sample_rate = config.sample_rate().0;
        let channels = config.channels().max(1);

        let stream_config = cpal::StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let (commands_tx, commands_rx) = crossbeam_channel::unbounded();
        let frames_rendered = Arc::new(AtomicU64::new(0));

        let mut callback = OutputCallback {
            commands: commands_rx,
            mixer: ToneMixer::new(),
            frames_rendered: Arc::clone(&frames_rendered),
            channels: channels as usize,
            sample_rate,
        };

        let err_fn = |err| tracing::error!("an error occurred on the output stream: {err}");

        let stream = device
            .build_output_stream(
                &stream_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| callback.process(data),
                err_fn,
                None,
            )
            .map_err(|e| Error::audio("building output stream", e))?;

        stream
            .play()
            .map_err(|e| Error::audio("starting output stream", e))?;

        tracing::info!(sample_rate, channels, "output stream started");

        Ok(Self {
            stream: Some(stream),
            handle: OutputHandle {
                commands: commands_tx,
                frames_rendered,
                next_id: Arc::new(AtomicU64::new(1)),
                sample_rate,
            },
        })
    }

    pub fn handle(&self) -> OutputHandle {
        self.handle.clone()
    }

    pub fn sample_rate(&self) -> u32 {
        self.handle.sample_rate
    }

    /// Silences all tones and closes the stream. Safe to call repeatedly.
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            self.handle.stop_all();
            if let Err(e) = stream.pause() {
                tracing::warn!("error pausing output stream: {e}");
            }
            drop(stream);
            tracing::info!("output stream closed");
        }
    }
}

impl Drop for ToneOutput {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn callback(sample_rate: u32, channels: usize) -> (OutputHandle, OutputCallback) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let frames_rendered = Arc::new(AtomicU64::new(0));
        let handle = OutputHandle {
            commands: tx,
            frames_rendered: Arc::clone(&frames_rendered),
            next_id: Arc::new(AtomicU64::new(1)),
            sample_rate,
        };
        let callback = OutputCallback {
            commands: rx,
            mixer: ToneMixer::new(),
            frames_rendered,
            channels,
            sample_rate,
        };
        (handle, callback)
    }

    #[test]
    fn clock_advances_by_rendered_frames() {
        let (handle, mut callback) = callback(1_000, 2);
        assert_eq!(handle.now(), 0.0);

        let mut buffer = vec![0.0; 2 * 250];
        callback.process(&mut buffer);
        assert_eq!(handle.now(), 0.25);
        callback.process(&mut buffer);
        assert_eq!(handle.now(), 0.5);
    }

    #[test]
    fn scheduled_tone_sounds_and_stop_all_silences() {
        let (mut handle, mut callback) = callback(8_000, 1);
        let first = handle.schedule(Tone::click(1000.0, 0.0));
        let second = handle.schedule(Tone::sustained(220.0, 0.0, None));
        assert_ne!(first, second);

        let mut buffer = vec![0.0; 64];
        callback.process(&mut buffer);
        assert!(buffer.iter().any(|&s| s != 0.0));
        assert_eq!(callback.mixer.active_voices(), 2);

        handle.stop_all();
        callback.process(&mut buffer);
        assert!(buffer.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn tone_scheduled_in_the_past_plays_at_the_cursor() {
        let (mut handle, mut callback) = callback(8_000, 1);
        let mut buffer = vec![0.0; 800];
        callback.process(&mut buffer);
        assert_eq!(handle.now(), 0.1);

        handle.schedule(Tone::click(1000.0, 0.06));
        callback.process(&mut buffer);
        let peak = buffer.iter().fold(0.0_f32, |peak, &s| peak.max(s.abs()));
        assert!(peak > 0.0, "late click was dropped");
    }

    #[test]
    fn stopping_finished_tone_is_benign() {
        let (mut handle, mut callback) = callback(8_000, 1);
        let id = handle.schedule(Tone::click(1000.0, 0.0));

        let mut buffer = vec![0.0; 800]; // 100 ms, longer than the click
        callback.process(&mut buffer);
        assert_eq!(callback.mixer.active_voices(), 0);

        handle.stop(id);
        callback.process(&mut buffer);
        assert!(buffer.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn commands_after_stream_closed_are_dropped() {
        let (mut handle, callback) = callback(8_000, 1);
        drop(callback);
        let id = handle.schedule(Tone::click(500.0, 0.0));
        handle.stop(id);
        handle.stop_all();
    }

    #[test]
    #[ignore] // Requires audio device, run manually with `cargo test -- --ignored`
    fn default_output_opens_and_closes() {
        let mut output = ToneOutput::open_default().unwrap();
        let clock = output.handle();
        std::thread::sleep(std::time::Duration::from_millis(100));
        assert!(clock.now() > 0.0);
        output.close();
        output.close();
    }
}
