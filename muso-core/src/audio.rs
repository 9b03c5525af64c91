//! # Audio Capture Module
//!
//! This module handles real-time microphone capture using CPAL (Cross-Platform
//! Audio Library) and hands fixed-size frames to the pitch detector.
//!
//! The capture callback keeps a rolling window of the most recent samples. The
//! tuner pulls a copy of that window on its own refresh tick through the
//! [`FrameSource`] trait, so analysis never runs on the audio thread and never
//! sees a partially written frame.
//!
//! ## Features
//! - Automatic audio device selection
//! - Downmixing of multi-channel input to mono
//! - Stream released on stop and on drop

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SupportedStreamConfigRange;

use crate::error::{Error, Result};

/// Default number of samples per analysis frame.
///
/// Half of the frame is compared against a lagged copy of itself, so the
/// longest period the detector can see is a little under 1024 samples.
pub const BUFFER_SIZE: usize = 2048;

/// Preferred capture sample rate in Hz.
pub const TARGET_SAMPLE_RATE: u32 = 44_100;

/// A fixed-length block of mono samples in the range [-1, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Root-mean-square level of the frame.
    pub fn rms(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let sum_squares: f32 = self.samples.iter().map(|&s| s * s).sum();
        (sum_squares / self.samples.len() as f32).sqrt()
    }
}

/// Something the tuner can pull the latest frame from on demand.
///
/// Implementations must return promptly; `None` means no complete frame is
/// available yet.
pub trait FrameSource: Send {
    fn latest_frame(&mut self) -> Option<AudioFrame>;

    fn sample_rate(&self) -> u32;
}

/// Rolling window of the newest `capacity` samples.
#[derive(Debug)]
struct FrameWindow {
    samples: VecDeque<f32>,
    capacity: usize,
}

impl FrameWindow {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, sample: f32) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    fn snapshot(&self) -> Option<Vec<f32>> {
        (self.samples.len() == self.capacity).then(|| self.samples.iter().copied().collect())
    }
}

/// Cloneable, thread-safe view of a running capture.
#[derive(Debug, Clone)]
pub struct CaptureHandle {
    window: Arc<Mutex<FrameWindow>>,
    sample_rate: u32,
}

impl FrameSource for CaptureHandle {
    fn latest_frame(&mut self) -> Option<AudioFrame> {
        let samples = self.window.lock().ok()?.snapshot()?;
        Some(AudioFrame::new(samples, self.sample_rate))
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Owns the microphone stream. Dropping it releases the device.
pub struct MicrophoneCapture {
    stream: Option<cpal::Stream>,
    handle: CaptureHandle,
}

impl MicrophoneCapture {
    /// Starts audio capture from the default input device.
    ///
    /// This function:
    /// 1. Selects the default audio input device
    /// 2. Picks an f32 configuration as close to 44.1 kHz as the device allows
    /// 3. Starts a stream whose callback feeds a rolling window of
    ///    `frame_size` mono samples
    ///
    /// # Returns
    /// * `Ok(capture)` - Running capture; get a [`CaptureHandle`] from it
    /// * `Err(e)` - No device, no usable format, or the stream failed to start
    pub fn start(frame_size: usize) -> Result<Self> {
        let host = cpal::default_host();
        let device = host.default_input_device().ok_or(Error::NoInputDevice)?;

        match device.name() {
            Ok(name) => tracing::info!(device = %name, "using audio input device"),
            Err(e) => tracing::warn!("input device has no readable name: {e}"),
        }

        let configs = device
            .supported_input_configs()
            .map_err(|e| Error::audio("querying input configs", e))?
            .collect::<Vec<_>>();
        let supported_config = find_supported_config(configs, TARGET_SAMPLE_RATE)
            .ok_or_else(|| Error::Audio("no suitable f32 input format found".into()))?;

        let sample_rate = clamp_sample_rate(&supported_config, TARGET_SAMPLE_RATE);
        let config = supported_config.with_sample_rate(cpal::SampleRate(sample_rate));
        let channels = config.channels().max(1) as usize;
        let config: cpal::StreamConfig = config.into();

        tracing::info!(sample_rate, channels, frame_size, "selected input format");

        let window = Arc::new(Mutex::new(FrameWindow::new(frame_size)));
        let callback_window = Arc::clone(&window);

        let err_fn = |err| tracing::error!("an error occurred on the input stream: {err}");

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    // Skip this block rather than block the audio thread on a poisoned lock.
                    let Ok(mut window) = callback_window.lock() else {
                        return;
                    };
                    for block in data.chunks(channels) {
                        let mono = block.iter().sum::<f32>() / block.len() as f32;
                        window.push(mono);
                    }
                },
                err_fn,
                None,
            )
            .map_err(|e| Error::audio("building input stream", e))?;

        stream
            .play()
            .map_err(|e| Error::audio("starting input stream", e))?;

        Ok(Self {
            stream: Some(stream),
            handle: CaptureHandle {
                window,
                sample_rate,
            },
        })
    }

    pub fn handle(&self) -> CaptureHandle {
        self.handle.clone()
    }

    pub fn sample_rate(&self) -> u32 {
        self.handle.sample_rate
    }

    pub fn is_running(&self) -> bool {
        self.stream.is_some()
    }

    /// Stops the stream and releases the microphone. Safe to call repeatedly.
    pub fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.pause() {
                tracing::warn!("error pausing input stream: {e}");
            }
            drop(stream);
            tracing::info!("microphone released");
        }
    }
}

impl Drop for MicrophoneCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Names of the input devices the default host can see.
pub fn list_input_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let devices = host
        .input_devices()
        .map_err(|e| Error::audio("listing input devices", e))?;
    Ok(devices.filter_map(|d| d.name().ok()).collect())
}

/// Finds the best supported input configuration for the target sample rate.
///
/// Only 32-bit float formats are considered. Among those, the configuration
/// closest to the target rate wins (distance 0 when its range contains the
/// target), and on equal distance the one with fewer channels.
fn find_supported_config(
    configs: Vec<SupportedStreamConfigRange>,
    target_rate: u32,
) -> Option<SupportedStreamConfigRange> {
    configs
        .into_iter()
        .filter(|c| c.sample_format() == cpal::SampleFormat::F32)
        .min_by_key(|c| {
            let rate = clamp_sample_rate(c, target_rate);
            let distance = (rate as i64 - target_rate as i64).abs();
            (distance, c.channels())
        })
}

fn clamp_sample_rate(config: &SupportedStreamConfigRange, target_rate: u32) -> u32 {
    target_rate.clamp(config.min_sample_rate().0, config.max_sample_rate().0)
}
