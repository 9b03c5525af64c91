use std::f32::consts::TAU;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, TryRecvError};
use muso_core::audio::{AudioFrame, FrameSource};
use muso_core::config::{DetectorConfig, TunerConfig};
use muso_core::{NoteReading, TunerSession};

const SAMPLE_RATE: u32 = 44_100;

/// Frame source whose signal the test can swap at any time.
#[derive(Debug, Clone)]
struct ScriptedSource {
    frame: Arc<Mutex<Option<AudioFrame>>>,
    pulls: Arc<AtomicUsize>,
    released: Arc<AtomicBool>,
}

impl ScriptedSource {
    fn new() -> Self {
        Self {
            frame: Arc::new(Mutex::new(None)),
            pulls: Arc::new(AtomicUsize::new(0)),
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    fn play(&self, frequency: f32, amplitude: f32) {
        let samples = (0..2048)
            .map(|i| amplitude * (TAU * frequency * i as f32 / SAMPLE_RATE as f32).sin())
            .collect();
        *self.frame.lock().unwrap() = Some(AudioFrame::new(samples, SAMPLE_RATE));
    }

    fn pulls(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// A copy the session can own; dropping it marks the source released.
    fn hand_out(&self) -> OwnedSource {
        OwnedSource(self.clone())
    }
}

struct OwnedSource(ScriptedSource);

impl FrameSource for OwnedSource {
    fn latest_frame(&mut self) -> Option<AudioFrame> {
        self.0.pulls.fetch_add(1, Ordering::SeqCst);
        self.0.frame.lock().unwrap().clone()
    }

    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }
}

impl Drop for OwnedSource {
    fn drop(&mut self) {
        self.0.released.store(true, Ordering::SeqCst);
    }
}

fn fast_config(tuning: &str) -> TunerConfig {
    TunerConfig {
        tuning: tuning.into(),
        refresh_interval_ms: 2,
        detector: DetectorConfig {
            assessment_window_ms: 40,
            ..DetectorConfig::default()
        },
        ..TunerConfig::default()
    }
}

/// Waits for a reading that satisfies `accept`.
fn wait_for(
    readings: &Receiver<NoteReading>,
    accept: impl Fn(&NoteReading) -> bool,
) -> NoteReading {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match readings.recv_timeout(remaining) {
            Ok(reading) if accept(&reading) => return reading,
            Ok(_) => continue,
            Err(e) => panic!("no matching reading: {e}"),
        }
    }
}

#[test]
fn session_reports_the_plucked_string() {
    let source = ScriptedSource::new();
    source.play(196.0, 0.4);

    let (readings_tx, readings_rx) = crossbeam_channel::unbounded();
    let mut session = TunerSession::start(source.hand_out(), &fast_config("standard"), move |r| {
        let _ = readings_tx.send(r);
    })
    .unwrap();
    assert!(session.is_running());

    let reading = wait_for(&readings_rx, |r| {
        r.string.as_ref().is_some_and(|s| s.label == "g3")
    });
    assert_eq!(reading.full_name(), "G3");
    assert!((reading.frequency - 196.0).abs() < 196.0 * 0.01);

    session.stop();
    assert!(!session.is_running());
    assert!(source.is_released());

    // The listener went away with the thread.
    while readings_rx.try_recv().is_ok() {}
    assert_eq!(readings_rx.try_recv(), Err(TryRecvError::Disconnected));
}

#[test]
fn silence_and_missing_frames_produce_no_readings() {
    let source = ScriptedSource::new();

    let (readings_tx, readings_rx) = crossbeam_channel::unbounded();
    let session = TunerSession::start(source.hand_out(), &fast_config("standard"), move |r| {
        let _ = readings_tx.send(r);
    })
    .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while source.pulls() < 10 {
        assert!(Instant::now() < deadline, "session never pulled a frame");
        std::thread::sleep(Duration::from_millis(2));
    }
    source.play(110.0, 0.001);
    let pulled = source.pulls();
    while source.pulls() < pulled + 10 {
        assert!(Instant::now() < deadline, "session stopped pulling frames");
        std::thread::sleep(Duration::from_millis(2));
    }

    drop(session);
    assert!(source.is_released());
    assert!(readings_rx.try_iter().next().is_none());
}

#[test]
fn restart_releases_the_previous_source_first() {
    let first = ScriptedSource::new();
    first.play(82.41, 0.5);
    let (readings_tx, readings_rx) = crossbeam_channel::unbounded();

    let tx = readings_tx.clone();
    let mut session = TunerSession::start(first.hand_out(), &fast_config("standard"), move |r| {
        let _ = tx.send(r);
    })
    .unwrap();
    wait_for(&readings_rx, |r| r.full_name() == "E2");

    let second = ScriptedSource::new();
    second.play(73.42, 0.5);
    session
        .restart(second.hand_out(), &fast_config("drop d"), move |r| {
            let _ = readings_tx.send(r);
        })
        .unwrap();
    assert!(first.is_released());
    assert!(!second.is_released());

    let reading = wait_for(&readings_rx, |r| {
        r.string.as_ref().is_some_and(|s| s.label == "d2")
    });
    assert_eq!(reading.full_name(), "D2");
}

#[test]
fn invalid_config_fails_to_start() {
    let source = ScriptedSource::new();
    let config = TunerConfig {
        refresh_interval_ms: 0,
        ..TunerConfig::default()
    };
    let result = TunerSession::start(source.hand_out(), &config, |_| {});
    assert!(result.is_err());
    assert!(source.is_released());
}
