use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use assert_approx_eq::assert_approx_eq;
use muso_core::clock::{AudioClock, ManualClock};
use muso_core::config::MetronomeConfig;
use muso_core::metronome::MetronomeState;
use muso_core::tone::{Tone, ToneId, ToneSink};
use muso_core::{Beat, Error, MetronomeDriver, MetronomeScheduler};

#[derive(Debug, Default)]
struct SinkLog {
    next_id: u64,
    scheduled: Vec<(ToneId, Tone)>,
    stopped: Vec<ToneId>,
}

/// Shared output that remembers every tone it was asked to play or stop.
#[derive(Debug, Clone, Default)]
struct RecordingSink {
    log: Arc<Mutex<SinkLog>>,
}

impl RecordingSink {
    fn scheduled_ids(&self) -> Vec<ToneId> {
        let log = self.log.lock().unwrap();
        log.scheduled.iter().map(|(id, _)| *id).collect()
    }

    /// Tones never stopped that still sound at or after `time`.
    fn audible_after(&self, time: f64) -> Vec<(ToneId, Tone)> {
        let log = self.log.lock().unwrap();
        log.scheduled
            .iter()
            .filter(|(id, tone)| !log.stopped.contains(id) && tone.end() > time)
            .copied()
            .collect()
    }
}

impl ToneSink for RecordingSink {
    fn schedule(&mut self, tone: Tone) -> ToneId {
        let mut log = self.log.lock().unwrap();
        log.next_id += 1;
        let id = ToneId(log.next_id);
        log.scheduled.push((id, tone));
        id
    }

    fn stop(&mut self, id: ToneId) {
        self.log.lock().unwrap().stopped.push(id);
    }

    fn stop_all(&mut self) {
        let mut log = self.log.lock().unwrap();
        let ids: Vec<ToneId> = log.scheduled.iter().map(|(id, _)| *id).collect();
        log.stopped.extend(ids);
    }
}

/// Manual clock that counts how often it is read.
#[derive(Debug, Clone, Default)]
struct CountingClock {
    clock: ManualClock,
    reads: Arc<AtomicUsize>,
}

impl CountingClock {
    fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl AudioClock for CountingClock {
    fn now(&self) -> f64 {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.clock.now()
    }
}

fn config(tempo: f64, beats_per_bar: u32) -> MetronomeConfig {
    MetronomeConfig {
        tempo,
        beats_per_bar,
        lookahead_ms: 1,
        ..MetronomeConfig::default()
    }
}

fn spawn(config: &MetronomeConfig, clock: &ManualClock, sink: &RecordingSink) -> MetronomeDriver {
    let scheduler = MetronomeScheduler::new(config, clock.clone(), sink.clone()).unwrap();
    MetronomeDriver::spawn(scheduler, config.lookahead())
}

/// Waits until the poll thread has scheduled everything due at the current
/// clock time.
fn settle(driver: &MetronomeDriver, clock: &ManualClock) -> (MetronomeState, Vec<Beat>) {
    let horizon = clock.now() + MetronomeConfig::default().schedule_ahead;
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let (state, history) = driver.snapshot().unwrap();
        if !state.running || state.next_beat_time >= horizon {
            return (state, history);
        }
        assert!(Instant::now() < deadline, "driver never caught up");
        thread::sleep(Duration::from_millis(1));
    }
}

/// Advances the clock in uneven steps, letting the driver catch up each time.
fn run_until(driver: &MetronomeDriver, clock: &ManualClock, until: f64) -> Vec<Beat> {
    let mut step = 0u64;
    // Also makes sure an earlier start() has been handled.
    let mut history = settle(driver, clock).1;
    while clock.now() < until {
        let jitter = ((step * 7919) % 17) as f64 * 0.002;
        clock.advance(0.02 + jitter);
        history = settle(driver, clock).1;
        step += 1;
    }
    history
}

#[test]
fn driver_keeps_exact_intervals_under_jittery_polling() {
    let clock = ManualClock::new(3.0);
    let sink = RecordingSink::default();
    let driver = spawn(&config(120.0, 4), &clock, &sink);

    driver.start().unwrap();
    let history = run_until(&driver, &clock, 14.0);

    assert!(history.len() >= 20, "only {} beats", history.len());
    assert_approx_eq!(history[0].scheduled_time, 3.05, 1e-9);
    for pair in history.windows(2) {
        assert_approx_eq!(pair[1].scheduled_time - pair[0].scheduled_time, 0.5, 1e-9);
    }
    for (n, beat) in history.iter().enumerate() {
        assert_eq!(beat.beat_index, n as u32 % 4);
    }
    driver.shutdown();
}

#[test]
fn replacing_a_metronome_leaks_no_ticks() {
    let clock = ManualClock::new(0.0);
    let sink = RecordingSink::default();

    let first = spawn(&config(240.0, 3), &clock, &sink);
    first.start().unwrap();
    run_until(&first, &clock, 1.31);
    first.stop().unwrap();
    let (state, _) = first.snapshot().unwrap();
    assert!(!state.running);
    let old_ids = sink.scheduled_ids();
    first.shutdown();

    let switch_time = clock.now();
    assert!(sink.audible_after(switch_time).is_empty());

    let second = spawn(&config(240.0, 3), &clock, &sink);
    second.start().unwrap();
    let history = run_until(&second, &clock, 3.0);

    assert_eq!(history[0].beat_index, 0);
    assert_approx_eq!(history[0].scheduled_time, switch_time + 0.05, 1e-9);
    for (n, beat) in history.iter().enumerate() {
        assert_eq!(beat.beat_index, n as u32 % 3);
    }

    let audible = sink.audible_after(switch_time);
    assert!(audible.iter().all(|(id, _)| !old_ids.contains(id)));
    assert_eq!(audible.len(), history.len());
    second.shutdown();
}

#[test]
fn tempo_change_applies_after_already_scheduled_beats() {
    let clock = ManualClock::new(0.0);
    let sink = RecordingSink::default();
    let driver = spawn(&config(120.0, 4), &clock, &sink);

    driver.start().unwrap();
    let before = run_until(&driver, &clock, 2.0);
    driver.set_tempo(60.0).unwrap();
    let after = run_until(&driver, &clock, 8.0);

    assert_eq!(&after[..before.len()], &before[..]);
    let tail = &after[before.len()..];
    assert!(tail.len() >= 4);
    // The beat already queued when the tempo changed keeps the old spacing.
    assert_approx_eq!(
        tail[0].scheduled_time - before[before.len() - 1].scheduled_time,
        0.5,
        1e-9
    );
    for pair in tail.windows(2) {
        assert_approx_eq!(pair[1].scheduled_time - pair[0].scheduled_time, 1.0, 1e-9);
    }
    driver.shutdown();
}

#[test]
fn invalid_settings_are_rejected_by_the_driver() {
    let clock = ManualClock::new(0.0);
    let sink = RecordingSink::default();
    let driver = spawn(&config(90.0, 4), &clock, &sink);

    assert!(matches!(driver.set_tempo(0.0), Err(Error::InvalidTempo(_))));
    assert!(matches!(driver.set_beats_per_bar(0), Err(Error::InvalidBeatsPerBar(0))));
    assert!(matches!(
        driver.set_accent_beats(&[4]),
        Err(Error::InvalidAccent { beat: 4, beats_per_bar: 4 })
    ));

    let (state, history) = driver.snapshot().unwrap();
    assert_eq!(state.tempo, 90.0);
    assert_eq!(state.beats_per_bar, 4);
    assert!(state.accent_beats.is_empty());
    assert!(history.is_empty());
}

#[test]
fn accents_reach_the_listener_from_the_next_beat() {
    let clock = ManualClock::new(0.0);
    let sink = RecordingSink::default();
    let config = config(120.0, 4);

    let (beats_tx, beats_rx) = crossbeam_channel::unbounded();
    let mut scheduler = MetronomeScheduler::new(&config, clock.clone(), sink.clone()).unwrap();
    scheduler.set_listener(move |beat| {
        let _ = beats_tx.send(beat.clone());
    });
    let driver = MetronomeDriver::spawn(scheduler, config.lookahead());

    driver.start().unwrap();
    let before = run_until(&driver, &clock, 1.0);
    driver.set_accent_beats(&[1, 3]).unwrap();
    let after = run_until(&driver, &clock, 5.0);
    driver.shutdown();

    let heard: Vec<Beat> = beats_rx.try_iter().collect();
    assert_eq!(heard, after);
    assert!(before.iter().all(|beat| !beat.is_accented));
    for beat in &after[before.len()..] {
        assert_eq!(beat.is_accented, beat.beat_index == 1 || beat.beat_index == 3);
    }
}

#[test]
fn dropping_the_driver_silences_pending_clicks() {
    let clock = ManualClock::new(0.0);
    let sink = RecordingSink::default();
    let driver = spawn(&config(600.0, 4), &clock, &sink);

    driver.start().unwrap();
    settle(&driver, &clock);
    assert!(!sink.audible_after(clock.now()).is_empty());

    drop(driver);
    assert!(sink.audible_after(clock.now()).is_empty());
}

#[test]
fn stopped_driver_does_not_poll() {
    let clock = CountingClock::default();
    let sink = RecordingSink::default();
    let config = config(120.0, 4);
    let scheduler = MetronomeScheduler::new(&config, clock.clone(), sink.clone()).unwrap();
    let driver = MetronomeDriver::spawn(scheduler, config.lookahead());

    thread::sleep(Duration::from_millis(50));
    driver.snapshot().unwrap();
    assert_eq!(clock.reads(), 0);

    driver.start().unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    let started = clock.reads();
    while clock.reads() < started + 10 {
        assert!(Instant::now() < deadline, "running driver stopped polling");
        thread::sleep(Duration::from_millis(1));
    }

    driver.stop().unwrap();
    driver.snapshot().unwrap();
    let stopped = clock.reads();
    thread::sleep(Duration::from_millis(50));
    driver.snapshot().unwrap();
    assert_eq!(clock.reads(), stopped);
    driver.shutdown();
}
