//! # Metronome Module
//!
//! A lookahead metronome. Two clocks are involved:
//!
//! - a coarse poll timer (every 25 ms by default) that only decides *when to
//!   schedule*, and
//! - the audio clock, on which every click is placed at an exact time.
//!
//! Each poll schedules all beats falling inside the next `schedule_ahead`
//! seconds of audio clock time. Beat times are accumulated from the previous
//! beat time, never from when the poll happened to run, so a late poll costs
//! nothing but lookahead and timing errors cannot build up.
//!
//! The scheduling step itself ([`schedule_ahead`]) is a plain function over a
//! [`MetronomeState`] record. [`MetronomeScheduler`] adds the clock, the tone
//! output and listeners around it, and [`MetronomeDriver`] runs a scheduler
//! on its own poll thread.

use std::collections::BTreeSet;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};

use crate::clock::AudioClock;
use crate::config::MetronomeConfig;
use crate::error::{Error, Result};
use crate::tone::{Tone, ToneId, ToneSink};

/// Fastest tempo the metronome accepts, BPM.
pub const MAX_TEMPO: f64 = 1000.0;

/// Longest bar the metronome accepts.
pub const MAX_BEATS_PER_BAR: u32 = 64;

pub fn validate_tempo(tempo: f64) -> Result<()> {
    if tempo.is_finite() && tempo > 0.0 && tempo <= MAX_TEMPO {
        Ok(())
    } else {
        Err(Error::InvalidTempo(tempo))
    }
}

pub fn validate_beats_per_bar(beats_per_bar: u32) -> Result<()> {
    if (1..=MAX_BEATS_PER_BAR).contains(&beats_per_bar) {
        Ok(())
    } else {
        Err(Error::InvalidBeatsPerBar(beats_per_bar))
    }
}

pub fn validate_accents(accents: &[u32], beats_per_bar: u32) -> Result<()> {
    match accents.iter().find(|&&beat| beat >= beats_per_bar) {
        Some(&beat) => Err(Error::InvalidAccent {
            beat,
            beats_per_bar,
        }),
        None => Ok(()),
    }
}

/// What a beat sounds like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeatRole {
    /// First beat of the bar
    Downbeat,
    Accent,
    Ordinary,
}

/// One scheduled beat. Never modified once emitted.
#[derive(Debug, Clone, PartialEq)]
pub struct Beat {
    /// Position in the bar, `0..beats_per_bar`
    pub beat_index: u32,
    pub beats_per_bar: u32,
    /// Audio clock time of the click, seconds
    pub scheduled_time: f64,
    pub is_accented: bool,
}

impl Beat {
    /// The downbeat takes precedence over an accent on beat 0.
    pub fn role(&self) -> BeatRole {
        if self.beat_index == 0 {
            BeatRole::Downbeat
        } else if self.is_accented {
            BeatRole::Accent
        } else {
            BeatRole::Ordinary
        }
    }
}

/// Everything the scheduling step reads and advances.
#[derive(Debug, Clone, PartialEq)]
pub struct MetronomeState {
    pub tempo: f64,
    pub beats_per_bar: u32,
    pub accent_beats: BTreeSet<u32>,
    pub running: bool,
    /// Audio clock time of the next beat to schedule
    pub next_beat_time: f64,
    /// Index of the next beat to schedule, always `< beats_per_bar`
    pub current_beat: u32,
}

impl MetronomeState {
    pub fn new(tempo: f64, beats_per_bar: u32, accent_beats: &[u32]) -> Result<Self> {
        validate_tempo(tempo)?;
        validate_beats_per_bar(beats_per_bar)?;
        validate_accents(accent_beats, beats_per_bar)?;
        Ok(Self {
            tempo,
            beats_per_bar,
            accent_beats: accent_beats.iter().copied().collect(),
            running: false,
            next_beat_time: 0.0,
            current_beat: 0,
        })
    }

    pub fn seconds_per_beat(&self) -> f64 {
        60.0 / self.tempo
    }
}

/// Emits every beat due before `horizon` and advances the state past them.
///
/// The beat interval is read from the current tempo after each beat, so tempo
/// changes apply from the next beat onwards.
pub fn schedule_ahead(state: &mut MetronomeState, horizon: f64) -> Vec<Beat> {
    let mut beats = Vec::new();
    if !state.running {
        return beats;
    }

    while state.next_beat_time < horizon {
        beats.push(Beat {
            beat_index: state.current_beat,
            beats_per_bar: state.beats_per_bar,
            scheduled_time: state.next_beat_time,
            is_accented: state.accent_beats.contains(&state.current_beat),
        });

        state.next_beat_time += state.seconds_per_beat();
        state.current_beat += 1;
        if state.current_beat >= state.beats_per_bar {
            state.current_beat = 0;
        }
    }

    beats
}

/// Tone frequencies per beat role, Hz.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClickTones {
    pub ordinary: f32,
    pub downbeat: f32,
    pub accent: f32,
}

impl ClickTones {
    pub fn frequency(&self, role: BeatRole) -> f32 {
        match role {
            BeatRole::Downbeat => self.downbeat,
            BeatRole::Accent => self.accent,
            BeatRole::Ordinary => self.ordinary,
        }
    }
}

impl From<&MetronomeConfig> for ClickTones {
    fn from(config: &MetronomeConfig) -> Self {
        Self {
            ordinary: config.default_frequency,
            downbeat: config.downbeat_frequency,
            accent: config.accent_frequency,
        }
    }
}

type BeatListener = Box<dyn FnMut(&Beat) + Send>;

/// A metronome bound to an audio clock and a tone output.
///
/// `poll` must be called periodically (more often than `schedule_ahead`
/// seconds) while running, and never from two threads at once.
pub struct MetronomeScheduler<C, S> {
    clock: C,
    sink: S,
    state: MetronomeState,
    tones: ClickTones,
    schedule_ahead: f64,
    start_delay: f64,
    history: Vec<Beat>,
    /// Clicks that may still be sounding, with their end times.
    pending: Vec<(ToneId, f64)>,
    listener: Option<BeatListener>,
}

impl<C: AudioClock, S: ToneSink> MetronomeScheduler<C, S> {
    pub fn new(config: &MetronomeConfig, clock: C, sink: S) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            clock,
            sink,
            state: MetronomeState::new(config.tempo, config.beats_per_bar, &config.accent_beats)?,
            tones: ClickTones::from(config),
            schedule_ahead: config.schedule_ahead,
            start_delay: config.start_delay,
            history: Vec::new(),
            pending: Vec::new(),
            listener: None,
        })
    }

    /// Registers the callback invoked for every beat as it is scheduled.
    pub fn set_listener(&mut self, listener: impl FnMut(&Beat) + Send + 'static) {
        self.listener = Some(Box::new(listener));
    }

    pub fn state(&self) -> &MetronomeState {
        &self.state
    }

    pub fn is_running(&self) -> bool {
        self.state.running
    }

    /// Every beat emitted so far, oldest first.
    pub fn history(&self) -> &[Beat] {
        &self.history
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Starts from beat 0 a short delay after the current clock time.
    ///
    /// A running metronome is stopped first, so none of its clicks survive.
    pub fn start(&mut self) {
        if self.state.running {
            self.stop();
        }
        self.state.running = true;
        self.state.current_beat = 0;
        self.state.next_beat_time = self.clock.now() + self.start_delay;
        tracing::info!(
            tempo = self.state.tempo,
            beats_per_bar = self.state.beats_per_bar,
            "metronome started"
        );
    }

    /// Stops scheduling and silences clicks that have not finished yet.
    pub fn stop(&mut self) {
        if !self.state.running {
            return;
        }
        self.state.running = false;
        for (id, _) in self.pending.drain(..) {
            self.sink.stop(id);
        }
        tracing::info!("metronome stopped");
    }

    /// Schedules every beat due within the lookahead window.
    ///
    /// Returns the beats scheduled by this call.
    pub fn poll(&mut self) -> &[Beat] {
        let now = self.clock.now();
        self.pending.retain(|&(_, end)| end > now);

        let beats = schedule_ahead(&mut self.state, now + self.schedule_ahead);
        let first_new = self.history.len();

        for beat in beats {
            let tone = Tone::click(self.tones.frequency(beat.role()), beat.scheduled_time);
            let id = self.sink.schedule(tone);
            self.pending.push((id, tone.end()));

            tracing::trace!(beat = beat.beat_index, time = beat.scheduled_time, "beat scheduled");
            if let Some(listener) = self.listener.as_mut() {
                listener(&beat);
            }
            self.history.push(beat);
        }

        &self.history[first_new..]
    }

    /// Changes the tempo from the next unscheduled beat on.
    pub fn set_tempo(&mut self, tempo: f64) -> Result<()> {
        validate_tempo(tempo)?;
        self.state.tempo = tempo;
        tracing::debug!(tempo, "tempo changed");
        Ok(())
    }

    /// Changes the bar length. Accents beyond the new bar are dropped and the
    /// beat counter wraps if it falls outside the bar.
    pub fn set_beats_per_bar(&mut self, beats_per_bar: u32) -> Result<()> {
        validate_beats_per_bar(beats_per_bar)?;
        self.state.beats_per_bar = beats_per_bar;
        self.state.accent_beats.retain(|&beat| beat < beats_per_bar);
        if self.state.current_beat >= beats_per_bar {
            self.state.current_beat = 0;
        }
        tracing::debug!(beats_per_bar, "meter changed");
        Ok(())
    }

    /// Replaces the accent set from the next unscheduled beat on.
    pub fn set_accent_beats(&mut self, accents: &[u32]) -> Result<()> {
        validate_accents(accents, self.state.beats_per_bar)?;
        self.state.accent_beats = accents.iter().copied().collect();
        Ok(())
    }
}

impl<C, S> std::fmt::Debug for MetronomeScheduler<C, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetronomeScheduler")
            .field("state", &self.state)
            .field("tones", &self.tones)
            .field("history_len", &self.history.len())
            .finish_non_exhaustive()
    }
}

/// Requests handled on the driver's poll thread.
enum DriverCommand {
    Start,
    Stop,
    SetTempo(f64, Sender<Result<()>>),
    SetBeatsPerBar(u32, Sender<Result<()>>),
    SetAccentBeats(Vec<u32>, Sender<Result<()>>),
    Snapshot(Sender<(MetronomeState, Vec<Beat>)>),
    Shutdown,
}

/// Runs a [`MetronomeScheduler`] on a dedicated poll thread.
///
/// The thread is the only code touching the scheduler, so polls and setting
/// changes are serialized and a poll is never re-entered. Dropping the driver
/// stops the metronome and joins the thread.
#[derive(Debug)]
pub struct MetronomeDriver {
    commands: Sender<DriverCommand>,
    thread_handle: Option<JoinHandle<()>>,
}

impl MetronomeDriver {
    /// Moves `scheduler` onto a new thread that polls it every `lookahead`.
    pub fn spawn<C, S>(mut scheduler: MetronomeScheduler<C, S>, lookahead: Duration) -> Self
    where
        C: AudioClock + 'static,
        S: ToneSink + 'static,
    {
        let (commands_tx, commands_rx) = crossbeam_channel::unbounded();
        let thread_handle = thread::spawn(move || {
            tracing::debug!(?lookahead, "metronome thread started");
            run_driver(&mut scheduler, lookahead, commands_rx);
            scheduler.stop();
            tracing::debug!("metronome thread finished");
        });

        Self {
            commands: commands_tx,
            thread_handle: Some(thread_handle),
        }
    }

    pub fn start(&self) -> Result<()> {
        self.send(DriverCommand::Start)
    }

    pub fn stop(&self) -> Result<()> {
        self.send(DriverCommand::Stop)
    }

    pub fn set_tempo(&self, tempo: f64) -> Result<()> {
        self.request(|reply| DriverCommand::SetTempo(tempo, reply))?
    }

    pub fn set_beats_per_bar(&self, beats_per_bar: u32) -> Result<()> {
        self.request(|reply| DriverCommand::SetBeatsPerBar(beats_per_bar, reply))?
    }

    pub fn set_accent_beats(&self, accents: &[u32]) -> Result<()> {
        let accents = accents.to_vec();
        self.request(|reply| DriverCommand::SetAccentBeats(accents, reply))?
    }

    /// Current state and beat history.
    pub fn snapshot(&self) -> Result<(MetronomeState, Vec<Beat>)> {
        self.request(DriverCommand::Snapshot)
    }

    /// Stops the metronome and waits for the poll thread to exit.
    pub fn shutdown(mut self) {
        self.join();
    }

    fn send(&self, command: DriverCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::ChannelClosed)
    }

    fn request<T>(&self, command: impl FnOnce(Sender<T>) -> DriverCommand) -> Result<T> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.send(command(reply_tx))?;
        reply_rx.recv().map_err(|_| Error::ChannelClosed)
    }

    fn join(&mut self) {
        if let Some(handle) = self.thread_handle.take() {
            let _ = self.commands.send(DriverCommand::Shutdown);
            if handle.join().is_err() {
                tracing::error!("metronome thread panicked");
            }
        }
    }
}

impl Drop for MetronomeDriver {
    fn drop(&mut self) {
        self.join();
    }
}

fn run_driver<C: AudioClock, S: ToneSink>(
    scheduler: &mut MetronomeScheduler<C, S>,
    lookahead: Duration,
    commands: Receiver<DriverCommand>,
) {
    // Only ticks while running; a stopped metronome sleeps on its commands.
    let mut ticker: Option<Receiver<Instant>> = None;
    loop {
        let tick = ticker.clone().unwrap_or_else(crossbeam_channel::never);
        crossbeam_channel::select! {
            recv(tick) -> _ => {
                scheduler.poll();
            },
            recv(commands) -> msg => match msg {
                Ok(DriverCommand::Start) => {
                    scheduler.start();
                    ticker = Some(crossbeam_channel::tick(lookahead));
                    // Schedule the first beats without waiting for the next tick.
                    scheduler.poll();
                }
                Ok(DriverCommand::Stop) => {
                    scheduler.stop();
                    ticker = None;
                }
                Ok(DriverCommand::SetTempo(tempo, reply)) => {
                    let _ = reply.send(scheduler.set_tempo(tempo));
                }
                Ok(DriverCommand::SetBeatsPerBar(beats, reply)) => {
                    let _ = reply.send(scheduler.set_beats_per_bar(beats));
                }
                Ok(DriverCommand::SetAccentBeats(accents, reply)) => {
                    let _ = reply.send(scheduler.set_accent_beats(&accents));
                }
                Ok(DriverCommand::Snapshot(reply)) => {
                    let _ = reply.send((scheduler.state().clone(), scheduler.history().to_vec()));
                }
                Ok(DriverCommand::Shutdown) | Err(_) => break,
            },
        }
    }
}
