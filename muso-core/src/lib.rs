// muso-core/src/lib.rs

//! The core logic for the muso practice tools: a guitar tuner, a metronome
//! and a pitch pipe.
//! This crate is responsible for audio capture and playback, pitch detection
//! and click scheduling. It is completely headless and contains no UI code.

pub mod audio;
pub mod clock;
pub mod config;
pub mod error;
pub mod metronome;
pub mod output;
pub mod pipe;
pub mod pitch;
pub mod tone;
pub mod tuner;
pub mod tuning;

pub use error::{Error, Result};
pub use metronome::{Beat, BeatRole, MetronomeDriver, MetronomeScheduler};
pub use tuner::{NoteReading, StringMatch, Tuner, TunerSession};
