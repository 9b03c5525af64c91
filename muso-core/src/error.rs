//! # Error Module
//!
//! Errors surfaced by the public API of `muso-core`. Device failures, rejected
//! configuration values and unparseable note names all end up here.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Tempo must be finite, positive and no faster than `MAX_TEMPO`.
    #[error("invalid tempo {0} BPM")]
    InvalidTempo(f64),

    #[error("invalid beats per bar {0}")]
    InvalidBeatsPerBar(u32),

    #[error("accent on beat {beat} is outside a bar of {beats_per_bar} beats")]
    InvalidAccent { beat: u32, beats_per_bar: u32 },

    #[error("unrecognised note name {0:?}")]
    InvalidNoteName(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to read configuration file")]
    ConfigIo(#[from] std::io::Error),

    #[error("failed to parse configuration")]
    ConfigParse(#[from] serde_json::Error),

    #[error("no audio input device available")]
    NoInputDevice,

    #[error("no audio output device available")]
    NoOutputDevice,

    /// Any failure reported by the audio backend while building or running a stream.
    #[error("audio backend error: {0}")]
    Audio(String),

    #[error("worker channel closed")]
    ChannelClosed,
}

impl Error {
    pub(crate) fn audio(context: &str, err: impl std::fmt::Display) -> Self {
        Error::Audio(format!("{context}: {err}"))
    }
}
