//! # Musical Tuning Module
//!
//! This module provides the note arithmetic the tuner needs: parsing note
//! names, equal temperament frequencies, mapping a measured frequency to its
//! nearest note with a cent deviation, and the instrument tunings whose
//! strings the pitch detector ranks.
//!
//! ## Features
//! - MIDI note table (C-1 to G9) with sharp spellings
//! - Note name parsing with sharps, flats and any case ("e2", "F#2", "Bb5")
//! - Configurable reference pitch (A4, default 440 Hz)
//! - Cent deviation calculations
//! - Guitar tuning presets with fallback to standard tuning

use once_cell::sync::Lazy;
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Error, Result};

/// Default concert pitch for A4 in Hz.
pub const TUNING_PITCH: f32 = 440.0;

/// MIDI number of A4, the note the reference pitch applies to.
const A4_MIDI: i32 = 69;

const NOTE_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// Represents a single entry of the note table.
#[derive(Debug, Clone)]
pub struct Note {
    /// Pitch class spelled with sharps (e.g. "C#")
    pub pitch_class: &'static str,
    /// Scientific pitch notation octave (C4 is middle C)
    pub octave: i32,
    /// MIDI note number
    pub midi: u8,
}

impl Note {
    /// Full note name, e.g. "A#2".
    pub fn name(&self) -> String {
        format!("{}{}", self.pitch_class, self.octave)
    }
}

/// Statically computed notes for the full MIDI range (C-1 to G9).
static NOTES: Lazy<Vec<Note>> = Lazy::new(|| {
    (0u8..=127)
        .map(|midi| Note {
            pitch_class: NOTE_NAMES[(midi % 12) as usize],
            // MIDI 60 is C4, so octave boundaries fall on multiples of 12.
            octave: midi as i32 / 12 - 1,
            midi,
        })
        .collect()
});

/// Static map for quick note name to MIDI number lookups of canonical spellings.
static NOTE_MAP: Lazy<BTreeMap<String, u8>> =
    Lazy::new(|| NOTES.iter().map(|note| (note.name(), note.midi)).collect());

/// Frequency of a MIDI note number in equal temperament.
pub fn midi_to_frequency(midi: i32, reference_pitch: f32) -> f32 {
    reference_pitch * 2.0_f32.powf((midi - A4_MIDI) as f32 / 12.0)
}

/// Parses a note name into its MIDI number.
///
/// Accepts a letter A-G in either case, any number of `#` or `b` accidentals
/// and a (possibly negative) octave number: "e2", "F#2", "Bb5", "c-1".
pub fn parse_note_name(name: &str) -> Result<i32> {
    let invalid = || Error::InvalidNoteName(name.to_string());
    let trimmed = name.trim();

    // Canonical spellings are served straight from the table.
    if let Some(&midi) = NOTE_MAP.get(trimmed) {
        return Ok(midi as i32);
    }

    let mut chars = trimmed.chars();
    let letter = chars.next().ok_or_else(invalid)?.to_ascii_uppercase();
    let base = match letter {
        'C' => 0,
        'D' => 2,
        'E' => 4,
        'F' => 5,
        'G' => 7,
        'A' => 9,
        'B' => 11,
        _ => return Err(invalid()),
    };

    let rest = chars.as_str();
    let octave_start = rest
        .find(|c: char| c == '-' || c.is_ascii_digit())
        .ok_or_else(invalid)?;
    let (accidentals, octave) = rest.split_at(octave_start);

    let mut shift = 0;
    for accidental in accidentals.chars() {
        match accidental {
            '#' | '♯' => shift += 1,
            'b' | '♭' => shift -= 1,
            _ => return Err(invalid()),
        }
    }
    let octave: i32 = octave.parse().map_err(|_| invalid())?;

    let midi = (octave + 1) * 12 + base + shift;
    if !(0..=127).contains(&midi) {
        return Err(invalid());
    }
    Ok(midi)
}

/// Frequency of a named note, e.g. `note_to_frequency("a4", 440.0) == 440.0`.
pub fn note_to_frequency(name: &str, reference_pitch: f32) -> Result<f32> {
    parse_note_name(name).map(|midi| midi_to_frequency(midi, reference_pitch))
}

/// Calculates the deviation from a target frequency in cents.
///
/// Positive values are sharp, negative values are flat.
pub fn calculate_cents_deviation(freq: f32, target_freq: f32) -> f32 {
    1200.0 * (freq / target_freq).log2()
}

/// The nearest equal-tempered note to a measured frequency.
#[derive(Debug, Clone, PartialEq)]
pub struct NoteMatch {
    /// Pitch class, e.g. "A#"
    pub note_name: String,
    pub octave: i32,
    pub midi: u8,
    /// Frequency of the matched note itself (not of the measurement)
    pub note_frequency: f32,
    /// Deviation of the measurement from `note_frequency`
    pub cents: f32,
}

/// Finds the closest musical note to a given frequency.
///
/// Returns `None` for frequencies that are not positive and finite. Results
/// outside the MIDI range are pinned to its ends, which shows up as a large
/// cent deviation.
pub fn frequency_to_note(freq: f32, reference_pitch: f32) -> Option<NoteMatch> {
    if !freq.is_finite() || freq <= 0.0 {
        return None;
    }
    let semitones = 12.0 * (freq / reference_pitch).log2();
    let midi = (A4_MIDI as f32 + semitones).round().clamp(0.0, 127.0) as u8;
    let note = &NOTES[midi as usize];
    let note_frequency = midi_to_frequency(midi as i32, reference_pitch);

    Some(NoteMatch {
        note_name: note.pitch_class.to_string(),
        octave: note.octave,
        midi,
        note_frequency,
        cents: calculate_cents_deviation(freq, note_frequency),
    })
}

/// Named tuning presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TuningPreset {
    #[default]
    Standard,
    DropD,
    SevenStringStandard,
}

impl TuningPreset {
    pub fn all() -> &'static [TuningPreset] {
        &[
            TuningPreset::Standard,
            TuningPreset::DropD,
            TuningPreset::SevenStringStandard,
        ]
    }

    /// Looks a preset up by name. Unrecognised names fall back to standard tuning.
    ///
    /// Matching ignores case and treats spaces and dashes like underscores, so
    /// "Drop D", "drop-d" and "drop_d" are the same preset.
    pub fn from_name(name: &str) -> Self {
        let normalized: String = name
            .trim()
            .to_ascii_lowercase()
            .chars()
            .map(|c| if c == ' ' || c == '-' { '_' } else { c })
            .collect();

        match Self::all().iter().find(|preset| preset.name() == normalized) {
            Some(preset) => *preset,
            None => {
                tracing::warn!(preset = name, "unknown tuning preset, using standard");
                TuningPreset::Standard
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TuningPreset::Standard => "standard",
            TuningPreset::DropD => "drop_d",
            TuningPreset::SevenStringStandard => "seven_string_standard",
        }
    }

    /// String note names, lowest string first.
    pub fn note_names(&self) -> &'static [&'static str] {
        match self {
            TuningPreset::Standard => &["e2", "a2", "d3", "g3", "b3", "e4"],
            TuningPreset::DropD => &["d2", "a2", "d3", "g3", "b3", "e4"],
            TuningPreset::SevenStringStandard => &["b1", "e2", "a2", "d3", "g3", "b3", "e4"],
        }
    }
}

impl fmt::Display for TuningPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One string of a tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetNote {
    /// Label as given in the tuning, e.g. "e2"
    pub name: String,
    /// Target frequency in Hz
    pub frequency: f32,
    /// Expected autocorrelation lag in samples (`sample_rate / frequency`, rounded)
    pub sample_offset: usize,
    /// Ranking score, reset whenever an assessment window starts
    pub accumulated_difference: f32,
}

impl TargetNote {
    pub fn new(name: &str, sample_rate: u32, reference_pitch: f32) -> Result<Self> {
        let frequency = note_to_frequency(name, reference_pitch)?;
        let sample_offset = (sample_rate as f32 / frequency).round() as usize;
        Ok(Self {
            name: name.to_string(),
            frequency,
            sample_offset: sample_offset.max(1),
            accumulated_difference: 0.0,
        })
    }
}

/// An ordered set of target strings for one instrument.
///
/// The strings never change after construction; only their
/// `accumulated_difference` ranking state is mutated by the detector.
#[derive(Debug, Clone, PartialEq)]
pub struct Tuning {
    name: String,
    strings: Vec<TargetNote>,
}

impl Tuning {
    /// Builds the tuning for a preset at the given sample rate.
    pub fn from_preset(preset: TuningPreset, sample_rate: u32, reference_pitch: f32) -> Self {
        let strings = preset
            .note_names()
            .iter()
            .map(|name| TargetNote::new(name, sample_rate, reference_pitch))
            .collect::<Result<Vec<_>>>()
            .unwrap_or_default();
        Self {
            name: preset.name().to_string(),
            strings,
        }
    }

    /// Builds a custom tuning from note names. Duplicate labels are kept once.
    pub fn from_note_names(
        name: &str,
        notes: &[&str],
        sample_rate: u32,
        reference_pitch: f32,
    ) -> Result<Self> {
        let mut strings: Vec<TargetNote> = Vec::with_capacity(notes.len());
        for note in notes {
            let target = TargetNote::new(note, sample_rate, reference_pitch)?;
            if !strings.iter().any(|s| s.name == target.name) {
                strings.push(target);
            }
        }
        if strings.is_empty() {
            return Err(Error::InvalidConfig(format!("tuning {name:?} has no strings")));
        }
        Ok(Self {
            name: name.to_string(),
            strings,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn strings(&self) -> &[TargetNote] {
        &self.strings
    }

    pub(crate) fn strings_mut(&mut self) -> &mut [TargetNote] {
        &mut self.strings
    }

    pub fn get(&self, label: &str) -> Option<&TargetNote> {
        self.strings.iter().find(|s| s.name == label)
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}
