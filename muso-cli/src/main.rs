//! # muso - Guitar Tuner and Metronome
//!
//! Command-line front end for `muso-core`.
//!
//! ## Architecture
//! - **Main Thread**: Owns the cpal streams, prints events, waits for Enter
//! - **Worker Threads**: Tuner session and metronome poll thread from the core
//! - **Communication**: Crossbeam channels carry readings and beats back here

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::Receiver;
use muso_core::audio::{self, MicrophoneCapture};
use muso_core::config::AppConfig;
use muso_core::output::ToneOutput;
use muso_core::pipe::PitchPipe;
use muso_core::tuning::{Tuning, TuningPreset, TUNING_PITCH};
use muso_core::{BeatRole, MetronomeDriver, MetronomeScheduler, TunerSession};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "info";
const VERBOSE_LOG_FILTER: &str = "debug";

/// Guitar tuner, metronome and pitch pipe.
#[derive(Parser, Debug)]
#[command(name = "muso")]
#[command(version)]
struct Cli {
    /// JSON configuration file; flags override its values
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log debug output (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Listen to the microphone and show the detected note
    Tune {
        /// Tuning preset, e.g. "standard", "drop d"
        #[arg(short, long)]
        tuning: Option<String>,

        /// Frequency of A4 in Hz
        #[arg(short, long)]
        reference: Option<f32>,

        /// Stop after this many seconds instead of waiting for Enter
        #[arg(short, long)]
        seconds: Option<u64>,
    },
    /// Play a click track
    Metronome {
        /// Beats per minute
        #[arg(short, long)]
        tempo: Option<f64>,

        /// Beats per bar
        #[arg(short, long)]
        beats: Option<u32>,

        /// Accented beats (0-based), e.g. --accent 1,3
        #[arg(short, long, value_delimiter = ',')]
        accent: Option<Vec<u32>>,

        /// Stop after this many seconds instead of waiting for Enter
        #[arg(short, long)]
        seconds: Option<u64>,
    },
    /// Play the reference tone of one string
    Pipe {
        /// String label, e.g. "a2"
        string: String,

        /// Tuning preset the string belongs to
        #[arg(short, long)]
        tuning: Option<String>,

        /// Frequency of A4 in Hz
        #[arg(short, long)]
        reference: Option<f32>,

        /// Tone length; plays until Enter when omitted
        #[arg(short, long, value_parser = parse_seconds)]
        seconds: Option<f64>,
    },
    /// List the tuning presets
    Presets,
    /// List audio input devices
    Devices,
    /// Write the default configuration to a file
    InitConfig {
        path: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);
    tracing::debug!(command = ?cli.command, "starting muso");

    let mut config = match &cli.config {
        Some(path) => AppConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => AppConfig::default(),
    };

    match cli.command {
        Command::Tune {
            tuning,
            reference,
            seconds,
        } => {
            if let Some(tuning) = tuning {
                config.tuner.tuning = tuning;
            }
            if let Some(reference) = reference {
                config.tuner.reference_pitch = reference;
            }
            run_tuner(&config, seconds)
        }
        Command::Metronome {
            tempo,
            beats,
            accent,
            seconds,
        } => {
            if let Some(tempo) = tempo {
                config.metronome.tempo = tempo;
            }
            if let Some(beats) = beats {
                config.metronome.beats_per_bar = beats;
            }
            if let Some(accent) = accent {
                config.metronome.accent_beats = accent;
            }
            run_metronome(&config, seconds)
        }
        Command::Pipe {
            string,
            tuning,
            reference,
            seconds,
        } => {
            if let Some(tuning) = tuning {
                config.tuner.tuning = tuning;
            }
            if let Some(reference) = reference {
                config.tuner.reference_pitch = reference;
            }
            run_pipe(&config, &string, seconds)
        }
        Command::Presets => {
            print_presets();
            Ok(())
        }
        Command::Devices => {
            let devices = audio::list_input_devices().context("listing input devices")?;
            if devices.is_empty() {
                println!("No input devices found.");
            }
            for name in devices {
                println!("{name}");
            }
            Ok(())
        }
        Command::InitConfig { path } => write_default_config(&path),
    }
}

/// Accepts a finite, non-negative number of seconds.
fn parse_seconds(arg: &str) -> std::result::Result<f64, String> {
    let seconds: f64 = arg.parse().map_err(|e| format!("{e}"))?;
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(format!("expected a non-negative number of seconds, got {arg}"));
    }
    Ok(seconds)
}

fn setup_logging(verbose: bool) {
    let default = if verbose {
        VERBOSE_LOG_FILTER
    } else {
        DEFAULT_LOG_FILTER
    };
    let directives = std::env::var("RUST_LOG").unwrap_or_else(|_| default.to_owned());

    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::builder().parse_lossy(directives))
        .init();
}

/// Fires once the user presses Enter, or after `seconds` when given.
fn stop_signal(seconds: Option<f64>) -> Receiver<()> {
    let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
    match seconds {
        Some(seconds) => {
            let timer = crossbeam_channel::after(Duration::from_secs_f64(seconds.max(0.0)));
            thread::spawn(move || {
                let _ = timer.recv();
                let _ = stop_tx.send(());
            });
        }
        None => {
            eprintln!("Press Enter to stop.");
            thread::spawn(move || {
                let mut line = String::new();
                let _ = std::io::stdin().lock().read_line(&mut line);
                let _ = stop_tx.send(());
            });
        }
    }
    stop_rx
}

fn run_tuner(config: &AppConfig, seconds: Option<u64>) -> Result<()> {
    config.tuner.validate().context("invalid tuner settings")?;

    let mut capture = MicrophoneCapture::start(config.tuner.frame_size)
        .context("could not open the microphone")?;

    let (readings_tx, readings_rx) = crossbeam_channel::unbounded();
    let mut session = TunerSession::start(capture.handle(), &config.tuner, move |reading| {
        let _ = readings_tx.send(reading);
    })
    .context("could not start the tuner")?;

    let stop = stop_signal(seconds.map(|s| s as f64));
    loop {
        crossbeam_channel::select! {
            recv(readings_rx) -> msg => match msg {
                Ok(reading) => {
                    let string = reading
                        .string
                        .as_ref()
                        .map(|s| format!("  string {} {:+6.1} cents", s.label, s.cents))
                        .unwrap_or_default();
                    println!(
                        "{:>8.2} Hz  {:<4} {:+6.1} cents{}",
                        reading.frequency,
                        reading.full_name(),
                        reading.cents,
                        string
                    );
                }
                Err(_) => break,
            },
            recv(stop) -> _ => break,
        }
    }

    session.stop();
    capture.stop();
    Ok(())
}

fn run_metronome(config: &AppConfig, seconds: Option<u64>) -> Result<()> {
    config.metronome.validate().context("invalid metronome settings")?;

    let mut output = ToneOutput::open_default().context("could not open audio output")?;
    let handle = output.handle();

    let (beats_tx, beats_rx) = crossbeam_channel::unbounded();
    let mut scheduler = MetronomeScheduler::new(&config.metronome, handle.clone(), handle)
        .context("could not create the metronome")?;
    scheduler.set_listener(move |beat| {
        let _ = beats_tx.send(beat.clone());
    });

    let driver = MetronomeDriver::spawn(scheduler, config.metronome.lookahead());
    driver.start().context("metronome thread exited")?;

    let stop = stop_signal(seconds.map(|s| s as f64));
    loop {
        crossbeam_channel::select! {
            recv(beats_rx) -> msg => match msg {
                Ok(beat) => {
                    let mark = match beat.role() {
                        BeatRole::Downbeat => "*",
                        BeatRole::Accent => ">",
                        BeatRole::Ordinary => ".",
                    };
                    println!(
                        "{mark} {}/{}  at {:.3}s",
                        beat.beat_index + 1,
                        beat.beats_per_bar,
                        beat.scheduled_time
                    );
                }
                Err(_) => break,
            },
            recv(stop) -> _ => break,
        }
    }

    driver.shutdown();
    output.close();
    Ok(())
}

fn run_pipe(config: &AppConfig, string: &str, seconds: Option<f64>) -> Result<()> {
    config.tuner.validate().context("invalid tuner settings")?;

    let mut output = ToneOutput::open_default().context("could not open audio output")?;
    let tuning = Tuning::from_preset(
        config.tuner.preset(),
        output.sample_rate(),
        config.tuner.reference_pitch,
    );

    let mut pipe = PitchPipe::new(tuning, output.handle(), output.handle());
    let duration = seconds.map(Duration::from_secs_f64);
    pipe.play(string, duration).with_context(|| {
        let labels: Vec<&str> = pipe.tuning().strings().iter().map(|s| s.name.as_str()).collect();
        format!("{string:?} is not a string of this tuning (try {})", labels.join(", "))
    })?;

    // Wait a little past the tone so its fade-out is heard.
    stop_signal(seconds.map(|s| s + 0.05))
        .recv()
        .context("stop signal lost")?;

    pipe.stop();
    drop(pipe);
    output.close();
    Ok(())
}

fn print_presets() {
    for preset in TuningPreset::all() {
        let tuning = Tuning::from_preset(*preset, audio::TARGET_SAMPLE_RATE, TUNING_PITCH);
        let strings: Vec<String> = tuning
            .strings()
            .iter()
            .map(|s| format!("{} ({:.2} Hz)", s.name, s.frequency))
            .collect();
        println!("{:<22} {}", preset.name(), strings.join("  "));
    }
}

fn write_default_config(path: &Path) -> Result<()> {
    AppConfig::default()
        .save(path)
        .with_context(|| format!("writing configuration to {}", path.display()))?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}
