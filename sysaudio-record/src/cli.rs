//! Command-line interface for audio-capture
//!
//! Handles argument parsing, logging configuration and the mapping onto a
//! [`SessionConfig`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::LevelFilter;
use sysaudio_core::models::format::MAX_SAMPLE_RATE_HZ;
use sysaudio_core::session::postprocess::DEFAULT_CONVERTER;
use sysaudio_core::{CommandConverter, SessionConfig};

/// Record the system audio output to a WAV file
#[derive(Parser, Debug)]
#[command(name = "audio-capture")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Output file. Any extension other than .wav is produced by converting
    /// the recorded WAV afterwards
    #[arg(short, long, value_name = "PATH")]
    pub output: PathBuf,

    /// Stop after this many seconds (0 = until interrupted)
    #[arg(short, long, value_name = "SECONDS", default_value_t = 0.0, value_parser = parse_duration)]
    pub duration: f64,

    /// Preferred sample rate. The source's native rate is used when it differs
    #[arg(short, long, value_name = "HZ", default_value_t = 44100.0, value_parser = parse_sample_rate)]
    pub sample_rate: f64,

    /// Increase logging verbosity
    /// -v = debug, -vv = trace, -vvv = trace including dependencies
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    pub quiet: bool,

    /// Write a JSON metadata sidecar next to the recording
    #[arg(long)]
    pub metadata: bool,

    /// Program used to convert non-WAV outputs
    #[arg(long, value_name = "PROGRAM", default_value = DEFAULT_CONVERTER)]
    pub converter: String,

    /// Record a generated 440 Hz tone instead of the system output
    #[arg(long)]
    pub test_tone: bool,
}

/// One year; longer recordings are indistinguishable from unbounded ones.
const MAX_DURATION_SECS: f64 = 365.0 * 24.0 * 3600.0;

fn parse_duration(s: &str) -> Result<f64, String> {
    let secs: f64 = s.parse().map_err(|_| format!("`{}` is not a number", s))?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(format!("duration must be a finite number >= 0, got {}", s));
    }
    if secs > MAX_DURATION_SECS {
        return Err(format!("duration must be at most {} seconds, got {}", MAX_DURATION_SECS, s));
    }
    if secs > 0.0 && Duration::from_secs_f64(secs).is_zero() {
        return Err(format!("duration {} is shorter than one nanosecond", s));
    }
    Ok(secs)
}

fn parse_sample_rate(s: &str) -> Result<f64, String> {
    let hz: f64 = s.parse().map_err(|_| format!("`{}` is not a number", s))?;
    if !hz.is_finite() || hz <= 0.0 || hz > MAX_SAMPLE_RATE_HZ {
        return Err(format!("sample rate must be in (0, {}] Hz, got {}", MAX_SAMPLE_RATE_HZ, s));
    }
    Ok(hz)
}

impl Args {
    /// Get the log level filter based on verbosity flags
    pub fn log_level(&self) -> LevelFilter {
        if self.quiet {
            LevelFilter::Error
        } else {
            match self.verbose {
                0 => LevelFilter::Info,
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    pub fn max_duration(&self) -> Option<Duration> {
        Duration::try_from_secs_f64(self.duration).ok().filter(|d| !d.is_zero())
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            requested_sample_rate: self.sample_rate,
            write_metadata: self.metadata,
            converter: Some(Arc::new(CommandConverter::new(&self.converter))),
            ..SessionConfig::new(&self.output)
        }
        .with_max_duration(self.max_duration())
    }
}

/// Initialize the logging system based on CLI arguments
pub fn init_logging(args: &Args) {
    let mut builder = env_logger::Builder::new();

    // Base level for all modules - keep at warn to suppress noisy deps
    builder.filter_level(LevelFilter::Warn);

    for module in ["audio_capture", "sysaudio_core", "sysaudio_windows", "sysaudio_pipewire"] {
        builder.filter_module(module, args.log_level());
    }

    if args.verbose >= 3 {
        builder.filter_level(args.log_level());
    }

    builder.format_timestamp_millis().init();
}
