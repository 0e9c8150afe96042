//! audio-capture - record the system audio output to a WAV file
//!
//! This is the entry point for the `audio-capture` command.

mod backend;
mod cli;
mod signals;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{debug, error, info};
use sysaudio_core::{
    CaptureError, CaptureSession, ConversionOutcome, DeliveryStats, RecordingResult, SessionDelegate, SessionState,
};

/// Reports session progress through the log.
struct ProgressLog;

impl SessionDelegate for ProgressLog {
    fn on_state_changed(&self, state: SessionState) {
        debug!("Session {}", state);
    }

    fn on_progress(&self, elapsed: Duration, stats: &DeliveryStats) {
        info!(
            "Recording {:.0}s ({} frames, {} buffers dropped)",
            elapsed.as_secs_f64(),
            stats.frames_written,
            stats.buffers_failed
        );
    }
}

fn record(args: &cli::Args) -> Result<RecordingResult, CaptureError> {
    let backend = backend::select(args)?;
    let config = args.session_config();
    info!(
        "Recording system audio via {} to {}",
        backend.name(),
        config.output_path.display()
    );

    let session = CaptureSession::new(backend, config).with_delegate(Arc::new(ProgressLog));
    let _signals = signals::install(session.cancellation_token())?;
    session.run()
}

fn main() -> ExitCode {
    let args = match cli::Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };
    cli::init_logging(&args);

    match record(&args) {
        Ok(result) => {
            info!(
                "Saved {:.2}s of {} audio to {} (stopped: {}, sha256 {})",
                result.audio_duration_secs(),
                result.format,
                result.file_path.display(),
                result.stop_reason,
                result.checksum
            );
            if let Some(ConversionOutcome::Failed(_)) = &result.conversion {
                info!("Kept the WAV recording at {}", result.native_path.display());
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
