//! Picks the capture backend for this platform.

use std::sync::Arc;

use sysaudio_core::{CaptureBackend, CaptureError, FormatDescriptor, SampleFormat, SyntheticBackend};

use crate::cli::Args;

const TEST_TONE_HZ: f64 = 440.0;

pub fn select(args: &Args) -> Result<Arc<dyn CaptureBackend>, CaptureError> {
    if args.test_tone {
        let format = FormatDescriptor::pcm(args.sample_rate, 2, 16, SampleFormat::Int);
        return Ok(Arc::new(SyntheticBackend::new(format).with_tone(TEST_TONE_HZ)));
    }
    system_backend()
}

#[cfg(target_os = "windows")]
fn system_backend() -> Result<Arc<dyn CaptureBackend>, CaptureError> {
    Ok(Arc::new(sysaudio_windows::WasapiLoopbackBackend::new()))
}

#[cfg(all(target_os = "linux", feature = "pipewire"))]
fn system_backend() -> Result<Arc<dyn CaptureBackend>, CaptureError> {
    Ok(Arc::new(sysaudio_pipewire::PipeWireMonitorBackend::new()))
}

#[cfg(all(target_os = "linux", not(feature = "pipewire")))]
fn system_backend() -> Result<Arc<dyn CaptureBackend>, CaptureError> {
    Err(CaptureError::SourceUnavailable(
        "built without PipeWire support (rebuild with --features pipewire, or use --test-tone)".into(),
    ))
}

#[cfg(not(any(target_os = "windows", target_os = "linux")))]
fn system_backend() -> Result<Arc<dyn CaptureBackend>, CaptureError> {
    Err(CaptureError::SourceUnavailable(format!(
        "system audio capture is not supported on {} (use --test-tone)",
        std::env::consts::OS
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_tone_uses_synthetic_source_at_requested_rate() {
        let args = Args::try_parse_from(["audio-capture", "-o", "t.wav", "--test-tone", "-s", "48000"]).unwrap();
        let backend = select(&args).unwrap();
        assert_eq!(backend.name(), "synthetic");
    }
}
