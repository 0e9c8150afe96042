use std::fs;
use std::path::{Path, PathBuf};

use crate::models::error::CaptureError;
use crate::models::recording_result::RecordingMetadata;

/// Sidecar location for a recording: `{stem}.metadata.json` next to it.
pub fn metadata_path(recording_path: &Path) -> PathBuf {
    recording_path.with_extension("metadata.json")
}

/// Write recording metadata as a JSON sidecar file.
pub fn write_metadata(metadata: &RecordingMetadata, recording_path: &Path) -> Result<PathBuf, CaptureError> {
    let path = metadata_path(recording_path);
    let json = serde_json::to_string_pretty(metadata)
        .map_err(|e| CaptureError::Io(format!("failed to serialize metadata: {}", e)))?;
    fs::write(&path, json).map_err(|e| CaptureError::io("failed to write metadata", e))?;
    Ok(path)
}

/// Read recording metadata from a JSON sidecar file.
pub fn read_metadata(recording_path: &Path) -> Result<RecordingMetadata, CaptureError> {
    let json = fs::read_to_string(metadata_path(recording_path))
        .map_err(|e| CaptureError::io("failed to read metadata", e))?;
    serde_json::from_str(&json).map_err(|e| CaptureError::Io(format!("failed to parse metadata: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::format::SampleFormat;
    use crate::models::recording_result::ConversionOutcome;
    use crate::models::state::StopReason;

    fn sample_metadata(path: &Path) -> RecordingMetadata {
        RecordingMetadata {
            id: "c0ffee".into(),
            created_at: "2026-01-01T00:00:00+00:00".into(),
            file_path: path.to_string_lossy().into_owned(),
            duration_secs: 1.5,
            sample_rate_hz: 48000.0,
            channel_count: 2,
            bits_per_channel: 32,
            sample_format: SampleFormat::Float,
            data_bytes: 576_000,
            frames: 72_000,
            buffers_dropped: 1,
            checksum: "ab".repeat(32),
            stop_reason: StopReason::Signal(2),
            conversion: Some(ConversionOutcome::Failed("ffmpeg not found".into())),
        }
    }

    #[test]
    fn sidecar_sits_next_to_recording() {
        assert_eq!(
            metadata_path(Path::new("/tmp/take1.wav")),
            PathBuf::from("/tmp/take1.metadata.json")
        );
    }

    #[test]
    fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let recording = dir.path().join("take.wav");
        let metadata = sample_metadata(&recording);

        let written = write_metadata(&metadata, &recording).unwrap();
        assert!(written.exists());
        assert_eq!(read_metadata(&recording).unwrap(), metadata);
    }

    #[test]
    fn json_uses_snake_case_reasons() {
        let dir = tempfile::tempdir().unwrap();
        let recording = dir.path().join("take.wav");
        write_metadata(&sample_metadata(&recording), &recording).unwrap();

        let json = fs::read_to_string(metadata_path(&recording)).unwrap();
        assert!(json.contains("\"signal\": 2"));
        assert!(json.contains("\"sample_format\": \"float\""));
    }

    #[test]
    fn missing_sidecar_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(read_metadata(&dir.path().join("none.wav")), Err(CaptureError::Io(_))));
    }
}
