use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::audio_models::DeliveryStats;
use super::format::{FormatDescriptor, SampleFormat};
use super::state::StopReason;

/// What happened to the optional container conversion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "detail")]
pub enum ConversionOutcome {
    /// The converted file replaced the requested output path.
    Converted,
    /// Conversion failed; the native WAV file was kept.
    Failed(String),
}

/// Result returned when a session stops cleanly.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingResult {
    /// Final output (the converted file, or the WAV when no conversion ran or it failed).
    pub file_path: PathBuf,
    /// The WAV file written during capture.
    pub native_path: PathBuf,
    pub format: FormatDescriptor,
    /// Wall-clock time spent in the `Recording` state.
    pub duration_secs: f64,
    pub data_bytes: u64,
    pub frames: u64,
    pub stats: DeliveryStats,
    pub stop_reason: StopReason,
    /// SHA-256 hex digest of `file_path` (empty if the converted file
    /// could not be read back).
    pub checksum: String,
    pub conversion: Option<ConversionOutcome>,
}

impl RecordingResult {
    /// Duration of the audio actually written, derived from the frame count.
    pub fn audio_duration_secs(&self) -> f64 {
        self.format.duration_of(self.frames)
    }
}

/// Metadata stored alongside a recording.
///
/// Serializable for the JSON sidecar consumed by downstream tooling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingMetadata {
    pub id: String,
    pub created_at: String,
    pub file_path: String,
    pub duration_secs: f64,
    pub sample_rate_hz: f64,
    pub channel_count: u16,
    pub bits_per_channel: u16,
    pub sample_format: SampleFormat,
    pub data_bytes: u64,
    pub frames: u64,
    pub buffers_dropped: u64,
    pub checksum: String,
    pub stop_reason: StopReason,
    pub conversion: Option<ConversionOutcome>,
}

impl RecordingMetadata {
    pub fn from_result(result: &RecordingResult) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
            file_path: result.file_path.to_string_lossy().into_owned(),
            duration_secs: result.audio_duration_secs(),
            sample_rate_hz: result.format.sample_rate_hz,
            channel_count: result.format.channel_count,
            bits_per_channel: result.format.bits_per_channel,
            sample_format: result.format.sample_format,
            data_bytes: result.data_bytes,
            frames: result.frames,
            buffers_dropped: result.stats.buffers_failed,
            checksum: result.checksum.clone(),
            stop_reason: result.stop_reason,
            conversion: result.conversion.clone(),
        }
    }
}
