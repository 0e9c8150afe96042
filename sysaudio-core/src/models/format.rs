use serde::{Deserialize, Serialize};

use super::error::CaptureError;

/// Sample encoding of a linear PCM stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    /// Signed little-endian integer samples.
    Int,
    /// IEEE little-endian float samples.
    Float,
}

impl SampleFormat {
    /// WAV `fmt ` chunk format tag (1 = PCM, 3 = IEEE float).
    pub fn wav_format_tag(self) -> u16 {
        match self {
            Self::Int => 1,
            Self::Float => 3,
        }
    }
}

/// PCM layout of a capture source, as reported by the backend.
///
/// Captured once during acquisition and never changed afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FormatDescriptor {
    pub sample_rate_hz: f64,
    pub channel_count: u16,
    pub bits_per_channel: u16,
    pub bytes_per_frame: u32,
    pub sample_format: SampleFormat,
}

/// Highest sample rate accepted from a source or a request.
pub const MAX_SAMPLE_RATE_HZ: f64 = 1_000_000.0;

impl FormatDescriptor {
    /// Build a packed interleaved descriptor, deriving `bytes_per_frame`.
    pub fn pcm(sample_rate_hz: f64, channel_count: u16, bits_per_channel: u16, sample_format: SampleFormat) -> Self {
        Self {
            sample_rate_hz,
            channel_count,
            bits_per_channel,
            bytes_per_frame: channel_count as u32 * (bits_per_channel as u32 / 8),
            sample_format,
        }
    }

    /// Check the packed-PCM invariants.
    pub fn validate(&self) -> Result<(), CaptureError> {
        if !(self.sample_rate_hz.is_finite() && self.sample_rate_hz > 0.0 && self.sample_rate_hz <= MAX_SAMPLE_RATE_HZ) {
            return Err(CaptureError::InvalidConfiguration(format!(
                "invalid sample rate: {}",
                self.sample_rate_hz
            )));
        }
        if self.channel_count == 0 {
            return Err(CaptureError::InvalidConfiguration("channel count must be positive".into()));
        }
        if self.bits_per_channel == 0 || self.bits_per_channel % 8 != 0 {
            return Err(CaptureError::InvalidConfiguration(format!(
                "unsupported bit depth: {}",
                self.bits_per_channel
            )));
        }
        if self.sample_format == SampleFormat::Float && ![32, 64].contains(&self.bits_per_channel) {
            return Err(CaptureError::InvalidConfiguration(format!(
                "float samples must be 32 or 64 bits, got {}",
                self.bits_per_channel
            )));
        }
        let expected = self.channel_count as u32 * self.bytes_per_sample() as u32;
        if self.bytes_per_frame != expected {
            return Err(CaptureError::InvalidConfiguration(format!(
                "bytes per frame {} does not match {} channels x {} bits",
                self.bytes_per_frame, self.channel_count, self.bits_per_channel
            )));
        }
        let block_align = self.channel_count.checked_mul(self.bytes_per_sample());
        let byte_rate = self.sample_rate().checked_mul(expected);
        if block_align.is_none() || byte_rate.is_none() {
            return Err(CaptureError::InvalidConfiguration(format!(
                "{} Hz x {} channels x {} bits does not fit a WAV header",
                self.sample_rate_hz, self.channel_count, self.bits_per_channel
            )));
        }
        Ok(())
    }

    pub fn bytes_per_sample(&self) -> u16 {
        self.bits_per_channel / 8
    }

    /// Integer sample rate as written into the WAV header.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate_hz.round() as u32
    }

    /// `sample_rate * channels * bytes_per_sample`
    pub fn byte_rate(&self) -> u32 {
        self.sample_rate()
            .saturating_mul(self.channel_count as u32)
            .saturating_mul(self.bytes_per_sample() as u32)
    }

    /// `channels * bytes_per_sample`
    pub fn block_align(&self) -> u16 {
        self.channel_count.saturating_mul(self.bytes_per_sample())
    }

    /// Number of whole frames contained in `byte_count` bytes.
    pub fn frames_in(&self, byte_count: usize) -> usize {
        if self.bytes_per_frame == 0 {
            return 0;
        }
        byte_count / self.bytes_per_frame as usize
    }

    /// Duration of `frames` frames in seconds.
    pub fn duration_of(&self, frames: u64) -> f64 {
        frames as f64 / self.sample_rate_hz
    }
}

impl std::fmt::Display for FormatDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.sample_format {
            SampleFormat::Int => "int",
            SampleFormat::Float => "float",
        };
        write!(
            f,
            "{} Hz, {} ch, {}-bit {}",
            self.sample_rate_hz, self.channel_count, self.bits_per_channel, kind
        )
    }
}
