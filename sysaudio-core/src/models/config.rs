use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::models::format::MAX_SAMPLE_RATE_HZ;
use crate::source::readiness::ReadinessPolicy;
use crate::traits::format_converter::FormatConverter;

/// Configuration for a recording session.
#[derive(Clone)]
pub struct SessionConfig {
    /// Requested output file. A non-WAV extension triggers post-conversion.
    pub output_path: PathBuf,

    /// Maximum recording duration (None = until cancelled).
    pub max_duration: Option<Duration>,

    /// Requested sample rate in Hz (default: 44100). Advisory only: the
    /// source's native rate always wins.
    pub requested_sample_rate: f64,

    /// Readiness polling and format-read retry parameters.
    pub readiness: ReadinessPolicy,

    /// Write a `<recording>.metadata.json` sidecar after stopping.
    pub write_metadata: bool,

    /// Converter used when the output extension is not WAV.
    pub converter: Option<Arc<dyn FormatConverter>>,
}

impl SessionConfig {
    pub fn new(output_path: impl Into<PathBuf>) -> Self {
        Self {
            output_path: output_path.into(),
            ..Default::default()
        }
    }

    pub fn with_max_duration(mut self, duration: Option<Duration>) -> Self {
        self.max_duration = duration.filter(|d| !d.is_zero());
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.output_path.as_os_str().is_empty() {
            return Err("output path is required".into());
        }
        if self.output_path.is_dir() {
            return Err(format!("output path is a directory: {}", self.output_path.display()));
        }
        if !(self.requested_sample_rate.is_finite()
            && self.requested_sample_rate > 0.0
            && self.requested_sample_rate <= MAX_SAMPLE_RATE_HZ)
        {
            return Err(format!(
                "sample rate must be in (0, {}] Hz, got {}",
                MAX_SAMPLE_RATE_HZ, self.requested_sample_rate
            ));
        }
        if self.readiness.format_read.max_attempts == 0 {
            return Err("format read attempts must be at least 1".into());
        }
        Ok(())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            output_path: PathBuf::new(),
            max_duration: None,
            requested_sample_rate: 44100.0,
            readiness: ReadinessPolicy::default(),
            write_metadata: false,
            converter: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_unbounded_at_44100() {
        let config = SessionConfig::new("out.wav");
        assert_eq!(config.max_duration, None);
        assert_eq!(config.requested_sample_rate, 44100.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_duration_means_unbounded() {
        let config = SessionConfig::new("out.wav").with_max_duration(Some(Duration::ZERO));
        assert_eq!(config.max_duration, None);

        let config = SessionConfig::new("out.wav").with_max_duration(Some(Duration::from_secs(3)));
        assert_eq!(config.max_duration, Some(Duration::from_secs(3)));
    }

    #[test]
    fn empty_output_rejected() {
        let config = SessionConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_sample_rate_rejected() {
        let config = SessionConfig {
            requested_sample_rate: 0.0,
            ..SessionConfig::new("out.wav")
        };
        assert!(config.validate().is_err());

        let config = SessionConfig {
            requested_sample_rate: 1.1e9,
            ..SessionConfig::new("out.wav")
        };
        assert!(config.validate().is_err());
    }
}
