//! Optional conversion of a finished WAV recording into another container.
//!
//! Capture always writes WAV. When the requested output has another
//! extension the recording goes to a `.wav` sibling first and is converted
//! after the session stops:
//!
//! ```text
//! take.wav ──convert──► .take.partial.m4a ──rename──► take.m4a   (take.wav removed)
//!     └── on any failure: partial removed, take.wav kept
//! ```

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::models::error::CaptureError;
use crate::models::recording_result::ConversionOutcome;
use crate::traits::format_converter::FormatConverter;

/// Program used by [`CommandConverter::default`].
pub const DEFAULT_CONVERTER: &str = "ffmpeg";

/// Whether `output` asks for something other than WAV.
///
/// Paths without an extension are written as WAV.
pub fn needs_conversion(output: &Path) -> bool {
    match output.extension().and_then(|e| e.to_str()) {
        Some(ext) => !ext.eq_ignore_ascii_case("wav") && !ext.eq_ignore_ascii_case("wave"),
        None => false,
    }
}

/// Where the WAV is written while recording towards `output`.
pub fn native_path_for(output: &Path) -> PathBuf {
    if needs_conversion(output) {
        output.with_extension("wav")
    } else {
        output.to_path_buf()
    }
}

/// Hidden sibling that receives converter output before the final rename.
pub fn partial_path_for(output: &Path) -> PathBuf {
    let stem = output.file_stem().map(|s| s.to_string_lossy()).unwrap_or_default();
    let name = match output.extension() {
        Some(ext) => format!(".{}.partial.{}", stem, ext.to_string_lossy()),
        None => format!(".{}.partial", stem),
    };
    output.with_file_name(name)
}

/// Convert `native` into `output` through a temporary sibling.
///
/// Never fails: errors are logged and reported as `ConversionOutcome::Failed`,
/// leaving the native WAV in place.
pub fn convert_recording(converter: &dyn FormatConverter, native: &Path, output: &Path) -> ConversionOutcome {
    let partial = partial_path_for(output);
    if partial.exists() {
        let _ = fs::remove_file(&partial);
    }

    log::info!(
        "Converting {} -> {} with {}",
        native.display(),
        output.display(),
        converter.name()
    );

    let result = converter.convert(native, &partial).and_then(|()| {
        if !partial.is_file() {
            return Err(CaptureError::ConversionFailed(format!(
                "{} produced no output",
                converter.name()
            )));
        }
        fs::rename(&partial, output)
            .map_err(|e| CaptureError::ConversionFailed(format!("failed to move converted file into place: {}", e)))
    });

    match result {
        Ok(()) => {
            if let Err(e) = fs::remove_file(native) {
                log::warn!("Converted, but could not remove {}: {}", native.display(), e);
            }
            ConversionOutcome::Converted
        }
        Err(e) => {
            if partial.exists() {
                let _ = fs::remove_file(&partial);
            }
            log::warn!("{}; keeping {}", e, native.display());
            ConversionOutcome::Failed(e.to_string())
        }
    }
}

/// Converter that shells out to an ffmpeg-compatible program:
/// `<program> -y -loglevel error -i <input> <output>`.
#[derive(Debug, Clone)]
pub struct CommandConverter {
    program: OsString,
    name: String,
}

impl CommandConverter {
    pub fn new(program: impl Into<OsString>) -> Self {
        let program = program.into();
        let name = Path::new(&program)
            .file_name()
            .unwrap_or(program.as_os_str())
            .to_string_lossy()
            .into_owned();
        Self { program, name }
    }
}

impl Default for CommandConverter {
    fn default() -> Self {
        Self::new(DEFAULT_CONVERTER)
    }
}

impl FormatConverter for CommandConverter {
    fn convert(&self, input: &Path, output: &Path) -> Result<(), CaptureError> {
        let result = Command::new(&self.program)
            .args(["-y", "-loglevel", "error", "-i"])
            .arg(input)
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| CaptureError::ConversionFailed(format!("failed to run {}: {}", self.name, e)))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(CaptureError::ConversionFailed(format!(
                "{} exited with {}: {}",
                self.name,
                result.status,
                stderr.trim()
            )));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
