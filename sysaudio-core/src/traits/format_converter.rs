use std::path::Path;

use crate::models::error::CaptureError;

/// Converts a finalized WAV recording into another container.
///
/// Default implementation runs an external program, see
/// [`CommandConverter`](crate::session::postprocess::CommandConverter).
pub trait FormatConverter: Send + Sync {
    /// Convert `input` into `output`. `output` does not exist beforehand and
    /// may be left behind half-written on failure.
    fn convert(&self, input: &Path, output: &Path) -> Result<(), CaptureError>;

    /// Name used in logs.
    fn name(&self) -> &str;
}
