use std::time::Duration;

use crate::models::audio_models::DeliveryStats;
use crate::models::error::CaptureError;
use crate::models::recording_result::RecordingResult;
use crate::models::state::SessionState;

/// Event delegate for recording session notifications.
///
/// `on_buffer_error` is called from the audio delivery thread and must
/// return quickly. The rest are called from whichever thread drives the
/// session, while it holds its internal lock: they may read `state()` but
/// must not call the session's control methods.
pub trait SessionDelegate: Send + Sync {
    /// Called after every state transition.
    fn on_state_changed(&self, _state: SessionState) {}

    /// Called about once a second while waiting for the stop trigger.
    fn on_progress(&self, _elapsed: Duration, _stats: &DeliveryStats) {}

    /// Called when a single buffer could not be written. Recording continues.
    fn on_buffer_error(&self, _error: &CaptureError) {}

    /// Called when the session fails.
    fn on_error(&self, _error: &CaptureError) {}

    /// Called once the file is finalized (and converted, if requested).
    fn on_finished(&self, _result: &RecordingResult) {}
}
