use std::sync::Arc;

use crate::models::audio_models::{CaptureHandle, ObjectId};
use crate::models::error::CaptureError;
use crate::models::format::FormatDescriptor;
use crate::source::readiness::{self, ReadinessPolicy};
use crate::traits::capture_backend::CaptureBackend;

/// Owns the acquisition and release of a system-audio capture source.
///
/// ## Acquisition
/// ```text
/// create_tap ─► create_compound ─► poll is_alive ─► read_format (retry)
///      │               │              (timeout: warn,        │
///      ▼               ▼               continue)             ▼
///  error          release tap                      release compound + tap,
///                                                  FormatUnavailable
/// ```
///
/// Release runs in reverse order of creation: compound first, then tap.
pub struct SourceManager {
    backend: Arc<dyn CaptureBackend>,
    policy: ReadinessPolicy,
}

impl SourceManager {
    pub fn new(backend: Arc<dyn CaptureBackend>, policy: ReadinessPolicy) -> Self {
        Self { backend, policy }
    }

    pub fn backend(&self) -> &Arc<dyn CaptureBackend> {
        &self.backend
    }

    pub fn policy(&self) -> ReadinessPolicy {
        self.policy
    }

    /// Acquire the system output and read its native format.
    ///
    /// On error every object created so far has been released.
    pub fn acquire(&self) -> Result<(CaptureHandle, FormatDescriptor), CaptureError> {
        let tap = self.backend.create_tap()?;
        if tap.is_unknown() {
            return Err(CaptureError::AcquisitionFailed {
                code: 0,
                context: format!("{} returned no tap", self.backend.name()),
            });
        }
        log::debug!("{}: created tap {}", self.backend.name(), tap);

        let mut handle = CaptureHandle {
            tap: Some(tap),
            compound: None,
        };

        match self.open_compound(tap, &mut handle) {
            Ok(format) => {
                log::info!("{}: capturing system output ({})", self.backend.name(), format);
                Ok((handle, format))
            }
            Err(e) => {
                self.release(&mut handle);
                Err(e)
            }
        }
    }

    fn open_compound(&self, tap: ObjectId, handle: &mut CaptureHandle) -> Result<FormatDescriptor, CaptureError> {
        let compound = self.backend.create_compound(tap)?;
        if compound.is_unknown() {
            return Err(CaptureError::AcquisitionFailed {
                code: 0,
                context: format!("{} returned no device", self.backend.name()),
            });
        }
        handle.compound = Some(compound);
        log::debug!("{}: created device {}", self.backend.name(), compound);

        match readiness::poll_until(self.policy.alive_poll, || self.backend.is_alive(compound)) {
            Some(attempt) => log::debug!("{}: device ready after {} polls", self.backend.name(), attempt),
            None => log::warn!(
                "{}: device not reported ready within {:?}, continuing anyway",
                self.backend.name(),
                self.policy.alive_poll.max_wait()
            ),
        }

        readiness::retry(self.policy.format_read, |attempt| {
            let result = self.backend.read_format(compound).and_then(|format| {
                format.validate()?;
                Ok(format)
            });
            if let Err(e) = &result {
                log::debug!("{}: format read attempt {} failed: {}", self.backend.name(), attempt, e);
            }
            result
        })
        .map_err(|exhausted| {
            log::warn!(
                "{}: giving up on stream format: {}",
                self.backend.name(),
                exhausted.last_error
            );
            CaptureError::FormatUnavailable {
                attempts: exhausted.attempts,
            }
        })
    }

    /// Release the objects held by `handle`, compound before tap.
    ///
    /// The handle is emptied, so releasing it again does nothing.
    pub fn release(&self, handle: &mut CaptureHandle) {
        if let Some(compound) = handle.compound.take() {
            log::debug!("{}: destroying device {}", self.backend.name(), compound);
            self.backend.destroy_compound(compound);
        }
        if let Some(tap) = handle.tap.take() {
            log::debug!("{}: releasing tap {}", self.backend.name(), tap);
            self.backend.release_tap(tap);
        }
    }
}
