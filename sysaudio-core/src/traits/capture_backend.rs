use std::sync::Arc;

use crate::models::audio_models::{AudioBuffer, DeliveryId, ObjectId};
use crate::models::error::CaptureError;
use crate::models::format::FormatDescriptor;

/// Producer callback invoked by the backend for every delivered buffer.
///
/// Runs on the backend's delivery thread. It must copy what it needs and
/// return quickly; the buffer is not valid after it returns.
pub type BufferCallback = Arc<dyn Fn(&AudioBuffer<'_>) + Send + Sync + 'static>;

/// Interface to the OS mechanism that exposes system audio.
///
/// Acquisition happens in two steps: a *tap* on the system mix, then a
/// *compound* object (aggregate device, loopback client, capture stream)
/// that makes the tap readable. Compound objects may finish initializing
/// asynchronously; `is_alive` reports when they have.
///
/// Implemented by:
/// - `WasapiLoopbackBackend` (Windows)
/// - `PipeWireMonitorBackend` (Linux)
/// - [`SyntheticBackend`](crate::source::synthetic::SyntheticBackend) (test tone)
pub trait CaptureBackend: Send + Sync {
    /// Short human-readable backend name for logs.
    fn name(&self) -> &str;

    /// Create the tap on the system output.
    ///
    /// Fails with `SourceUnavailable` if there is nothing to tap, or
    /// `AcquisitionFailed` if the OS refuses.
    fn create_tap(&self) -> Result<ObjectId, CaptureError>;

    /// Create the readable object wrapping `tap`.
    fn create_compound(&self, tap: ObjectId) -> Result<ObjectId, CaptureError>;

    /// Whether the compound object has finished initializing.
    fn is_alive(&self, compound: ObjectId) -> bool;

    /// Read the native stream format. May fail until the object is ready.
    fn read_format(&self, compound: ObjectId) -> Result<FormatDescriptor, CaptureError>;

    /// Register the producer callback without starting delivery.
    fn register_callback(&self, compound: ObjectId, callback: BufferCallback) -> Result<DeliveryId, CaptureError>;

    /// Start delivering buffers to a registered callback.
    fn start_device(&self, compound: ObjectId, delivery: DeliveryId) -> Result<(), CaptureError>;

    /// Stop delivery. Must not return while a callback invocation is in flight.
    fn stop_device(&self, compound: ObjectId, delivery: DeliveryId);

    /// Drop the registration; the callback is never invoked again.
    fn unregister_callback(&self, compound: ObjectId, delivery: DeliveryId);

    /// Destroy the compound object. Unknown ids are ignored.
    fn destroy_compound(&self, compound: ObjectId);

    /// Release the tap. Unknown ids are ignored.
    fn release_tap(&self, tap: ObjectId);
}
