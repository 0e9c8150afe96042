//! # sysaudio-core
//!
//! Platform-agnostic core for recording the system audio output to a file.
//!
//! Acquires a capture source through a [`CaptureBackend`], streams its
//! buffers into a WAV file in the source's native format, and shuts the
//! pipeline down cleanly on duration expiry or cancellation. Platform
//! backends (Windows WASAPI loopback, Linux PipeWire monitor) live in their
//! own crates and plug in through the backend trait.
//!
//! ## Architecture
//!
//! ```text
//! sysaudio-core (this crate)
//! ├── traits/       ← CaptureBackend, SessionDelegate, FormatConverter
//! ├── models/       ← CaptureError, SessionState, FormatDescriptor, SessionConfig, etc.
//! ├── source/       ← SourceManager, readiness retry helpers, SyntheticBackend
//! ├── processing/   ← WAV header generation and parsing
//! ├── session/      ← CaptureSession, StreamingRecorder, CancellationToken, post-conversion
//! └── storage/      ← WavWriter, checksum, metadata sidecar
//! ```

pub mod models;
pub mod processing;
pub mod session;
pub mod source;
pub mod storage;
pub mod traits;

// Re-export key types at crate root for convenience.
pub use models::audio_models::{AudioBuffer, CaptureHandle, DeliveryId, DeliveryStats, ObjectId};
pub use models::config::SessionConfig;
pub use models::error::CaptureError;
pub use models::format::{FormatDescriptor, SampleFormat};
pub use models::recording_result::{ConversionOutcome, RecordingMetadata, RecordingResult};
pub use models::state::{SessionState, StopReason};
pub use session::cancellation::CancellationToken;
pub use session::controller::CaptureSession;
pub use session::postprocess::CommandConverter;
pub use session::recorder::StreamingRecorder;
pub use source::manager::SourceManager;
pub use source::readiness::{ReadinessPolicy, RetryPolicy};
pub use source::synthetic::SyntheticBackend;
pub use storage::wav_writer::WavWriter;
pub use traits::capture_backend::{BufferCallback, CaptureBackend};
pub use traits::format_converter::FormatConverter;
pub use traits::session_delegate::SessionDelegate;
