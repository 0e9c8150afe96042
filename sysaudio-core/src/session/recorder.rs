use std::fs::File;
use std::io::{BufWriter, Seek, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::models::audio_models::{AudioBuffer, CaptureHandle, DeliveryId, DeliveryStats, ObjectId};
use crate::models::error::CaptureError;
use crate::models::format::FormatDescriptor;
use crate::storage::wav_writer::SharedWriter;
use crate::traits::capture_backend::{BufferCallback, CaptureBackend};
use crate::traits::session_delegate::SessionDelegate;

/// State captured by the producer callback.
///
/// The callback holds the only other reference to the writer. The writer
/// lock is never contended: at most one callback runs at a time, and the
/// controller only closes the writer after `stop_device` has returned.
struct DeliveryContext<W: Write + Seek + Send> {
    writer: SharedWriter<W>,
    bytes_per_frame: usize,
    accepting: AtomicBool,
    warned_partial: AtomicBool,
    delegate: Option<Arc<dyn SessionDelegate>>,
    buffers_received: AtomicU64,
    buffers_written: AtomicU64,
    buffers_failed: AtomicU64,
    frames_written: AtomicU64,
    late_buffers: AtomicU64,
}

impl<W: Write + Seek + Send> DeliveryContext<W> {
    fn deliver(&self, buffer: &AudioBuffer<'_>) {
        if !self.accepting.load(Ordering::Acquire) {
            self.late_buffers.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.buffers_received.fetch_add(1, Ordering::Relaxed);

        let bytes = buffer.bytes();
        let frames = bytes.len() / self.bytes_per_frame;
        let whole = frames * self.bytes_per_frame;
        if whole != bytes.len() && !self.warned_partial.swap(true, Ordering::Relaxed) {
            log::warn!(
                "Dropping {} trailing bytes of a partial frame ({} bytes per frame)",
                bytes.len() - whole,
                self.bytes_per_frame
            );
        }
        if frames == 0 {
            return;
        }

        let result = self.writer.lock().append(&bytes[..whole]);
        match result {
            Ok(()) => {
                self.buffers_written.fetch_add(1, Ordering::Relaxed);
                self.frames_written.fetch_add(frames as u64, Ordering::Relaxed);
            }
            Err(e) => {
                self.buffers_failed.fetch_add(1, Ordering::Relaxed);
                log::error!("Dropped buffer of {} frames: {}", frames, e);
                if let Some(delegate) = &self.delegate {
                    delegate.on_buffer_error(&e);
                }
            }
        }
    }

    fn stats(&self) -> DeliveryStats {
        DeliveryStats {
            buffers_received: self.buffers_received.load(Ordering::Relaxed),
            buffers_written: self.buffers_written.load(Ordering::Relaxed),
            buffers_failed: self.buffers_failed.load(Ordering::Relaxed),
            frames_written: self.frames_written.load(Ordering::Relaxed),
            late_buffers: self.late_buffers.load(Ordering::Relaxed),
        }
    }
}

/// Forwards buffers from a capture source into a WAV writer.
///
/// ```text
/// [backend delivery thread] ──callback──► DeliveryContext ──append──► WavWriter
/// ```
///
/// No resampling or reformatting happens here: bytes land in the file in
/// the source's native layout.
pub struct StreamingRecorder<W: Write + Seek + Send + 'static = BufWriter<File>> {
    backend: Arc<dyn CaptureBackend>,
    context: Option<Arc<DeliveryContext<W>>>,
    active: Option<(ObjectId, DeliveryId)>,
}

impl<W: Write + Seek + Send + 'static> StreamingRecorder<W> {
    pub fn new(backend: Arc<dyn CaptureBackend>) -> Self {
        Self {
            backend,
            context: None,
            active: None,
        }
    }

    /// Register the producer callback on the source and start delivery.
    ///
    /// If the device fails to start the registration is removed before the
    /// error is returned.
    pub fn start(
        &mut self,
        handle: &CaptureHandle,
        format: &FormatDescriptor,
        writer: SharedWriter<W>,
        delegate: Option<Arc<dyn SessionDelegate>>,
    ) -> Result<(), CaptureError> {
        if self.active.is_some() {
            return Err(CaptureError::AlreadyRecording);
        }
        let compound = handle.compound().ok_or_else(|| CaptureError::StartFailed {
            code: 0,
            context: "capture source not acquired".into(),
        })?;
        if format.bytes_per_frame == 0 {
            return Err(CaptureError::InvalidConfiguration("bytes per frame must be positive".into()));
        }

        let context = Arc::new(DeliveryContext {
            writer,
            bytes_per_frame: format.bytes_per_frame as usize,
            accepting: AtomicBool::new(true),
            warned_partial: AtomicBool::new(false),
            delegate,
            buffers_received: AtomicU64::new(0),
            buffers_written: AtomicU64::new(0),
            buffers_failed: AtomicU64::new(0),
            frames_written: AtomicU64::new(0),
            late_buffers: AtomicU64::new(0),
        });

        let callback: BufferCallback = {
            let context = Arc::clone(&context);
            Arc::new(move |buffer: &AudioBuffer<'_>| context.deliver(buffer))
        };

        let delivery = self.backend.register_callback(compound, callback)?;
        if let Err(e) = self.backend.start_device(compound, delivery) {
            log::debug!("{}: start failed, removing callback", self.backend.name());
            self.backend.unregister_callback(compound, delivery);
            context.accepting.store(false, Ordering::Release);
            self.context = Some(context);
            return Err(e);
        }

        log::debug!("{}: delivery started on {}", self.backend.name(), compound);
        self.context = Some(context);
        self.active = Some((compound, delivery));
        Ok(())
    }

    /// Stop delivery. Returns once no callback can be running.
    ///
    /// Does nothing unless recording.
    pub fn stop(&mut self) {
        let Some((compound, delivery)) = self.active.take() else {
            return;
        };
        self.backend.stop_device(compound, delivery);
        self.backend.unregister_callback(compound, delivery);
        if let Some(context) = &self.context {
            context.accepting.store(false, Ordering::Release);
        }

        let stats = self.stats();
        log::debug!(
            "{}: delivery stopped ({} buffers written, {} failed)",
            self.backend.name(),
            stats.buffers_written,
            stats.buffers_failed
        );
    }

    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    pub fn stats(&self) -> DeliveryStats {
        self.context.as_ref().map(|c| c.stats()).unwrap_or_default()
    }
}

impl<W: Write + Seek + Send + 'static> Drop for StreamingRecorder<W> {
    fn drop(&mut self) {
        self.stop();
    }
}
