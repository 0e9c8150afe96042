use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::models::audio_models::{CaptureHandle, DeliveryStats};
use crate::models::config::SessionConfig;
use crate::models::error::CaptureError;
use crate::models::format::FormatDescriptor;
use crate::models::recording_result::{ConversionOutcome, RecordingMetadata, RecordingResult};
use crate::models::state::{SessionState, StopReason};
use crate::session::cancellation::CancellationToken;
use crate::session::postprocess;
use crate::session::recorder::StreamingRecorder;
use crate::source::manager::SourceManager;
use crate::storage::checksum::sha256_file;
use crate::storage::metadata;
use crate::storage::wav_writer::{SharedWriter, WavWriter};
use crate::traits::capture_backend::CaptureBackend;
use crate::traits::session_delegate::SessionDelegate;

/// How often `wait()` wakes up to report progress.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Requested and native rates closer than this are considered equal.
const RATE_TOLERANCE_HZ: f64 = 0.5;

static SESSION_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Held by the one session allowed to record in this process.
struct ActiveSessionGuard {
    _private: (),
}

impl ActiveSessionGuard {
    fn acquire() -> Result<Self, CaptureError> {
        SESSION_ACTIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| CaptureError::SessionActive)?;
        Ok(Self { _private: () })
    }
}

impl Drop for ActiveSessionGuard {
    fn drop(&mut self) {
        SESSION_ACTIVE.store(false, Ordering::Release);
    }
}

/// Resources owned while a session is live. Guarded by `CaptureSession::inner`.
#[derive(Default)]
struct SessionInner {
    handle: CaptureHandle,
    format: Option<FormatDescriptor>,
    recorder: Option<StreamingRecorder>,
    writer: Option<SharedWriter>,
    guard: Option<ActiveSessionGuard>,
    started_at: Option<Instant>,
    final_stats: DeliveryStats,
    outcome: Option<Result<RecordingResult, CaptureError>>,
}

/// One recording of the system output into a file.
///
/// ## State machine
/// ```text
/// idle ─start()─► starting ─► recording ─stop()─► stopping ─► stopped
///                    │            │                   │
///                    └────────────┴───────────────────┴─────► failed
/// ```
///
/// ## Shutdown
/// The duration deadline, process signals and explicit `stop()` all trigger
/// the same [`CancellationToken`]. Teardown then runs exactly once, in
/// order: recorder (delivery quiesced), writer (header finalized), source
/// (compound, then tap). Later `stop()` calls return the cached outcome.
///
/// All methods take `&self`; share the session in an `Arc` to stop it from
/// another thread. Only one session per process may be past `start()` at a
/// time.
pub struct CaptureSession {
    config: SessionConfig,
    source: SourceManager,
    native_path: PathBuf,
    token: CancellationToken,
    delegate: Option<Arc<dyn SessionDelegate>>,
    state: Mutex<SessionState>,
    inner: Mutex<SessionInner>,
}

impl CaptureSession {
    pub fn new(backend: Arc<dyn CaptureBackend>, config: SessionConfig) -> Self {
        let native_path = postprocess::native_path_for(&config.output_path);
        Self {
            source: SourceManager::new(backend, config.readiness),
            native_path,
            config,
            token: CancellationToken::new(),
            delegate: None,
            state: Mutex::new(SessionState::Idle),
            inner: Mutex::new(SessionInner::default()),
        }
    }

    pub fn with_delegate(mut self, delegate: Arc<dyn SessionDelegate>) -> Self {
        self.delegate = Some(delegate);
        self
    }

    /// Token that stops this session when triggered.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Path of the WAV file written during capture.
    pub fn native_path(&self) -> &Path {
        &self.native_path
    }

    /// Native format of the acquired source, once started.
    pub fn format(&self) -> Option<FormatDescriptor> {
        self.inner.lock().format
    }

    pub fn stats(&self) -> DeliveryStats {
        let inner = self.inner.lock();
        match &inner.recorder {
            Some(recorder) => recorder.stats(),
            None => inner.final_stats,
        }
    }

    /// Acquire the source, open the file and begin recording.
    ///
    /// On failure everything acquired so far is released, the partial file
    /// is removed and the session ends in `Failed`.
    pub fn start(&self) -> Result<(), CaptureError> {
        let mut inner = self.inner.lock();
        let current = self.state();
        if current != SessionState::Idle {
            return Err(CaptureError::InvalidTransition {
                from: current,
                to: SessionState::Starting,
            });
        }
        self.config.validate().map_err(CaptureError::InvalidConfiguration)?;

        let guard = ActiveSessionGuard::acquire()?;
        self.transition(SessionState::Starting)?;

        match self.open_pipeline(&mut inner) {
            Ok(()) => {
                inner.guard = Some(guard);
                inner.started_at = Some(Instant::now());
                log::info!("Recording to {}", self.native_path.display());
                Ok(())
            }
            Err(e) => {
                self.abort_start(&mut inner);
                drop(guard);
                self.fail(&mut inner, e.clone());
                Err(e)
            }
        }
    }

    fn open_pipeline(&self, inner: &mut SessionInner) -> Result<(), CaptureError> {
        let (handle, format) = self.source.acquire()?;
        inner.handle = handle;
        inner.format = Some(format);

        if (format.sample_rate_hz - self.config.requested_sample_rate).abs() > RATE_TOLERANCE_HZ {
            log::warn!(
                "Requested {} Hz but the source runs at {} Hz; recording at the native rate",
                self.config.requested_sample_rate,
                format.sample_rate_hz
            );
        }

        let writer = WavWriter::create(&self.native_path, format)?.into_shared();
        inner.writer = Some(Arc::clone(&writer));

        let mut recorder = StreamingRecorder::new(Arc::clone(self.source.backend()));
        recorder.start(&inner.handle, &format, writer, self.delegate.clone())?;
        inner.recorder = Some(recorder);

        self.transition(SessionState::Recording)
    }

    fn abort_start(&self, inner: &mut SessionInner) {
        if let Some(mut recorder) = inner.recorder.take() {
            recorder.stop();
        }
        if let Some(writer) = inner.writer.take() {
            let _ = writer.lock().close();
            if let Err(e) = fs::remove_file(&self.native_path) {
                log::warn!("Failed to remove partial file {}: {}", self.native_path.display(), e);
            }
        }
        self.source.release(&mut inner.handle);
    }

    /// Block until the duration elapses or the session is cancelled.
    ///
    /// Returns immediately if the session never started recording.
    pub fn wait(&self) -> StopReason {
        let started_at = self.inner.lock().started_at;
        let Some(started_at) = started_at else {
            return self.token.reason().unwrap_or(StopReason::Requested);
        };
        // A deadline past what `Instant` can represent never arrives.
        let deadline = self.config.max_duration.and_then(|d| started_at.checked_add(d));

        loop {
            if let Some(deadline) = deadline {
                if deadline <= Instant::now() + PROGRESS_INTERVAL {
                    return self.token.wait_until(Some(deadline));
                }
            }
            if let Some(reason) = self.token.wait_timeout(PROGRESS_INTERVAL) {
                return reason;
            }
            if let Some(delegate) = &self.delegate {
                delegate.on_progress(started_at.elapsed(), &self.stats());
            }
        }
    }

    /// Stop recording and finalize the file.
    ///
    /// The first call from `Recording` performs the teardown; every later
    /// call returns the same outcome. Returns `Ok(None)` if the session was
    /// never started.
    pub fn stop(&self) -> Result<Option<RecordingResult>, CaptureError> {
        let mut inner = self.inner.lock();
        match self.state() {
            SessionState::Idle => return Ok(None),
            SessionState::Recording => {}
            _ => return inner.outcome.clone().transpose(),
        }

        self.token.cancel(StopReason::Requested);
        let stop_reason = self.token.reason().unwrap_or(StopReason::Requested);
        log::info!("Stopping: {}", stop_reason);

        match self.finalize(&mut inner, stop_reason) {
            Ok(result) => {
                inner.outcome = Some(Ok(result.clone()));
                Ok(Some(result))
            }
            Err(e) => {
                self.fail(&mut inner, e.clone());
                Err(e)
            }
        }
    }

    /// `start()`, `wait()` and `stop()` in sequence.
    pub fn run(&self) -> Result<RecordingResult, CaptureError> {
        self.start()?;
        let reason = self.wait();
        log::debug!("Stop triggered: {}", reason);
        self.stop()?.ok_or(CaptureError::InvalidTransition {
            from: SessionState::Idle,
            to: SessionState::Stopping,
        })
    }

    fn finalize(&self, inner: &mut SessionInner, stop_reason: StopReason) -> Result<RecordingResult, CaptureError> {
        self.transition(SessionState::Stopping)?;
        let duration = inner.started_at.map(|t| t.elapsed()).unwrap_or_default();

        if let Some(mut recorder) = inner.recorder.take() {
            recorder.stop();
            inner.final_stats = recorder.stats();
        }
        let stats = inner.final_stats;

        let closed = match inner.writer.take() {
            Some(writer) => {
                let mut writer = writer.lock();
                writer.close().map(|()| (writer.state(), *writer.format()))
            }
            None => Err(CaptureError::Io("file is not open".into())),
        };
        self.source.release(&mut inner.handle);
        inner.guard = None;

        let (written, format) = closed?;
        let checksum = sha256_file(&self.native_path)?;
        self.transition(SessionState::Stopped)?;

        let mut result = RecordingResult {
            file_path: self.native_path.clone(),
            native_path: self.native_path.clone(),
            format,
            duration_secs: duration.as_secs_f64(),
            data_bytes: written.bytes_written,
            frames: stats.frames_written,
            stats,
            stop_reason,
            checksum,
            conversion: None,
        };

        if postprocess::needs_conversion(&self.config.output_path) {
            match &self.config.converter {
                Some(converter) => {
                    let outcome =
                        postprocess::convert_recording(converter.as_ref(), &self.native_path, &self.config.output_path);
                    if outcome == ConversionOutcome::Converted {
                        result.file_path = self.config.output_path.clone();
                        result.checksum = match sha256_file(&result.file_path) {
                            Ok(digest) => digest,
                            Err(e) => {
                                log::warn!("Failed to checksum {}: {}", result.file_path.display(), e);
                                String::new()
                            }
                        };
                    }
                    result.conversion = Some(outcome);
                }
                None => log::warn!(
                    "No converter configured for {}; keeping {}",
                    self.config.output_path.display(),
                    self.native_path.display()
                ),
            }
        }

        if self.config.write_metadata {
            match metadata::write_metadata(&RecordingMetadata::from_result(&result), &result.file_path) {
                Ok(path) => log::debug!("Wrote metadata to {}", path.display()),
                Err(e) => log::warn!("{}", e),
            }
        }

        if stats.buffers_failed > 0 {
            log::warn!("{} buffers could not be written", stats.buffers_failed);
        }
        log::info!(
            "Recorded {:.2}s ({} frames, {} bytes)",
            result.audio_duration_secs(),
            result.frames,
            result.data_bytes
        );

        if let Some(delegate) = &self.delegate {
            delegate.on_finished(&result);
        }
        Ok(result)
    }

    fn fail(&self, inner: &mut SessionInner, error: CaptureError) {
        let _ = self.transition(SessionState::Failed);
        if let Some(delegate) = &self.delegate {
            delegate.on_error(&error);
        }
        inner.outcome = Some(Err(error));
    }

    fn transition(&self, next: SessionState) -> Result<(), CaptureError> {
        {
            let mut state = self.state.lock();
            if !state.can_transition_to(next) {
                return Err(CaptureError::InvalidTransition { from: *state, to: next });
            }
            log::debug!("Session {} -> {}", *state, next);
            *state = next;
        }
        if let Some(delegate) = &self.delegate {
            delegate.on_state_changed(next);
        }
        Ok(())
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if self.state() == SessionState::Recording {
            log::warn!("Session dropped while recording; stopping");
            let _ = self.stop();
        }
    }
}
