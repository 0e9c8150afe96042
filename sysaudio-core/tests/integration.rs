//! End-to-end tests for sysaudio-core, driven by the synthetic backend.
//!
//! Only one session may record per process, so every test that starts a
//! session holds `SERIAL`.

use std::fs;
use std::io::{self, Cursor, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sysaudio_core::processing::wav_format::parse_header;
use sysaudio_core::source::synthetic::{BackendEvent, FailurePoint};
use sysaudio_core::storage::checksum::sha256_file;
use sysaudio_core::storage::metadata::read_metadata;
use sysaudio_core::{
    CaptureBackend, CaptureError, CaptureSession, ConversionOutcome, FormatConverter, FormatDescriptor,
    ReadinessPolicy, RecordingResult, SampleFormat, SessionConfig, SessionDelegate, SessionState, SourceManager,
    StopReason, StreamingRecorder, SyntheticBackend, WavWriter,
};

static SERIAL: Mutex<()> = Mutex::new(());

fn cd_format() -> FormatDescriptor {
    FormatDescriptor::pcm(44100.0, 2, 16, SampleFormat::Int)
}

fn session(backend: &Arc<SyntheticBackend>, config: SessionConfig) -> CaptureSession {
    let shared: Arc<dyn CaptureBackend> = backend.clone();
    CaptureSession::new(shared, config)
}

fn count(events: &[BackendEvent], pred: impl Fn(&BackendEvent) -> bool) -> usize {
    events.iter().filter(|e| pred(e)).count()
}

/// Records every delegate notification.
#[derive(Default)]
struct RecordingDelegate {
    states: Mutex<Vec<SessionState>>,
    buffer_errors: AtomicUsize,
    errors: Mutex<Vec<CaptureError>>,
    finished: AtomicUsize,
}

impl SessionDelegate for RecordingDelegate {
    fn on_state_changed(&self, state: SessionState) {
        self.states.lock().push(state);
    }

    fn on_buffer_error(&self, _error: &CaptureError) {
        self.buffer_errors.fetch_add(1, Ordering::SeqCst);
    }

    fn on_error(&self, error: &CaptureError) {
        self.errors.lock().push(error.clone());
    }

    fn on_finished(&self, _result: &RecordingResult) {
        self.finished.fetch_add(1, Ordering::SeqCst);
    }
}

/// Copies the WAV verbatim to the requested output.
struct CopyConverter;

impl FormatConverter for CopyConverter {
    fn convert(&self, input: &Path, output: &Path) -> Result<(), CaptureError> {
        fs::copy(input, output)
            .map(|_| ())
            .map_err(|e| CaptureError::ConversionFailed(e.to_string()))
    }

    fn name(&self) -> &str {
        "copy"
    }
}

struct RefusingConverter;

impl FormatConverter for RefusingConverter {
    fn convert(&self, _input: &Path, _output: &Path) -> Result<(), CaptureError> {
        Err(CaptureError::ConversionFailed("unsupported container".into()))
    }

    fn name(&self) -> &str {
        "refuse"
    }
}

/// In-memory sink whose Nth `write` call fails.
struct FlakySink {
    inner: Cursor<Vec<u8>>,
    writes: usize,
    fail_on: usize,
}

impl Write for FlakySink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writes += 1;
        if self.writes == self.fail_on {
            return Err(io::Error::new(io::ErrorKind::Other, "device full"));
        }
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for FlakySink {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }
}

#[test]
fn test_two_second_recording_has_exact_header() {
    let _serial = SERIAL.lock();
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("two_seconds.wav");

    let backend = Arc::new(
        SyntheticBackend::new(cd_format())
            .with_buffer(4410, Duration::from_millis(10))
            .with_buffer_limit(20),
    );
    let config = SessionConfig::new(&output).with_max_duration(Some(Duration::from_secs(2)));
    let session = session(&backend, config);

    let started = Instant::now();
    let result = session.run().unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_secs(2), "{:?}", elapsed);
    assert!(elapsed < Duration::from_secs(4), "{:?}", elapsed);
    assert_eq!(result.stop_reason, StopReason::DurationElapsed);
    assert_eq!(session.state(), SessionState::Stopped);

    let frames = 20 * 4410u64;
    assert_eq!(result.frames, frames);
    assert_eq!(result.data_bytes, frames * 4);
    assert!((result.audio_duration_secs() - 2.0).abs() < 1e-9);

    let bytes = fs::read(&output).unwrap();
    assert_eq!(bytes.len() as u64, 44 + frames * 4);
    let header = parse_header(&bytes).unwrap();
    assert_eq!(header.data_size as u64, frames * 4);
    assert_eq!(header.riff_size as u64, 36 + frames * 4);
    assert_eq!(header.byte_rate, 176_400);
    assert_eq!(header.block_align, 4);
    assert_eq!(header.channels, 2);
    assert_eq!(header.sample_rate, 44100);
    assert_eq!(header.bits_per_sample, 16);
    assert_eq!(header.format_tag, 1);

    assert_eq!(result.checksum, sha256_file(&output).unwrap());
    assert_eq!(backend.live_objects(), 0);
}

#[test]
fn test_cancel_mid_recording_stops_promptly() {
    let _serial = SERIAL.lock();
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("cancelled.wav");

    let backend = Arc::new(SyntheticBackend::new(cd_format()).with_buffer(441, Duration::from_millis(10)));
    let session = session(&backend, SessionConfig::new(&output));
    let token = session.cancellation_token();

    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(500));
        token.cancel(StopReason::Cancelled)
    });

    let started = Instant::now();
    let result = session.run().unwrap();
    let elapsed = started.elapsed();
    assert!(canceller.join().unwrap());

    assert_eq!(result.stop_reason, StopReason::Cancelled);
    assert!(elapsed >= Duration::from_millis(450), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(1500), "{:?}", elapsed);

    // Everything delivered before the stop is on disk, nothing after it.
    assert!(result.frames > 0);
    assert_eq!(result.frames, backend.frames_delivered());
    let size = fs::metadata(&output).unwrap().len();
    assert_eq!(size, 44 + result.data_bytes);

    thread::sleep(Duration::from_millis(100));
    assert_eq!(fs::metadata(&output).unwrap().len(), size);
    assert_eq!(backend.frames_delivered(), result.frames);
}

#[test]
fn test_append_failure_drops_one_buffer() {
    let format = FormatDescriptor::pcm(8000.0, 1, 16, SampleFormat::Int);
    let backend = Arc::new(
        SyntheticBackend::new(format)
            .with_buffer(160, Duration::from_millis(2))
            .with_buffer_limit(10),
    );
    let manager = SourceManager::new(backend.clone(), ReadinessPolicy::default());
    let (mut handle, native) = manager.acquire().unwrap();

    // Write 1 is the header, so write 6 carries buffer 5.
    let sink = FlakySink {
        inner: Cursor::new(Vec::new()),
        writes: 0,
        fail_on: 6,
    };
    let writer = WavWriter::new(sink, native).unwrap().into_shared();
    let delegate = Arc::new(RecordingDelegate::default());

    let mut recorder = StreamingRecorder::new(backend.clone());
    recorder
        .start(&handle, &native, writer.clone(), Some(delegate.clone() as Arc<dyn SessionDelegate>))
        .unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while backend.buffers_delivered() < 10 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    recorder.stop();
    manager.release(&mut handle);

    let stats = recorder.stats();
    assert_eq!(stats.buffers_received, 10);
    assert_eq!(stats.buffers_written, 9);
    assert_eq!(stats.buffers_failed, 1);
    assert_eq!(delegate.buffer_errors.load(Ordering::SeqCst), 1);

    let mut writer = writer.lock();
    writer.close().unwrap();
    assert_eq!(writer.state().bytes_written, 9 * 160 * 2);
}

#[test]
fn test_duplicate_stop_triggers_tear_down_once() {
    let _serial = SERIAL.lock();
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("twice.wav");

    let backend = Arc::new(SyntheticBackend::new(cd_format()));
    let session = Arc::new(session(&backend, SessionConfig::new(&output)));
    session.start().unwrap();
    thread::sleep(Duration::from_millis(100));

    let token = session.cancellation_token();
    let stoppers: Vec<_> = (0..4)
        .map(|i| {
            let session = Arc::clone(&session);
            let token = token.clone();
            thread::spawn(move || {
                token.cancel(StopReason::Signal(2 + i));
                session.stop()
            })
        })
        .collect();
    let results: Vec<_> = stoppers
        .into_iter()
        .map(|h| h.join().unwrap().unwrap().unwrap())
        .collect();

    assert!(results.windows(2).all(|pair| pair[0] == pair[1]));
    assert!(matches!(results[0].stop_reason, StopReason::Signal(_)));

    let events = backend.events();
    assert_eq!(count(&events, |e| matches!(e, BackendEvent::DeviceStopped(_))), 1);
    assert_eq!(count(&events, |e| matches!(e, BackendEvent::CompoundDestroyed(_))), 1);
    assert_eq!(count(&events, |e| matches!(e, BackendEvent::TapReleased(_))), 1);

    // Teardown order: delivery first, then the compound, then the tap.
    let position = |pred: fn(&BackendEvent) -> bool| events.iter().position(pred).unwrap();
    let stopped = position(|e| matches!(e, BackendEvent::DeviceStopped(_)));
    let unregistered = position(|e| matches!(e, BackendEvent::CallbackUnregistered(_)));
    let destroyed = position(|e| matches!(e, BackendEvent::CompoundDestroyed(_)));
    let released = position(|e| matches!(e, BackendEvent::TapReleased(_)));
    assert!(stopped < unregistered && unregistered < destroyed && destroyed < released);

    let header = parse_header(&fs::read(&output).unwrap()).unwrap();
    assert_eq!(header.data_size as u64, results[0].data_bytes);
}

#[test]
fn test_never_ready_source_proceeds_within_bound() {
    let _serial = SERIAL.lock();
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("late.wav");

    let backend = Arc::new(SyntheticBackend::new(cd_format()).never_ready());
    let config = SessionConfig::new(&output).with_max_duration(Some(Duration::from_millis(200)));
    let session = session(&backend, config);

    let started = Instant::now();
    session.start().unwrap();
    let startup = started.elapsed();

    assert!(startup >= Duration::from_secs(2), "{:?}", startup);
    assert!(startup < Duration::from_millis(2600), "{:?}", startup);
    assert_eq!(backend.alive_polls(), 21);
    assert_eq!(backend.format_reads(), 1);

    session.wait();
    let result = session.stop().unwrap().unwrap();
    assert_eq!(result.stop_reason, StopReason::DurationElapsed);
}

#[test]
fn test_format_unavailable_after_three_reads() {
    let _serial = SERIAL.lock();
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("unformatted.wav");

    let backend = Arc::new(SyntheticBackend::new(cd_format()).with_failing_format_reads(u32::MAX));
    let delegate = Arc::new(RecordingDelegate::default());
    let session = session(&backend, SessionConfig::new(&output)).with_delegate(delegate.clone());

    let err = session.start().unwrap_err();
    assert_eq!(err, CaptureError::FormatUnavailable { attempts: 3 });
    assert_eq!(backend.format_reads(), 3);
    assert_eq!(backend.live_objects(), 0);
    assert!(!output.exists());

    assert_eq!(session.state(), SessionState::Failed);
    assert_eq!(*delegate.states.lock(), vec![SessionState::Starting, SessionState::Failed]);
    assert_eq!(*delegate.errors.lock(), vec![err.clone()]);
    assert_eq!(session.stop(), Err(err));
}

#[test]
fn test_start_failure_removes_partial_file() {
    let _serial = SERIAL.lock();
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("unstarted.wav");

    let backend = Arc::new(SyntheticBackend::new(cd_format()).failing_at(FailurePoint::StartDevice));
    let session = session(&backend, SessionConfig::new(&output));

    assert!(matches!(session.start(), Err(CaptureError::StartFailed { .. })));
    assert!(!output.exists());
    assert_eq!(backend.live_objects(), 0);

    // The process-wide slot was given back.
    let healthy = Arc::new(SyntheticBackend::new(cd_format()));
    let next = self::session(&healthy, SessionConfig::new(dir.path().join("next.wav")));
    next.start().unwrap();
    assert!(next.stop().unwrap().is_some());
}

#[test]
fn test_second_session_is_rejected_while_recording() {
    let _serial = SERIAL.lock();
    let dir = tempfile::tempdir().unwrap();

    let first_backend = Arc::new(SyntheticBackend::new(cd_format()));
    let first = session(&first_backend, SessionConfig::new(dir.path().join("first.wav")));
    first.start().unwrap();

    let second_backend = Arc::new(SyntheticBackend::new(cd_format()));
    let second = session(&second_backend, SessionConfig::new(dir.path().join("second.wav")));
    assert_eq!(second.start(), Err(CaptureError::SessionActive));
    assert_eq!(second.state(), SessionState::Idle);
    assert!(second_backend.events().is_empty());

    first.stop().unwrap();
    assert!(second.start().is_ok());
    second.stop().unwrap();
}

#[test]
fn test_state_transitions_and_repeat_calls() {
    let _serial = SERIAL.lock();
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("states.wav");

    let backend = Arc::new(SyntheticBackend::new(cd_format()));
    let delegate = Arc::new(RecordingDelegate::default());
    let session = session(&backend, SessionConfig::new(&output)).with_delegate(delegate.clone());

    assert_eq!(session.stop(), Ok(None));
    session.start().unwrap();
    assert!(matches!(
        session.start(),
        Err(CaptureError::InvalidTransition {
            from: SessionState::Recording,
            ..
        })
    ));

    let first = session.stop().unwrap();
    let second = session.stop().unwrap();
    assert_eq!(first, second);
    assert_eq!(first.unwrap().stop_reason, StopReason::Requested);

    assert_eq!(
        *delegate.states.lock(),
        vec![
            SessionState::Starting,
            SessionState::Recording,
            SessionState::Stopping,
            SessionState::Stopped,
        ]
    );
    assert_eq!(delegate.finished.load(Ordering::SeqCst), 1);
}

#[test]
fn test_float_source_is_recorded_natively() {
    let _serial = SERIAL.lock();
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("float.wav");

    let float = FormatDescriptor::pcm(48000.0, 2, 32, SampleFormat::Float);
    let backend = Arc::new(SyntheticBackend::new(float).with_buffer(480, Duration::from_millis(5)));
    let config = SessionConfig::new(&output).with_max_duration(Some(Duration::from_millis(200)));
    let result = session(&backend, config).run().unwrap();

    assert_eq!(result.format, float);
    let header = parse_header(&fs::read(&output).unwrap()).unwrap();
    assert_eq!(header.format_tag, 3);
    assert_eq!(header.sample_rate, 48000);
    assert_eq!(header.block_align, 8);
    assert_eq!(header.data_size as u64, result.frames * 8);
}

#[test]
fn test_conversion_replaces_output() {
    let _serial = SERIAL.lock();
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("take.flac");

    let backend = Arc::new(SyntheticBackend::new(cd_format()));
    let config = SessionConfig {
        converter: Some(Arc::new(CopyConverter)),
        ..SessionConfig::new(&output).with_max_duration(Some(Duration::from_millis(100)))
    };
    let session = session(&backend, config);
    assert_eq!(session.native_path(), dir.path().join("take.wav"));

    let result = session.run().unwrap();
    assert_eq!(result.conversion, Some(ConversionOutcome::Converted));
    assert_eq!(result.file_path, output);
    assert!(output.exists());
    assert!(!result.native_path.exists());
    assert_eq!(result.checksum, sha256_file(&output).unwrap());
}

#[test]
fn test_converted_sidecar_checksum_matches_final_file() {
    let _serial = SERIAL.lock();
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("take.ogg");

    let backend = Arc::new(SyntheticBackend::new(cd_format()));
    let config = SessionConfig {
        converter: Some(Arc::new(CopyConverter)),
        write_metadata: true,
        ..SessionConfig::new(&output).with_max_duration(Some(Duration::from_millis(100)))
    };
    let result = session(&backend, config).run().unwrap();

    let metadata = read_metadata(&output).unwrap();
    assert_eq!(metadata.file_path, output.to_string_lossy());
    assert_eq!(metadata.checksum, sha256_file(&output).unwrap());
    assert_eq!(metadata.checksum, result.checksum);
}

#[test]
fn test_unrepresentable_duration_records_until_cancelled() {
    let _serial = SERIAL.lock();
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("forever.wav");

    let backend = Arc::new(SyntheticBackend::new(cd_format()));
    let config = SessionConfig::new(&output).with_max_duration(Duration::try_from_secs_f64(1e19).ok());
    assert!(config.max_duration.is_some());
    let session = session(&backend, config);
    let token = session.cancellation_token();

    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(200));
        token.cancel(StopReason::Cancelled)
    });

    let result = session.run().unwrap();
    assert!(canceller.join().unwrap());
    assert_eq!(result.stop_reason, StopReason::Cancelled);
    assert!(result.frames > 0);
}

#[test]
fn test_oversized_source_format_is_rejected() {
    let _serial = SERIAL.lock();
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("fast.wav");

    let backend = Arc::new(SyntheticBackend::new(FormatDescriptor::pcm(1.1e9, 2, 16, SampleFormat::Int)));
    let config = SessionConfig::new(&output).with_max_duration(Some(Duration::from_millis(100)));
    let session = session(&backend, config);

    let err = session.run().unwrap_err();
    assert_eq!(err, CaptureError::FormatUnavailable { attempts: 3 });
    assert_eq!(session.state(), SessionState::Failed);
    assert!(!output.exists());
    assert_eq!(backend.live_objects(), 0);
}

#[test]
fn test_failed_conversion_keeps_wav() {
    let _serial = SERIAL.lock();
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("take.m4a");

    let backend = Arc::new(SyntheticBackend::new(cd_format()));
    let config = SessionConfig {
        converter: Some(Arc::new(RefusingConverter)),
        ..SessionConfig::new(&output).with_max_duration(Some(Duration::from_millis(100)))
    };
    let result = session(&backend, config).run().unwrap();

    assert!(matches!(result.conversion, Some(ConversionOutcome::Failed(_))));
    assert_eq!(result.file_path, dir.path().join("take.wav"));
    assert!(result.file_path.exists());
    assert!(!output.exists());
}

#[test]
fn test_metadata_sidecar_describes_recording() {
    let _serial = SERIAL.lock();
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("described.wav");

    let backend = Arc::new(SyntheticBackend::new(cd_format()));
    let config = SessionConfig {
        write_metadata: true,
        ..SessionConfig::new(&output).with_max_duration(Some(Duration::from_millis(150)))
    };
    let result = session(&backend, config).run().unwrap();

    let metadata = read_metadata(&output).unwrap();
    assert_eq!(metadata.frames, result.frames);
    assert_eq!(metadata.data_bytes, result.data_bytes);
    assert_eq!(metadata.checksum, result.checksum);
    assert_eq!(metadata.channel_count, 2);
    assert_eq!(metadata.stop_reason, StopReason::DurationElapsed);
    assert!(metadata.conversion.is_none());
}
