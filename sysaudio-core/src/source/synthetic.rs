//! Synthetic capture backend.
//!
//! Generates a sine tone on a delivery thread, behaving like an OS
//! capture source (asynchronous readiness, fallible format reads, ordered
//! teardown) without requiring audio hardware or permissions. Used by the
//! `--test-tone` CLI mode and throughout the tests.

use std::collections::{HashMap, HashSet};
use std::f64::consts::TAU;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::models::audio_models::{AudioBuffer, DeliveryId, ObjectId};
use crate::models::error::CaptureError;
use crate::models::format::{FormatDescriptor, SampleFormat};
use crate::traits::capture_backend::{BufferCallback, CaptureBackend};

/// Status code reported for injected failures.
pub const SYNTHETIC_FAILURE_STATUS: i32 = -50;

/// Sleep granularity of an idle delivery thread.
const IDLE_POLL: Duration = Duration::from_millis(5);

/// Where an injected failure happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePoint {
    /// `create_tap` reports that no source exists.
    NoSource,
    CreateTap,
    CreateCompound,
    RegisterCallback,
    StartDevice,
}

/// Backend calls that changed OS-object state, in call order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendEvent {
    TapCreated(ObjectId),
    CompoundCreated(ObjectId),
    CallbackRegistered(DeliveryId),
    DeviceStarted(DeliveryId),
    DeviceStopped(DeliveryId),
    CallbackUnregistered(DeliveryId),
    CompoundDestroyed(ObjectId),
    TapReleased(ObjectId),
}

#[derive(Debug, Clone)]
struct SyntheticConfig {
    format: FormatDescriptor,
    frames_per_buffer: u32,
    buffer_interval: Duration,
    max_buffers: Option<u64>,
    tone_hz: f64,
    ready_after: Option<Duration>,
    failing_format_reads: u32,
    fail_at: Option<FailurePoint>,
}

#[derive(Default)]
struct Counters {
    format_reads: AtomicU32,
    alive_polls: AtomicU32,
    buffers_delivered: AtomicU64,
    frames_delivered: AtomicU64,
}

struct Worker {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Worker {
    fn stop(self) {
        self.running.store(false, Ordering::SeqCst);
        if self.handle.join().is_err() {
            log::error!("Synthetic delivery thread panicked");
        }
    }
}

struct Delivery {
    compound: ObjectId,
    callback: BufferCallback,
    worker: Option<Worker>,
}

#[derive(Default)]
struct SyntheticState {
    next_object: u32,
    next_delivery: u64,
    taps: HashSet<ObjectId>,
    compounds: HashMap<ObjectId, Instant>,
    deliveries: HashMap<DeliveryId, Delivery>,
    events: Vec<BackendEvent>,
}

impl SyntheticState {
    fn allocate_object(&mut self) -> ObjectId {
        self.next_object += 1;
        ObjectId(self.next_object)
    }
}

/// Sine-tone capture backend.
pub struct SyntheticBackend {
    config: SyntheticConfig,
    state: Mutex<SyntheticState>,
    counters: Arc<Counters>,
}

impl SyntheticBackend {
    /// A source that is ready immediately and delivers 10 ms buffers every 10 ms.
    pub fn new(format: FormatDescriptor) -> Self {
        let frames_per_buffer = ((format.sample_rate_hz / 100.0).round() as u32).max(1);
        Self {
            config: SyntheticConfig {
                format,
                frames_per_buffer,
                buffer_interval: Duration::from_millis(10),
                max_buffers: None,
                tone_hz: 440.0,
                ready_after: Some(Duration::ZERO),
                failing_format_reads: 0,
                fail_at: None,
            },
            state: Mutex::new(SyntheticState::default()),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn with_buffer(mut self, frames_per_buffer: u32, interval: Duration) -> Self {
        self.config.frames_per_buffer = frames_per_buffer.max(1);
        self.config.buffer_interval = interval;
        self
    }

    /// Stop producing after `count` buffers (the device stays started).
    pub fn with_buffer_limit(mut self, count: u64) -> Self {
        self.config.max_buffers = Some(count);
        self
    }

    pub fn with_tone(mut self, hz: f64) -> Self {
        self.config.tone_hz = hz;
        self
    }

    /// Report alive only once `delay` has passed since compound creation.
    pub fn ready_after(mut self, delay: Duration) -> Self {
        self.config.ready_after = Some(delay);
        self
    }

    pub fn never_ready(mut self) -> Self {
        self.config.ready_after = None;
        self
    }

    /// Fail the first `count` format reads.
    pub fn with_failing_format_reads(mut self, count: u32) -> Self {
        self.config.failing_format_reads = count;
        self
    }

    pub fn failing_at(mut self, point: FailurePoint) -> Self {
        self.config.fail_at = Some(point);
        self
    }

    pub fn format(&self) -> FormatDescriptor {
        self.config.format
    }

    pub fn events(&self) -> Vec<BackendEvent> {
        self.state.lock().events.clone()
    }

    pub fn format_reads(&self) -> u32 {
        self.counters.format_reads.load(Ordering::SeqCst)
    }

    pub fn alive_polls(&self) -> u32 {
        self.counters.alive_polls.load(Ordering::SeqCst)
    }

    pub fn buffers_delivered(&self) -> u64 {
        self.counters.buffers_delivered.load(Ordering::SeqCst)
    }

    pub fn frames_delivered(&self) -> u64 {
        self.counters.frames_delivered.load(Ordering::SeqCst)
    }

    /// Taps, compounds and registrations that have not been released.
    pub fn live_objects(&self) -> usize {
        let state = self.state.lock();
        state.taps.len() + state.compounds.len() + state.deliveries.len()
    }

    fn injected(&self, point: FailurePoint, context: &str) -> Result<(), CaptureError> {
        if self.config.fail_at != Some(point) {
            return Ok(());
        }
        Err(match point {
            FailurePoint::NoSource => CaptureError::SourceUnavailable("synthetic source disabled".into()),
            FailurePoint::CreateTap | FailurePoint::CreateCompound => CaptureError::AcquisitionFailed {
                code: SYNTHETIC_FAILURE_STATUS,
                context: context.into(),
            },
            FailurePoint::RegisterCallback | FailurePoint::StartDevice => CaptureError::StartFailed {
                code: SYNTHETIC_FAILURE_STATUS,
                context: context.into(),
            },
        })
    }

    fn spawn_worker(&self, callback: BufferCallback) -> Result<Worker, CaptureError> {
        let running = Arc::new(AtomicBool::new(true));
        let config = self.config.clone();
        let counters = Arc::clone(&self.counters);
        let flag = Arc::clone(&running);

        let handle = thread::Builder::new()
            .name("synthetic-delivery".into())
            .spawn(move || delivery_loop(config, counters, flag, callback))
            .map_err(|e| CaptureError::StartFailed {
                code: SYNTHETIC_FAILURE_STATUS,
                context: format!("failed to spawn delivery thread: {}", e),
            })?;

        Ok(Worker { running, handle })
    }
}

impl CaptureBackend for SyntheticBackend {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn create_tap(&self) -> Result<ObjectId, CaptureError> {
        self.injected(FailurePoint::NoSource, "create tap")?;
        self.injected(FailurePoint::CreateTap, "create tap")?;

        let mut state = self.state.lock();
        let tap = state.allocate_object();
        state.taps.insert(tap);
        state.events.push(BackendEvent::TapCreated(tap));
        Ok(tap)
    }

    fn create_compound(&self, tap: ObjectId) -> Result<ObjectId, CaptureError> {
        self.injected(FailurePoint::CreateCompound, "create aggregate device")?;

        let mut state = self.state.lock();
        if !state.taps.contains(&tap) {
            return Err(CaptureError::AcquisitionFailed {
                code: SYNTHETIC_FAILURE_STATUS,
                context: format!("unknown tap {}", tap),
            });
        }
        let compound = state.allocate_object();
        state.compounds.insert(compound, Instant::now());
        state.events.push(BackendEvent::CompoundCreated(compound));
        Ok(compound)
    }

    fn is_alive(&self, compound: ObjectId) -> bool {
        self.counters.alive_polls.fetch_add(1, Ordering::SeqCst);
        let Some(created) = self.state.lock().compounds.get(&compound).copied() else {
            return false;
        };
        match self.config.ready_after {
            Some(delay) => created.elapsed() >= delay,
            None => false,
        }
    }

    fn read_format(&self, compound: ObjectId) -> Result<FormatDescriptor, CaptureError> {
        let reads = self.counters.format_reads.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.state.lock().compounds.contains_key(&compound) {
            return Err(CaptureError::AcquisitionFailed {
                code: SYNTHETIC_FAILURE_STATUS,
                context: format!("unknown device {}", compound),
            });
        }
        if reads <= self.config.failing_format_reads {
            return Err(CaptureError::AcquisitionFailed {
                code: SYNTHETIC_FAILURE_STATUS,
                context: "stream format not yet known".into(),
            });
        }
        Ok(self.config.format)
    }

    fn register_callback(&self, compound: ObjectId, callback: BufferCallback) -> Result<DeliveryId, CaptureError> {
        self.injected(FailurePoint::RegisterCallback, "create IO proc")?;

        let mut state = self.state.lock();
        if !state.compounds.contains_key(&compound) {
            return Err(CaptureError::StartFailed {
                code: SYNTHETIC_FAILURE_STATUS,
                context: format!("unknown device {}", compound),
            });
        }
        state.next_delivery += 1;
        let id = DeliveryId(state.next_delivery);
        state.deliveries.insert(
            id,
            Delivery {
                compound,
                callback,
                worker: None,
            },
        );
        state.events.push(BackendEvent::CallbackRegistered(id));
        Ok(id)
    }

    fn start_device(&self, compound: ObjectId, delivery: DeliveryId) -> Result<(), CaptureError> {
        self.injected(FailurePoint::StartDevice, "start device")?;

        let mut state = self.state.lock();
        let callback = match state.deliveries.get(&delivery) {
            Some(d) if d.compound == compound && d.worker.is_none() => Arc::clone(&d.callback),
            Some(d) if d.worker.is_some() => return Ok(()),
            _ => {
                return Err(CaptureError::StartFailed {
                    code: SYNTHETIC_FAILURE_STATUS,
                    context: format!("no callback registered on {}", compound),
                })
            }
        };

        let worker = self.spawn_worker(callback)?;
        if let Some(d) = state.deliveries.get_mut(&delivery) {
            d.worker = Some(worker);
        }
        state.events.push(BackendEvent::DeviceStarted(delivery));
        Ok(())
    }

    fn stop_device(&self, _compound: ObjectId, delivery: DeliveryId) {
        let worker = {
            let mut state = self.state.lock();
            let worker = state.deliveries.get_mut(&delivery).and_then(|d| d.worker.take());
            if worker.is_some() {
                state.events.push(BackendEvent::DeviceStopped(delivery));
            }
            worker
        };
        // Joined outside the lock: the delivery thread never takes it, but
        // callers inspecting events while we wait should not block.
        if let Some(worker) = worker {
            worker.stop();
        }
    }

    fn unregister_callback(&self, _compound: ObjectId, delivery: DeliveryId) {
        let removed = {
            let mut state = self.state.lock();
            let removed = state.deliveries.remove(&delivery);
            if removed.is_some() {
                state.events.push(BackendEvent::CallbackUnregistered(delivery));
            }
            removed
        };
        if let Some(worker) = removed.and_then(|d| d.worker) {
            worker.stop();
        }
    }

    fn destroy_compound(&self, compound: ObjectId) {
        let orphans: Vec<Delivery> = {
            let mut state = self.state.lock();
            if state.compounds.remove(&compound).is_none() {
                return;
            }
            state.events.push(BackendEvent::CompoundDestroyed(compound));
            let ids: Vec<DeliveryId> = state
                .deliveries
                .iter()
                .filter(|(_, d)| d.compound == compound)
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| state.deliveries.remove(id)).collect()
        };
        for worker in orphans.into_iter().filter_map(|d| d.worker) {
            worker.stop();
        }
    }

    fn release_tap(&self, tap: ObjectId) {
        let mut state = self.state.lock();
        if state.taps.remove(&tap) {
            state.events.push(BackendEvent::TapReleased(tap));
        }
    }
}

impl Drop for SyntheticBackend {
    fn drop(&mut self) {
        let deliveries: Vec<Delivery> = self.state.get_mut().deliveries.drain().map(|(_, d)| d).collect();
        for worker in deliveries.into_iter().filter_map(|d| d.worker) {
            worker.stop();
        }
    }
}

fn delivery_loop(config: SyntheticConfig, counters: Arc<Counters>, running: Arc<AtomicBool>, callback: BufferCallback) {
    let mut tone = ToneGenerator::new(config.format, config.tone_hz);
    let mut bytes = Vec::with_capacity(config.frames_per_buffer as usize * config.format.bytes_per_frame as usize);
    let mut delivered: u64 = 0;

    while running.load(Ordering::SeqCst) {
        if config.max_buffers.is_some_and(|limit| delivered >= limit) {
            thread::sleep(IDLE_POLL);
            continue;
        }

        tone.fill(&mut bytes, config.frames_per_buffer);
        callback(&AudioBuffer::new(&bytes, config.frames_per_buffer));

        delivered += 1;
        counters.buffers_delivered.fetch_add(1, Ordering::SeqCst);
        counters
            .frames_delivered
            .fetch_add(config.frames_per_buffer as u64, Ordering::SeqCst);

        if !config.buffer_interval.is_zero() {
            thread::sleep(config.buffer_interval);
        }
    }
}

/// Renders a sine tone into any packed PCM layout.
pub struct ToneGenerator {
    format: FormatDescriptor,
    phase: f64,
    step: f64,
}

impl ToneGenerator {
    const AMPLITUDE: f64 = 0.25;

    pub fn new(format: FormatDescriptor, tone_hz: f64) -> Self {
        Self {
            format,
            phase: 0.0,
            step: TAU * tone_hz / format.sample_rate_hz,
        }
    }

    /// Replace `out` with `frames` frames of tone, identical on every channel.
    pub fn fill(&mut self, out: &mut Vec<u8>, frames: u32) {
        out.clear();
        for _ in 0..frames {
            let value = self.phase.sin() * Self::AMPLITUDE;
            self.phase = (self.phase + self.step) % TAU;
            for _ in 0..self.format.channel_count {
                self.push_sample(out, value);
            }
        }
    }

    fn push_sample(&self, out: &mut Vec<u8>, value: f64) {
        match (self.format.sample_format, self.format.bits_per_channel) {
            (SampleFormat::Float, 64) => out.extend_from_slice(&value.to_le_bytes()),
            (SampleFormat::Float, _) => out.extend_from_slice(&(value as f32).to_le_bytes()),
            // 8-bit WAV PCM is unsigned.
            (SampleFormat::Int, 8) => out.push((value * 127.0 + 128.0) as u8),
            (SampleFormat::Int, 16) => out.extend_from_slice(&((value * i16::MAX as f64) as i16).to_le_bytes()),
            (SampleFormat::Int, 24) => {
                let sample = (value * 8_388_607.0) as i32;
                out.extend_from_slice(&sample.to_le_bytes()[..3]);
            }
            (SampleFormat::Int, bits) => {
                let sample = (value * i32::MAX as f64) as i32;
                let bytes = sample.to_le_bytes();
                out.extend_from_slice(&bytes);
                out.resize(out.len() + (bits as usize / 8).saturating_sub(4), 0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stereo_16() -> FormatDescriptor {
        FormatDescriptor::pcm(44100.0, 2, 16, SampleFormat::Int)
    }

    #[test]
    fn tone_fills_whole_frames() {
        for format in [
            FormatDescriptor::pcm(8000.0, 1, 8, SampleFormat::Int),
            stereo_16(),
            FormatDescriptor::pcm(48000.0, 2, 24, SampleFormat::Int),
            FormatDescriptor::pcm(48000.0, 2, 32, SampleFormat::Float),
            FormatDescriptor::pcm(48000.0, 1, 64, SampleFormat::Float),
        ] {
            let mut tone = ToneGenerator::new(format, 440.0);
            let mut out = Vec::new();
            tone.fill(&mut out, 100);
            assert_eq!(out.len(), 100 * format.bytes_per_frame as usize, "{}", format);
        }
    }

    #[test]
    fn tone_is_not_silent() {
        let mut tone = ToneGenerator::new(stereo_16(), 440.0);
        let mut out = Vec::new();
        tone.fill(&mut out, 441);
        assert!(out.chunks(2).any(|s| i16::from_le_bytes([s[0], s[1]]).abs() > 1000));
    }

    #[test]
    fn delivers_until_limit_then_idles() {
        let backend = SyntheticBackend::new(stereo_16())
            .with_buffer(441, Duration::ZERO)
            .with_buffer_limit(5);
        let tap = backend.create_tap().unwrap();
        let compound = backend.create_compound(tap).unwrap();

        let seen = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&seen);
        let callback: BufferCallback = Arc::new(move |buffer: &AudioBuffer<'_>| {
            assert_eq!(buffer.len(), 441 * 4);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let delivery = backend.register_callback(compound, callback).unwrap();
        backend.start_device(compound, delivery).unwrap();
        thread::sleep(Duration::from_millis(100));
        backend.stop_device(compound, delivery);

        assert_eq!(seen.load(Ordering::SeqCst), 5);
        assert_eq!(backend.frames_delivered(), 5 * 441);
    }

    #[test]
    fn teardown_leaves_nothing_alive() {
        let backend = SyntheticBackend::new(stereo_16());
        let tap = backend.create_tap().unwrap();
        let compound = backend.create_compound(tap).unwrap();
        let delivery = backend.register_callback(compound, Arc::new(|_: &AudioBuffer<'_>| {})).unwrap();
        backend.start_device(compound, delivery).unwrap();

        backend.destroy_compound(compound);
        backend.release_tap(tap);
        assert_eq!(backend.live_objects(), 0);

        // Second release is ignored.
        backend.release_tap(tap);
        let releases = backend
            .events()
            .iter()
            .filter(|e| matches!(e, BackendEvent::TapReleased(_)))
            .count();
        assert_eq!(releases, 1);
    }

    #[test]
    fn injected_failures_surface_as_errors() {
        let backend = SyntheticBackend::new(stereo_16()).failing_at(FailurePoint::NoSource);
        assert!(matches!(backend.create_tap(), Err(CaptureError::SourceUnavailable(_))));

        let backend = SyntheticBackend::new(stereo_16()).failing_at(FailurePoint::CreateCompound);
        let tap = backend.create_tap().unwrap();
        assert!(matches!(
            backend.create_compound(tap),
            Err(CaptureError::AcquisitionFailed { code: SYNTHETIC_FAILURE_STATUS, .. })
        ));
    }

    #[test]
    fn readiness_follows_delay() {
        let backend = SyntheticBackend::new(stereo_16()).ready_after(Duration::from_millis(30));
        let tap = backend.create_tap().unwrap();
        let compound = backend.create_compound(tap).unwrap();
        assert!(!backend.is_alive(compound));
        thread::sleep(Duration::from_millis(40));
        assert!(backend.is_alive(compound));

        let never = SyntheticBackend::new(stereo_16()).never_ready();
        let tap = never.create_tap().unwrap();
        let compound = never.create_compound(tap).unwrap();
        assert!(!never.is_alive(compound));
    }
}
