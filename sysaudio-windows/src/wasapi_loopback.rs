//! WASAPI loopback capture backend for system audio.
//!
//! Captures the mix going to the default render endpoint using
//! `AUDCLNT_STREAMFLAGS_LOOPBACK`. No special permissions needed on Windows.
//!
//! ## Object mapping
//! - tap: the default render endpoint (id + friendly name)
//! - compound: a device thread that owns COM, the `IAudioClient` and its
//!   `IAudioCaptureClient`; all COM calls happen on that thread
//!
//! ```text
//! caller ──Start/Stop/Shutdown──► device thread ──ack──► caller
//!                                   │ poll every 10ms while running
//!                                   ▼
//!                              BufferCallback
//! ```
//!
//! Stop is acknowledged from the device thread between polls, so no
//! callback can be in flight once `stop_device` returns.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use windows::core::PCWSTR;
use windows::Win32::Media::Audio::*;
use windows::Win32::System::Com::*;
use windows::Win32::System::Threading::*;

use sysaudio_core::models::audio_models::{AudioBuffer, DeliveryId, ObjectId};
use sysaudio_core::models::error::CaptureError;
use sysaudio_core::models::format::{FormatDescriptor, SampleFormat};
use sysaudio_core::traits::capture_backend::{BufferCallback, CaptureBackend};

use crate::device_enumerator::{DeviceEnumerator, RenderEndpoint};
use crate::os_error;

const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Shared-mode engine buffer, in 100ns units (100 ms).
const BUFFER_DURATION: i64 = 1_000_000;

const FORMAT_TAG_PCM: u16 = 1;
const FORMAT_TAG_IEEE_FLOAT: u16 = 3;
const FORMAT_TAG_EXTENSIBLE: u16 = 0xFFFE;

enum Command {
    Start {
        callback: BufferCallback,
        ack: SyncSender<Result<(), CaptureError>>,
    },
    Stop {
        ack: SyncSender<()>,
    },
    Shutdown,
}

/// State published by the device thread.
#[derive(Default)]
struct DeviceShared {
    alive: AtomicBool,
    format: Mutex<Option<Result<FormatDescriptor, CaptureError>>>,
}

struct LoopbackDevice {
    shared: Arc<DeviceShared>,
    commands: Sender<Command>,
    thread: Option<JoinHandle<()>>,
    registered: Option<(DeliveryId, BufferCallback)>,
}

impl LoopbackDevice {
    fn shutdown(mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                log::error!("Loopback device thread panicked");
            }
        }
    }
}

#[derive(Default)]
struct BackendState {
    next_object: u32,
    next_delivery: u64,
    taps: HashMap<ObjectId, RenderEndpoint>,
    devices: HashMap<ObjectId, LoopbackDevice>,
}

impl BackendState {
    fn allocate_object(&mut self) -> ObjectId {
        self.next_object += 1;
        ObjectId(self.next_object)
    }
}

/// System audio capture through WASAPI loopback on the default render device.
#[derive(Default)]
pub struct WasapiLoopbackBackend {
    state: Mutex<BackendState>,
}

impl WasapiLoopbackBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send a command that expects an acknowledgement and wait for it.
    fn request<T>(
        &self,
        compound: ObjectId,
        make: impl FnOnce(SyncSender<T>) -> Command,
    ) -> Result<T, CaptureError> {
        let (ack_tx, ack_rx) = mpsc::sync_channel(1);
        let sent = {
            let state = self.state.lock();
            let device = state.devices.get(&compound).ok_or_else(|| CaptureError::StartFailed {
                code: 0,
                context: format!("unknown device {}", compound),
            })?;
            device.commands.send(make(ack_tx)).is_ok()
        };
        // The lock is released while waiting: the device thread never takes it.
        if !sent {
            return Err(CaptureError::StartFailed {
                code: 0,
                context: "loopback device thread has exited".into(),
            });
        }
        ack_rx.recv().map_err(|_| CaptureError::StartFailed {
            code: 0,
            context: "loopback device thread has exited".into(),
        })
    }
}

impl CaptureBackend for WasapiLoopbackBackend {
    fn name(&self) -> &str {
        "wasapi-loopback"
    }

    fn create_tap(&self) -> Result<ObjectId, CaptureError> {
        let endpoint = with_mta(|| DeviceEnumerator::new()?.default_render_endpoint())?;
        log::info!("Loopback source: {}", endpoint.name);

        let mut state = self.state.lock();
        let tap = state.allocate_object();
        state.taps.insert(tap, endpoint);
        Ok(tap)
    }

    fn create_compound(&self, tap: ObjectId) -> Result<ObjectId, CaptureError> {
        let mut state = self.state.lock();
        let endpoint_id = state
            .taps
            .get(&tap)
            .map(|e| e.id.clone())
            .ok_or_else(|| CaptureError::AcquisitionFailed {
                code: 0,
                context: format!("unknown tap {}", tap),
            })?;

        let shared = Arc::new(DeviceShared::default());
        let (commands, receiver) = mpsc::channel();
        let thread_shared = Arc::clone(&shared);

        let handle = thread::Builder::new()
            .name("wasapi-loopback-capture".into())
            .spawn(move || device_thread(endpoint_id, thread_shared, receiver))
            .map_err(|e| CaptureError::AcquisitionFailed {
                code: 0,
                context: format!("failed to spawn loopback thread: {}", e),
            })?;

        let compound = state.allocate_object();
        state.devices.insert(
            compound,
            LoopbackDevice {
                shared,
                commands,
                thread: Some(handle),
                registered: None,
            },
        );
        Ok(compound)
    }

    fn is_alive(&self, compound: ObjectId) -> bool {
        self.state
            .lock()
            .devices
            .get(&compound)
            .is_some_and(|d| d.shared.alive.load(Ordering::Acquire))
    }

    fn read_format(&self, compound: ObjectId) -> Result<FormatDescriptor, CaptureError> {
        let state = self.state.lock();
        let device = state.devices.get(&compound).ok_or_else(|| CaptureError::AcquisitionFailed {
            code: 0,
            context: format!("unknown device {}", compound),
        })?;
        let format = device.shared.format.lock().clone();
        format.unwrap_or_else(|| {
            Err(CaptureError::AcquisitionFailed {
                code: 0,
                context: "mix format not yet known".into(),
            })
        })
    }

    fn register_callback(&self, compound: ObjectId, callback: BufferCallback) -> Result<DeliveryId, CaptureError> {
        let mut state = self.state.lock();
        state.next_delivery += 1;
        let delivery = DeliveryId(state.next_delivery);
        let device = state.devices.get_mut(&compound).ok_or_else(|| CaptureError::StartFailed {
            code: 0,
            context: format!("unknown device {}", compound),
        })?;
        if device.registered.is_some() {
            return Err(CaptureError::AlreadyRecording);
        }
        device.registered = Some((delivery, callback));
        Ok(delivery)
    }

    fn start_device(&self, compound: ObjectId, delivery: DeliveryId) -> Result<(), CaptureError> {
        let callback = {
            let state = self.state.lock();
            match state.devices.get(&compound).and_then(|d| d.registered.as_ref()) {
                Some((id, callback)) if *id == delivery => Arc::clone(callback),
                _ => {
                    return Err(CaptureError::StartFailed {
                        code: 0,
                        context: format!("no callback registered on {}", compound),
                    })
                }
            }
        };
        self.request(compound, |ack| Command::Start { callback, ack })?
    }

    fn stop_device(&self, compound: ObjectId, _delivery: DeliveryId) {
        if let Err(e) = self.request(compound, |ack| Command::Stop { ack }) {
            log::debug!("Stop on {}: {}", compound, e);
        }
    }

    fn unregister_callback(&self, compound: ObjectId, delivery: DeliveryId) {
        let mut state = self.state.lock();
        if let Some(device) = state.devices.get_mut(&compound) {
            if device.registered.as_ref().is_some_and(|(id, _)| *id == delivery) {
                device.registered = None;
            }
        }
    }

    fn destroy_compound(&self, compound: ObjectId) {
        let device = self.state.lock().devices.remove(&compound);
        if let Some(device) = device {
            device.shutdown();
        }
    }

    fn release_tap(&self, tap: ObjectId) {
        self.state.lock().taps.remove(&tap);
    }
}

impl Drop for WasapiLoopbackBackend {
    fn drop(&mut self) {
        let devices: Vec<LoopbackDevice> = self.state.get_mut().devices.drain().map(|(_, d)| d).collect();
        for device in devices {
            device.shutdown();
        }
    }
}

/// Run `f` on a short-lived thread with its own multithreaded COM apartment.
fn with_mta<T: Send + 'static>(
    f: impl FnOnce() -> Result<T, CaptureError> + Send + 'static,
) -> Result<T, CaptureError> {
    let handle = thread::Builder::new()
        .name("wasapi-com".into())
        .spawn(move || unsafe {
            CoInitializeEx(None, COINIT_MULTITHREADED)
                .ok()
                .map_err(|e| os_error("CoInitializeEx", e))?;
            let _com_guard = CoUninitializeGuard;
            f()
        })
        .map_err(|e| CaptureError::AcquisitionFailed {
            code: 0,
            context: format!("failed to spawn COM thread: {}", e),
        })?;
    handle.join().unwrap_or_else(|_| {
        Err(CaptureError::AcquisitionFailed {
            code: 0,
            context: "COM thread panicked".into(),
        })
    })
}

/// Everything the device thread needs to pull packets.
struct LoopbackClient {
    audio_client: IAudioClient,
    capture_client: IAudioCaptureClient,
    format: FormatDescriptor,
}

/// Device thread entry point.
///
/// Sequence:
/// 1. CoInitializeEx (MTA)
/// 2. Open the render endpoint chosen by the tap
/// 3. Activate IAudioClient, read the mix format
/// 4. Initialize with LOOPBACK flag in shared mode
/// 5. Get IAudioCaptureClient, publish format, report alive
/// 6. Serve commands, polling packets every 10ms while started
fn device_thread(endpoint_id: String, shared: Arc<DeviceShared>, commands: Receiver<Command>) {
    unsafe {
        if let Err(e) = CoInitializeEx(None, COINIT_MULTITHREADED).ok() {
            *shared.format.lock() = Some(Err(os_error("CoInitializeEx", e)));
            return;
        }
        let _com_guard = CoUninitializeGuard;

        let client = match open_loopback(&endpoint_id) {
            Ok(client) => client,
            Err(e) => {
                log::error!("Loopback initialization failed: {}", e);
                *shared.format.lock() = Some(Err(e));
                return;
            }
        };
        *shared.format.lock() = Some(Ok(client.format));
        shared.alive.store(true, Ordering::Release);

        // MMCSS registration for real-time priority
        let mut task_index: u32 = 0;
        let task_name: Vec<u16> = "Pro Audio\0".encode_utf16().collect();
        let _mmcss_handle = AvSetMmThreadCharacteristicsW(PCWSTR(task_name.as_ptr()), &mut task_index);

        serve(&client, &commands);

        let _ = client.audio_client.Stop();
        shared.alive.store(false, Ordering::Release);
    }
}

unsafe fn open_loopback(endpoint_id: &str) -> Result<LoopbackClient, CaptureError> {
    let device = DeviceEnumerator::new()?.device(endpoint_id)?;

    let audio_client: IAudioClient = device
        .Activate(CLSCTX_ALL, None)
        .map_err(|e| os_error("IMMDevice::Activate", e))?;

    let mix_format_ptr = audio_client
        .GetMixFormat()
        .map_err(|e| os_error("IAudioClient::GetMixFormat", e))?;

    let described = describe_mix_format(mix_format_ptr);
    let initialized = audio_client.Initialize(
        AUDCLNT_SHAREMODE_SHARED,
        AUDCLNT_STREAMFLAGS_LOOPBACK | AUDCLNT_STREAMFLAGS_NOPERSIST,
        BUFFER_DURATION,
        0,
        mix_format_ptr,
        None,
    );
    CoTaskMemFree(Some(mix_format_ptr as *const _));

    let format = described?;
    initialized.map_err(|e| os_error("IAudioClient::Initialize (loopback)", e))?;

    let capture_client: IAudioCaptureClient = audio_client
        .GetService()
        .map_err(|e| os_error("IAudioClient::GetService", e))?;

    Ok(LoopbackClient {
        audio_client,
        capture_client,
        format,
    })
}

/// Translate the engine mix format. Float is signalled either by the
/// format tag or by the extensible sub-format GUID.
unsafe fn describe_mix_format(ptr: *const WAVEFORMATEX) -> Result<FormatDescriptor, CaptureError> {
    let mix = std::ptr::read_unaligned(ptr);
    let tag = mix.wFormatTag;

    let sub_format = if tag == FORMAT_TAG_EXTENSIBLE {
        let extensible = std::ptr::read_unaligned(ptr as *const WAVEFORMATEXTENSIBLE);
        extensible.SubFormat.data1 as u16
    } else {
        tag
    };

    let sample_format = match sub_format {
        FORMAT_TAG_IEEE_FLOAT => SampleFormat::Float,
        FORMAT_TAG_PCM => SampleFormat::Int,
        other => {
            return Err(CaptureError::AcquisitionFailed {
                code: 0,
                context: format!("unsupported mix format tag {:#06x}", other),
            })
        }
    };

    let format = FormatDescriptor {
        sample_rate_hz: mix.nSamplesPerSec as f64,
        channel_count: mix.nChannels,
        bits_per_channel: mix.wBitsPerSample,
        bytes_per_frame: mix.nBlockAlign as u32,
        sample_format,
    };
    format.validate()?;
    Ok(format)
}

/// Command loop. Returns on `Shutdown` or when the backend is dropped.
unsafe fn serve(client: &LoopbackClient, commands: &Receiver<Command>) {
    let mut callback: Option<BufferCallback> = None;

    loop {
        let command = if callback.is_some() {
            match commands.recv_timeout(POLL_INTERVAL) {
                Ok(command) => Some(command),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => return,
            }
        } else {
            match commands.recv() {
                Ok(command) => Some(command),
                Err(_) => return,
            }
        };

        match command {
            Some(Command::Start { callback: cb, ack }) => {
                let started = client.audio_client.Start().map_err(|e| CaptureError::StartFailed {
                    code: e.code().0,
                    context: format!("IAudioClient::Start: {}", e),
                });
                if started.is_ok() {
                    callback = Some(cb);
                }
                let _ = ack.send(started);
            }
            Some(Command::Stop { ack }) => {
                if callback.take().is_some() {
                    let _ = client.audio_client.Stop();
                }
                let _ = ack.send(());
            }
            Some(Command::Shutdown) => return,
            None => {
                if let Some(cb) = &callback {
                    if let Err(e) = drain_packets(client, cb) {
                        log::error!("Loopback capture error: {}", e);
                        let _ = client.audio_client.Stop();
                        callback = None;
                    }
                }
            }
        }
    }
}

unsafe fn drain_packets(client: &LoopbackClient, callback: &BufferCallback) -> Result<(), CaptureError> {
    let block_align = client.format.bytes_per_frame as usize;
    let capture = &client.capture_client;

    let mut packet_length = capture
        .GetNextPacketSize()
        .map_err(|e| os_error("GetNextPacketSize", e))?;

    while packet_length > 0 {
        let mut buffer_ptr: *mut u8 = std::ptr::null_mut();
        let mut num_frames: u32 = 0;
        let mut flags: u32 = 0;

        capture
            .GetBuffer(&mut buffer_ptr, &mut num_frames, &mut flags, None, None)
            .map_err(|e| os_error("GetBuffer", e))?;

        if num_frames > 0 && !buffer_ptr.is_null() {
            let len = num_frames as usize * block_align;
            if flags & (AUDCLNT_BUFFERFLAGS_SILENT.0 as u32) != 0 {
                let silence = vec![0u8; len];
                callback(&AudioBuffer::new(&silence, num_frames));
            } else {
                let bytes = std::slice::from_raw_parts(buffer_ptr, len);
                callback(&AudioBuffer::new(bytes, num_frames));
            }
        }

        capture
            .ReleaseBuffer(num_frames)
            .map_err(|e| os_error("ReleaseBuffer", e))?;

        packet_length = capture
            .GetNextPacketSize()
            .map_err(|e| os_error("GetNextPacketSize", e))?;
    }
    Ok(())
}

struct CoUninitializeGuard;

impl Drop for CoUninitializeGuard {
    fn drop(&mut self) {
        unsafe {
            CoUninitialize();
        }
    }
}
