//! System audio capture from the default PipeWire sink monitor.
//!
//! ## Object mapping
//! - tap: a verified connection target (the daemon answered a connect)
//! - compound: a loop thread owning the main loop, context, core and an
//!   input stream with `stream.capture.sink = true`
//!
//! The stream's process callback runs on the loop thread (no
//! `RT_PROCESS`), and start/stop install or remove the buffer callback on
//! that same thread. Once a stop is acknowledged no callback can be in
//! flight.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use pipewire as pw;
use pw::spa;
use pw::spa::param::format::{MediaSubtype, MediaType};
use pw::spa::param::format_utils;
use pw::spa::pod::Pod;

use sysaudio_core::models::audio_models::{AudioBuffer, DeliveryId, ObjectId};
use sysaudio_core::models::error::CaptureError;
use sysaudio_core::models::format::{FormatDescriptor, SampleFormat};
use sysaudio_core::traits::capture_backend::{BufferCallback, CaptureBackend};

const STREAM_NAME: &str = "sysaudio-monitor";

enum StreamCommand {
    Install { callback: BufferCallback, ack: SyncSender<()> },
    Remove { ack: SyncSender<()> },
    Shutdown,
}

/// State published by the loop thread.
#[derive(Default)]
struct StreamShared {
    negotiated: AtomicBool,
    format: Mutex<Option<Result<FormatDescriptor, CaptureError>>>,
}

struct MonitorStream {
    shared: Arc<StreamShared>,
    commands: pw::channel::Sender<StreamCommand>,
    thread: Option<JoinHandle<()>>,
    registered: Option<(DeliveryId, BufferCallback)>,
}

impl MonitorStream {
    fn shutdown(mut self) {
        let _ = self.commands.send(StreamCommand::Shutdown);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                log::error!("PipeWire loop thread panicked");
            }
        }
    }

    /// Send a command and wait for the loop thread to acknowledge it.
    fn request(&self, make: impl FnOnce(SyncSender<()>) -> StreamCommand) -> Result<(), CaptureError> {
        let (ack_tx, ack_rx) = mpsc::sync_channel(1);
        let exited = || CaptureError::StartFailed {
            code: 0,
            context: "PipeWire loop thread has exited".into(),
        };
        self.commands.send(make(ack_tx)).map_err(|_| exited())?;
        ack_rx.recv().map_err(|_| exited())
    }
}

#[derive(Default)]
struct BackendState {
    next_object: u32,
    next_delivery: u64,
    taps: Vec<ObjectId>,
    streams: HashMap<ObjectId, MonitorStream>,
}

impl BackendState {
    fn allocate_object(&mut self) -> ObjectId {
        self.next_object += 1;
        ObjectId(self.next_object)
    }
}

/// Records whatever the default sink plays, through its PipeWire monitor.
#[derive(Default)]
pub struct PipeWireMonitorBackend {
    state: Mutex<BackendState>,
}

impl PipeWireMonitorBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CaptureBackend for PipeWireMonitorBackend {
    fn name(&self) -> &str {
        "pipewire-monitor"
    }

    fn create_tap(&self) -> Result<ObjectId, CaptureError> {
        probe_daemon()?;
        let mut state = self.state.lock();
        let tap = state.allocate_object();
        state.taps.push(tap);
        Ok(tap)
    }

    fn create_compound(&self, tap: ObjectId) -> Result<ObjectId, CaptureError> {
        let mut state = self.state.lock();
        if !state.taps.contains(&tap) {
            return Err(CaptureError::AcquisitionFailed {
                code: 0,
                context: format!("unknown tap {}", tap),
            });
        }

        let shared = Arc::new(StreamShared::default());
        let (commands, receiver) = pw::channel::channel::<StreamCommand>();
        let thread_shared = Arc::clone(&shared);

        let handle = thread::Builder::new()
            .name("pipewire-monitor".into())
            .spawn(move || {
                if let Err(e) = run_stream_loop(&thread_shared, receiver) {
                    log::error!("PipeWire monitor stream failed: {}", e);
                    *thread_shared.format.lock() = Some(Err(e));
                }
                thread_shared.negotiated.store(false, Ordering::Release);
            })
            .map_err(|e| CaptureError::AcquisitionFailed {
                code: 0,
                context: format!("failed to spawn PipeWire thread: {}", e),
            })?;

        let compound = state.allocate_object();
        state.streams.insert(
            compound,
            MonitorStream {
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
            .streams
            .get(&compound)
            .is_some_and(|s| s.shared.negotiated.load(Ordering::Acquire))
    }

    fn read_format(&self, compound: ObjectId) -> Result<FormatDescriptor, CaptureError> {
        let state = self.state.lock();
        let stream = state.streams.get(&compound).ok_or_else(|| CaptureError::AcquisitionFailed {
            code: 0,
            context: format!("unknown stream {}", compound),
        })?;
        let format = stream.shared.format.lock().clone();
        format.unwrap_or_else(|| {
            Err(CaptureError::AcquisitionFailed {
                code: 0,
                context: "stream format not negotiated yet".into(),
            })
        })
    }

    fn register_callback(&self, compound: ObjectId, callback: BufferCallback) -> Result<DeliveryId, CaptureError> {
        let mut state = self.state.lock();
        state.next_delivery += 1;
        let delivery = DeliveryId(state.next_delivery);
        let stream = state.streams.get_mut(&compound).ok_or_else(|| CaptureError::StartFailed {
            code: 0,
            context: format!("unknown stream {}", compound),
        })?;
        if stream.registered.is_some() {
            return Err(CaptureError::AlreadyRecording);
        }
        stream.registered = Some((delivery, callback));
        Ok(delivery)
    }

    fn start_device(&self, compound: ObjectId, delivery: DeliveryId) -> Result<(), CaptureError> {
        let state = self.state.lock();
        let stream = state.streams.get(&compound).ok_or_else(|| CaptureError::StartFailed {
            code: 0,
            context: format!("unknown stream {}", compound),
        })?;
        let callback = match &stream.registered {
            Some((id, callback)) if *id == delivery => Arc::clone(callback),
            _ => {
                return Err(CaptureError::StartFailed {
                    code: 0,
                    context: format!("no callback registered on {}", compound),
                })
            }
        };
        // The loop thread never takes the backend lock, so waiting here is safe.
        stream.request(|ack| StreamCommand::Install { callback, ack })
    }

    fn stop_device(&self, compound: ObjectId, _delivery: DeliveryId) {
        let state = self.state.lock();
        if let Some(stream) = state.streams.get(&compound) {
            if let Err(e) = stream.request(|ack| StreamCommand::Remove { ack }) {
                log::debug!("Stop on {}: {}", compound, e);
            }
        }
    }

    fn unregister_callback(&self, compound: ObjectId, delivery: DeliveryId) {
        let mut state = self.state.lock();
        if let Some(stream) = state.streams.get_mut(&compound) {
            if stream.registered.as_ref().is_some_and(|(id, _)| *id == delivery) {
                stream.registered = None;
            }
        }
    }

    fn destroy_compound(&self, compound: ObjectId) {
        let stream = self.state.lock().streams.remove(&compound);
        if let Some(stream) = stream {
            stream.shutdown();
        }
    }

    fn release_tap(&self, tap: ObjectId) {
        self.state.lock().taps.retain(|t| *t != tap);
    }
}

impl Drop for PipeWireMonitorBackend {
    fn drop(&mut self) {
        let streams: Vec<MonitorStream> = self.state.get_mut().streams.drain().map(|(_, s)| s).collect();
        for stream in streams {
            stream.shutdown();
        }
    }
}

/// Connect to the daemon once to make sure there is something to record.
fn probe_daemon() -> Result<(), CaptureError> {
    pw::init();

    let mainloop = pw::main_loop::MainLoopRc::new(None)
        .map_err(|e| CaptureError::SourceUnavailable(format!("failed to create PipeWire main loop: {}", e)))?;
    let context = pw::context::ContextRc::new(&mainloop, None)
        .map_err(|e| CaptureError::SourceUnavailable(format!("failed to create PipeWire context: {}", e)))?;
    let _core = context
        .connect_rc(None)
        .map_err(|e| CaptureError::SourceUnavailable(format!("PipeWire daemon not reachable: {}", e)))?;
    Ok(())
}

fn stream_error(context: &str, e: impl std::fmt::Display) -> CaptureError {
    CaptureError::AcquisitionFailed {
        code: 0,
        context: format!("{}: {}", context, e),
    }
}

/// User data for the stream callbacks. Lives on the loop thread only.
struct StreamData {
    format: spa::param::audio::AudioInfoRaw,
    bytes_per_frame: usize,
    shared: Arc<StreamShared>,
    callback: Rc<RefCell<Option<BufferCallback>>>,
}

/// Run the monitor stream until `Shutdown` or until the backend is dropped.
fn run_stream_loop(
    shared: &Arc<StreamShared>,
    receiver: pw::channel::Receiver<StreamCommand>,
) -> Result<(), CaptureError> {
    pw::init();

    let mainloop =
        pw::main_loop::MainLoopRc::new(None).map_err(|e| stream_error("failed to create PipeWire main loop", e))?;
    let context =
        pw::context::ContextRc::new(&mainloop, None).map_err(|e| stream_error("failed to create PipeWire context", e))?;
    let core = context
        .connect_rc(None)
        .map_err(|e| stream_error("failed to connect to PipeWire", e))?;

    let slot: Rc<RefCell<Option<BufferCallback>>> = Rc::new(RefCell::new(None));

    let mainloop_weak = mainloop.downgrade();
    let command_slot = Rc::clone(&slot);
    let _receiver = receiver.attach(mainloop.loop_(), move |command| match command {
        StreamCommand::Install { callback, ack } => {
            *command_slot.borrow_mut() = Some(callback);
            let _ = ack.send(());
        }
        StreamCommand::Remove { ack } => {
            command_slot.borrow_mut().take();
            let _ = ack.send(());
        }
        StreamCommand::Shutdown => {
            command_slot.borrow_mut().take();
            if let Some(mainloop) = mainloop_weak.upgrade() {
                mainloop.quit();
            }
        }
    });

    let props = pw::properties::properties! {
        *pw::keys::MEDIA_TYPE => "Audio",
        *pw::keys::MEDIA_CATEGORY => "Capture",
        *pw::keys::MEDIA_ROLE => "Music",
        *pw::keys::APP_NAME => "sysaudio",
        "stream.capture.sink" => "true",
    };

    let stream = pw::stream::StreamBox::new(&core, STREAM_NAME, props)
        .map_err(|e| stream_error("failed to create PipeWire stream", e))?;

    let user_data = StreamData {
        format: Default::default(),
        bytes_per_frame: 0,
        shared: Arc::clone(shared),
        callback: slot,
    };

    let _listener = stream
        .add_local_listener_with_user_data(user_data)
        .param_changed(|_, data, id, param| {
            let Some(param) = param else { return };
            if id != spa::param::ParamType::Format.as_raw() {
                return;
            }

            let (media_type, media_subtype) = match format_utils::parse_format(param) {
                Ok(v) => v,
                Err(_) => return,
            };
            if media_type != MediaType::Audio || media_subtype != MediaSubtype::Raw {
                return;
            }

            let negotiated = match data.format.parse(param) {
                Ok(_) if data.format.format() == spa::param::audio::AudioFormat::F32LE => {
                    let channels = data.format.channels().min(u16::MAX as u32) as u16;
                    let format = FormatDescriptor::pcm(data.format.rate() as f64, channels, 32, SampleFormat::Float);
                    format.validate().map(|()| format)
                }
                Ok(_) => Err(stream_error("unexpected sample format", format!("{:?}", data.format.format()))),
                Err(e) => Err(stream_error("failed to parse stream format", format!("{:?}", e))),
            };

            if let Ok(format) = &negotiated {
                data.bytes_per_frame = format.bytes_per_frame as usize;
                log::debug!("PipeWire monitor negotiated {}", format);
            }
            let ok = negotiated.is_ok();
            *data.shared.format.lock() = Some(negotiated);
            data.shared.negotiated.store(ok, Ordering::Release);
        })
        .process(|stream, data| {
            let Some(mut buffer) = stream.dequeue_buffer() else {
                return;
            };
            let Some(callback) = data.callback.borrow().clone() else {
                return;
            };
            if data.bytes_per_frame == 0 {
                return;
            }

            let datas = buffer.datas_mut();
            if datas.is_empty() {
                return;
            }
            let chunk = &mut datas[0];
            let offset = chunk.chunk().offset() as usize;
            let size = chunk.chunk().size() as usize;

            if let Some(bytes) = chunk.data() {
                let end = offset.saturating_add(size).min(bytes.len());
                let bytes = &bytes[offset.min(end)..end];
                let frames = bytes.len() / data.bytes_per_frame;
                callback(&AudioBuffer::new(bytes, frames as u32));
            }
        })
        .register()
        .map_err(|e| stream_error("failed to register stream listener", e))?;

    // Request F32LE at the sink's native rate and channel layout.
    let mut audio_info = spa::param::audio::AudioInfoRaw::new();
    audio_info.set_format(spa::param::audio::AudioFormat::F32LE);

    let obj = spa::pod::Object {
        type_: spa::utils::SpaTypes::ObjectParamFormat.as_raw(),
        id: spa::param::ParamType::EnumFormat.as_raw(),
        properties: audio_info.into(),
    };

    let values: Vec<u8> = spa::pod::serialize::PodSerializer::serialize(
        std::io::Cursor::new(Vec::new()),
        &spa::pod::Value::Object(obj),
    )
    .map_err(|e| stream_error("failed to serialize audio format", format!("{:?}", e)))?
    .0
    .into_inner();

    let format_pod = Pod::from_bytes(&values).ok_or_else(|| stream_error("invalid format pod", "empty"))?;
    let mut params = [format_pod];

    stream
        .connect(
            spa::utils::Direction::Input,
            None,
            pw::stream::StreamFlags::AUTOCONNECT | pw::stream::StreamFlags::MAP_BUFFERS,
            &mut params,
        )
        .map_err(|e| stream_error("failed to connect stream", e))?;

    mainloop.run();
    Ok(())
}
