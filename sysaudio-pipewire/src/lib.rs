//! # sysaudio-pipewire
//!
//! Linux PipeWire backend for sysaudio.
//!
//! Provides `PipeWireMonitorBackend`, which records the default sink's
//! monitor (everything the system is playing) as 32-bit float PCM at the
//! sink's native rate.
//!
//! Built only with the `pipewire` feature on Linux; it links against
//! `libpipewire-0.3`.

#[cfg(all(target_os = "linux", feature = "pipewire"))]
pub mod monitor;

#[cfg(all(target_os = "linux", feature = "pipewire"))]
pub use monitor::PipeWireMonitorBackend;
