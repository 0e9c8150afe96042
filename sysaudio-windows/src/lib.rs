//! # sysaudio-windows
//!
//! Windows WASAPI backend for sysaudio.
//!
//! Provides:
//! - `WasapiLoopbackBackend`: system audio capture via WASAPI loopback on the default render endpoint
//! - `DeviceEnumerator`: render endpoint lookup via the MMDevice API
//!
//! ## Platform Requirements
//! - Windows 10 1703+ (build 15063)
//! - Visual Studio Build Tools 2022 + Windows SDK for linking
//!
//! ## Usage
//! ```ignore
//! use std::sync::Arc;
//! use sysaudio_core::{CaptureSession, SessionConfig};
//! use sysaudio_windows::WasapiLoopbackBackend;
//!
//! let session = CaptureSession::new(Arc::new(WasapiLoopbackBackend::new()), SessionConfig::new("out.wav"));
//! let result = session.run()?;
//! ```

#[cfg(target_os = "windows")]
pub mod device_enumerator;
#[cfg(target_os = "windows")]
pub mod wasapi_loopback;

#[cfg(target_os = "windows")]
pub use device_enumerator::{DeviceEnumerator, RenderEndpoint};
#[cfg(target_os = "windows")]
pub use wasapi_loopback::WasapiLoopbackBackend;

/// Map a failed COM call onto the acquisition error, keeping its HRESULT.
#[cfg(target_os = "windows")]
pub(crate) fn os_error(context: &str, e: windows::core::Error) -> sysaudio_core::CaptureError {
    sysaudio_core::CaptureError::AcquisitionFailed {
        code: e.code().0,
        context: format!("{}: {}", context, e.message()),
    }
}
