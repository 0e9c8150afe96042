//! Render endpoint lookup via the MMDevice API.
//!
//! Loopback capture reads from a *render* endpoint, so only output devices
//! are resolved here.

use std::iter;

use windows::core::*;
use windows::Win32::Devices::FunctionDiscovery::*;
use windows::Win32::Media::Audio::*;
use windows::Win32::System::Com::StructuredStorage::PropVariantClear;
use windows::Win32::System::Com::*;
use windows::Win32::System::Variant::*;

use sysaudio_core::models::error::CaptureError;

use crate::os_error;

/// A render endpoint that can be opened in loopback mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderEndpoint {
    pub id: String,
    pub name: String,
}

/// Audio endpoint lookup using the Windows MMDevice API.
pub struct DeviceEnumerator {
    enumerator: IMMDeviceEnumerator,
}

impl DeviceEnumerator {
    /// Requires COM to be initialized on the calling thread.
    pub fn new() -> std::result::Result<Self, CaptureError> {
        unsafe {
            let enumerator: IMMDeviceEnumerator = CoCreateInstance(&MMDeviceEnumerator, None, CLSCTX_ALL)
                .map_err(|e| os_error("create device enumerator", e))?;
            Ok(Self { enumerator })
        }
    }

    /// The endpoint system sounds currently play through.
    pub fn default_render_endpoint(&self) -> std::result::Result<RenderEndpoint, CaptureError> {
        unsafe {
            let device = self
                .enumerator
                .GetDefaultAudioEndpoint(eRender, eConsole)
                .map_err(|e| CaptureError::SourceUnavailable(format!("no default output device: {}", e)))?;

            let raw_id = device.GetId().map_err(|e| os_error("IMMDevice::GetId", e))?;
            let id = raw_id.to_string().unwrap_or_default();
            CoTaskMemFree(Some(raw_id.0 as *const _));

            let name = Self::friendly_name(&device).unwrap_or_else(|| "System output".into());
            Ok(RenderEndpoint { id, name })
        }
    }

    /// Open an endpoint by the id returned from [`default_render_endpoint`](Self::default_render_endpoint).
    pub fn device(&self, id: &str) -> std::result::Result<IMMDevice, CaptureError> {
        let wide: Vec<u16> = id.encode_utf16().chain(iter::once(0)).collect();
        unsafe {
            self.enumerator
                .GetDevice(PCWSTR(wide.as_ptr()))
                .map_err(|e| CaptureError::SourceUnavailable(format!("output device {} is gone: {}", id, e)))
        }
    }

    /// Read the PKEY_Device_FriendlyName property from a device.
    fn friendly_name(device: &IMMDevice) -> Option<String> {
        unsafe {
            let store = device.OpenPropertyStore(STGM_READ).ok()?;

            let mut prop_variant = std::mem::zeroed::<PROPVARIANT>();
            store.GetValue(&PKEY_Device_FriendlyName, &mut prop_variant).ok()?;

            let name = if prop_variant.Anonymous.Anonymous.vt == VT_LPWSTR {
                let pwsz = prop_variant.Anonymous.Anonymous.Anonymous.pwszVal;
                if !pwsz.is_null() {
                    pwsz.to_string().ok()
                } else {
                    None
                }
            } else {
                None
            };

            PropVariantClear(&mut prop_variant).ok();
            name
        }
    }
}
