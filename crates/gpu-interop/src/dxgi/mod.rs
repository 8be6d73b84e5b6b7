//! Compositor bridge backend: DXGI flip-model swapchain on a D3D11 device,
//! drawn into by GL through WGL_NV_DX_interop2.

mod backend;
mod device;
mod hdr;
pub mod wgl;

pub use backend::DxgiBackend;

use tracing::error;
use windows::Win32::Graphics::Dxgi::{
    DXGI_ERROR_DEVICE_HUNG, DXGI_ERROR_DEVICE_REMOVED, DXGI_ERROR_DEVICE_RESET,
};

use interop_core::{InteropError, NativeCode};

/// Map a failed COM call onto the bridge error, logging it with its HRESULT.
pub(crate) fn hr_error(call: &str, err: &windows::core::Error) -> InteropError {
    let hr = err.code();
    let code = NativeCode::HResult(hr.0);
    error!("{call} failed: {} ({code})", err.message());
    if [DXGI_ERROR_DEVICE_REMOVED, DXGI_ERROR_DEVICE_RESET, DXGI_ERROR_DEVICE_HUNG].contains(&hr) {
        InteropError::DeviceLost { code }
    } else {
        InteropError::native(format!("{call}: {}", err.message()), code)
    }
}
