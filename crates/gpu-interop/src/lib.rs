//! Native backends for the GL interop bridges.
//!
//! [`interop_core`] holds the platform-neutral state machines; this crate
//! plugs real APIs into them. Vulkan with `GL_EXT_memory_object` and
//! `GL_EXT_semaphore` drives the explicit bridge everywhere but macOS.
//! On Windows the compositor bridge runs on DXGI/D3D11 through
//! `WGL_NV_DX_interop2`.

pub mod gl_ext;
pub mod surface;

#[cfg(not(target_os = "macos"))]
pub mod vulkan;

#[cfg(target_os = "windows")]
pub mod dxgi;

pub use interop_core;
pub use surface::WindowSurface;

#[cfg(not(target_os = "macos"))]
use interop_core::{FrameBridge, InteropConfig};

/// The platform's preferred bridge: the compositor bridge on Windows, the
/// explicit Vulkan bridge elsewhere.
#[cfg(target_os = "windows")]
pub fn create_bridge(config: InteropConfig) -> Box<dyn FrameBridge> {
    let backend = dxgi::DxgiBackend::new(&config);
    Box::new(interop_core::CompositorBridge::new(backend, config))
}

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
pub fn create_bridge(config: InteropConfig) -> Box<dyn FrameBridge> {
    create_explicit_bridge(config)
}

/// The explicit bridge, available wherever Vulkan is.
#[cfg(not(target_os = "macos"))]
pub fn create_explicit_bridge(config: InteropConfig) -> Box<dyn FrameBridge> {
    Box::new(interop_core::ExplicitBridge::new(
        vulkan::VulkanBackend::new(),
        config,
    ))
}
