//! Presentation surfaces from `raw-window-handle` windows.

use anyhow::{bail, Context, Result};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};

use interop_core::{RawInstance, RawSurface, SurfaceProvider};

/// A window the bridge presents into.
///
/// For the explicit bridge this creates a `VkSurfaceKHR` on the bridge's
/// instance; for the compositor bridge it hands over the Win32 `HWND`.
/// The window must outlive the bridge.
pub struct WindowSurface {
    display: RawDisplayHandle,
    window: RawWindowHandle,
}

impl WindowSurface {
    pub fn new(target: &(impl HasWindowHandle + HasDisplayHandle)) -> Result<Self> {
        let display = target.display_handle().context("display handle")?.as_raw();
        let window = target.window_handle().context("window handle")?.as_raw();
        Ok(Self::from_raw(display, window))
    }

    pub fn from_raw(display: RawDisplayHandle, window: RawWindowHandle) -> Self {
        Self { display, window }
    }

    #[cfg(not(target_os = "macos"))]
    fn vulkan_surface(&self, instance: u64, get_instance_proc_addr: usize) -> Result<RawSurface> {
        use ash::vk::{self, Handle};

        if get_instance_proc_addr == 0 {
            bail!("null vkGetInstanceProcAddr");
        }
        let static_fn = ash::StaticFn {
            get_instance_proc_addr: unsafe {
                std::mem::transmute::<usize, vk::PFN_vkGetInstanceProcAddr>(get_instance_proc_addr)
            },
        };
        let entry = unsafe { ash::Entry::from_static_fn(static_fn) };
        let instance =
            unsafe { ash::Instance::load(entry.static_fn(), vk::Instance::from_raw(instance)) };
        let surface = unsafe {
            ash_window::create_surface(&entry, &instance, self.display, self.window, None)
        }
        .context("vkCreate*SurfaceKHR")?;
        Ok(RawSurface::Vulkan(surface.as_raw()))
    }

    #[cfg(target_os = "macos")]
    fn vulkan_surface(&self, _instance: u64, _get_instance_proc_addr: usize) -> Result<RawSurface> {
        bail!("Vulkan surfaces are not supported on this platform")
    }
}

impl SurfaceProvider for WindowSurface {
    fn create_surface(&mut self, instance: RawInstance) -> Result<RawSurface> {
        match instance {
            RawInstance::Vulkan {
                instance,
                get_instance_proc_addr,
            } => self.vulkan_surface(instance, get_instance_proc_addr),
            RawInstance::Dxgi => match self.window {
                RawWindowHandle::Win32(handle) => Ok(RawSurface::Hwnd(handle.hwnd.get())),
                other => bail!("DXGI presents to Win32 windows only, got {other:?}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroIsize;

    use raw_window_handle::{
        Win32WindowHandle, WindowsDisplayHandle, XlibDisplayHandle, XlibWindowHandle,
    };

    use super::*;

    #[test]
    fn win32_window_becomes_hwnd() {
        let Some(hwnd) = NonZeroIsize::new(0x1234) else {
            unreachable!()
        };
        let mut surface = WindowSurface::from_raw(
            RawDisplayHandle::Windows(WindowsDisplayHandle::new()),
            RawWindowHandle::Win32(Win32WindowHandle::new(hwnd)),
        );
        assert_eq!(
            surface.create_surface(RawInstance::Dxgi).unwrap(),
            RawSurface::Hwnd(0x1234)
        );
    }

    #[test]
    fn dxgi_rejects_non_win32_windows() {
        let mut surface = WindowSurface::from_raw(
            RawDisplayHandle::Xlib(XlibDisplayHandle::new(None, 0)),
            RawWindowHandle::Xlib(XlibWindowHandle::new(7)),
        );
        assert!(surface.create_surface(RawInstance::Dxgi).is_err());
    }

    #[test]
    fn null_proc_addr_is_rejected() {
        let mut surface = WindowSurface::from_raw(
            RawDisplayHandle::Xlib(XlibDisplayHandle::new(None, 0)),
            RawWindowHandle::Xlib(XlibWindowHandle::new(7)),
        );
        let result = surface.create_surface(RawInstance::Vulkan {
            instance: 1,
            get_instance_proc_addr: 0,
        });
        assert!(result.is_err());
    }
}
